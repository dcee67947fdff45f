// apps/kernel-server/src/server.rs
// Purpose: API surface module root.
// Architecture: API Layer

pub mod handlers;
