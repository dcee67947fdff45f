// apps/kernel-server/src/cache_registry.rs
// Purpose: Per-run optional external context-cache handle.
// Architecture: Core Data Structure
// Dependencies: DashMap

use dashmap::DashMap;

/// The kernel never interprets the cache handle; it only stores and
/// forwards it. TTLs on the handle are owned by the LLM adapter layer
/// (§9 Open Questions).
#[derive(Default)]
pub struct CacheRegistry {
    by_run: DashMap<String, String>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        CacheRegistry { by_run: DashMap::new() }
    }

    pub fn set(&self, run_id: &str, cached_content_id: String) {
        self.by_run.insert(run_id.to_string(), cached_content_id);
    }

    pub fn get(&self, run_id: &str) -> Option<String> {
        self.by_run.get(run_id).map(|c| c.clone())
    }
}
