// apps/kernel-server/src/signatures.rs
// Purpose: Per-run store of opaque reasoning-continuation tokens.
// Architecture: Core Data Structure
// Dependencies: DashMap

use crate::models::ThoughtSignatureStore;
use dashmap::DashMap;

/// Signatures are forwarded byte-for-byte; the kernel never parses them.
/// Stale entries (for agents that no longer exist, e.g. after adoption
/// mints a fresh id) are permitted and simply ignored by lookups.
#[derive(Default)]
pub struct SignatureStore {
    by_run: DashMap<String, ThoughtSignatureStore>,
}

impl SignatureStore {
    pub fn new() -> Self {
        SignatureStore { by_run: DashMap::new() }
    }

    pub fn init_run(&self, run_id: &str) {
        self.by_run.insert(run_id.to_string(), ThoughtSignatureStore::default());
    }

    pub fn set(&self, run_id: &str, agent_id: &str, signature: String) -> Result<(), String> {
        let mut store = self
            .by_run
            .get_mut(run_id)
            .ok_or_else(|| format!("run not found: {}", run_id))?;
        store.signatures.insert(agent_id.to_string(), signature);
        Ok(())
    }

    pub fn get(&self, run_id: &str, agent_id: &str) -> Option<String> {
        self.by_run.get(run_id).and_then(|s| s.signatures.get(agent_id).cloned())
    }

    pub fn get_all(&self, run_id: &str) -> Option<ThoughtSignatureStore> {
        self.by_run.get(run_id).map(|s| s.value().clone())
    }

    /// The parent-signature selection rule in §4.6: the first available
    /// signature among `parents`, in manifest-declared order.
    pub fn first_available(&self, run_id: &str, parents: &[String]) -> Option<String> {
        parents.iter().find_map(|p| self.get(run_id, p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_available_is_deterministic_on_declared_order() {
        let store = SignatureStore::new();
        store.init_run("r1");
        store.set("r1", "b", "sig-b".to_string()).unwrap();
        store.set("r1", "a", "sig-a".to_string()).unwrap();

        let parents = vec!["a".to_string(), "b".to_string()];
        assert_eq!(store.first_available("r1", &parents), Some("sig-a".to_string()));
    }

    #[test]
    fn stale_entries_for_missing_agents_are_simply_absent() {
        let store = SignatureStore::new();
        store.init_run("r1");
        assert_eq!(store.get("r1", "never-ran"), None);
    }
}
