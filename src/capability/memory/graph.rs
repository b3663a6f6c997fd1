use std::collections::HashMap;

use parking_lot::RwLock;
use serde_json::{Map, Value};

use super::MemoryError;

/// In-memory node store keyed by id.
#[derive(Default)]
pub struct GraphStore {
    nodes: RwLock<HashMap<String, Map<String, Value>>>,
}

impl GraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a node. Returns true when the node is new.
    pub fn upsert(&self, id: &str, payload: Map<String, Value>) -> Result<bool, MemoryError> {
        if id.is_empty() {
            return Err(MemoryError::EmptyKey);
        }
        Ok(self.nodes.write().insert(id.to_string(), payload).is_none())
    }

    pub fn get(&self, id: &str) -> Option<Map<String, Value>> {
        self.nodes.read().get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_upsert_and_get() {
        let graph = GraphStore::new();
        assert!(graph.upsert("n1", object(json!({"kind": "person"}))).unwrap());
        assert!(!graph.upsert("n1", object(json!({"kind": "org"}))).unwrap());
        assert_eq!(graph.get("n1").unwrap()["kind"], "org");
        assert!(graph.get("n2").is_none());
        assert!(graph.upsert("", Map::new()).is_err());
    }
}
