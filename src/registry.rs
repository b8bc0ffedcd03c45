use crate::error::DirectoryError;
use std::collections::HashMap;

pub type NodeId = u32;

/// Bidirectional mapping between peer cache names and compact node ids.
///
/// Ids are allocated lazily on first sight (`node_id`), matching the
/// original's behavior of registering a peer the first time it is addressed
/// rather than requiring upfront enumeration.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    name_to_id: HashMap<String, NodeId>,
    id_to_name: Vec<String>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns this peer's id, allocating a fresh one if unseen.
    pub fn node_id(&mut self, name: &str) -> NodeId {
        if let Some(&id) = self.name_to_id.get(name) {
            return id;
        }
        let id = self.id_to_name.len() as NodeId;
        self.id_to_name.push(name.to_string());
        self.name_to_id.insert(name.to_string(), id);
        id
    }

    /// Lookup-only variant: fatal if the name was never registered.
    pub fn node_name_to_id(&self, name: &str) -> Result<NodeId, DirectoryError> {
        self.name_to_id
            .get(name)
            .copied()
            .ok_or_else(|| DirectoryError::UnknownNode(name.to_string()))
    }

    pub fn node_name(&self, id: NodeId) -> Option<&str> {
        self.id_to_name.get(id as usize).map(String::as_str)
    }

    /// Number of peer caches registered so far.
    pub fn target_count(&self) -> usize {
        self.id_to_name.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_stable_ids() {
        let mut reg = NodeRegistry::new();
        let a = reg.node_id("cache0");
        let b = reg.node_id("cache1");
        assert_ne!(a, b);
        assert_eq!(reg.node_id("cache0"), a);
        assert_eq!(reg.target_count(), 2);
    }

    #[test]
    fn unknown_name_lookup_is_fatal() {
        let reg = NodeRegistry::new();
        assert!(matches!(
            reg.node_name_to_id("ghost"),
            Err(DirectoryError::UnknownNode(_))
        ));
    }

    #[test]
    fn round_trips_name() {
        let mut reg = NodeRegistry::new();
        let id = reg.node_id("cache0");
        assert_eq!(reg.node_name(id), Some("cache0"));
    }
}
