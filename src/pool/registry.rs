/// Node registry: every connection, split by role
///
/// `master` and `slave` always partition `all`. The registry holds no lock
/// of its own; the pool mutates it under its state mutex.

use crate::core::{NodeConnection, NodeRole};
use std::collections::HashMap;
use std::sync::Arc;

/// Connections keyed by node key
pub type NodeMap = HashMap<String, Arc<dyn NodeConnection>>;

#[derive(Debug, Default)]
pub struct NodeRegistry {
    all: NodeMap,
    master: NodeMap,
    slave: NodeMap,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection under `all` and the map for its role
    pub fn insert(&mut self, key: String, conn: Arc<dyn NodeConnection>, read_only: bool) {
        self.master.remove(&key);
        self.slave.remove(&key);
        self.role_map_mut(read_only).insert(key.clone(), Arc::clone(&conn));
        self.all.insert(key, conn);
    }

    /// Move `key` into the map for `read_only`. Returns false for unknown keys.
    pub fn set_role(&mut self, key: &str, read_only: bool) -> bool {
        let Some(conn) = self.all.get(key).cloned() else {
            return false;
        };
        if read_only {
            self.master.remove(key);
        } else {
            self.slave.remove(key);
        }
        self.role_map_mut(read_only).insert(key.to_string(), conn);
        true
    }

    /// Drop `key` from every map, but only while it still maps to `conn`
    pub fn remove_if_same(&mut self, key: &str, conn: &Arc<dyn NodeConnection>) -> bool {
        match self.all.get(key) {
            Some(current) if Arc::ptr_eq(current, conn) => {
                self.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Arc<dyn NodeConnection>> {
        self.master.remove(key);
        self.slave.remove(key);
        self.all.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn NodeConnection>> {
        self.all.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.all.contains_key(key)
    }

    pub fn view(&self, role: NodeRole) -> &NodeMap {
        match role {
            NodeRole::All => &self.all,
            NodeRole::Master => &self.master,
            NodeRole::Slave => &self.slave,
        }
    }

    /// Sorted keys of one view
    pub fn keys(&self, role: NodeRole) -> Vec<String> {
        let mut keys: Vec<String> = self.view(role).keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn nodes(&self, role: NodeRole) -> Vec<Arc<dyn NodeConnection>> {
        self.view(role).values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }

    /// `all == master ∪ slave` and `master ∩ slave == ∅`
    pub fn is_consistent(&self) -> bool {
        let disjoint = self.master.keys().all(|key| !self.slave.contains_key(key));
        let covered = self.all.len() == self.master.len() + self.slave.len();
        let subset = self
            .master
            .keys()
            .chain(self.slave.keys())
            .all(|key| self.all.contains_key(key));
        disjoint && covered && subset
    }

    fn role_map_mut(&mut self, read_only: bool) -> &mut NodeMap {
        match NodeRole::for_read_only(read_only) {
            NodeRole::Slave => &mut self.slave,
            _ => &mut self.master,
        }
    }
}
