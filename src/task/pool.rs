//! Coalescing of equivalent in-flight tasks by key.

use std::collections::HashMap;
use std::hash::Hash;

use crate::task::{TaskGraph, TaskId};

/// Map from logical work identity to the live task performing it.
///
/// With deduplication disabled the pool is bypassed entirely and callers
/// get fresh, unpooled tasks. Entries are removed by the task's disposal
/// hook; removal verifies the entry still points at the disposing task to
/// guard against a replacement racing the hook.
pub(crate) struct TaskPool<K> {
    map: HashMap<K, TaskId>,
}

impl<K: Hash + Eq + Clone> TaskPool<K> {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// Live task registered for the key, if any.
    pub fn get_live(&self, key: &K, graph: &TaskGraph) -> Option<TaskId> {
        let id = *self.map.get(key)?;
        graph.contains(id).then_some(id)
    }

    pub fn insert(&mut self, key: K, id: TaskId) {
        self.map.insert(key, id);
    }

    /// Removes the entry only when it still points at `id`.
    pub fn remove_if(&mut self, key: &K, id: TaskId) {
        if self.map.get(key) == Some(&id) {
            self.map.remove(key);
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}
