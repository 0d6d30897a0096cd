//! Typed multicast listener registry.
//!
//! Listeners are grouped by event kind. Each group is an immutable `Arc<Vec<_>>`
//! that is replaced wholesale on subscribe/unsubscribe, so `publish` only holds
//! the read lock long enough to clone the `Arc` and then calls listeners with
//! no lock held. Listeners may (un)subscribe from inside a callback.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Handle returned by [`Listeners::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub struct Listeners<K, T> {
    groups: RwLock<HashMap<K, Arc<Vec<(ListenerId, Listener<T>)>>>>,
    next_id: AtomicU64,
}

impl<K, T> Default for Listeners<K, T>
where
    K: Eq + Hash + Copy,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> Listeners<K, T>
where
    K: Eq + Hash + Copy,
{
    pub fn new() -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe<F>(&self, kind: K, listener: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut groups = self.groups.write();
        let current = groups.get(&kind).cloned().unwrap_or_default();
        let mut next: Vec<(ListenerId, Listener<T>)> = current.iter().cloned().collect();
        next.push((id, Arc::new(listener)));
        groups.insert(kind, Arc::new(next));
        id
    }

    /// Returns false when the listener was not registered for `kind`.
    pub fn unsubscribe(&self, kind: K, id: ListenerId) -> bool {
        let mut groups = self.groups.write();
        let Some(current) = groups.get(&kind).cloned() else {
            return false;
        };
        let next: Vec<(ListenerId, Listener<T>)> = current
            .iter()
            .filter(|(lid, _)| *lid != id)
            .cloned()
            .collect();
        let removed = next.len() != current.len();
        groups.insert(kind, Arc::new(next));
        removed
    }

    /// Deliver `payload` to every listener of `kind`. Returns the number notified.
    pub fn publish(&self, kind: K, payload: &T) -> usize {
        let snapshot = self.groups.read().get(&kind).cloned();
        match snapshot {
            Some(listeners) => {
                for (_, listener) in listeners.iter() {
                    listener(payload);
                }
                listeners.len()
            }
            None => 0,
        }
    }

    pub fn listener_count(&self, kind: K) -> usize {
        self.groups.read().get(&kind).map(|g| g.len()).unwrap_or(0)
    }
}
