//! The connection registry: a concurrent map from agent id to its live
//! connection, mutated only through `insert`/`remove` so register/unregister
//! and reaping never race each other into a torn state.
//!
//! Grounded on `hub_server/ws/hub.go`'s `Hub.clients` map, but backed by a
//! `DashMap` rather than a single mutex plus channel-fed control loop —
//! idiomatic for the teacher's style elsewhere (`continuum-core`'s session
//! tables are `DashMap`s too) and avoids funnelling every heartbeat-driven
//! `last_seen` update through one serialized loop.

use std::sync::Arc;

use dashmap::DashMap;

/// The subset of [`super::connection::Connection`] the registry and reaper
/// need. Kept as a trait so the reaper's cutoff arithmetic is testable
/// without a real TCP socket behind every connection.
pub trait ConnectionLike: Send + Sync {
    fn last_seen(&self) -> i64;
    fn close(&self);
}

impl ConnectionLike for super::connection::Connection {
    fn last_seen(&self) -> i64 {
        super::connection::Connection::last_seen(self)
    }

    fn close(&self) {
        super::connection::Connection::close(self)
    }
}

pub struct Registry<C: ConnectionLike = super::connection::Connection> {
    conns: DashMap<String, Arc<C>>,
}

impl<C: ConnectionLike> Default for Registry<C> {
    fn default() -> Self {
        Self { conns: DashMap::new() }
    }
}

impl<C: ConnectionLike> Registry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `conn`, closing and returning any prior connection under the
    /// same id so the caller can finish tearing it down (§4.E supplant: "the
    /// old socket is closed, the new one takes over the slot").
    pub fn insert(&self, id: String, conn: Arc<C>) -> Option<Arc<C>> {
        let previous = self.conns.insert(id, conn);
        if let Some(prev) = &previous {
            prev.close();
        }
        previous
    }

    pub fn remove(&self, id: &str) -> Option<Arc<C>> {
        self.conns.remove(id).map(|(_, c)| c)
    }

    /// Removes the entry under `id` only if it is still `conn` — guards
    /// against a stale unregister (from a connection that was already
    /// supplanted by `insert`) deleting its successor.
    pub fn remove_if_same(&self, id: &str, conn: &Arc<C>) -> bool {
        use dashmap::mapref::entry::Entry as DashEntry;
        match self.conns.entry(id.to_string()) {
            DashEntry::Occupied(e) if Arc::ptr_eq(e.get(), conn) => {
                e.remove();
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<C>> {
        self.conns.get(id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.conns.iter().map(|e| e.key().clone()).collect()
    }

    /// Ids whose connection's `last_seen` is at or before `cutoff`.
    pub fn ids_stale_since(&self, cutoff: i64) -> Vec<String> {
        self.conns
            .iter()
            .filter(|e| e.value().last_seen() <= cutoff)
            .map(|e| e.key().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

    struct FakeConn {
        last_seen: AtomicI64,
        closed: AtomicBool,
    }

    impl FakeConn {
        fn new(last_seen: i64) -> Arc<Self> {
            Arc::new(Self { last_seen: AtomicI64::new(last_seen), closed: AtomicBool::new(false) })
        }
    }

    impl ConnectionLike for FakeConn {
        fn last_seen(&self) -> i64 {
            self.last_seen.load(Ordering::Relaxed)
        }

        fn close(&self) {
            self.closed.store(true, Ordering::Relaxed);
        }
    }

    #[test]
    fn insert_replaces_and_closes_the_prior_connection() {
        let registry: Registry<FakeConn> = Registry::new();
        let first = FakeConn::new(100);
        registry.insert("A1".into(), first.clone());
        let second = FakeConn::new(200);
        registry.insert("A1".into(), second.clone());

        assert!(first.closed.load(Ordering::Relaxed));
        assert!(!second.closed.load(Ordering::Relaxed));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn stale_filter_respects_cutoff_boundary() {
        let registry: Registry<FakeConn> = Registry::new();
        registry.insert("old".into(), FakeConn::new(100));
        registry.insert("new".into(), FakeConn::new(500));

        let stale = registry.ids_stale_since(100);
        assert_eq!(stale, vec!["old".to_string()]);

        let stale_both = registry.ids_stale_since(500);
        let mut sorted = stale_both.clone();
        sorted.sort();
        assert_eq!(sorted, vec!["new".to_string(), "old".to_string()]);
    }

    #[test]
    fn remove_returns_the_connection_and_drops_it_from_the_map() {
        let registry: Registry<FakeConn> = Registry::new();
        registry.insert("A1".into(), FakeConn::new(1));
        assert!(registry.remove("A1").is_some());
        assert!(registry.is_empty());
        assert!(registry.remove("A1").is_none());
    }

    #[test]
    fn remove_if_same_ignores_a_stale_handle_after_supplant() {
        let registry: Registry<FakeConn> = Registry::new();
        let old = FakeConn::new(1);
        registry.insert("A1".into(), old.clone());
        let new = FakeConn::new(2);
        registry.insert("A1".into(), new.clone());

        assert!(!registry.remove_if_same("A1", &old));
        assert_eq!(registry.len(), 1);
        assert!(registry.remove_if_same("A1", &new));
        assert!(registry.is_empty());
    }
}
