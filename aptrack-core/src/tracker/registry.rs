//! Shared per-server state: active sessions and handshake history.
//!
//! [`SessionRegistry`] is owned by the supervisor and mutated only through
//! `&mut self`, so there is a single writer. [`ConnectionDataStore`] is shared
//! with listeners and follows the replace-whole-value discipline of
//! [`crate::catalog::CatalogStore`].

use crate::error::{Error, Result};
use crate::types::{LiveProgress, PlayerSlot, SlotId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;

// ============================================
// Active sessions
// ============================================

/// A running listener.
#[derive(Debug)]
pub struct SessionHandle {
    pub address: String,
    pub started_at: DateTime<Utc>,
    /// Latest live progress published by the listener
    pub live: watch::Receiver<LiveProgress>,
    pub task: JoinHandle<()>,
}

/// Listeners by normalized address; at most one per address.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, SessionHandle>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener; fails if the address is already tracked.
    pub fn insert(&mut self, handle: SessionHandle) -> Result<()> {
        if self.sessions.contains_key(&handle.address) {
            return Err(Error::Registry(format!(
                "already tracking {}",
                handle.address
            )));
        }
        tracing::debug!(server = %handle.address, "Session registered");
        self.sessions.insert(handle.address.clone(), handle);
        Ok(())
    }

    pub fn remove(&mut self, address: &str) -> Option<SessionHandle> {
        let removed = self.sessions.remove(address);
        if removed.is_some() {
            tracing::debug!(server = %address, "Session removed");
        }
        removed
    }

    pub fn get(&self, address: &str) -> Option<&SessionHandle> {
        self.sessions.get(address)
    }

    pub fn contains(&self, address: &str) -> bool {
        self.sessions.contains_key(address)
    }

    /// Tracked addresses, sorted.
    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.sessions.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

// ============================================
// Handshake history
// ============================================

/// One accepted handshake.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionRecord {
    /// Opaque id of the transport session that received it
    pub session_id: String,
    pub received_at: DateTime<Utc>,
    pub own_slot: Option<SlotId>,
    pub roster: Vec<PlayerSlot>,
    /// Raw `Connected` payload
    pub payload: serde_json::Value,
}

/// Handshakes per server, append-only.
#[derive(Debug, Default)]
pub struct ConnectionDataStore {
    inner: RwLock<HashMap<String, Arc<Vec<ConnectionRecord>>>>,
}

impl ConnectionDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record. Readers holding the previous history are unaffected.
    pub fn record(&self, server: &str, record: ConnectionRecord) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let mut history: Vec<ConnectionRecord> = guard
            .get(server)
            .map(|h| h.as_ref().clone())
            .unwrap_or_default();
        history.push(record);
        guard.insert(server.to_string(), Arc::new(history));
    }

    pub fn history(&self, server: &str) -> Arc<Vec<ConnectionRecord>> {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        guard.get(server).cloned().unwrap_or_default()
    }

    pub fn latest(&self, server: &str) -> Option<ConnectionRecord> {
        self.history(server).last().cloned()
    }

    pub fn find_session(&self, server: &str, session_id: &str) -> Option<ConnectionRecord> {
        self.history(server)
            .iter()
            .find(|r| r.session_id == session_id)
            .cloned()
    }

    /// Most recent roster entry for a slot, searching older handshakes too.
    pub fn lookup_player(&self, server: &str, slot: SlotId) -> Option<PlayerSlot> {
        self.history(server)
            .iter()
            .rev()
            .find_map(|r| r.roster.iter().find(|p| p.id == slot).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SlotKind;

    fn record(session_id: &str, players: &[(SlotId, &str)]) -> ConnectionRecord {
        ConnectionRecord {
            session_id: session_id.to_string(),
            received_at: Utc::now(),
            own_slot: None,
            roster: players
                .iter()
                .map(|(id, name)| PlayerSlot {
                    id: *id,
                    name: name.to_string(),
                    game: "Factorio".to_string(),
                    kind: SlotKind::Player,
                })
                .collect(),
            payload: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn test_registry_rejects_duplicate_address() {
        let mut registry = SessionRegistry::new();
        let (_tx, rx) = watch::channel(LiveProgress::new());
        let handle = SessionHandle {
            address: "ws://a:1".to_string(),
            started_at: Utc::now(),
            live: rx.clone(),
            task: tokio::spawn(async {}),
        };
        registry.insert(handle).unwrap();

        let duplicate = SessionHandle {
            address: "ws://a:1".to_string(),
            started_at: Utc::now(),
            live: rx,
            task: tokio::spawn(async {}),
        };
        assert!(matches!(registry.insert(duplicate), Err(Error::Registry(_))));
        assert_eq!(registry.addresses(), vec!["ws://a:1".to_string()]);

        assert!(registry.remove("ws://a:1").is_some());
        assert!(registry.is_empty());
        assert!(registry.remove("ws://a:1").is_none());
    }

    #[test]
    fn test_connection_history_is_append_only() {
        let store = ConnectionDataStore::new();
        store.record("srv", record("s1", &[(1, "Alice")]));
        let before = store.history("srv");
        store.record("srv", record("s2", &[(2, "Bob")]));

        assert_eq!(before.len(), 1);
        assert_eq!(store.history("srv").len(), 2);
        assert_eq!(store.latest("srv").unwrap().session_id, "s2");
        assert!(store.find_session("srv", "s1").is_some());
        assert!(store.history("other").is_empty());
    }

    #[test]
    fn test_lookup_falls_back_to_older_handshakes() {
        let store = ConnectionDataStore::new();
        store.record("srv", record("s1", &[(1, "Alice"), (2, "Bob")]));
        store.record("srv", record("s2", &[(1, "Alicia")]));

        assert_eq!(store.lookup_player("srv", 1).unwrap().name, "Alicia");
        assert_eq!(store.lookup_player("srv", 2).unwrap().name, "Bob");
        assert!(store.lookup_player("srv", 3).is_none());
    }
}
