//! Listener supervisor.
//!
//! [`Tracker`] is the single owner of the session registry. It spawns one
//! listener task per server address, hands each the shared catalog and
//! handshake stores, and removes registry entries as listeners reach a
//! terminal state.

use super::connection;
use super::listener::{Listener, ListenerContext, ListenerExit};
use super::registry::{ConnectionDataStore, SessionHandle, SessionRegistry};
use super::retry::RetryPolicy;
use crate::catalog::CatalogStore;
use crate::config::{Config, ServerConfig};
use crate::error::{Error, Result};
use crate::progress::{
    CompletionOracle, NoCompletion, ProgressEngine, ProgressSources, ProgressWarning,
    SaveFileCompletion,
};
use crate::types::{LiveProgress, Notification, PlayerSlot, SlotId};
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Result of a progress query against a tracked (or untracked) server.
#[derive(Debug, Clone)]
pub struct ProgressQuery {
    pub engine: ProgressEngine,
    pub warnings: Vec<ProgressWarning>,
    /// Roster from the latest handshake, empty when never connected
    pub roster: Vec<PlayerSlot>,
}

pub struct Tracker {
    config: Config,
    registry: SessionRegistry,
    catalogs: Arc<CatalogStore>,
    connections: Arc<ConnectionDataStore>,
    notifications: mpsc::UnboundedSender<Notification>,
    exits_tx: mpsc::UnboundedSender<ListenerExit>,
    exits: mpsc::UnboundedReceiver<ListenerExit>,
    shutdown: watch::Sender<bool>,
}

impl Tracker {
    /// Create a tracker and the receiving end of its notification channel.
    pub fn new(config: &Config) -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (notifications, notification_rx) = mpsc::unbounded_channel();
        let (exits_tx, exits) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let tracker = Self {
            config: config.clone(),
            registry: SessionRegistry::new(),
            catalogs: Arc::new(CatalogStore::new()),
            connections: Arc::new(ConnectionDataStore::new()),
            notifications,
            exits_tx,
            exits,
            shutdown,
        };
        (tracker, notification_rx)
    }

    pub fn catalogs(&self) -> &Arc<CatalogStore> {
        &self.catalogs
    }

    pub fn connections(&self) -> &Arc<ConnectionDataStore> {
        &self.connections
    }

    /// Start a listener for `server`. Returns the normalized address.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self, server: ServerConfig) -> Result<String> {
        let address = connection::normalize_address(&server.address)?;
        if self.registry.contains(&address) {
            return Err(Error::Registry(format!("already tracking {}", address)));
        }
        let server = ServerConfig {
            address: address.clone(),
            ..server
        };

        let completion: Arc<dyn CompletionOracle> = match server.resolve_save_file() {
            Some(save_file) => Arc::new(SaveFileCompletion {
                team: self.config.progress.team,
                save_file,
                multidata_file: server.resolve_multidata_file(),
            }),
            None => Arc::new(NoCompletion),
        };

        let (live_tx, live_rx) = watch::channel(LiveProgress::new());
        let listener = Listener::new(ListenerContext {
            server,
            policy: RetryPolicy::from(&self.config.retry),
            timeouts: self.config.timeouts.clone(),
            catalogs: Arc::clone(&self.catalogs),
            connections: Arc::clone(&self.connections),
            completion,
            notifications: self.notifications.clone(),
            live: live_tx,
            shutdown: self.shutdown.subscribe(),
        });

        let exits = self.exits_tx.clone();
        let task = tokio::spawn(async move {
            let exit = listener.run().await;
            if exits.send(exit).is_err() {
                tracing::debug!("Tracker gone before listener exit was reported");
            }
        });

        self.registry.insert(SessionHandle {
            address: address.clone(),
            started_at: Utc::now(),
            live: live_rx,
            task,
        })?;
        tracing::info!(server = %address, "Tracking started");
        Ok(address)
    }

    pub fn is_tracking(&self, address: &str) -> bool {
        connection::normalize_address(address)
            .map(|a| self.registry.contains(&a))
            .unwrap_or(false)
    }

    /// Addresses with a running listener, sorted.
    pub fn active(&self) -> Vec<String> {
        self.registry.addresses()
    }

    /// Latest live checks published by a listener.
    pub fn live_progress(&self, address: &str) -> Option<LiveProgress> {
        self.registry
            .get(address)
            .map(|handle| handle.live.borrow().clone())
    }

    /// Roster from the newest handshake with `address`.
    pub fn roster(&self, address: &str) -> Vec<PlayerSlot> {
        self.connections
            .latest(address)
            .map(|record| record.roster)
            .unwrap_or_default()
    }

    /// Answer a progress query from disk plus whatever is live.
    pub fn query_progress(&self, server: &ServerConfig) -> ProgressQuery {
        let address = connection::normalize_address(&server.address)
            .unwrap_or_else(|_| server.address.clone());
        let sources = ProgressSources::for_server(server, self.config.progress.team);
        let live = self.live_progress(&address).unwrap_or_default();
        let roster = self.roster(&address);
        let live_slots: BTreeSet<SlotId> = roster.iter().map(|p| p.id).collect();
        let connected = self.registry.contains(&address);

        let engine = sources.load(live);
        let warnings = sources.warnings(
            &engine,
            &live_slots,
            connected,
            self.config.progress.stale_after(),
            Utc::now(),
        );
        ProgressQuery {
            engine,
            warnings,
            roster,
        }
    }

    /// Wait for the next listener to stop and drop it from the registry.
    ///
    /// Returns `None` when nothing is running. Cancel-safe: the only await is
    /// the channel receive, so an exit is never taken and then dropped.
    pub async fn next_exit(&mut self) -> Option<ListenerExit> {
        if self.registry.is_empty() {
            return None;
        }
        let exit = self.exits.recv().await?;
        // The listener reports its exit as its last act; its task is detached.
        if let Some(handle) = self.registry.remove(&exit.server) {
            let uptime = Utc::now().signed_duration_since(handle.started_at);
            tracing::debug!(
                server = %exit.server,
                uptime_secs = uptime.num_seconds(),
                finished = handle.task.is_finished(),
                "Listener stopped"
            );
        }
        Some(exit)
    }

    /// Wait for every listener to reach a terminal state.
    pub async fn run_until_idle(&mut self) -> Vec<ListenerExit> {
        let mut exits = Vec::new();
        while let Some(exit) = self.next_exit().await {
            exits.push(exit);
        }
        exits
    }

    /// Ask every listener to stop and wait for them.
    pub async fn shutdown(&mut self) -> Vec<ListenerExit> {
        tracing::info!(sessions = self.registry.len(), "Shutting down listeners");
        self.shutdown.send_replace(true);
        self.run_until_idle().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::registry::ConnectionRecord;
    use crate::tracker::retry::CloseReason;
    use crate::types::{NotificationKind, SlotKind};

    fn quick_config() -> Config {
        let mut config = Config::default();
        config.retry.base_delay_secs = 1;
        config.retry.max_delay_secs = 1;
        config.retry.max_attempts = 1;
        config
    }

    #[tokio::test]
    async fn test_start_rejects_duplicates_and_bad_addresses() {
        let (mut tracker, _rx) = Tracker::new(&Config::default());

        let address = tracker
            .start(ServerConfig::for_address("127.0.0.1:9"))
            .unwrap();
        assert_eq!(address, "ws://127.0.0.1:9");
        assert!(tracker.is_tracking("ws://127.0.0.1:9/"));

        let duplicate = tracker.start(ServerConfig::for_address("ws://127.0.0.1:9"));
        assert!(matches!(duplicate, Err(Error::Registry(_))));

        let invalid = tracker.start(ServerConfig::for_address("http://example.com"));
        assert!(matches!(invalid, Err(Error::InvalidAddress(_))));

        let exits = tracker.shutdown().await;
        assert_eq!(exits.len(), 1);
        assert_eq!(exits[0].reason, CloseReason::Shutdown);
        assert!(tracker.active().is_empty());
    }

    #[tokio::test]
    async fn test_failed_listener_leaves_registry() {
        crate::logging::init_test();
        let (mut tracker, mut rx) = Tracker::new(&quick_config());
        tracker
            .start(ServerConfig::for_address("ws://127.0.0.1:9"))
            .unwrap();

        let exit = tracker.next_exit().await.unwrap();
        assert!(matches!(exit.reason, CloseReason::RetriesExhausted { .. }));
        assert!(!tracker.is_tracking("ws://127.0.0.1:9"));
        assert!(tracker.next_exit().await.is_none());

        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.kind, NotificationKind::Error);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_exits_survive_racing_notifications() {
        let mut config = quick_config();
        config.retry.max_attempts = 0;

        for _ in 0..20 {
            let (mut tracker, mut rx) = Tracker::new(&config);
            for port in 1..=6 {
                tracker
                    .start(ServerConfig::for_address(format!("ws://127.0.0.1:{}", port)))
                    .unwrap();
            }

            let mut exits = Vec::new();
            loop {
                tokio::select! {
                    Some(_) = rx.recv() => {}
                    exit = tracker.next_exit() => match exit {
                        Some(exit) => exits.push(exit),
                        None => break,
                    },
                }
            }

            assert_eq!(exits.len(), 6);
            assert!(exits.iter().all(|e| e.reason.is_failure()));
            assert!(tracker.active().is_empty());
        }
    }

    fn fixture(name: &str) -> std::path::PathBuf {
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("tests/fixtures")
            .join(name)
    }

    /// Register a session without a listener, publishing `live` for it.
    fn register_idle_session(
        tracker: &mut Tracker,
        address: &str,
        live: LiveProgress,
    ) -> watch::Sender<LiveProgress> {
        let (live_tx, live_rx) = watch::channel(live);
        tracker
            .registry
            .insert(SessionHandle {
                address: address.to_string(),
                started_at: Utc::now(),
                live: live_rx,
                task: tokio::spawn(async {}),
            })
            .unwrap();
        live_tx
    }

    fn handshake(roster: &[SlotId]) -> ConnectionRecord {
        ConnectionRecord {
            session_id: "s1".to_string(),
            received_at: Utc::now(),
            own_slot: None,
            roster: roster
                .iter()
                .map(|id| PlayerSlot {
                    id: *id,
                    name: format!("Player {}", id),
                    game: "Factorio".to_string(),
                    kind: SlotKind::Player,
                })
                .collect(),
            payload: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn test_query_merges_live_checks_with_save_file() {
        let (mut tracker, _rx) = Tracker::new(&Config::default());
        let address = "ws://localhost:38281";
        let server = ServerConfig {
            save_file: Some(fixture("two_players.apsave")),
            multidata_file: Some(fixture("two_players.archipelago")),
            ..ServerConfig::for_address(address)
        };

        let mut live = LiveProgress::new();
        live.record(1, 1000);
        let live_tx = register_idle_session(&mut tracker, address, live);
        tracker.connections.record(address, handshake(&[1, 2]));

        let query = tracker.query_progress(&server);
        assert_eq!(query.engine.compute_player_progress(1).checked, 15);
        assert!(query.warnings.is_empty());
        assert_eq!(query.roster.len(), 2);

        // Newly published checks are picked up by the next query.
        live_tx.send_modify(|live| {
            live.record_all(1, [1015, 1016]);
        });
        let query = tracker.query_progress(&server);
        let alice = query.engine.compute_player_progress(1);
        assert_eq!((alice.checked, alice.total), (17, 20));
        assert_eq!(alice.percentage, Some(85.0));
    }

    #[tokio::test]
    async fn test_query_warns_when_roster_misses_save_file() {
        let (mut tracker, _rx) = Tracker::new(&Config::default());
        let address = "ws://localhost:38281";
        let server = ServerConfig {
            save_file: Some(fixture("two_players.apsave")),
            ..ServerConfig::for_address(address)
        };
        let _live_tx = register_idle_session(&mut tracker, address, LiveProgress::new());
        tracker.connections.record(address, handshake(&[7, 8]));

        let query = tracker.query_progress(&server);
        assert_eq!(
            query.warnings,
            vec![ProgressWarning::Mismatch {
                live: BTreeSet::from([7, 8]),
                snapshot: BTreeSet::from([1, 2]),
            }]
        );
    }

    #[tokio::test]
    async fn test_query_without_sources_is_empty() {
        let (tracker, _rx) = Tracker::new(&Config::default());
        let query = tracker.query_progress(&ServerConfig::for_address("localhost"));
        assert!(query.engine.all_progress().is_empty());
        assert!(query.warnings.is_empty());
        assert!(query.roster.is_empty());
    }
}
