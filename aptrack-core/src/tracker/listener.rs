//! One long-lived listener per tracked server.
//!
//! The listener owns the transport and drives it with the pure
//! [`Session`] state machine: every transport or classifier observation
//! becomes an [`Event`], and the returned [`Action`] decides whether to keep
//! reading, probe, wait for a retry, or stop.

use super::classifier::{Classifier, Outcome};
use super::connection;
use super::registry::ConnectionDataStore;
use super::retry::{Action, CloseReason, Event, RetryPolicy, Session};
use crate::catalog::CatalogStore;
use crate::config::{ServerConfig, TimeoutConfig};
use crate::error::Error;
use crate::progress::CompletionOracle;
use crate::protocol;
use crate::types::{LiveProgress, Notification, NotificationKind};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message};

/// Everything a listener needs from its supervisor.
pub struct ListenerContext {
    /// Server settings with a normalized address
    pub server: ServerConfig,
    pub policy: RetryPolicy,
    pub timeouts: TimeoutConfig,
    pub catalogs: Arc<CatalogStore>,
    pub connections: Arc<ConnectionDataStore>,
    pub completion: Arc<dyn CompletionOracle>,
    pub notifications: mpsc::UnboundedSender<Notification>,
    pub live: watch::Sender<LiveProgress>,
    pub shutdown: watch::Receiver<bool>,
}

/// Why a listener stopped.
#[derive(Debug, Clone, PartialEq)]
pub struct ListenerExit {
    pub server: String,
    pub reason: CloseReason,
}

pub struct Listener {
    server: ServerConfig,
    policy: RetryPolicy,
    timeouts: TimeoutConfig,
    classifier: Classifier,
    notifications: mpsc::UnboundedSender<Notification>,
    live: watch::Sender<LiveProgress>,
    shutdown: watch::Receiver<bool>,
}

impl Listener {
    pub fn new(ctx: ListenerContext) -> Self {
        let classifier = Classifier::new(
            ctx.server.address.clone(),
            ctx.catalogs,
            ctx.connections,
            ctx.completion,
        );
        Self {
            server: ctx.server,
            policy: ctx.policy,
            timeouts: ctx.timeouts,
            classifier,
            notifications: ctx.notifications,
            live: ctx.live,
            shutdown: ctx.shutdown,
        }
    }

    pub fn address(&self) -> &str {
        &self.server.address
    }

    /// Connect, listen and reconnect until a terminal state is reached.
    pub async fn run(mut self) -> ListenerExit {
        let mut session = Session::new(self.policy);
        let mut action = if *self.shutdown.borrow() {
            apply(&mut session, Event::Shutdown)
        } else {
            Action::Connect
        };

        loop {
            action = match action {
                Action::Connect => self.attempt(&mut session).await,
                Action::Wait(delay) => {
                    tracing::info!(
                        server = %self.server.address,
                        attempt = session.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        "Reconnecting after backoff"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => apply(&mut session, Event::RetryElapsed),
                        _ = wait_for_shutdown(&mut self.shutdown) => apply(&mut session, Event::Shutdown),
                    }
                }
                Action::Close(reason) => {
                    self.announce_close(&reason);
                    return ListenerExit {
                        server: self.server.address.clone(),
                        reason,
                    };
                }
                // Only produced mid-connection; treat a stray one as a dead link.
                Action::None | Action::Probe => apply(
                    &mut session,
                    Event::TransportFailed("connection ended unexpectedly".to_string()),
                ),
            };
        }
    }

    /// One transport lifetime: connect, handshake, pump until it ends.
    async fn attempt(&mut self, session: &mut Session) -> Action {
        let address = match connection::normalize_address(&self.server.address) {
            Ok(address) => address,
            Err(Error::InvalidAddress(message)) => {
                return apply(session, Event::InvalidAddress(message))
            }
            Err(e) => return apply(session, Event::InvalidAddress(e.to_string())),
        };
        let connect_timeout = self.timeouts.connect();

        let connected = tokio::select! {
            result = connection::connect(&address, connect_timeout) => result,
            _ = wait_for_shutdown(&mut self.shutdown) => return apply(session, Event::Shutdown),
        };
        let transport = match connected {
            Ok(transport) => transport,
            Err(Error::InvalidAddress(message)) => {
                return apply(session, Event::InvalidAddress(message))
            }
            Err(e) => {
                tracing::warn!(server = %address, error = %e, "Connect failed");
                return apply(session, Event::TransportFailed(e.to_string()));
            }
        };
        apply(session, Event::TransportOpened);

        let (mut sink, mut stream) = transport.split();
        let uuid = connection::client_uuid(&address);
        if let Err(e) =
            connection::handshake(&mut sink, self.server.password.as_deref(), &uuid).await
        {
            tracing::warn!(server = %address, error = %e, "Handshake send failed");
            return apply(session, Event::TransportFailed(e.to_string()));
        }

        let action = self.pump(session, &mut sink, &mut stream).await;

        if let Err(e) = sink.close().await {
            tracing::debug!(server = %address, error = %e, "Close after session end failed");
        }
        action
    }

    /// Read frames until the state machine asks for something other than
    /// "keep going".
    async fn pump<S, R>(&mut self, session: &mut Session, sink: &mut S, stream: &mut R) -> Action
    where
        S: Sink<Message, Error = tungstenite::Error> + Unpin,
        R: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        let ping_interval = self.timeouts.ping_interval();
        let pong_timeout = self.timeouts.pong_timeout();
        let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_activity = Instant::now();
        let mut pong_deadline: Option<Instant> = None;

        loop {
            let receive_deadline = last_activity + session.receive_timeout(&self.timeouts);

            let events: Vec<Event> = tokio::select! {
                _ = wait_for_shutdown(&mut self.shutdown) => vec![Event::Shutdown],

                _ = ping.tick(), if session.is_confirmed() => {
                    match sink.send(Message::Ping(Vec::new())).await {
                        Ok(()) => {
                            pong_deadline.get_or_insert(Instant::now() + pong_timeout);
                            Vec::new()
                        }
                        Err(e) => vec![Event::TransportFailed(e.to_string())],
                    }
                }

                _ = sleep_until(pong_deadline) => {
                    vec![Event::TransportFailed("keepalive ping unanswered".to_string())]
                }

                _ = tokio::time::sleep_until(receive_deadline) => {
                    last_activity = Instant::now();
                    vec![Event::IdleTimeout]
                }

                frame = stream.next() => {
                    if matches!(frame, Some(Ok(_))) {
                        last_activity = Instant::now();
                        pong_deadline = None;
                    }
                    match frame {
                        Some(Ok(Message::Text(text))) => self.on_text(&text, sink).await,
                        Some(Ok(Message::Pong(_))) => vec![Event::PongReceived],
                        Some(Ok(Message::Close(frame))) => {
                            let reason = frame
                                .map(|f| format!("closed by server: {} {}", f.code, f.reason))
                                .unwrap_or_else(|| "closed by server".to_string());
                            vec![Event::TransportFailed(reason)]
                        }
                        // Pings are answered by the transport itself.
                        Some(Ok(_)) => Vec::new(),
                        Some(Err(e)) => vec![Event::TransportFailed(e.to_string())],
                        None => vec![Event::TransportFailed("connection closed".to_string())],
                    }
                }
            };

            let mut pending: VecDeque<Event> = events.into();
            while let Some(event) = pending.pop_front() {
                match apply(session, event) {
                    Action::None => {}
                    Action::Probe => {
                        tracing::debug!(server = %self.server.address, "Idle, probing link");
                        if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                            pending.push_front(Event::TransportFailed(e.to_string()));
                        }
                    }
                    action => return action,
                }
            }
        }
    }

    /// Decode one text frame and classify each command in it.
    async fn on_text<S>(&mut self, text: &str, sink: &mut S) -> Vec<Event>
    where
        S: Sink<Message, Error = tungstenite::Error> + Unpin,
    {
        let messages = match protocol::decode_frame(text) {
            Ok(messages) => messages,
            Err(e) => {
                tracing::warn!(server = %self.server.address, error = %e, "Skipping malformed frame");
                return vec![Event::MessageFailed];
            }
        };

        let mut events = Vec::new();
        for message in messages {
            // Completion checks may read the save file from disk.
            let classified = run_blocking(|| self.classifier.classify(&message));
            let outcomes = match classified {
                Ok(outcomes) => outcomes,
                Err(e) => {
                    tracing::warn!(server = %self.server.address, error = %e, "Skipping message");
                    events.push(Event::MessageFailed);
                    continue;
                }
            };

            let mut confirmed = false;
            for outcome in outcomes {
                match outcome {
                    Outcome::Notify(notification) => self.emit(notification),
                    Outcome::RequestCatalog(games) => {
                        tracing::debug!(
                            server = %self.server.address,
                            games = games.len(),
                            "Requesting data package"
                        );
                        if let Err(e) = connection::request_catalog(sink, &games).await {
                            events.push(Event::TransportFailed(e.to_string()));
                        }
                    }
                    Outcome::HandshakeConfirmed => {
                        confirmed = true;
                        events.push(Event::HandshakeConfirmed);
                    }
                    Outcome::Rejected(errors) => events.push(Event::Rejected(errors)),
                    Outcome::GameComplete => events.push(Event::GameComplete),
                }
            }
            // The confirming message itself does not count toward stability.
            if !confirmed {
                events.push(Event::MessageProcessed);
            }
        }

        self.publish_live();
        events
    }

    fn emit(&self, notification: Notification) {
        tracing::debug!(server = %notification.server, kind = ?notification.kind, "Notification");
        if self.notifications.send(notification).is_err() {
            tracing::debug!(server = %self.server.address, "Notification channel closed");
        }
    }

    fn publish_live(&self) {
        let live = self.classifier.live();
        self.live.send_if_modified(|current| {
            if *current == *live {
                false
            } else {
                *current = live.clone();
                true
            }
        });
    }

    /// Failures worth telling the channel about; clean stops stay quiet.
    fn announce_close(&self, reason: &CloseReason) {
        let address = &self.server.address;
        match reason {
            CloseReason::InvalidAddress { .. } | CloseReason::RetriesExhausted { .. } => {
                tracing::error!(server = %address, reason = %reason, "Listener stopped");
                self.emit(Notification::new(
                    address.clone(),
                    NotificationKind::Error,
                    format!("Stopped tracking {}: {}", address, reason),
                ));
            }
            // The refusal was already announced by the classifier.
            CloseReason::Rejected { .. } => {
                tracing::warn!(server = %address, reason = %reason, "Listener stopped");
            }
            CloseReason::GameComplete | CloseReason::Shutdown => {
                tracing::info!(server = %address, reason = %reason, "Listener stopped");
            }
        }
    }
}

/// Feed one event through the state machine in place.
pub(crate) fn apply(session: &mut Session, event: Event) -> Action {
    tracing::trace!(phase = ?session.phase(), event = ?event, "Session event");
    let current = std::mem::replace(session, Session::new(*session.policy()));
    let (next, action) = current.step(event);
    *session = next;
    action
}

/// Resolves once shutdown is requested or the supervisor is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

/// Run blocking work without stalling other listeners on a multi-threaded
/// runtime. On a current-thread runtime the work runs inline.
fn run_blocking<T>(work: impl FnOnce() -> T) -> T {
    use tokio::runtime::{Handle, RuntimeFlavor};
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(work)
        }
        _ => work(),
    }
}
