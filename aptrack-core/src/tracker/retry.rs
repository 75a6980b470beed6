//! Reconnect state machine.
//!
//! [`Session::step`] is a pure transition `(state, event) -> (state, action)`;
//! the listener feeds it transport and classifier events and performs the
//! returned [`Action`]. Nothing here touches a socket or a clock.
//!
//! ```text
//! Connecting -> HandshakePending -> Confirmed{streak} -> Stable
//!      ^              |                   |                |
//!      |              +------ failure ----+---- failure ---+
//!      |                         v
//!      +---- RetryElapsed --- Retrying            (any) -> Closed(reason)
//! ```

use crate::config::{RetryConfig, TimeoutConfig};
use serde::Serialize;
use std::time::Duration;

/// Retry parameters in their runtime form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub stability_threshold: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            base_delay: Duration::from_secs(config.base_delay_secs),
            max_delay: Duration::from_secs(config.max_delay_secs),
            max_attempts: config.max_attempts,
            stability_threshold: config.stability_threshold.max(1),
        }
    }
}

impl RetryPolicy {
    /// `min(base * 2^(attempt-1), cap)` for a 1-indexed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum CloseReason {
    /// Every tracked slot reached its goal
    GameComplete,
    /// Process shutdown
    Shutdown,
    /// Server answered `ConnectionRefused`
    Rejected { errors: Vec<String> },
    /// Address cannot be connected to at all
    InvalidAddress { message: String },
    /// Too many failures without a stable run in between
    RetriesExhausted { attempts: u32, last_error: String },
}

impl CloseReason {
    /// Clean closes produce no error notice.
    pub fn is_failure(&self) -> bool {
        !matches!(self, CloseReason::GameComplete | CloseReason::Shutdown)
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::GameComplete => write!(f, "game complete"),
            CloseReason::Shutdown => write!(f, "shutdown"),
            CloseReason::Rejected { errors } => {
                write!(f, "connection refused: {}", errors.join(", "))
            }
            CloseReason::InvalidAddress { message } => write!(f, "invalid address: {}", message),
            CloseReason::RetriesExhausted {
                attempts,
                last_error,
            } => write!(
                f,
                "gave up after {} failed attempts (last error: {})",
                attempts, last_error
            ),
        }
    }
}

/// Lifecycle phase of a tracked connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    /// Transport being opened
    Connecting,
    /// `Connect` sent, waiting for `Connected`
    HandshakePending,
    /// Handshake accepted; `streak` messages processed in a row since
    Confirmed { streak: u32 },
    /// Enough clean messages after confirmation
    Stable,
    /// Idle receive timeout hit; keepalive ping outstanding. `streak` is
    /// carried over from `Confirmed` and resumes when the probe is answered.
    Probing { stable: bool, streak: u32 },
    /// Waiting out a backoff delay
    Retrying { delay: Duration },
    Closed(CloseReason),
}

/// Input to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Transport open and `Connect` sent
    TransportOpened,
    /// Classifier saw `Connected`
    HandshakeConfirmed,
    /// One inbound message handled without error
    MessageProcessed,
    /// One inbound message failed to process; session continues
    MessageFailed,
    /// Keepalive answered
    PongReceived,
    /// Receive timeout for the current phase elapsed
    IdleTimeout,
    /// Connect, send or receive failed
    TransportFailed(String),
    /// Server refused the handshake
    Rejected(Vec<String>),
    /// Address is malformed
    InvalidAddress(String),
    /// Classifier decided the game is over
    GameComplete,
    Shutdown,
    /// Backoff delay finished
    RetryElapsed,
}

/// What the listener must do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    None,
    /// Open a transport and send the handshake
    Connect,
    /// Send a keepalive ping and wait for the pong timeout
    Probe,
    /// Sleep, then feed [`Event::RetryElapsed`]
    Wait(Duration),
    /// Close the transport and stop; the reason says whether to report it
    Close(CloseReason),
}

/// Retry state for one server address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    phase: Phase,
    attempts: u32,
    policy: RetryPolicy,
}

impl Session {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            phase: Phase::Connecting,
            attempts: 0,
            policy,
        }
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    /// Failed attempts since the last stable run.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(
            self.phase,
            Phase::Confirmed { .. } | Phase::Stable | Phase::Probing { .. }
        )
    }

    pub fn is_stable(&self) -> bool {
        matches!(
            self.phase,
            Phase::Stable | Phase::Probing { stable: true, .. }
        )
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.phase, Phase::Closed(_))
    }

    /// Receive timeout that applies in the current phase.
    pub fn receive_timeout(&self, timeouts: &TimeoutConfig) -> Duration {
        match self.phase {
            Phase::Probing { .. } => timeouts.pong_timeout(),
            Phase::Confirmed { .. } | Phase::Stable => timeouts.idle(),
            _ => timeouts.handshake(),
        }
    }

    /// Apply one event.
    pub fn step(self, event: Event) -> (Session, Action) {
        let Session {
            phase,
            attempts,
            policy,
        } = self;
        let at = |phase: Phase, attempts: u32| Session {
            phase,
            attempts,
            policy,
        };

        match (phase, event) {
            (Phase::Closed(reason), _) => (at(Phase::Closed(reason), attempts), Action::None),

            // Terminal events are honored from any live phase.
            (_, Event::Shutdown) => close(at(Phase::Connecting, attempts), CloseReason::Shutdown),
            (_, Event::GameComplete) => {
                close(at(Phase::Connecting, attempts), CloseReason::GameComplete)
            }
            (_, Event::Rejected(errors)) => close(
                at(Phase::Connecting, attempts),
                CloseReason::Rejected { errors },
            ),
            (_, Event::InvalidAddress(message)) => close(
                at(Phase::Connecting, attempts),
                CloseReason::InvalidAddress { message },
            ),

            (Phase::Connecting, Event::TransportOpened) => {
                (at(Phase::HandshakePending, attempts), Action::None)
            }
            (Phase::HandshakePending, Event::HandshakeConfirmed) => {
                (at(Phase::Confirmed { streak: 0 }, attempts), Action::None)
            }

            (Phase::Confirmed { streak }, Event::MessageProcessed)
            | (
                Phase::Probing {
                    stable: false,
                    streak,
                },
                Event::MessageProcessed,
            ) => {
                let streak = streak + 1;
                if streak >= policy.stability_threshold {
                    (at(Phase::Stable, 0), Action::None)
                } else {
                    (at(Phase::Confirmed { streak }, attempts), Action::None)
                }
            }
            (Phase::Confirmed { .. }, Event::MessageFailed) => {
                (at(Phase::Confirmed { streak: 0 }, attempts), Action::None)
            }

            // Any traffic answers a probe.
            (
                Phase::Probing { stable: true, .. },
                Event::PongReceived | Event::MessageProcessed,
            ) => (at(Phase::Stable, attempts), Action::None),
            (Phase::Probing { streak, .. }, Event::PongReceived) => {
                (at(Phase::Confirmed { streak }, attempts), Action::None)
            }

            (Phase::Confirmed { streak }, Event::IdleTimeout) => (
                at(
                    Phase::Probing {
                        stable: false,
                        streak,
                    },
                    attempts,
                ),
                Action::Probe,
            ),
            (Phase::Stable, Event::IdleTimeout) => (
                at(
                    Phase::Probing {
                        stable: true,
                        streak: 0,
                    },
                    attempts,
                ),
                Action::Probe,
            ),
            (Phase::Probing { stable, streak }, Event::IdleTimeout) => fail(
                at(Phase::Probing { stable, streak }, attempts),
                stable,
                "keepalive probe unanswered".to_string(),
            ),
            (phase @ (Phase::Connecting | Phase::HandshakePending), Event::IdleTimeout) => fail(
                at(phase, attempts),
                false,
                "handshake not confirmed in time".to_string(),
            ),

            (Phase::Stable, Event::TransportFailed(error)) => {
                fail(at(Phase::Stable, attempts), true, error)
            }
            (Phase::Probing { stable, streak }, Event::TransportFailed(error)) => {
                fail(at(Phase::Probing { stable, streak }, attempts), stable, error)
            }
            (
                phase @ (Phase::Connecting | Phase::HandshakePending | Phase::Confirmed { .. }),
                Event::TransportFailed(error),
            ) => fail(at(phase, attempts), false, error),

            (Phase::Retrying { .. }, Event::RetryElapsed) => {
                (at(Phase::Connecting, attempts), Action::Connect)
            }

            // Everything else leaves the state untouched.
            (phase, _) => (at(phase, attempts), Action::None),
        }
    }
}

fn close(session: Session, reason: CloseReason) -> (Session, Action) {
    let session = Session {
        phase: Phase::Closed(reason.clone()),
        ..session
    };
    (session, Action::Close(reason))
}

/// Count a failure and either schedule a retry or give up.
///
/// A drop after a stable run starts over at attempt 1.
fn fail(session: Session, was_stable: bool, error: String) -> (Session, Action) {
    let attempts = if was_stable {
        1
    } else {
        session.attempts.saturating_add(1)
    };
    if attempts > session.policy.max_attempts {
        return close(
            Session {
                attempts,
                ..session
            },
            CloseReason::RetriesExhausted {
                attempts,
                last_error: error,
            },
        );
    }
    let delay = session.policy.backoff(attempts);
    (
        Session {
            phase: Phase::Retrying { delay },
            attempts,
            policy: session.policy,
        },
        Action::Wait(delay),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            max_attempts: 3,
            stability_threshold: 5,
        }
    }

    fn run(session: Session, events: Vec<Event>) -> (Session, Action) {
        let mut state = (session, Action::None);
        for event in events {
            state = state.0.step(event);
        }
        state
    }

    fn confirmed() -> Session {
        run(
            Session::new(policy()),
            vec![Event::TransportOpened, Event::HandshakeConfirmed],
        )
        .0
    }

    fn failed(session: Session) -> Session {
        let (session, _) = session.step(Event::TransportFailed("reset".into()));
        session.step(Event::RetryElapsed).0
    }

    #[test]
    fn test_backoff_sequence() {
        let delays: Vec<u64> = (1..=7).map(|n| policy().backoff(n).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 32, 60, 60]);
        assert_eq!(policy().backoff(200), Duration::from_secs(60));
    }

    #[test]
    fn test_handshake_progression() {
        let (session, action) = Session::new(policy()).step(Event::TransportOpened);
        assert_eq!(session.phase(), &Phase::HandshakePending);
        assert_eq!(action, Action::None);
        assert!(!session.is_confirmed());

        let (session, _) = session.step(Event::HandshakeConfirmed);
        assert_eq!(session.phase(), &Phase::Confirmed { streak: 0 });
        assert!(session.is_confirmed());
    }

    #[test]
    fn test_stability_on_fifth_message_resets_attempts() {
        let mut session = Session::new(policy());
        session = failed(session);
        session = failed(session);
        assert_eq!(session.attempts(), 2);

        session = run(
            session,
            vec![Event::TransportOpened, Event::HandshakeConfirmed],
        )
        .0;
        for _ in 0..4 {
            session = session.step(Event::MessageProcessed).0;
        }
        assert_eq!(session.phase(), &Phase::Confirmed { streak: 4 });
        assert_eq!(session.attempts(), 2);

        session = session.step(Event::MessageProcessed).0;
        assert_eq!(session.phase(), &Phase::Stable);
        assert_eq!(session.attempts(), 0);
    }

    #[test]
    fn test_failed_message_resets_streak() {
        let session = run(
            confirmed(),
            vec![
                Event::MessageProcessed,
                Event::MessageProcessed,
                Event::MessageFailed,
                Event::MessageProcessed,
            ],
        )
        .0;
        assert_eq!(session.phase(), &Phase::Confirmed { streak: 1 });
    }

    #[test]
    fn test_unstable_failures_exhaust_attempts() {
        let mut session = Session::new(policy());
        let mut waits = Vec::new();
        for _ in 0..3 {
            let (next, action) = session.step(Event::TransportFailed("refused".into()));
            waits.push(action);
            session = next.step(Event::RetryElapsed).0;
        }
        assert_eq!(
            waits,
            vec![
                Action::Wait(Duration::from_secs(2)),
                Action::Wait(Duration::from_secs(4)),
                Action::Wait(Duration::from_secs(8)),
            ]
        );

        let (session, action) = session.step(Event::TransportFailed("refused".into()));
        assert!(session.is_closed());
        let Action::Close(reason) = action else {
            panic!("expected close, got {:?}", action);
        };
        assert!(reason.is_failure());
        assert_eq!(
            reason,
            CloseReason::RetriesExhausted {
                attempts: 4,
                last_error: "refused".into()
            }
        );
    }

    #[test]
    fn test_stable_drop_restarts_at_attempt_one() {
        let mut session = confirmed();
        for _ in 0..5 {
            session = session.step(Event::MessageProcessed).0;
        }
        assert!(session.is_stable());

        let (session, action) = session.step(Event::TransportFailed("eof".into()));
        assert_eq!(session.attempts(), 1);
        assert_eq!(action, Action::Wait(Duration::from_secs(2)));

        let (session, action) = session.step(Event::RetryElapsed);
        assert_eq!(session.phase(), &Phase::Connecting);
        assert_eq!(action, Action::Connect);
    }

    #[test]
    fn test_rejection_and_bad_address_are_terminal() {
        let (session, action) =
            Session::new(policy()).step(Event::InvalidAddress("no scheme".into()));
        assert!(session.is_closed());
        assert!(matches!(action, Action::Close(CloseReason::InvalidAddress { .. })));

        let (session, action) = run(
            Session::new(policy()),
            vec![
                Event::TransportOpened,
                Event::Rejected(vec!["InvalidPassword".into()]),
            ],
        );
        assert!(matches!(action, Action::Close(CloseReason::Rejected { .. })));
        assert_eq!(session.attempts(), 0);

        // Closed sessions ignore further input.
        let (session, action) = session.step(Event::RetryElapsed);
        assert!(session.is_closed());
        assert_eq!(action, Action::None);
    }

    #[test]
    fn test_game_complete_is_clean_close() {
        let (session, action) = confirmed().step(Event::GameComplete);
        assert!(session.is_closed());
        let Action::Close(reason) = action else {
            panic!("expected close");
        };
        assert!(!reason.is_failure());
    }

    #[test]
    fn test_answered_probe_keeps_streak() {
        let session = run(
            confirmed(),
            vec![
                Event::MessageProcessed,
                Event::MessageProcessed,
                Event::MessageProcessed,
            ],
        )
        .0;

        let (probing, action) = session.clone().step(Event::IdleTimeout);
        assert_eq!(action, Action::Probe);
        assert_eq!(
            probing.phase(),
            &Phase::Probing {
                stable: false,
                streak: 3
            }
        );

        let (ponged, _) = probing.clone().step(Event::PongReceived);
        assert_eq!(ponged.phase(), &Phase::Confirmed { streak: 3 });

        // A message answering the probe counts toward stability too.
        let (answered, _) = probing.step(Event::MessageProcessed);
        assert_eq!(answered.phase(), &Phase::Confirmed { streak: 4 });
        let (stable, _) = answered.step(Event::MessageProcessed);
        assert!(stable.is_stable());
        assert_eq!(stable.attempts(), 0);
    }

    #[test]
    fn test_idle_timeouts_depend_on_confirmation() {
        let timeouts = TimeoutConfig::default();

        let pending = Session::new(policy()).step(Event::TransportOpened).0;
        assert_eq!(pending.receive_timeout(&timeouts), Duration::from_secs(30));
        let (after, action) = pending.step(Event::IdleTimeout);
        assert!(matches!(after.phase(), Phase::Retrying { .. }));
        assert_eq!(action, Action::Wait(Duration::from_secs(2)));

        let session = confirmed();
        assert_eq!(session.receive_timeout(&timeouts), Duration::from_secs(120));
        let (probing, action) = session.step(Event::IdleTimeout);
        assert_eq!(action, Action::Probe);
        assert_eq!(probing.receive_timeout(&timeouts), Duration::from_secs(10));

        let (answered, _) = probing.clone().step(Event::PongReceived);
        assert_eq!(answered.phase(), &Phase::Confirmed { streak: 0 });

        let (dead, action) = probing.step(Event::IdleTimeout);
        assert!(matches!(dead.phase(), Phase::Retrying { .. }));
        assert!(matches!(action, Action::Wait(_)));
    }
}
