//! Live game-event tracking
//!
//! ## Pipeline
//!
//! ```text
//! Tracker (supervisor, owns SessionRegistry)
//!   └─ Listener task per server address
//!        ├─ connection: connect, Connect handshake, GetDataPackage
//!        ├─ classifier: route each inbound command, filter noise,
//!        │              record live checks, emit notifications
//!        └─ retry: pure (state, event) -> (state, action) machine
//! ```
//!
//! Listeners share only the [`CatalogStore`](crate::catalog::CatalogStore)
//! and [`ConnectionDataStore`], both replaced whole on write.

pub mod classifier;
pub mod connection;
pub mod listener;
pub mod registry;
pub mod retry;
pub mod supervisor;

pub use classifier::{Classifier, Outcome};
pub use connection::{normalize_address, DEFAULT_PORT};
pub use listener::{Listener, ListenerContext, ListenerExit};
pub use registry::{ConnectionDataStore, ConnectionRecord, SessionHandle, SessionRegistry};
pub use retry::{Action, CloseReason, Event, Phase, RetryPolicy, Session};
pub use supervisor::{ProgressQuery, Tracker};
