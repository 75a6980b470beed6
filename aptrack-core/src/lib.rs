//! # aptrack-core
//!
//! Core library for aptrack - a tracker for Archipelago multiworld servers.
//!
//! This library provides:
//! - A long-lived websocket listener per game server, with reconnect backoff
//! - Classification and noise filtering of server-pushed events
//! - Progress and hint economics reconciled from live events and save files
//! - A tolerant decoder for the server's compressed save files
//! - Configuration, logging and small persisted state files
//!
//! ## Architecture
//!
//! Progress has two sources that never talk to each other:
//! - **Live:** location checks seen over the websocket this session
//! - **Snapshot:** the server's save file, re-read from disk on every query
//!
//! Queries take the union of both; live data only ever adds.
//!
//! ## Example
//!
//! ```rust,no_run
//! use aptrack_core::config::ServerConfig;
//! use aptrack_core::{Config, Tracker};
//!
//! # async fn run() -> aptrack_core::Result<()> {
//! let config = Config::load()?;
//! let (mut tracker, mut notifications) = Tracker::new(&config);
//! tracker.start(ServerConfig::for_address("archipelago.gg:38281"))?;
//!
//! while let Some(notification) = notifications.recv().await {
//!     println!("{}", notification);
//! }
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use catalog::{Catalog, CatalogStore};
pub use config::Config;
pub use error::{Error, Result};
pub use progress::{PlayerProgress, ProgressEngine, ProgressSources};
pub use tracker::Tracker;
pub use types::*;

// Public modules
pub mod admin;
pub mod catalog;
pub mod config;
pub mod error;
pub mod format;
pub mod hints;
pub mod logging;
pub mod progress;
pub mod protocol;
pub mod savefile;
pub mod state;
pub mod tracker;
pub mod types;
