//! Interfaces to the systems around a tracked game: the game server process
//! and the object store holding player configuration files.
//!
//! Nothing in the tracking pipeline depends on these.

pub mod process;
pub mod storage;

pub use process::{LocalServerProcess, ProcessManager};
pub use storage::{LocalObjectStore, Metadata, ObjectEntry, ObjectStore};
