//! taskstack library crate
//!
//! A task tree that behaves like a call stack: finishing a task returns focus to its
//! parent. The crate provides the tree state machine with undo history, the session
//! store that journals and persists it, and the [`Core`] facade that serializes
//! commands from a presentation layer.

pub mod api;
pub mod cli;
pub mod config;
pub mod guide;
pub mod logging;
pub mod machine;
pub mod models;
pub mod store;

pub use api::{Core, CoreError};
pub use config::StoreConfig;
pub use machine::{AddOutcome, RemoveOutcome, TreeMachine};
pub use models::{Node, NodeId, NodeStatus, Snapshot, TreeError, TreeState};
pub use store::{SessionStore, StoreError};
