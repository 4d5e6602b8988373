//! Offsync - offline-first local persistence with deferred remote sync
//!
//! Writes land in a local store first (SQLite, or a flat JSON store when
//! SQLite is unavailable) and are delivered to the remote API when the
//! network allows. Writes that cannot be delivered wait in an offline queue
//! that a scheduler drains on a timer and on network restore.

pub mod config;
pub mod error;
pub mod facade;
pub mod migrate;
pub mod queue;
pub mod remote;
pub mod service;
pub mod store;
pub mod sync;

pub use error::{OffsyncError, Result};
pub use facade::{ApiFacade, SaveOutcome};
pub use service::{ServiceOptions, SyncService};
