//! In-memory mirror of the served directory tree.
//!
//! This crate holds the whole served tree in memory and keeps it in step
//! with the disk. The disk is the source of truth; the cache is rebuilt from
//! it at startup and reconciled against it on a fixed interval afterwards.
//!
//! # Architecture
//! - [`FileCache`]: key → [`CacheEntry`] map. Any number of concurrent
//!   lookups, at most one reconcile at a time, and the exclusive lock is only
//!   ever held while the map itself is being mutated.
//! - [`Reconciler`]: walks a storage backend, works out what was added,
//!   changed and removed, reads what it must *outside* of any lock and then
//!   commits the whole delta in one step.
//! - [`RefreshLoop`]: background task driving the reconciler until shut down.

mod entry;
pub mod error;
mod reconcile;
mod refresh;
mod store;

pub use crate::entry::CacheEntry;
pub use crate::reconcile::{ReconcileStats, Reconciler, Strategy};
pub use crate::refresh::RefreshLoop;
pub use crate::store::{FileCache, Reconcile};
