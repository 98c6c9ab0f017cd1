//! Chain feed for the taker.
//!
//! The taker never indexes the blockchain itself. A [`ChainBackend`] supplied by the caller
//! broadcasts transactions, answers confirmation and spend queries and pushes block/transaction
//! notifications. [`ChainWatcher`] turns those notifications into the bounded waits the swap
//! coordinator and the recovery manager need.

pub mod backend;
pub mod watcher;
pub mod watcher_error;

pub use backend::{BroadcastError, ChainBackend, ChainEvent};
pub use watcher::ChainWatcher;
pub use watcher_error::{ChainError, WatcherError};
