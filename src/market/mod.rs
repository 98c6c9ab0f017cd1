//! Maker discovery.
//!
//! The taker learns maker endpoints from a [`MakerDirectory`]. How the directory is reached
//! (directory server, nostr relays, a static list) is up to the caller.
pub mod directory;

pub use directory::{MakerDirectory, MultiDirectory, StaticDirectory};
