//! Defines a Coinswap Taker Client.
//!
//! This module contains the entire swap workflow as major decision makings are involved for the
//! Taker. Makers are simple request-response servers.
//! The Taker handles all necessary communications between one or many makers to route the swap:
//! - Keeps a live offerbook of makers in the background
//! - Selects a route of makers for each swap
//! - Drives the multi-hop swap state machine
//! - Recovers its funds when a maker drops out mid-swap
//!
//! For detailed protocol documentation between takers and makers, see the
//! [dev book](https://github.com/citadel-tech/coinswap/blob/master/docs/dev-book.md).
mod api;
mod background_services;
mod config;
mod coordinator;
pub mod error;
pub mod offers;
mod recovery;
pub mod routes;
mod routines;
pub mod swap;
pub mod swap_tracker;

pub use api::{SwapParams, Taker, TakerBackends};
pub use config::TakerConfig;
pub use error::{NoRouteError, SwapError, TakerError};
pub use offers::{
    MakerAddress, MakerEntry, MakerHealth, MakerId, OfferBook, OfferBookHandle, OfferSyncService,
};
pub use recovery::{PendingRefund, RecoveryOutcome};
pub use routes::{select_route, RoutePolicy};
pub use routines::MakerTransport;
pub use swap::{HopContract, HopStatus, Route, SwapAttempt, SwapStatus};
pub use swap_tracker::SwapRecord;
