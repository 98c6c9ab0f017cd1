//! Coinswap protocol primitives: maker offers, the messages exchanged with makers,
//! and the hashlock/timelock contracts every hop is locked in.
pub mod contract;
pub mod error;
pub mod messages;

pub use bitcoin::hashes::hash160::Hash as Hash160;
pub use messages::{
    ContractTerms, FundingNotice, FundingRequest, HopAccept, HopResponse, HopTerms, Offer,
    Preimage, Settlement, SettlementAck,
};
