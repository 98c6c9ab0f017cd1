//! Coinswap Protocol Messages.
//!
//! Messages are exchanged between one Taker and one or many Makers. Makers never talk to each
//! other, the Taker relays everything a maker needs to know about its neighbours.
//!
//! A route of `n` makers has `n + 1` hops. Hop `k` is funded by its upstream party and paid to its
//! downstream party:
//!
//! ```text
//! Taker --hop 0--> Maker1 --hop 1--> Maker2 --hop 2--> Taker
//! ```
//!
//! ```shell
//! ********* Negotiation *********
//! Taker -> Maker_i: [HopTerms]          (incoming/outgoing amount, hashlock, locktimes)
//! Maker_i -> Taker: [HopResponse]       (Accept with the maker's hashlock key, or Reject)
//!
//! ********* Funding *********
//! Taker broadcasts hop 0.
//! Taker -> Maker_i: [FundingRequest]    (once hop i-1 is confirmed)
//! Maker_i -> Taker: [FundingNotice]     (Maker_i's broadcast funding of hop i)
//!
//! ********* Settlement (last hop first) *********
//! Taker -> Maker_n ... Maker_1: [Settlement]   (the hash preimage)
//! Maker_i -> Taker:             [SettlementAck] (releases hop i)
//! ```

use std::fmt::Display;

use bitcoin::{
    hashes::hash160::Hash as Hash160, Amount, OutPoint, PublicKey, ScriptBuf, Transaction,
};
use serde::{Deserialize, Serialize};

use super::{contract::calculate_coinswap_fee, error::ProtocolError};

/// Secret whose HASH160 locks every hop of a swap.
pub type Preimage = [u8; 32];

/// Terms advertised by a maker.
///
/// Fees are charged on the amount a maker receives:
/// `base_fee + floor(amount * amount_relative_fee_pct / 100)
///  + floor(amount * locktime * time_relative_fee_pct / 100)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    /// Flat fee in sats.
    pub base_fee: u64,
    /// Percentage of the swapped amount.
    pub amount_relative_fee_pct: f64,
    /// Percentage of the swapped amount per block of locktime.
    pub time_relative_fee_pct: f64,
    /// Confirmations the maker waits for on its incoming hop before funding its outgoing one.
    pub required_confirms: u32,
    /// Smallest refund locktime (in blocks) the maker accepts.
    pub minimum_locktime: u16,
    /// Largest amount accepted, in sats.
    pub max_size: u64,
    /// Smallest amount accepted, in sats.
    pub min_size: u64,
}

impl Offer {
    /// Total fee this maker charges for `amount` with a refund locktime of `locktime` blocks.
    pub fn fee_for(&self, amount: u64, locktime: u16) -> u64 {
        calculate_coinswap_fee(
            amount,
            locktime,
            self.base_fee,
            self.amount_relative_fee_pct,
            self.time_relative_fee_pct,
        )
    }

    /// Rejects offers that cannot be honoured.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.min_size > self.max_size {
            return Err(ProtocolError::InvalidOffer("min_size exceeds max_size"));
        }
        let valid_pct = |pct: f64| pct.is_finite() && pct >= 0.0;
        if !valid_pct(self.amount_relative_fee_pct) || !valid_pct(self.time_relative_fee_pct) {
            return Err(ProtocolError::InvalidOffer("fee percentage out of range"));
        }
        Ok(())
    }

    /// Whether `amount` fits the maker's size bounds.
    pub fn accepts_amount(&self, amount: u64) -> bool {
        self.min_size <= amount && amount <= self.max_size
    }
}

/// Hashlock/timelock parameters of one hop contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractTerms {
    /// Amount locked in the contract.
    pub amount: Amount,
    /// HASH160 of the swap preimage.
    pub hashlock: Hash160,
    /// Absolute block height after which the sender can refund.
    pub locktime: u32,
}

/// Terms proposed to the maker at `position` of the route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HopTerms {
    /// Identifier of the swap attempt.
    pub swap_id: String,
    /// Position of the maker in the route, 0-based.
    pub position: usize,
    /// Contract the maker will receive.
    pub incoming: ContractTerms,
    /// Contract the maker will fund for the next party.
    pub outgoing: ContractTerms,
    /// Funding transactions per hop.
    pub tx_count: u32,
}

/// A maker's acceptance of [`HopTerms`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HopAccept {
    /// Echo of the swap identifier.
    pub swap_id: String,
    /// Key the maker will use on the hashlock branch of its incoming contract.
    pub hashlock_pubkey: PublicKey,
    /// Amount the maker commits to fund on its outgoing hop.
    pub outgoing_amount: Amount,
}

/// Answer to a hop proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HopResponse {
    /// Maker agrees to the terms.
    Accept(HopAccept),
    /// Maker refuses the terms.
    Reject {
        /// Human readable reason.
        reason: String,
    },
}

/// Asks a maker to fund its outgoing hop once its incoming hop is confirmed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingRequest {
    /// Identifier of the swap attempt.
    pub swap_id: String,
    /// Index of the hop the maker funds.
    pub hop_index: usize,
    /// Agreed terms of that hop.
    pub terms: ContractTerms,
    /// Key of the downstream party on the hashlock branch.
    pub receiver_pubkey: PublicKey,
    /// Confirmed funding outpoint of the maker's incoming hop.
    pub upstream_outpoint: OutPoint,
    /// Redeemscript of the maker's incoming contract.
    pub upstream_redeemscript: ScriptBuf,
}

/// A maker's broadcast funding of its outgoing hop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingNotice {
    /// The broadcast funding transaction.
    pub funding_tx: Transaction,
    /// Redeemscript of the funded contract.
    pub contract_redeemscript: ScriptBuf,
    /// The maker's key on the timelock branch.
    pub timelock_pubkey: PublicKey,
}

/// Reveals the swap secret to a maker during settlement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settlement {
    /// Identifier of the swap attempt.
    pub swap_id: String,
    /// Hop the maker is asked to release.
    pub hop_index: usize,
    /// The swap preimage.
    pub preimage: Preimage,
}

/// A maker's release of the hop it funded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementAck {
    /// Echo of the swap identifier.
    pub swap_id: String,
    /// Released hop.
    pub hop_index: usize,
}

impl Display for HopResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accept(_) => write!(f, "Accept"),
            Self::Reject { reason } => write!(f, "Reject({reason})"),
        }
    }
}
