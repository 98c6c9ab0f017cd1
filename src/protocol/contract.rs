//! Hop contracts: fee schedule, locktime schedule, redeemscripts and the transactions that fund
//! and spend them.
//!
//! Every hop locks its amount in a P2WSH output with two spending branches:
//!
//! ```text
//! OP_SIZE 32 OP_EQUAL
//! OP_IF
//!     OP_HASH160 <hashlock> OP_EQUALVERIFY <receiver pubkey>
//! OP_ELSE
//!     <locktime> OP_CHECKLOCKTIMEVERIFY OP_DROP <sender pubkey>
//! OP_ENDIF
//! OP_CHECKSIG
//! ```
//!
//! The receiver claims with the swap preimage, the sender refunds once the absolute
//! `locktime` height is reached.

use bitcoin::{
    absolute::LockTime,
    hashes::{hash160::Hash as Hash160, Hash},
    opcodes::all::{
        OP_CHECKSIG, OP_CLTV, OP_DROP, OP_ELSE, OP_ENDIF, OP_EQUAL, OP_EQUALVERIFY, OP_HASH160,
        OP_IF, OP_SIZE,
    },
    script,
    secp256k1::rand::{rngs::OsRng, RngCore},
    transaction::Version,
    Amount, OutPoint, PublicKey, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
};
use serde::{Deserialize, Serialize};

use super::{
    error::ContractError,
    messages::{ContractTerms, FundingNotice, Preimage},
};

/// Virtual size of a transaction spending one contract output to one P2WPKH output.
pub const CONTRACT_SPEND_VSIZE: u64 = 160;

const TX_OVERHEAD_VSIZE: u64 = 11;
const P2WPKH_INPUT_VSIZE: u64 = 68;
const P2WSH_OUTPUT_VSIZE: u64 = 43;
const P2WPKH_OUTPUT_VSIZE: u64 = 31;

/// Outputs below this value are not worth creating.
pub const DUST_LIMIT: Amount = Amount::from_sat(546);

/// Per-category breakdown of one maker's fee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FeeBreakdown {
    /// Flat fee.
    pub base: u64,
    /// Fee proportional to the amount.
    pub amount_relative: u64,
    /// Fee proportional to amount and locktime.
    pub time_relative: u64,
}

impl FeeBreakdown {
    /// Sum of all categories.
    pub fn total(&self) -> u64 {
        self.base + self.amount_relative + self.time_relative
    }
}

/// Splits a maker fee into its categories. Each proportional part is floored to whole sats.
pub fn fee_breakdown(
    swap_amount: u64,
    refund_locktime: u16,
    base_fee: u64,
    amount_relative_fee_pct: f64,
    time_relative_fee_pct: f64,
) -> FeeBreakdown {
    let amount = swap_amount as f64;
    FeeBreakdown {
        base: base_fee,
        amount_relative: (amount * amount_relative_fee_pct / 100.0).floor() as u64,
        time_relative: (amount * refund_locktime as f64 * time_relative_fee_pct / 100.0).floor()
            as u64,
    }
}

/// Total fee a maker charges for relaying `swap_amount` with a refund locktime of
/// `refund_locktime` blocks.
pub fn calculate_coinswap_fee(
    swap_amount: u64,
    refund_locktime: u16,
    base_fee: u64,
    amount_relative_fee_pct: f64,
    time_relative_fee_pct: f64,
) -> u64 {
    fee_breakdown(
        swap_amount,
        refund_locktime,
        base_fee,
        amount_relative_fee_pct,
        time_relative_fee_pct,
    )
    .total()
}

/// Relative locktimes, in blocks, for the `maker_count + 1` hops of a route.
///
/// Hop `k` gets `base + step * (maker_count - k)`, so every upstream hop expires
/// `step` blocks after the one downstream of it.
pub fn locktime_offsets(maker_count: usize, base: u16, step: u16) -> Vec<u16> {
    (0..=maker_count)
        .map(|k| base.saturating_add(step.saturating_mul((maker_count - k) as u16)))
        .collect()
}

/// Checks that hop locktimes strictly decrease from the first hop to the last.
pub fn validate_locktime_schedule(locktimes: &[u32]) -> Result<(), ContractError> {
    for (hop, pair) in locktimes.windows(2).enumerate() {
        if pair[1] >= pair[0] {
            return Err(ContractError::NonDecreasingLocktime {
                hop: hop + 1,
                previous: pair[0],
                current: pair[1],
            });
        }
    }
    Ok(())
}

/// Fresh random swap secret.
pub fn generate_preimage() -> Preimage {
    let mut preimage = [0u8; 32];
    OsRng.fill_bytes(&mut preimage);
    preimage
}

/// HASH160 of the preimage.
pub fn hashlock_of(preimage: &Preimage) -> Hash160 {
    Hash160::hash(preimage)
}

/// Builds the hashlock/timelock redeemscript of a hop.
pub fn create_contract_redeemscript(
    hashlock: &Hash160,
    hashlock_pubkey: &PublicKey,
    timelock_pubkey: &PublicKey,
    locktime: u32,
) -> Result<ScriptBuf, ContractError> {
    let locktime = LockTime::from_height(locktime)?;
    Ok(script::Builder::new()
        .push_opcode(OP_SIZE)
        .push_int(32)
        .push_opcode(OP_EQUAL)
        .push_opcode(OP_IF)
        .push_opcode(OP_HASH160)
        .push_slice(hashlock.to_byte_array())
        .push_opcode(OP_EQUALVERIFY)
        .push_key(hashlock_pubkey)
        .push_opcode(OP_ELSE)
        .push_lock_time(locktime)
        .push_opcode(OP_CLTV)
        .push_opcode(OP_DROP)
        .push_key(timelock_pubkey)
        .push_opcode(OP_ENDIF)
        .push_opcode(OP_CHECKSIG)
        .into_script())
}

/// P2WSH script pubkey paying to a contract.
pub fn contract_script_pubkey(redeemscript: &ScriptBuf) -> ScriptBuf {
    ScriptBuf::new_p2wsh(&redeemscript.wscript_hash())
}

/// Locates the output of `tx` paying `amount` to `redeemscript`.
pub fn find_contract_output(
    hop: usize,
    tx: &Transaction,
    redeemscript: &ScriptBuf,
    amount: Amount,
) -> Result<OutPoint, ContractError> {
    let spk = contract_script_pubkey(redeemscript);
    let (vout, output) = tx
        .output
        .iter()
        .enumerate()
        .find(|(_, out)| out.script_pubkey == spk)
        .ok_or(ContractError::MissingContractOutput { hop })?;

    if output.value != amount {
        return Err(ContractError::IncorrectFundingAmount {
            expected: amount,
            found: output.value,
        });
    }

    Ok(OutPoint {
        txid: tx.compute_txid(),
        vout: vout as u32,
    })
}

/// Verifies a maker's funding of hop `hop` against the agreed terms.
///
/// Returns the funded contract outpoint.
pub fn verify_funding_notice(
    hop: usize,
    notice: &FundingNotice,
    terms: &ContractTerms,
    receiver_pubkey: &PublicKey,
) -> Result<OutPoint, ContractError> {
    let expected = create_contract_redeemscript(
        &terms.hashlock,
        receiver_pubkey,
        &notice.timelock_pubkey,
        terms.locktime,
    )?;
    if expected != notice.contract_redeemscript {
        return Err(ContractError::RedeemscriptMismatch { hop });
    }
    find_contract_output(hop, &notice.funding_tx, &expected, terms.amount)
}

/// Estimated fee of a funding transaction.
pub fn funding_fee(input_count: usize, with_change: bool, fee_rate: f64) -> Amount {
    let outputs = P2WSH_OUTPUT_VSIZE + if with_change { P2WPKH_OUTPUT_VSIZE } else { 0 };
    let vsize = TX_OVERHEAD_VSIZE + P2WPKH_INPUT_VSIZE * input_count as u64 + outputs;
    Amount::from_sat((vsize as f64 * fee_rate).ceil() as u64)
}

/// Estimated fee of a contract spend (refund or claim).
pub fn contract_spend_fee(fee_rate: f64) -> Amount {
    Amount::from_sat((CONTRACT_SPEND_VSIZE as f64 * fee_rate).ceil() as u64)
}

/// Unsigned funding transaction paying `amount` into a contract, plus optional change.
pub fn build_funding_tx(
    inputs: &[OutPoint],
    contract_spk: ScriptBuf,
    amount: Amount,
    change: Option<(ScriptBuf, Amount)>,
) -> Transaction {
    let mut output = vec![TxOut {
        value: amount,
        script_pubkey: contract_spk,
    }];
    if let Some((script_pubkey, value)) = change {
        output.push(TxOut {
            value,
            script_pubkey,
        });
    }

    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: inputs
            .iter()
            .map(|outpoint| TxIn {
                previous_output: *outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            })
            .collect(),
        output,
    }
}

/// Unsigned transaction sweeping a contract output to `destination`.
///
/// `refund_height` selects the timelock branch: the transaction is then only valid from that
/// height on. Without it the spend is a hashlock claim valid immediately.
pub fn build_contract_spend(
    contract: OutPoint,
    input_value: Amount,
    fee: Amount,
    destination: ScriptBuf,
    refund_height: Option<u32>,
) -> Result<Transaction, ContractError> {
    let value = input_value
        .checked_sub(fee)
        .filter(|value| *value >= DUST_LIMIT)
        .ok_or(ContractError::ValueBelowFee {
            outpoint: contract,
            fee,
        })?;

    let (lock_time, sequence) = match refund_height {
        Some(height) => (
            LockTime::from_height(height)?,
            Sequence::ENABLE_LOCKTIME_NO_RBF,
        ),
        None => (LockTime::ZERO, Sequence::MAX),
    };

    Ok(Transaction {
        version: Version::TWO,
        lock_time,
        input: vec![TxIn {
            previous_output: contract,
            script_sig: ScriptBuf::new(),
            sequence,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value,
            script_pubkey: destination,
        }],
    })
}
