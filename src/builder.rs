//! Unsigned transaction construction: fee schedule and coin selection.

use std::fmt;

use bitcoin::{
    absolute, transaction::Version, Amount, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
};

use crate::balance::BalanceEngine;
use crate::chain::{AddressChain, DerivationError};
use crate::graph::TxGraph;

/// Minimum fee per 1000 bytes enforced by the standard relay policy.
pub const TX_FEE_PER_KB: u64 = 1_000;

/// Default fee rate, chosen so a 191-byte transaction pays the standard fee.
pub const DEFAULT_FEE_PER_KB: u64 = (TX_FEE_PER_KB * 1_000 + 190) / 191;

/// Size estimate of a signed pay-to-pubkey-hash input.
pub(crate) const TX_INPUT_SIZE: usize = 148;

/// Size of a pay-to-pubkey-hash output.
pub(crate) const TX_OUTPUT_SIZE: usize = 34;

// serialized length of an input with empty script and no witness
const EMPTY_INPUT_SIZE: usize = 41;

/// Errors from [`create_tx_for_outputs`](crate::Wallet::create_tx_for_outputs).
#[derive(Debug)]
pub enum CreateTxError {
    /// The requested output list is empty.
    EmptyOutputs,
    /// A requested output carries no value.
    ZeroAmount,
    /// The spendable balance cannot cover the requested amount plus fee.
    InsufficientFunds {
        /// Satoshis reachable by selection.
        available: u64,
        /// Requested amount plus the estimated fee.
        required: u64,
    },
    /// Deriving a change address failed.
    Derivation(DerivationError),
}

impl fmt::Display for CreateTxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyOutputs => write!(f, "no outputs requested"),
            Self::ZeroAmount => write!(f, "output amount must be non-zero"),
            Self::InsufficientFunds {
                available,
                required,
            } => write!(
                f,
                "insufficient funds: {} sat available, {} sat required",
                available, required
            ),
            Self::Derivation(err) => write!(f, "change address derivation failed: {}", err),
        }
    }
}

impl std::error::Error for CreateTxError {}

impl From<DerivationError> for CreateTxError {
    fn from(err: DerivationError) -> Self {
        CreateTxError::Derivation(err)
    }
}

/// Fee for a transaction of `size` bytes: the configured rate rounded up to
/// 100-satoshi granularity, floored by the standard per-kilobyte fee.
pub fn fee_for_tx_size(fee_per_kb: u64, size: usize) -> u64 {
    let size = size as u64;
    let standard = size.div_ceil(1_000) * TX_FEE_PER_KB;
    let fee = (size * fee_per_kb / 1_000).div_ceil(100) * 100;
    fee.max(standard)
}

/// Outputs below this amount cost more to spend later than they are worth.
pub fn min_output_amount(fee_per_kb: u64) -> u64 {
    fee_per_kb * 3 * (TX_OUTPUT_SIZE as u64 + TX_INPUT_SIZE as u64) / 1_000
}

/// Serialized size of `tx`, counting each not-yet-signed input at the
/// standard signed-input estimate.
pub(crate) fn estimated_tx_size(tx: &Transaction) -> usize {
    let unsigned = tx
        .input
        .iter()
        .filter(|input| input.script_sig.is_empty() && input.witness.is_empty())
        .count();
    tx.total_size() + unsigned * (TX_INPUT_SIZE - EMPTY_INPUT_SIZE)
}

pub(crate) struct Selection {
    /// The unsigned transaction, change output not yet attached.
    pub tx: Transaction,
    /// Excess over amount plus fee, when large enough for a change output.
    pub change: Option<u64>,
}

/// Select inputs from the UTXO set, in history order, until the requested
/// outputs and the estimated fee are covered.
///
/// An unconfirmed funding transaction that the wallet received without
/// spending anything adds its own size to the fee estimate, so the new
/// transaction pays for its parent's confirmation as well.
pub(crate) fn select_coins(
    graph: &TxGraph,
    engine: &BalanceEngine,
    chains: &AddressChain,
    fee_per_kb: u64,
    outputs: Vec<TxOut>,
) -> Result<Selection, CreateTxError> {
    if outputs.is_empty() {
        return Err(CreateTxError::EmptyOutputs);
    }
    if outputs.iter().any(|output| output.value == Amount::ZERO) {
        return Err(CreateTxError::ZeroAmount);
    }

    let amount: u64 = outputs.iter().map(|output| output.value.to_sat()).sum();
    let mut tx = Transaction {
        version: Version::TWO,
        lock_time: absolute::LockTime::ZERO,
        input: Vec::new(),
        output: outputs,
    };

    let dust = min_output_amount(fee_per_kb);
    let mut balance = 0u64;
    let mut fee = 0u64;
    let mut cpfp_size = 0usize;

    for outpoint in engine.utxos() {
        let Some(funding) = graph.get(&outpoint.txid) else {
            continue;
        };

        tx.input.push(TxIn {
            previous_output: *outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        });
        balance += funding.tx().output[outpoint.vout as usize].value.to_sat();

        if !funding.is_confirmed() && engine.amount_sent_by(funding.tx(), graph, chains) == 0 {
            cpfp_size += estimated_tx_size(funding.tx());
        }

        // reserve room for a change output
        fee = fee_for_tx_size(
            fee_per_kb,
            estimated_tx_size(&tx) + TX_OUTPUT_SIZE + cpfp_size,
        );
        if balance == amount + fee || balance >= amount + fee + dust {
            break;
        }
    }

    if balance < amount + fee {
        return Err(CreateTxError::InsufficientFunds {
            available: balance,
            required: amount + fee,
        });
    }

    let excess = balance - amount - fee;
    let change = (excess >= dust).then_some(excess);
    Ok(Selection { tx, change })
}
