//! Derived wallet state: the UTXO set, running balance and conflict tracking.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use bitcoin::{OutPoint, Sequence, Transaction, Txid};
use tracing::debug;

use crate::chain::AddressChain;
use crate::graph::TxGraph;
use crate::tx::{WalletTx, LOCKTIME_THRESHOLD};

/// State derived from the transaction history: unspent outputs, the running
/// balance, totals, and the set of unconfirmed transactions known to conflict
/// with earlier ones.
///
/// Everything here is rebuilt from scratch by [`recompute`](Self::recompute)
/// after any structural change to the history; the individual fields are
/// never patched incrementally.
#[derive(Debug, Default)]
pub struct BalanceEngine {
    balance: u64,
    total_sent: u64,
    total_received: u64,
    utxos: Vec<OutPoint>,
    balance_hist: Vec<u64>,
    spent_outputs: HashSet<OutPoint>,
    invalid: HashSet<Txid>,
}

impl BalanceEngine {
    /// Current balance in satoshis, excluding invalid transactions.
    pub fn balance(&self) -> u64 {
        self.balance
    }

    /// Total amount ever spent from the wallet.
    pub fn total_sent(&self) -> u64 {
        self.total_sent
    }

    /// Total amount ever received by the wallet.
    pub fn total_received(&self) -> u64 {
        self.total_received
    }

    /// Unspent outputs in history order.
    pub fn utxos(&self) -> &[OutPoint] {
        &self.utxos
    }

    /// Whether `outpoint` is spent by a registered, non-conflicting transaction.
    pub fn is_spent(&self, outpoint: &OutPoint) -> bool {
        self.spent_outputs.contains(outpoint)
    }

    /// Whether the registered transaction `txid` conflicts with an earlier one.
    pub fn is_invalid(&self, txid: &Txid) -> bool {
        self.invalid.contains(txid)
    }

    /// Rebuild all derived state from the sorted history.
    ///
    /// Returns true when the resulting balance differs from the previous one,
    /// so the caller can notify once its lock is released.
    pub fn recompute(&mut self, graph: &TxGraph, chains: &AddressChain) -> bool {
        let mut balance = 0u64;
        let mut prev_balance = 0u64;

        self.utxos.clear();
        self.balance_hist.clear();
        self.spent_outputs.clear();
        self.invalid.clear();
        self.total_sent = 0;
        self.total_received = 0;

        for wtx in graph.iter_sorted() {
            // an unconfirmed transaction whose input is already spent, or
            // whose funding transaction is itself invalid, is a double spend
            if !wtx.is_confirmed() {
                let conflicted = wtx.tx().input.iter().any(|input| {
                    self.spent_outputs.contains(&input.previous_output)
                        || self.invalid.contains(&input.previous_output.txid)
                });
                if conflicted {
                    self.invalid.insert(wtx.txid());
                    self.balance_hist.push(balance);
                    continue;
                }
            }

            // spent even when the referenced tx is unknown, so a later
            // registration of it cannot double-count the output
            for input in &wtx.tx().input {
                self.spent_outputs.insert(input.previous_output);
            }

            for (vout, output) in wtx.tx().output.iter().enumerate() {
                if chains.contains_script(&output.script_pubkey) {
                    self.utxos.push(OutPoint::new(wtx.txid(), vout as u32));
                    balance += output.value.to_sat();
                }
            }

            // arrival order is not guaranteed, so sweep the whole UTXO list
            // against the spent set rather than only this tx's outputs
            for i in (0..self.utxos.len()).rev() {
                let outpoint = self.utxos[i];
                if !self.spent_outputs.contains(&outpoint) {
                    continue;
                }
                if let Some(funding) = graph.get(&outpoint.txid) {
                    balance -= funding.tx().output[outpoint.vout as usize].value.to_sat();
                }
                self.utxos.remove(i);
            }

            if prev_balance < balance {
                self.total_received += balance - prev_balance;
            }
            if balance < prev_balance {
                self.total_sent += prev_balance - balance;
            }
            self.balance_hist.push(balance);
            prev_balance = balance;
        }

        let changed = balance != self.balance;
        self.balance = balance;
        debug!(
            balance,
            utxos = self.utxos.len(),
            invalid = self.invalid.len(),
            "recomputed wallet state"
        );
        changed
    }

    /// Balance right after `txid` in history order, or the current balance
    /// when the transaction is not registered.
    pub fn balance_after(&self, txid: &Txid, graph: &TxGraph) -> u64 {
        graph
            .position(txid)
            .and_then(|i| self.balance_hist.get(i))
            .copied()
            .unwrap_or(self.balance)
    }

    /// Whether no earlier transaction spends any of `tx`'s inputs and none of
    /// its funding transactions is invalid.
    ///
    /// Confirmed transactions are always valid. For an unregistered
    /// transaction the check recurses through its registered ancestors.
    pub fn is_valid(&self, tx: &WalletTx, graph: &TxGraph) -> bool {
        if tx.is_confirmed() {
            return true;
        }
        if graph.contains(&tx.txid()) {
            return !self.invalid.contains(&tx.txid());
        }
        tx.tx().input.iter().all(|input| {
            if self.spent_outputs.contains(&input.previous_output) {
                return false;
            }
            match graph.get(&input.previous_output.txid) {
                Some(funding) => self.is_valid(funding, graph),
                None => true,
            }
        })
    }

    /// Whether `tx` cannot be mined by `block_height + 1` or within the next
    /// ten minutes, due to its own lock time or a postdated ancestor.
    ///
    /// Lock time is only binding while some input has a non-final sequence.
    pub fn is_postdated(&self, tx: &WalletTx, graph: &TxGraph, block_height: u32) -> bool {
        if tx.is_confirmed() {
            return false;
        }

        let ancestor_postdated = tx.tx().input.iter().any(|input| {
            graph
                .get(&input.previous_output.txid)
                .map_or(false, |funding| {
                    self.is_postdated(funding, graph, block_height)
                })
        });
        if ancestor_postdated {
            return true;
        }

        let lock_time = tx.lock_time();
        let by_height = lock_time > block_height + 1 && lock_time < LOCKTIME_THRESHOLD;
        let by_time = lock_time >= LOCKTIME_THRESHOLD && u64::from(lock_time) >= unix_now() + 600;
        if by_height || by_time {
            return tx
                .tx()
                .input
                .iter()
                .any(|input| input.sequence != Sequence::MAX);
        }
        false
    }

    /// Total of `tx`'s outputs paying wallet addresses.
    pub fn amount_received_from(&self, tx: &Transaction, chains: &AddressChain) -> u64 {
        tx.output
            .iter()
            .filter(|output| chains.contains_script(&output.script_pubkey))
            .map(|output| output.value.to_sat())
            .sum()
    }

    /// Total of the wallet outputs consumed by `tx`'s inputs, change and fee
    /// included.
    pub fn amount_sent_by(&self, tx: &Transaction, graph: &TxGraph, chains: &AddressChain) -> u64 {
        tx.input
            .iter()
            .filter_map(|input| {
                let funding = graph.get(&input.previous_output.txid)?;
                let output = funding
                    .tx()
                    .output
                    .get(input.previous_output.vout as usize)?;
                chains
                    .contains_script(&output.script_pubkey)
                    .then(|| output.value.to_sat())
            })
            .sum()
    }

    /// Difference between `tx`'s inputs and outputs, or `None` when any
    /// funding transaction is unknown to the wallet.
    pub fn fee_for(&self, tx: &Transaction, graph: &TxGraph) -> Option<u64> {
        let mut amount = 0u64;
        for input in &tx.input {
            let funding = graph.get(&input.previous_output.txid)?;
            let output = funding
                .tx()
                .output
                .get(input.previous_output.vout as usize)?;
            amount += output.value.to_sat();
        }
        for output in &tx.output {
            amount = amount.checked_sub(output.value.to_sat())?;
        }
        Some(amount)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
