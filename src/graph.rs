//! The authoritative set of registered transactions and their history order.

use std::cmp::Ordering;
use std::collections::HashMap;

use bitcoin::Txid;

use crate::chain::{AddressChain, Keychain};
use crate::tx::WalletTx;

/// Registered transactions keyed by txid, plus a linearised history.
///
/// The history is ordered by confirmation height first; transactions at the
/// same height are ordered so that a spender always follows the transactions
/// that funded it, and otherwise by the chain position of their outputs.
#[derive(Debug, Default)]
pub struct TxGraph {
    txs: HashMap<Txid, WalletTx>,
    order: Vec<Txid>,
}

impl TxGraph {
    /// Number of registered transactions.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// True when no transaction is registered.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Whether `txid` is registered.
    pub fn contains(&self, txid: &Txid) -> bool {
        self.txs.contains_key(txid)
    }

    /// The registered transaction with the given id.
    pub fn get(&self, txid: &Txid) -> Option<&WalletTx> {
        self.txs.get(txid)
    }

    pub(crate) fn get_mut(&mut self, txid: &Txid) -> Option<&mut WalletTx> {
        self.txs.get_mut(txid)
    }

    /// Insert a transaction; a no-op if its txid is already present.
    pub fn insert(&mut self, tx: WalletTx) {
        let txid = tx.txid();
        if self.txs.insert(txid, tx).is_none() {
            self.order.push(txid);
        }
    }

    /// Remove and return the transaction with the given id.
    pub fn remove(&mut self, txid: &Txid) -> Option<WalletTx> {
        let removed = self.txs.remove(txid);
        if removed.is_some() {
            self.order.retain(|id| id != txid);
        }
        removed
    }

    /// Position of `txid` in the sorted history.
    pub fn position(&self, txid: &Txid) -> Option<usize> {
        self.order.iter().position(|id| id == txid)
    }

    /// Transactions in history order.
    pub fn iter_sorted(&self) -> impl DoubleEndedIterator<Item = &WalletTx> {
        self.order.iter().map(|txid| self.expect(txid))
    }

    /// Txids in history order.
    pub fn txids_sorted(&self) -> impl DoubleEndedIterator<Item = Txid> + '_ {
        self.order.iter().copied()
    }

    /// Re-establish the history order after insertions or height changes.
    pub fn sort(&mut self, chains: &AddressChain) {
        let mut order = std::mem::take(&mut self.order);
        order.sort_by_key(|txid| self.expect(txid).block_height());

        // Order each run of equal-height transactions; heights never tie
        // across runs, so dependency and chain position only matter within.
        let mut start = 0;
        while start < order.len() {
            let height = self.expect(&order[start]).block_height();
            let mut end = start + 1;
            while end < order.len() && self.expect(&order[end]).block_height() == height {
                end += 1;
            }
            self.sort_group(&mut order[start..end], chains);
            start = end;
        }

        self.order = order;
    }

    /// Topologically order one equal-height group, breaking ties by chain
    /// position and original order.
    fn sort_group(&self, group: &mut [Txid], chains: &AddressChain) {
        let n = group.len();
        if n < 2 {
            return;
        }

        let index_of: HashMap<Txid, usize> =
            group.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        let mut parents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (child, txid) in group.iter().enumerate() {
            for input in &self.expect(txid).tx().input {
                if let Some(&parent) = index_of.get(&input.previous_output.txid) {
                    if parent != child {
                        parents[child].push(parent);
                    }
                }
            }
        }

        let mut placed = vec![false; n];
        let mut result = Vec::with_capacity(n);
        while result.len() < n {
            let mut best: Option<usize> = None;
            for candidate in 0..n {
                if placed[candidate] || parents[candidate].iter().any(|&p| !placed[p]) {
                    continue;
                }
                best = match best {
                    None => Some(candidate),
                    Some(current) => {
                        let a = self.expect(&group[candidate]);
                        let b = self.expect(&group[current]);
                        if Self::chain_cmp(a, b, chains) == Ordering::Less {
                            Some(candidate)
                        } else {
                            Some(current)
                        }
                    }
                };
            }
            match best {
                Some(pick) => {
                    placed[pick] = true;
                    result.push(group[pick]);
                }
                // Hash-keyed references cannot form a cycle; keep the
                // remaining transactions in their current order if one does.
                None => {
                    for (i, id) in group.iter().enumerate() {
                        if !placed[i] {
                            result.push(*id);
                        }
                    }
                }
            }
        }
        group.copy_from_slice(&result);
    }

    /// Compare two same-height transactions with no spend relation by the
    /// chain position of their outputs: lower index first.
    fn chain_cmp(a: &WalletTx, b: &WalletTx, chains: &AddressChain) -> Ordering {
        let i = Self::chain_position(a, Keychain::Internal, chains);
        let j = match i {
            Some(_) => Self::chain_position(b, Keychain::Internal, chains),
            None => Self::chain_position(b, Keychain::External, chains),
        };
        let i = match (i, j) {
            (None, Some(_)) => Self::chain_position(a, Keychain::External, chains),
            _ => i,
        };
        match (i, j) {
            (Some(i), Some(j)) => i.cmp(&j),
            _ => Ordering::Equal,
        }
    }

    /// The lowest `keychain` index among the transaction's outputs.
    fn chain_position(tx: &WalletTx, keychain: Keychain, chains: &AddressChain) -> Option<u32> {
        tx.tx()
            .output
            .iter()
            .filter_map(|out| chains.position(&out.script_pubkey))
            .filter(|(chain, _)| *chain == keychain)
            .map(|(_, index)| index)
            .min()
    }

    fn expect(&self, txid: &Txid) -> &WalletTx {
        self.txs
            .get(txid)
            .expect("history order references a registered tx")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tx::UNCONFIRMED;
    use bitcoin::bip32::{Xpriv, Xpub};
    use bitcoin::hashes::Hash;
    use bitcoin::secp256k1::Secp256k1;
    use bitcoin::{
        absolute, transaction::Version, Amount, NetworkKind, OutPoint, ScriptBuf, Sequence,
        Transaction, TxIn, TxOut, Witness,
    };

    fn chains_with(external: u32, internal: u32) -> AddressChain {
        let secp = Secp256k1::new();
        let master = Xpriv::new_master(NetworkKind::Test, b"graph test seed").unwrap();
        let mut chains = AddressChain::new(Xpub::from_priv(&secp, &master), NetworkKind::Test);
        chains
            .unused_addresses(external, Keychain::External)
            .unwrap();
        chains
            .unused_addresses(internal, Keychain::Internal)
            .unwrap();
        chains
    }

    fn foreign_txid(n: u8) -> Txid {
        Txid::from_byte_array([n; 32])
    }

    fn tx_with(inputs: Vec<OutPoint>, outputs: Vec<TxOut>) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: inputs
                .into_iter()
                .map(|previous_output| TxIn {
                    previous_output,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::new(),
                })
                .collect(),
            output: outputs,
        }
    }

    fn pay(script: ScriptBuf, sat: u64) -> TxOut {
        TxOut {
            value: Amount::from_sat(sat),
            script_pubkey: script,
        }
    }

    #[test]
    fn spender_sorts_after_funder_at_equal_height() {
        let chains = chains_with(3, 2);
        let script = |i: u32| {
            chains
                .address_at(Keychain::External, i)
                .unwrap()
                .script_pubkey()
        };

        let funder = WalletTx::new(tx_with(
            vec![OutPoint::new(foreign_txid(1), 0)],
            vec![pay(script(0), 10_000)],
        ));
        let spender = WalletTx::new(tx_with(
            vec![OutPoint::new(funder.txid(), 0)],
            vec![pay(script(1), 9_000)],
        ));
        let (funder_id, spender_id) = (funder.txid(), spender.txid());

        let mut graph = TxGraph::default();
        graph.insert(spender);
        graph.insert(funder);
        graph.sort(&chains);

        let order: Vec<Txid> = graph.txids_sorted().collect();
        assert_eq!(order, vec![funder_id, spender_id]);
    }

    #[test]
    fn grandchild_sorts_after_whole_ancestry() {
        let chains = chains_with(4, 2);
        let script = |i: u32| {
            chains
                .address_at(Keychain::External, i)
                .unwrap()
                .script_pubkey()
        };

        let a = WalletTx::new(tx_with(
            vec![OutPoint::new(foreign_txid(1), 0)],
            vec![pay(script(0), 30_000)],
        ));
        let b = WalletTx::new(tx_with(
            vec![OutPoint::new(a.txid(), 0)],
            vec![pay(script(1), 20_000)],
        ));
        let c = WalletTx::new(tx_with(
            vec![OutPoint::new(b.txid(), 0)],
            vec![pay(script(2), 10_000)],
        ));
        let ids = [a.txid(), b.txid(), c.txid()];

        let mut graph = TxGraph::default();
        graph.insert(c);
        graph.insert(a);
        graph.insert(b);
        graph.sort(&chains);

        let order: Vec<Txid> = graph.txids_sorted().collect();
        assert_eq!(order, ids.to_vec());
    }

    #[test]
    fn lower_height_sorts_first() {
        let chains = chains_with(3, 2);
        let script = |i: u32| {
            chains
                .address_at(Keychain::External, i)
                .unwrap()
                .script_pubkey()
        };

        let confirmed = WalletTx::with_status(
            tx_with(
                vec![OutPoint::new(foreign_txid(1), 0)],
                vec![pay(script(0), 1_000)],
            ),
            100,
            1_700_000_000,
        );
        let pending = WalletTx::new(tx_with(
            vec![OutPoint::new(foreign_txid(2), 0)],
            vec![pay(script(1), 2_000)],
        ));
        assert_eq!(pending.block_height(), UNCONFIRMED);
        let (confirmed_id, pending_id) = (confirmed.txid(), pending.txid());

        let mut graph = TxGraph::default();
        graph.insert(pending);
        graph.insert(confirmed);
        graph.sort(&chains);

        let order: Vec<Txid> = graph.txids_sorted().collect();
        assert_eq!(order, vec![confirmed_id, pending_id]);
    }

    #[test]
    fn unrelated_transactions_tie_break_by_chain_position() {
        let chains = chains_with(4, 2);
        let script = |i: u32| {
            chains
                .address_at(Keychain::External, i)
                .unwrap()
                .script_pubkey()
        };

        let later = WalletTx::new(tx_with(
            vec![OutPoint::new(foreign_txid(1), 0)],
            vec![pay(script(2), 1_000)],
        ));
        let earlier = WalletTx::new(tx_with(
            vec![OutPoint::new(foreign_txid(2), 0)],
            vec![pay(script(0), 1_000)],
        ));
        let (later_id, earlier_id) = (later.txid(), earlier.txid());

        let mut graph = TxGraph::default();
        graph.insert(later);
        graph.insert(earlier);
        graph.sort(&chains);

        let order: Vec<Txid> = graph.txids_sorted().collect();
        assert_eq!(order, vec![earlier_id, later_id]);
    }

    #[test]
    fn insert_is_idempotent_and_remove_returns_entry() {
        let chains = chains_with(2, 1);
        let script = chains
            .address_at(Keychain::External, 0)
            .unwrap()
            .script_pubkey();

        let tx = WalletTx::new(tx_with(
            vec![OutPoint::new(foreign_txid(1), 0)],
            vec![pay(script, 5_000)],
        ));
        let txid = tx.txid();

        let mut graph = TxGraph::default();
        graph.insert(tx.clone());
        graph.insert(tx);
        assert_eq!(graph.len(), 1);

        let removed = graph.remove(&txid).unwrap();
        assert_eq!(removed.txid(), txid);
        assert!(graph.is_empty());
        assert!(graph.remove(&txid).is_none());
    }
}
