//! The wallet façade: locking, registration, callbacks and the query API.

use std::fmt;
use std::sync::{Arc, RwLock};

use bitcoin::bip32::Xpub;
use bitcoin::{Address, Amount, NetworkKind, OutPoint, Transaction, TxOut, Txid};
use rand_core::RngCore;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::balance::BalanceEngine;
use crate::builder::{self, CreateTxError, DEFAULT_FEE_PER_KB};
use crate::chain::{
    AddressChain, DerivationError, Keychain, GAP_LIMIT_EXTERNAL, GAP_LIMIT_INTERNAL,
};
use crate::graph::TxGraph;
use crate::signer::{self, SignError, SigningEntry};
use crate::tx::WalletTx;

/// Seed material handed to the wallet for the duration of a signing call.
///
/// `None` means the user declined authentication. The buffer is wiped when
/// dropped and is never retained by the wallet.
pub type Seed = Option<Zeroizing<Vec<u8>>>;

type SeedFn = dyn Fn(&str, u64) -> Seed + Send + Sync;

/// Wallet construction parameters.
#[derive(Debug, Clone)]
pub struct WalletParams {
    /// Network the wallet's addresses are encoded for.
    pub network: NetworkKind,
    /// Fee rate in satoshis per 1000 bytes used when creating transactions.
    pub fee_per_kb: u64,
    /// Gap limit maintained on the external (receive) chain.
    pub gap_limit_external: u32,
    /// Gap limit maintained on the internal (change) chain.
    pub gap_limit_internal: u32,
}

impl WalletParams {
    /// Default parameters for the given network.
    pub fn new(network: NetworkKind) -> Self {
        Self {
            network,
            fee_per_kb: DEFAULT_FEE_PER_KB,
            gap_limit_external: GAP_LIMIT_EXTERNAL,
            gap_limit_internal: GAP_LIMIT_INTERNAL,
        }
    }
}

impl Default for WalletParams {
    fn default() -> Self {
        Self::new(NetworkKind::Main)
    }
}

/// Host notification hooks, all invoked after the wallet lock is released,
/// in the thread that performed the mutation.
#[derive(Clone, Default)]
pub struct Callbacks {
    /// The balance changed as a result of a mutation.
    pub balance_changed: Option<Arc<dyn Fn(Amount) + Send + Sync>>,
    /// A transaction was accepted by [`Wallet::register`].
    pub tx_added: Option<Arc<dyn Fn(&WalletTx) + Send + Sync>>,
    /// Block heights or timestamps were set on the listed transactions.
    pub tx_updated: Option<Arc<dyn Fn(&[Txid], u32, u32) + Send + Sync>>,
    /// A transaction was removed, directly or as a dependent.
    pub tx_deleted: Option<Arc<dyn Fn(Txid) + Send + Sync>>,
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("balance_changed", &self.balance_changed.is_some())
            .field("tx_added", &self.tx_added.is_some())
            .field("tx_updated", &self.tx_updated.is_some())
            .field("tx_deleted", &self.tx_deleted.is_some())
            .finish()
    }
}

enum Event {
    BalanceChanged(u64),
    TxAdded(WalletTx),
    TxUpdated(Vec<Txid>, u32, u32),
    TxDeleted(Txid),
}

struct WalletInner {
    chains: AddressChain,
    graph: TxGraph,
    engine: BalanceEngine,
    fee_per_kb: u64,
    gap_limit_external: u32,
    gap_limit_internal: u32,
}

impl WalletInner {
    /// Whether `tx` touches the wallet: pays a wallet address, or spends an
    /// output of a registered transaction that did.
    fn is_relevant(&self, tx: &Transaction) -> bool {
        let pays_wallet = tx
            .output
            .iter()
            .any(|output| self.chains.contains_script(&output.script_pubkey));
        if pays_wallet {
            return true;
        }
        tx.input.iter().any(|input| {
            self.graph
                .get(&input.previous_output.txid)
                .and_then(|funding| funding.tx().output.get(input.previous_output.vout as usize))
                .map_or(false, |output| {
                    self.chains.contains_script(&output.script_pubkey)
                })
        })
    }

    /// Record every script touched by `tx` as used, resolving input scripts
    /// through the registered funding transactions.
    fn mark_used(&mut self, tx: &Transaction) {
        for output in &tx.output {
            self.chains.mark_used(&output.script_pubkey);
        }
        let input_scripts: Vec<_> = tx
            .input
            .iter()
            .filter_map(|input| {
                let funding = self.graph.get(&input.previous_output.txid)?;
                let output = funding
                    .tx()
                    .output
                    .get(input.previous_output.vout as usize)?;
                Some(output.script_pubkey.clone())
            })
            .collect();
        for script in input_scripts {
            self.chains.mark_used(&script);
        }
    }

    /// Restore both gap limits after addresses were consumed.
    fn extend_gaps(&mut self) {
        let external = self.gap_limit_external;
        let internal = self.gap_limit_internal;
        if let Err(err) = self.chains.unused_addresses(external, Keychain::External) {
            warn!(%err, "failed to extend external address chain");
        }
        if let Err(err) = self.chains.unused_addresses(internal, Keychain::Internal) {
            warn!(%err, "failed to extend internal address chain");
        }
    }

    fn sort_and_recompute(&mut self) -> bool {
        self.graph.sort(&self.chains);
        self.engine.recompute(&self.graph, &self.chains)
    }
}

/// An in-memory SPV wallet: address discovery, transaction registration,
/// balance tracking, transaction construction and signing.
///
/// All state lives behind one readers-writer lock. Notification callbacks
/// fire after the lock is released, so a host may re-enter the wallet from
/// inside a callback.
pub struct Wallet {
    inner: RwLock<WalletInner>,
    callbacks: RwLock<Callbacks>,
    seed_fn: Box<SeedFn>,
}

impl Wallet {
    /// Build a wallet over `master` and a previously persisted transaction
    /// list, which is trusted and registered without relevance checks.
    ///
    /// `seed_fn` is consulted by [`sign_transaction`](Self::sign_transaction);
    /// it receives the authentication prompt and the amount being sent, and
    /// returns the BIP32 seed matching `master`, or `None` to cancel.
    pub fn new<F>(
        params: WalletParams,
        master: Xpub,
        transactions: Vec<WalletTx>,
        seed_fn: F,
    ) -> Result<Self, DerivationError>
    where
        F: Fn(&str, u64) -> Seed + Send + Sync + 'static,
    {
        let mut inner = WalletInner {
            chains: AddressChain::new(master, params.network),
            graph: TxGraph::default(),
            engine: BalanceEngine::default(),
            fee_per_kb: params.fee_per_kb,
            gap_limit_external: params.gap_limit_external,
            gap_limit_internal: params.gap_limit_internal,
        };

        for tx in transactions {
            inner.graph.insert(tx);
        }
        let registered: Vec<Transaction> =
            inner.graph.iter_sorted().map(|wtx| wtx.tx().clone()).collect();
        for tx in &registered {
            inner.mark_used(tx);
        }

        inner
            .chains
            .unused_addresses(params.gap_limit_external, Keychain::External)?;
        inner
            .chains
            .unused_addresses(params.gap_limit_internal, Keychain::Internal)?;
        inner.sort_and_recompute();

        Ok(Self {
            inner: RwLock::new(inner),
            callbacks: RwLock::new(Callbacks::default()),
            seed_fn: Box::new(seed_fn),
        })
    }

    /// Replace the notification hooks.
    pub fn set_callbacks(&self, callbacks: Callbacks) {
        *self.callbacks.write().unwrap() = callbacks;
    }

    /// Register a transaction discovered on the network.
    ///
    /// Returns true when the transaction is registered afterwards, including
    /// when it already was; false when it touches no wallet address and is
    /// ignored. Registration marks addresses used, restores the gap limits
    /// and recomputes the derived state.
    pub fn register(&self, tx: WalletTx) -> bool {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.write().unwrap();
            if inner.graph.contains(&tx.txid()) {
                return true;
            }
            if !inner.is_relevant(tx.tx()) {
                return false;
            }

            let txid = tx.txid();
            inner.mark_used(tx.tx());
            inner.graph.insert(tx);
            let changed = inner.sort_and_recompute();
            inner.extend_gaps();
            debug!(%txid, "registered transaction");

            if changed {
                events.push(Event::BalanceChanged(inner.engine.balance()));
            }
            if let Some(wtx) = inner.graph.get(&txid) {
                events.push(Event::TxAdded(wtx.clone()));
            }
        }
        self.dispatch(events);
        true
    }

    /// Remove a registered transaction along with every registered
    /// transaction that spends it, directly or transitively.
    pub fn remove(&self, txid: &Txid) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.write().unwrap();
            if !inner.graph.contains(txid) {
                return;
            }

            let mut deleted = Vec::new();
            Self::remove_with_dependents(&mut inner.graph, *txid, &mut deleted);
            let changed = inner.sort_and_recompute();
            debug!(%txid, dependents = deleted.len() - 1, "removed transaction");

            events.extend(deleted.into_iter().map(Event::TxDeleted));
            if changed {
                events.push(Event::BalanceChanged(inner.engine.balance()));
            }
        }
        self.dispatch(events);
    }

    /// Set the block height and timestamp on each matching transaction, as
    /// learned from merkle blocks. A height change re-sorts the history and
    /// recomputes the derived state.
    pub fn update_transactions(&self, txids: &[Txid], block_height: u32, timestamp: u32) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.write().unwrap();
            let mut updated = Vec::new();
            let mut height_changed = false;

            for txid in txids {
                let Some(wtx) = inner.graph.get_mut(txid) else {
                    continue;
                };
                if wtx.block_height() == block_height && wtx.timestamp() == timestamp {
                    continue;
                }
                if wtx.block_height() != block_height {
                    height_changed = true;
                }
                wtx.set_status(block_height, timestamp);
                updated.push(*txid);
            }

            if height_changed && inner.sort_and_recompute() {
                events.push(Event::BalanceChanged(inner.engine.balance()));
            }
            if !updated.is_empty() {
                debug!(count = updated.len(), block_height, "updated transactions");
                events.push(Event::TxUpdated(updated, block_height, timestamp));
            }
        }
        self.dispatch(events);
    }

    /// Whether `txid` is registered.
    pub fn contains_tx_hash(&self, txid: &Txid) -> bool {
        self.inner.read().unwrap().graph.contains(txid)
    }

    /// The registered transaction with the given id.
    pub fn transaction_for_hash(&self, txid: &Txid) -> Option<WalletTx> {
        self.inner.read().unwrap().graph.get(txid).cloned()
    }

    /// All registered transactions in history order, oldest first.
    pub fn transactions(&self) -> Vec<WalletTx> {
        self.inner
            .read()
            .unwrap()
            .graph
            .iter_sorted()
            .cloned()
            .collect()
    }

    /// Unspent outputs in history order.
    pub fn utxos(&self) -> Vec<OutPoint> {
        self.inner.read().unwrap().engine.utxos().to_vec()
    }

    /// Current balance, excluding transactions known to be invalid.
    pub fn balance(&self) -> Amount {
        Amount::from_sat(self.inner.read().unwrap().engine.balance())
    }

    /// Total amount ever spent from the wallet.
    pub fn total_sent(&self) -> Amount {
        Amount::from_sat(self.inner.read().unwrap().engine.total_sent())
    }

    /// Total amount ever received by the wallet.
    pub fn total_received(&self) -> Amount {
        Amount::from_sat(self.inner.read().unwrap().engine.total_received())
    }

    /// Balance right after the given transaction in history order, or the
    /// current balance when it is not registered.
    pub fn balance_after_tx(&self, txid: &Txid) -> Amount {
        let inner = self.inner.read().unwrap();
        Amount::from_sat(inner.engine.balance_after(txid, &inner.graph))
    }

    /// Fee paid by `tx`, or `None` when a funding transaction is unknown.
    pub fn fee_for_tx(&self, tx: &Transaction) -> Option<Amount> {
        let inner = self.inner.read().unwrap();
        inner.engine.fee_for(tx, &inner.graph).map(Amount::from_sat)
    }

    /// Total of `tx`'s outputs paying wallet addresses.
    pub fn amount_received_from_tx(&self, tx: &Transaction) -> Amount {
        let inner = self.inner.read().unwrap();
        Amount::from_sat(inner.engine.amount_received_from(tx, &inner.chains))
    }

    /// Total of the wallet outputs consumed by `tx`'s inputs.
    pub fn amount_sent_by_tx(&self, tx: &Transaction) -> Amount {
        let inner = self.inner.read().unwrap();
        Amount::from_sat(inner.engine.amount_sent_by(tx, &inner.graph, &inner.chains))
    }

    /// Whether no registered transaction conflicts with `tx`.
    pub fn transaction_is_valid(&self, tx: &WalletTx) -> bool {
        let inner = self.inner.read().unwrap();
        inner.engine.is_valid(tx, &inner.graph)
    }

    /// Whether `tx` cannot be mined by `block_height + 1` or within the next
    /// ten minutes.
    pub fn transaction_is_postdated(&self, tx: &WalletTx, block_height: u32) -> bool {
        let inner = self.inner.read().unwrap();
        inner.engine.is_postdated(tx, &inner.graph, block_height)
    }

    /// Fee charged for a transaction of `size` bytes at the configured rate.
    pub fn fee_for_tx_size(&self, size: usize) -> Amount {
        Amount::from_sat(builder::fee_for_tx_size(
            self.inner.read().unwrap().fee_per_kb,
            size,
        ))
    }

    /// Smallest economical output amount at the configured fee rate.
    pub fn min_output_amount(&self) -> Amount {
        Amount::from_sat(builder::min_output_amount(
            self.inner.read().unwrap().fee_per_kb,
        ))
    }

    /// Set the fee rate, in satoshis per 1000 bytes, for future transactions.
    pub fn set_fee_per_kb(&self, fee_per_kb: u64) {
        self.inner.write().unwrap().fee_per_kb = fee_per_kb;
    }

    /// The first unused receive address, extending the chain as needed.
    pub fn receive_address(&self) -> Result<Address, DerivationError> {
        self.first_unused(Keychain::External)
    }

    /// The first unused change address, extending the chain as needed.
    pub fn change_address(&self) -> Result<Address, DerivationError> {
        self.first_unused(Keychain::Internal)
    }

    /// The first `gap_limit` unused addresses on `keychain`, extending the
    /// chain so that many unused addresses exist.
    pub fn unused_addresses(
        &self,
        gap_limit: u32,
        keychain: Keychain,
    ) -> Result<Vec<Address>, DerivationError> {
        self.inner
            .write()
            .unwrap()
            .chains
            .unused_addresses(gap_limit, keychain)
    }

    /// Whether the wallet ever generated `address`.
    pub fn contains_address(&self, address: &Address) -> bool {
        self.inner
            .read()
            .unwrap()
            .chains
            .contains_script(&address.script_pubkey())
    }

    /// Whether `address` appeared in any registered transaction.
    pub fn address_is_used(&self, address: &Address) -> bool {
        self.inner
            .read()
            .unwrap()
            .chains
            .is_used(&address.script_pubkey())
    }

    /// Whether `tx` pays a wallet address or spends a wallet output, even if
    /// it has not been registered.
    pub fn contains_transaction(&self, tx: &Transaction) -> bool {
        self.inner.read().unwrap().is_relevant(tx)
    }

    /// Create an unsigned transaction sending `amount` to `address`.
    pub fn create_transaction(
        &self,
        amount: Amount,
        address: &Address,
    ) -> Result<Transaction, CreateTxError> {
        self.create_tx_for_outputs(vec![TxOut {
            value: amount,
            script_pubkey: address.script_pubkey(),
        }])
    }

    /// Create an unsigned transaction satisfying the requested outputs,
    /// selecting inputs from the UTXO set and appending a change output in a
    /// random position when the excess is worth keeping.
    pub fn create_tx_for_outputs(&self, outputs: Vec<TxOut>) -> Result<Transaction, CreateTxError> {
        self.create_tx_for_outputs_with_rng(outputs, &mut rand::thread_rng())
    }

    /// [`create_tx_for_outputs`](Self::create_tx_for_outputs) with a caller
    /// supplied source of randomness for the output order.
    pub fn create_tx_for_outputs_with_rng(
        &self,
        outputs: Vec<TxOut>,
        rng: &mut impl RngCore,
    ) -> Result<Transaction, CreateTxError> {
        let selection = {
            let inner = self.inner.read().unwrap();
            builder::select_coins(
                &inner.graph,
                &inner.engine,
                &inner.chains,
                inner.fee_per_kb,
                outputs,
            )?
        };

        let mut tx = selection.tx;
        if let Some(change) = selection.change {
            let address = self.change_address()?;
            tx.output.push(TxOut {
                value: Amount::from_sat(change),
                script_pubkey: address.script_pubkey(),
            });
            shuffle_outputs(&mut tx.output, rng);
        }
        Ok(tx)
    }

    /// Sign every input of `tx` controlled by a wallet key.
    ///
    /// The chain positions of the spent outputs are resolved under the read
    /// lock; the lock is released before the seed callback runs, so it may
    /// block on user authentication and may re-enter the wallet. Seed
    /// material and derived keys are wiped before returning.
    pub fn sign_transaction(&self, tx: &mut Transaction, auth_prompt: &str) -> Result<(), SignError> {
        let (entries, amount, network) = {
            let inner = self.inner.read().unwrap();
            let mut entries = Vec::new();
            for (input_index, input) in tx.input.iter().enumerate() {
                let Some(funding) = inner.graph.get(&input.previous_output.txid) else {
                    continue;
                };
                let Some(output) = funding
                    .tx()
                    .output
                    .get(input.previous_output.vout as usize)
                else {
                    continue;
                };
                if let Some((keychain, index)) = inner.chains.position(&output.script_pubkey) {
                    entries.push(SigningEntry {
                        input_index,
                        keychain,
                        index,
                        script_pubkey: output.script_pubkey.clone(),
                    });
                }
            }
            let sent = inner.engine.amount_sent_by(tx, &inner.graph, &inner.chains);
            let received = inner.engine.amount_received_from(tx, &inner.chains);
            (entries, sent.saturating_sub(received), inner.chains.network())
        };

        if entries.is_empty() {
            return Err(SignError::NoSigningKeys);
        }

        let seed = (self.seed_fn)(auth_prompt, amount).ok_or(SignError::Cancelled)?;
        signer::sign_inputs(tx, &entries, seed.as_slice(), network)
    }

    fn first_unused(&self, keychain: Keychain) -> Result<Address, DerivationError> {
        let mut addrs = self
            .inner
            .write()
            .unwrap()
            .chains
            .unused_addresses(1, keychain)?;
        Ok(addrs.remove(0))
    }

    fn remove_with_dependents(graph: &mut TxGraph, txid: Txid, deleted: &mut Vec<Txid>) {
        let dependents: Vec<Txid> = graph
            .iter_sorted()
            .rev()
            .filter(|wtx| {
                wtx.txid() != txid
                    && wtx
                        .tx()
                        .input
                        .iter()
                        .any(|input| input.previous_output.txid == txid)
            })
            .map(|wtx| wtx.txid())
            .collect();
        for dependent in dependents {
            Self::remove_with_dependents(graph, dependent, deleted);
        }
        if graph.remove(&txid).is_some() {
            deleted.push(txid);
        }
    }

    fn dispatch(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let callbacks = self.callbacks.read().unwrap().clone();
        for event in events {
            match event {
                Event::BalanceChanged(balance) => {
                    if let Some(cb) = &callbacks.balance_changed {
                        cb(Amount::from_sat(balance));
                    }
                }
                Event::TxAdded(wtx) => {
                    if let Some(cb) = &callbacks.tx_added {
                        cb(&wtx);
                    }
                }
                Event::TxUpdated(txids, block_height, timestamp) => {
                    if let Some(cb) = &callbacks.tx_updated {
                        cb(&txids, block_height, timestamp);
                    }
                }
                Event::TxDeleted(txid) => {
                    if let Some(cb) = &callbacks.tx_deleted {
                        cb(txid);
                    }
                }
            }
        }
    }
}

impl fmt::Debug for Wallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read().unwrap();
        f.debug_struct("Wallet")
            .field("transactions", &inner.graph.len())
            .field("balance", &inner.engine.balance())
            .field("utxos", &inner.engine.utxos().len())
            .field("chains", &inner.chains)
            .field("fee_per_kb", &inner.fee_per_kb)
            .finish()
    }
}

/// Fisher–Yates over the outputs, so the change position carries no signal.
fn shuffle_outputs(outputs: &mut [TxOut], rng: &mut impl RngCore) {
    let n = outputs.len();
    for picked in 0..n.saturating_sub(1) {
        let remaining = n - picked;
        let offset = rng.next_u32() as usize % remaining;
        outputs.swap(picked, picked + offset);
    }
}
