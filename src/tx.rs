use bitcoin::{Transaction, Txid};

/// Block height sentinel for transactions that have not been mined yet.
pub const UNCONFIRMED: u32 = 0x7FFF_FFFF;

/// Lock times at or above this value are unix timestamps, below it block heights.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// A transaction tracked by the wallet, together with its chain position.
///
/// The txid is computed once at construction. Two `WalletTx` values compare
/// equal when their txids are equal.
#[derive(Debug, Clone)]
pub struct WalletTx {
    tx: Transaction,
    txid: Txid,
    block_height: u32,
    timestamp: u32,
}

impl WalletTx {
    /// Wrap a transaction that has not been confirmed.
    pub fn new(tx: Transaction) -> Self {
        Self::with_status(tx, UNCONFIRMED, 0)
    }

    /// Wrap a transaction with a known block height and timestamp.
    pub fn with_status(tx: Transaction, block_height: u32, timestamp: u32) -> Self {
        let txid = tx.compute_txid();
        Self {
            tx,
            txid,
            block_height,
            timestamp,
        }
    }

    /// The underlying transaction.
    pub fn tx(&self) -> &Transaction {
        &self.tx
    }

    /// Cached transaction id.
    pub fn txid(&self) -> Txid {
        self.txid
    }

    /// Height of the block this transaction was mined in, or [`UNCONFIRMED`].
    pub fn block_height(&self) -> u32 {
        self.block_height
    }

    /// Timestamp of the containing block, or 0 when unconfirmed.
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    /// Whether the transaction has been mined.
    pub fn is_confirmed(&self) -> bool {
        self.block_height != UNCONFIRMED
    }

    /// Consensus lock time.
    pub fn lock_time(&self) -> u32 {
        self.tx.lock_time.to_consensus_u32()
    }

    /// Unwrap into the underlying transaction.
    pub fn into_tx(self) -> Transaction {
        self.tx
    }

    pub(crate) fn set_status(&mut self, block_height: u32, timestamp: u32) {
        self.block_height = block_height;
        self.timestamp = timestamp;
    }
}

impl PartialEq for WalletTx {
    fn eq(&self, other: &Self) -> bool {
        self.txid == other.txid
    }
}

impl Eq for WalletTx {}

impl core::hash::Hash for WalletTx {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.txid.hash(state)
    }
}
