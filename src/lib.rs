//! `spv_wallet`
//!
//! The core of an SPV wallet: a BIP32 address hierarchy with gap-limit
//! discovery, a transaction graph ordered by confirmation and spend
//! dependency, a derived UTXO set and running balance that stay consistent
//! under out-of-order and conflicting arrivals, fee-aware transaction
//! construction with child-pays-for-parent support, and signing against
//! seed material provided by the host.
//!
//! Network I/O, persistence and script interpretation beyond address
//! extraction live outside this crate; transactions enter through
//! [`Wallet::register`] and leave through the notification callbacks.

#![warn(missing_docs)]

mod balance;
mod builder;
mod chain;
mod graph;
mod signer;
mod tx;
mod wallet;

pub use balance::BalanceEngine;
pub use builder::{
    fee_for_tx_size, min_output_amount, CreateTxError, DEFAULT_FEE_PER_KB, TX_FEE_PER_KB,
};
pub use chain::{
    AddressChain, DerivationError, Keychain, GAP_LIMIT_EXTERNAL, GAP_LIMIT_INTERNAL,
};
pub use graph::TxGraph;
pub use signer::SignError;
pub use tx::{WalletTx, LOCKTIME_THRESHOLD, UNCONFIRMED};
pub use wallet::{Callbacks, Seed, Wallet, WalletParams};
