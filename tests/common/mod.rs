#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bitcoin::bip32::{Xpriv, Xpub};
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::{
    absolute, transaction::Version, Address, NetworkKind, OutPoint, PubkeyHash, ScriptBuf,
    Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use spv_wallet::{Wallet, WalletParams, WalletTx};
use zeroize::Zeroizing;

pub const SEED: &[u8] = b"integration test wallet seed";

pub fn master_xpub() -> Xpub {
    let secp = Secp256k1::new();
    let master = Xpriv::new_master(NetworkKind::Test, SEED).unwrap();
    Xpub::from_priv(&secp, &master)
}

pub fn params() -> WalletParams {
    WalletParams {
        fee_per_kb: 1_000,
        ..WalletParams::new(NetworkKind::Test)
    }
}

/// A wallet whose seed callback always provides the matching seed.
pub fn new_wallet() -> Wallet {
    Wallet::new(params(), master_xpub(), Vec::new(), |_prompt, _amount| {
        Some(Zeroizing::new(SEED.to_vec()))
    })
    .unwrap()
}

/// A wallet whose seed callback declines, as if the user cancelled.
pub fn cancelling_wallet() -> Wallet {
    Wallet::new(params(), master_xpub(), Vec::new(), |_prompt, _amount| None).unwrap()
}

/// A wallet that records whether the seed callback ran.
pub fn prompting_wallet() -> (Wallet, Arc<AtomicBool>) {
    let prompted = Arc::new(AtomicBool::new(false));
    let flag = prompted.clone();
    let wallet = Wallet::new(params(), master_xpub(), Vec::new(), move |_prompt, _amount| {
        flag.store(true, Ordering::SeqCst);
        Some(Zeroizing::new(SEED.to_vec()))
    })
    .unwrap();
    (wallet, prompted)
}

pub fn foreign_txid(n: u8) -> Txid {
    Txid::from_byte_array([n; 32])
}

pub fn foreign_outpoint(n: u8) -> OutPoint {
    OutPoint::new(foreign_txid(n), 0)
}

/// A pay-to-pubkey-hash script that does not belong to the wallet.
pub fn foreign_script(n: u8) -> ScriptBuf {
    ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array([n; 20]))
}

/// An address that does not belong to the wallet.
pub fn foreign_address(n: u8) -> Address {
    Address::p2pkh(PubkeyHash::from_byte_array([n; 20]), NetworkKind::Test)
}

pub fn tx(inputs: Vec<OutPoint>, outputs: Vec<(ScriptBuf, u64)>) -> Transaction {
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
        output: outputs
            .into_iter()
            .map(|(script_pubkey, sat)| TxOut {
                value: bitcoin::Amount::from_sat(sat),
                script_pubkey,
            })
            .collect(),
    }
}

/// An unconfirmed transaction paying `sat` to `address` from a foreign source.
pub fn incoming_to(address: &Address, source: u8, sat: u64) -> WalletTx {
    WalletTx::new(tx(
        vec![foreign_outpoint(source)],
        vec![(address.script_pubkey(), sat)],
    ))
}

/// Balance must always equal the sum of the outputs referenced by the UTXO set.
pub fn assert_balance_matches_utxos(wallet: &Wallet) {
    let total: u64 = wallet
        .utxos()
        .iter()
        .map(|outpoint| {
            let funding = wallet
                .transaction_for_hash(&outpoint.txid)
                .expect("utxo references a registered tx");
            funding.tx().output[outpoint.vout as usize].value.to_sat()
        })
        .sum();
    assert_eq!(wallet.balance().to_sat(), total);
}

/// A funder must always precede its spender in the reported history.
pub fn assert_topological_history(wallet: &Wallet) {
    let history = wallet.transactions();
    for (i, spender) in history.iter().enumerate() {
        for funder in &history[i + 1..] {
            let spends_later_tx = spender
                .tx()
                .input
                .iter()
                .any(|input| input.previous_output.txid == funder.txid());
            assert!(
                !spends_later_tx,
                "{} spends {} but sorts before it",
                spender.txid(),
                funder.txid()
            );
        }
    }
}
