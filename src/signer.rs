//! Input signing against seed material obtained from the host.

use std::fmt;

use bitcoin::bip32::{self, ChildNumber, Xpriv};
use bitcoin::hashes::Hash;
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::secp256k1::{Message, Secp256k1};
use bitcoin::sighash::SighashCache;
use bitcoin::{transaction, EcdsaSighashType, NetworkKind, PublicKey, ScriptBuf, Transaction};

use crate::chain::Keychain;

/// Errors from [`sign_transaction`](crate::Wallet::sign_transaction).
#[derive(Debug)]
pub enum SignError {
    /// The seed callback declined to provide seed material.
    Cancelled,
    /// No input of the transaction is controlled by a wallet key.
    NoSigningKeys,
    /// A derived key does not match the address recorded for it; the seed
    /// does not belong to this wallet's master public key.
    SeedMismatch,
    /// BIP32 private key derivation failed.
    Bip32(bip32::Error),
    /// A signing entry referenced an input index outside the transaction.
    InputIndex(transaction::InputsIndexError),
}

impl fmt::Display for SignError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "signing cancelled by the seed provider"),
            Self::NoSigningKeys => write!(f, "no input is spendable with wallet keys"),
            Self::SeedMismatch => write!(f, "seed does not match the wallet master public key"),
            Self::Bip32(err) => write!(f, "key derivation failed: {}", err),
            Self::InputIndex(err) => write!(f, "input out of range: {}", err),
        }
    }
}

impl std::error::Error for SignError {}

impl From<bip32::Error> for SignError {
    fn from(err: bip32::Error) -> Self {
        SignError::Bip32(err)
    }
}

impl From<transaction::InputsIndexError> for SignError {
    fn from(err: transaction::InputsIndexError) -> Self {
        SignError::InputIndex(err)
    }
}

/// A transaction input the wallet can sign, resolved to its chain position.
#[derive(Debug, Clone)]
pub(crate) struct SigningEntry {
    pub input_index: usize,
    pub keychain: Keychain,
    pub index: u32,
    pub script_pubkey: ScriptBuf,
}

/// Sign the listed inputs with keys derived from `seed`.
///
/// Keys exist only for the duration of the call and are erased before it
/// returns; the caller owns (and wipes) the seed itself.
pub(crate) fn sign_inputs(
    tx: &mut Transaction,
    entries: &[SigningEntry],
    seed: &[u8],
    network: NetworkKind,
) -> Result<(), SignError> {
    let secp = Secp256k1::new();
    let mut master = Xpriv::new_master(network, seed)?;

    let mut script_sigs: Vec<(usize, ScriptBuf)> = Vec::with_capacity(entries.len());
    let result = (|| -> Result<(), SignError> {
        let cache = SighashCache::new(&*tx);
        for entry in entries {
            let path = [
                ChildNumber::from_normal_idx(entry.keychain.child_number())?,
                ChildNumber::from_normal_idx(entry.index)?,
            ];
            let mut child = master.derive_priv(&secp, &path)?;
            let pubkey = PublicKey::new(child.private_key.public_key(&secp));
            if ScriptBuf::new_p2pkh(&pubkey.pubkey_hash()) != entry.script_pubkey {
                child.private_key.non_secure_erase();
                return Err(SignError::SeedMismatch);
            }

            let sighash = cache.legacy_signature_hash(
                entry.input_index,
                &entry.script_pubkey,
                EcdsaSighashType::All.to_u32(),
            )?;
            let message = Message::from_digest(sighash.to_byte_array());
            let signature = secp.sign_ecdsa(&message, &child.private_key);
            child.private_key.non_secure_erase();

            let mut sig_bytes = signature.serialize_der().to_vec();
            sig_bytes.push(EcdsaSighashType::All.to_u32() as u8);
            let script_sig = Builder::new()
                .push_slice(PushBytesBuf::try_from(sig_bytes).expect("DER signature fits a push"))
                .push_slice(&pubkey.inner.serialize())
                .into_script();
            script_sigs.push((entry.input_index, script_sig));
        }
        Ok(())
    })();
    master.private_key.non_secure_erase();
    result?;

    for (input_index, script_sig) in script_sigs {
        tx.input[input_index].script_sig = script_sig;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use bitcoin::bip32::Xpub;
    use bitcoin::{
        absolute, transaction::Version, Address, Amount, OutPoint, Sequence, TxIn, TxOut, Txid,
        Witness,
    };

    const SEED: &[u8] = b"signer test seed";

    fn chain_script(keychain: Keychain, index: u32) -> ScriptBuf {
        let secp = Secp256k1::new();
        let master = Xpriv::new_master(NetworkKind::Test, SEED).unwrap();
        let xpub = Xpub::from_priv(&secp, &master);
        let path = [
            ChildNumber::from_normal_idx(keychain.child_number()).unwrap(),
            ChildNumber::from_normal_idx(index).unwrap(),
        ];
        let child = xpub.derive_pub(&secp, &path).unwrap();
        let pubkey = PublicKey::new(child.public_key);
        Address::p2pkh(pubkey.pubkey_hash(), NetworkKind::Test).script_pubkey()
    }

    fn unsigned_spend() -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(Txid::from_byte_array([3; 32]), 0),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(9_000),
                script_pubkey: ScriptBuf::from_bytes(vec![0x6a]),
            }],
        }
    }

    #[test]
    fn signs_matching_input() {
        let mut tx = unsigned_spend();
        let entries = vec![SigningEntry {
            input_index: 0,
            keychain: Keychain::External,
            index: 0,
            script_pubkey: chain_script(Keychain::External, 0),
        }];

        sign_inputs(&mut tx, &entries, SEED, NetworkKind::Test).unwrap();
        assert!(!tx.input[0].script_sig.is_empty());
        // signature push plus a 33-byte compressed key push
        assert!(tx.input[0].script_sig.len() > 100);
    }

    #[test]
    fn rejects_foreign_seed() {
        let mut tx = unsigned_spend();
        let entries = vec![SigningEntry {
            input_index: 0,
            keychain: Keychain::External,
            index: 0,
            script_pubkey: chain_script(Keychain::External, 0),
        }];

        let err = sign_inputs(&mut tx, &entries, b"some other seed", NetworkKind::Test)
            .unwrap_err();
        assert!(matches!(err, SignError::SeedMismatch));
        assert!(tx.input[0].script_sig.is_empty());
    }
}
