//! BIP32 address chains with gap-limit discovery.

use std::collections::{HashMap, HashSet};
use std::fmt;

use bitcoin::bip32::{self, ChildNumber, Xpub};
use bitcoin::secp256k1::{Secp256k1, VerifyOnly};
use bitcoin::{Address, NetworkKind, PublicKey, Script, ScriptBuf};

/// Number of unused external (receive) addresses kept ahead of the last used one.
pub const GAP_LIMIT_EXTERNAL: u32 = 10;

/// Number of unused internal (change) addresses kept ahead of the last used one.
pub const GAP_LIMIT_INTERNAL: u32 = 5;

/// The two BIP32 sub-trees a wallet derives addresses from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Keychain {
    /// Receive addresses, handed out to other parties.
    External,
    /// Change addresses, only ever used by the wallet itself.
    Internal,
}

impl Keychain {
    /// The non-hardened child number of this chain below the master key.
    pub fn child_number(self) -> u32 {
        match self {
            Keychain::External => 0,
            Keychain::Internal => 1,
        }
    }
}

/// Error raised when extending an address chain fails.
#[derive(Debug)]
pub enum DerivationError {
    /// BIP32 child key derivation failed.
    Bip32(bip32::Error),
}

impl fmt::Display for DerivationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bip32(err) => write!(f, "bip32 derivation failed: {}", err),
        }
    }
}

impl std::error::Error for DerivationError {}

impl From<bip32::Error> for DerivationError {
    fn from(err: bip32::Error) -> Self {
        DerivationError::Bip32(err)
    }
}

#[derive(Debug, Clone)]
struct ChainAddress {
    address: Address,
    script: ScriptBuf,
}

/// The internal and external address chains of a wallet.
///
/// Addresses are derived on demand from the master public key and appended;
/// a chain never shrinks and never reorders. Scripts of every address ever
/// generated are indexed so that output ownership is a set lookup.
pub struct AddressChain {
    secp: Secp256k1<VerifyOnly>,
    master: Xpub,
    network: NetworkKind,
    external: Vec<ChainAddress>,
    internal: Vec<ChainAddress>,
    by_script: HashMap<ScriptBuf, (Keychain, u32)>,
    used: HashSet<ScriptBuf>,
}

impl AddressChain {
    /// New empty chains below `master`.
    pub fn new(master: Xpub, network: NetworkKind) -> Self {
        Self {
            secp: Secp256k1::verification_only(),
            master,
            network,
            external: Vec::new(),
            internal: Vec::new(),
            by_script: HashMap::new(),
            used: HashSet::new(),
        }
    }

    /// Network the addresses are encoded for.
    pub fn network(&self) -> NetworkKind {
        self.network
    }

    /// Number of addresses generated so far on `keychain`.
    pub fn len(&self, keychain: Keychain) -> usize {
        self.chain(keychain).len()
    }

    /// True when no address has been generated on either chain.
    pub fn is_empty(&self) -> bool {
        self.external.is_empty() && self.internal.is_empty()
    }

    /// The first `gap_limit` unused addresses following the last used one.
    ///
    /// The chain is extended as needed so that the trailing run of unused
    /// addresses is at least `gap_limit` long. Re-requesting the same gap
    /// limit without any intervening use returns the same addresses.
    pub fn unused_addresses(
        &mut self,
        gap_limit: u32,
        keychain: Keychain,
    ) -> Result<Vec<Address>, DerivationError> {
        let gap_limit = gap_limit as usize;

        // Index just past the highest used address: everything from here on
        // is the trailing unused run.
        let mut first_unused = self.chain(keychain).len();
        while first_unused > 0
            && !self.used.contains(&self.chain(keychain)[first_unused - 1].script)
        {
            first_unused -= 1;
        }

        while self.chain(keychain).len() - first_unused < gap_limit {
            let index = self.chain(keychain).len() as u32;
            let entry = self.derive(keychain, index)?;
            self.by_script
                .insert(entry.script.clone(), (keychain, index));
            self.chain_mut(keychain).push(entry);
        }

        Ok(self.chain(keychain)[first_unused..first_unused + gap_limit]
            .iter()
            .map(|entry| entry.address.clone())
            .collect())
    }

    /// Whether `script` pays one of the generated addresses, used or not.
    pub fn contains_script(&self, script: &Script) -> bool {
        self.by_script.contains_key(script)
    }

    /// Chain and index of the address paid by `script`.
    pub fn position(&self, script: &Script) -> Option<(Keychain, u32)> {
        self.by_script.get(script).copied()
    }

    /// The address generated at `index` on `keychain`.
    pub fn address_at(&self, keychain: Keychain, index: u32) -> Option<&Address> {
        self.chain(keychain)
            .get(index as usize)
            .map(|entry| &entry.address)
    }

    /// Record that `script` appeared in a registered transaction.
    pub fn mark_used(&mut self, script: &Script) {
        self.used.insert(script.to_owned());
    }

    /// Whether `script` has appeared in any registered transaction.
    pub fn is_used(&self, script: &Script) -> bool {
        self.used.contains(script)
    }

    fn chain(&self, keychain: Keychain) -> &Vec<ChainAddress> {
        match keychain {
            Keychain::External => &self.external,
            Keychain::Internal => &self.internal,
        }
    }

    fn chain_mut(&mut self, keychain: Keychain) -> &mut Vec<ChainAddress> {
        match keychain {
            Keychain::External => &mut self.external,
            Keychain::Internal => &mut self.internal,
        }
    }

    fn derive(&self, keychain: Keychain, index: u32) -> Result<ChainAddress, DerivationError> {
        let path = [
            ChildNumber::from_normal_idx(keychain.child_number())?,
            ChildNumber::from_normal_idx(index)?,
        ];
        let child = self.master.derive_pub(&self.secp, &path)?;
        let pubkey = PublicKey::new(child.public_key);
        let address = Address::p2pkh(pubkey.pubkey_hash(), self.network);
        let script = address.script_pubkey();
        Ok(ChainAddress { address, script })
    }
}

impl fmt::Debug for AddressChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressChain")
            .field("external", &self.external.len())
            .field("internal", &self.internal.len())
            .field("used", &self.used.len())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bitcoin::bip32::Xpriv;

    fn test_chain() -> AddressChain {
        let secp = Secp256k1::new();
        let master = Xpriv::new_master(NetworkKind::Test, b"address chain test seed").unwrap();
        AddressChain::new(Xpub::from_priv(&secp, &master), NetworkKind::Test)
    }

    #[test]
    fn extension_is_idempotent() {
        let mut chain = test_chain();
        let first = chain.unused_addresses(5, Keychain::External).unwrap();
        let second = chain.unused_addresses(5, Keychain::External).unwrap();
        assert_eq!(first, second);
        assert_eq!(chain.len(Keychain::External), 5);
        assert_eq!(chain.len(Keychain::Internal), 0);
    }

    #[test]
    fn chains_are_disjoint() {
        let mut chain = test_chain();
        let external = chain.unused_addresses(3, Keychain::External).unwrap();
        let internal = chain.unused_addresses(3, Keychain::Internal).unwrap();
        for addr in &external {
            assert!(!internal.contains(addr));
        }
    }

    #[test]
    fn window_slides_past_used_addresses() {
        let mut chain = test_chain();
        let before = chain.unused_addresses(3, Keychain::External).unwrap();
        chain.mark_used(&before[0].script_pubkey());

        let after = chain.unused_addresses(3, Keychain::External).unwrap();
        assert_eq!(after[0], before[1]);
        assert_eq!(chain.len(Keychain::External), 4);

        // a used address at the end of the chain restarts the unused run
        chain.mark_used(&after[2].script_pubkey());
        let third = chain.unused_addresses(3, Keychain::External).unwrap();
        assert!(!third.contains(&before[1]));
        assert_eq!(chain.len(Keychain::External), 7);
    }

    #[test]
    fn position_tracks_every_generated_address() {
        let mut chain = test_chain();
        let addrs = chain.unused_addresses(4, Keychain::Internal).unwrap();
        for (i, addr) in addrs.iter().enumerate() {
            let script = addr.script_pubkey();
            assert!(chain.contains_script(&script));
            assert_eq!(chain.position(&script), Some((Keychain::Internal, i as u32)));
        }
        assert!(!chain.is_used(&addrs[0].script_pubkey()));
    }
}
