use serde::{Deserialize, Serialize};

pub mod ledger;
pub mod store;

pub use ledger::{ScriptPubKey, Utxo, UtxoRef};
pub use store::{read, write, KvStore, MemoryStore, Page, Staged, StoreError, StoreResult};

pub type Address = [u8; 32];
pub type Hash = [u8; 32];

pub(crate) fn hash_leaf(bytes: &[u8]) -> Hash {
    *blake3::hash(bytes).as_bytes()
}

pub(crate) fn fold_hashes(leaves: Vec<Hash>) -> Hash {
    if leaves.is_empty() {
        return [0u8; 32];
    }
    let mut hasher = blake3::Hasher::new();
    for leaf in leaves {
        hasher.update(&leaf);
    }
    *hasher.finalize().as_bytes()
}

/// Consensus address of a validator key.
pub fn address_from_pubkey(pubkey: &[u8]) -> Address {
    *blake3::hash(pubkey).as_bytes()
}

/// Module accounts are derived from their name so every node agrees on them.
pub fn module_address(name: &str) -> Address {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"module/");
    hasher.update(name.as_bytes());
    *hasher.finalize().as_bytes()
}

pub fn parse_address(text: &str) -> Option<Address> {
    let clean = text.trim();
    let clean = clean.strip_prefix("0x").unwrap_or(clean);
    if clean.len() != 64 {
        return None;
    }
    let bytes = hex::decode(clean).ok()?;
    let mut addr = [0u8; 32];
    addr.copy_from_slice(&bytes);
    Some(addr)
}

pub fn format_address(address: &Address) -> String {
    hex::encode(address)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidatorStatus {
    Bonded,
    Unbonding,
    Unbonded,
}

/// Staking view of a validator as handed over by the host chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BondedValidator {
    /// Operator address, used by the entropy ceremony.
    pub operator: Address,
    pub pubkey: Vec<u8>,
    pub power: u64,
    pub status: ValidatorStatus,
}

impl BondedValidator {
    pub fn cons_address(&self) -> Address {
        address_from_pubkey(&self.pubkey)
    }

    pub fn is_bonded(&self) -> bool {
        self.status == ValidatorStatus::Bonded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_text_forms_round_trip() {
        let addr = address_from_pubkey(b"validator-key");
        let text = format_address(&addr);
        assert_eq!(parse_address(&text), Some(addr));
        assert_eq!(parse_address(&format!("0x{text}")), Some(addr));
        assert_eq!(parse_address("claim"), None);
        assert_eq!(parse_address(&text[..62]), None);
    }

    #[test]
    fn module_addresses_are_distinct() {
        assert_ne!(module_address("reserve"), module_address("fees"));
    }
}
