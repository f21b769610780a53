//! UTXO ledger: Bitcoin-origin credits keyed by `txid-vout`.

use serde::{Deserialize, Serialize};

use crate::store::{read, write, KvStore, StoreResult};

const UTXO_PREFIX: &[u8] = b"utxo/";
const ADDRESS_INDEX_PREFIX: &[u8] = b"utxo_addr/";
const LAST_HEIGHT_KEY: &[u8] = b"meta/last_processed_height";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptPubKey {
    pub hex: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub txid: String,
    pub vout: u32,
    pub amount: u64,
    pub entitled_amount: u64,
    pub script_pubkey: ScriptPubKey,
}

impl Utxo {
    pub fn key(&self) -> Vec<u8> {
        utxo_key(&self.txid, self.vout)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UtxoRef {
    pub txid: String,
    pub vout: u32,
}

impl UtxoRef {
    /// Ledger keys carry lowercase txids.
    pub fn normalized(&self) -> Self {
        Self {
            txid: self.txid.to_ascii_lowercase(),
            vout: self.vout,
        }
    }
}

impl std::fmt::Display for UtxoRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.txid, self.vout)
    }
}

pub fn utxo_key(txid: &str, vout: u32) -> Vec<u8> {
    let mut key = UTXO_PREFIX.to_vec();
    key.extend_from_slice(format!("{txid}-{vout}").as_bytes());
    key
}

pub fn get_utxo(store: &dyn KvStore, txid: &str, vout: u32) -> StoreResult<Option<Utxo>> {
    read(store, &utxo_key(txid, vout))
}

fn address_prefix(address: &str) -> Vec<u8> {
    let mut key = ADDRESS_INDEX_PREFIX.to_vec();
    key.extend_from_slice(address.as_bytes());
    key.push(b'/');
    key
}

fn address_index_key(address: &str, txid: &str, vout: u32) -> Vec<u8> {
    let mut key = address_prefix(address);
    key.extend_from_slice(format!("{txid}-{vout}").as_bytes());
    key
}

/// Persists a record, clamping the entitlement so it never exceeds the amount.
/// The address index follows the record.
pub fn put_utxo(store: &mut dyn KvStore, utxo: &Utxo) -> StoreResult<()> {
    let previous = get_utxo(store, &utxo.txid, utxo.vout)?;
    if let Some(old) = previous.as_ref().and_then(|p| p.script_pubkey.address.as_deref()) {
        if utxo.script_pubkey.address.as_deref() != Some(old) {
            store.remove(&address_index_key(old, &utxo.txid, utxo.vout))?;
        }
    }
    if let Some(address) = utxo.script_pubkey.address.as_deref() {
        store.set(&address_index_key(address, &utxo.txid, utxo.vout), Vec::new())?;
    }
    if utxo.entitled_amount > utxo.amount {
        let mut clamped = utxo.clone();
        clamped.entitled_amount = clamped.amount;
        return write(store, &clamped.key(), &clamped);
    }
    write(store, &utxo.key(), utxo)
}

pub fn remove_utxo(store: &mut dyn KvStore, txid: &str, vout: u32) -> StoreResult<()> {
    if let Some(address) = get_utxo(store, txid, vout)?.and_then(|u| u.script_pubkey.address) {
        store.remove(&address_index_key(&address, txid, vout))?;
    }
    store.remove(&utxo_key(txid, vout))
}

/// Paginated walk over the ledger. The returned cursor is an opaque
/// `txid-vout` string to pass back on the next call.
pub fn list_utxos(
    store: &dyn KvStore,
    start_after: Option<&str>,
    limit: usize,
) -> StoreResult<(Vec<Utxo>, Option<String>)> {
    let cursor = start_after.map(|c| {
        let mut key = UTXO_PREFIX.to_vec();
        key.extend_from_slice(c.as_bytes());
        key
    });
    let page = store.walk(UTXO_PREFIX, cursor.as_deref(), limit)?;
    let mut out = Vec::with_capacity(page.items.len());
    for (key, _) in &page.items {
        if let Some(utxo) = read::<Utxo>(store, key)? {
            out.push(utxo);
        }
    }
    let next = page
        .next_key
        .map(|k| String::from_utf8_lossy(&k[UTXO_PREFIX.len()..]).into_owned());
    Ok((out, next))
}

pub fn all_utxos(store: &dyn KvStore) -> StoreResult<Vec<Utxo>> {
    let mut out = Vec::new();
    for (key, _) in store.scan_prefix(UTXO_PREFIX)? {
        if let Some(utxo) = read::<Utxo>(store, &key)? {
            out.push(utxo);
        }
    }
    Ok(out)
}

/// Records paying `address`, read through the address index.
pub fn utxos_for_address(store: &dyn KvStore, address: &str) -> StoreResult<Vec<Utxo>> {
    let prefix = address_prefix(address);
    let mut out = Vec::new();
    for (key, _) in store.scan_prefix(&prefix)? {
        let mut record = UTXO_PREFIX.to_vec();
        record.extend_from_slice(&key[prefix.len()..]);
        if let Some(utxo) = read::<Utxo>(store, &record)? {
            out.push(utxo);
        }
    }
    Ok(out)
}

pub fn last_processed_height(store: &dyn KvStore) -> StoreResult<u64> {
    Ok(read::<u64>(store, LAST_HEIGHT_KEY)?.unwrap_or(0))
}

pub fn set_last_processed_height(store: &mut dyn KvStore, height: u64) -> StoreResult<()> {
    write(store, LAST_HEIGHT_KEY, &height)
}
