//! Minting against entitled UTXOs.

use bitgate_state::ledger::{get_utxo, put_utxo};
use bitgate_state::{module_address, parse_address, Address, KvStore, Staged, Utxo, UtxoRef};
use bitgate_zk::{ClaimProofVerifier, ClaimPublicInputs, MAX_PROOF_BYTES, MIN_PROOF_BYTES};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info};

use crate::bank;
use crate::bitcoin_block::address_hash_from_str;
use crate::params::Params;
use crate::{RuntimeError, RuntimeResult};

pub const RESERVE_MODULE: &str = "reserve";
pub const MAX_CLAIM_REFS: usize = 50;

pub fn reserve_address() -> Address {
    module_address(RESERVE_MODULE)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimResult {
    pub total_claimed: u64,
    pub count_claimed: u32,
    pub count_skipped: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovClaimUtxo {
    pub authority: String,
    pub utxos: Vec<UtxoRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimWithProof {
    pub claimer: String,
    pub utxo_refs: Vec<UtxoRef>,
    pub proof: Vec<u8>,
    /// Format-checked only. The chain recomputes every hash it verifies against.
    pub message_hash: String,
    pub address_hash: String,
    pub qbtc_address_hash: String,
}

fn is_hex_of_len(text: &str, len: usize) -> bool {
    text.len() == len && text.bytes().all(|b| b.is_ascii_hexdigit())
}

fn validate_ref(utxo_ref: &UtxoRef) -> RuntimeResult<()> {
    if !is_hex_of_len(&utxo_ref.txid, 64) {
        return Err(RuntimeError::invalid(format!(
            "txid {:?} must be 64 hex characters",
            utxo_ref.txid
        )));
    }
    Ok(())
}

impl ClaimWithProof {
    pub fn validate_basic(&self) -> RuntimeResult<Address> {
        if self.utxo_refs.is_empty() {
            return Err(RuntimeError::invalid("no utxo refs given"));
        }
        if self.utxo_refs.len() > MAX_CLAIM_REFS {
            return Err(RuntimeError::invalid(format!(
                "{} utxo refs exceed the limit of {MAX_CLAIM_REFS}",
                self.utxo_refs.len()
            )));
        }
        for utxo_ref in &self.utxo_refs {
            validate_ref(utxo_ref)?;
        }
        if !(MIN_PROOF_BYTES..=MAX_PROOF_BYTES).contains(&self.proof.len()) {
            return Err(RuntimeError::invalid(format!(
                "proof is {} bytes, expected {MIN_PROOF_BYTES}..={MAX_PROOF_BYTES}",
                self.proof.len()
            )));
        }
        if !is_hex_of_len(&self.message_hash, 64) {
            return Err(RuntimeError::invalid("message_hash must be 64 hex characters"));
        }
        if !is_hex_of_len(&self.address_hash, 40) {
            return Err(RuntimeError::invalid("address_hash must be 40 hex characters"));
        }
        if !is_hex_of_len(&self.qbtc_address_hash, 64) {
            return Err(RuntimeError::invalid("qbtc_address_hash must be 64 hex characters"));
        }
        parse_address(&self.claimer)
            .ok_or_else(|| RuntimeError::invalid(format!("claimer {:?} is not a chain address", self.claimer)))
    }
}

/// Mints the UTXO's entitlement into the reserve and optionally forwards it.
/// Returns the minted amount, zero when the entitlement was already spent.
pub fn claim_utxo(
    store: &mut dyn KvStore,
    params: &Params,
    txid: &str,
    vout: u32,
    recipient: Option<&Address>,
) -> RuntimeResult<u64> {
    let mut utxo = get_utxo(store, txid, vout)?
        .ok_or_else(|| RuntimeError::NotFound(format!("utxo {txid}-{vout}")))?;
    if utxo.entitled_amount == 0 {
        debug!(%txid, vout, "utxo already claimed");
        return Ok(0);
    }
    let amount = utxo.entitled_amount;
    let reserve = reserve_address();
    bank::mint(store, &reserve, &params.bond_denom, amount as u128)?;
    if let Some(to) = recipient {
        bank::transfer(store, &reserve, to, &params.bond_denom, amount as u128)?;
    }
    utxo.entitled_amount = 0;
    put_utxo(store, &utxo)?;
    info!(%txid, vout, amount, "claimed utxo");
    Ok(amount)
}

/// All-or-nothing batch claim into the reserve.
pub fn gov_claim_utxo(
    store: &mut dyn KvStore,
    params: &Params,
    msg: &GovClaimUtxo,
) -> RuntimeResult<ClaimResult> {
    if !params.is_authority(&msg.authority) {
        return Err(RuntimeError::Unauthorized(format!(
            "{} is not the governance authority",
            msg.authority
        )));
    }
    if msg.utxos.is_empty() {
        return Err(RuntimeError::invalid("no utxo refs given"));
    }
    let refs: Vec<UtxoRef> = msg.utxos.iter().map(UtxoRef::normalized).collect();
    for utxo_ref in &refs {
        validate_ref(utxo_ref)?;
    }

    let mut staged = Staged::new(store);
    let mut result = ClaimResult::default();
    for utxo_ref in &refs {
        let minted = claim_utxo(&mut staged, params, &utxo_ref.txid, utxo_ref.vout, None)?;
        if minted == 0 {
            result.count_skipped += 1;
        } else {
            result.total_claimed += minted;
            result.count_claimed += 1;
        }
    }
    staged.commit()?;
    info!(claimed = result.count_claimed, total = result.total_claimed, "governance claim applied");
    Ok(result)
}

fn live_address_hash(utxo: &Utxo) -> Option<[u8; 20]> {
    if utxo.entitled_amount == 0 {
        return None;
    }
    address_hash_from_str(utxo.script_pubkey.address.as_deref()?)
}

/// Claims every referenced UTXO paying the address the proof covers. The
/// proven address is taken from the ledger, never from the request.
pub fn claim_with_proof(
    store: &mut dyn KvStore,
    params: &Params,
    verifier: Option<&dyn ClaimProofVerifier>,
    msg: &ClaimWithProof,
) -> RuntimeResult<ClaimResult> {
    let claimer = msg.validate_basic()?;
    let verifier = verifier.ok_or(RuntimeError::ZkNotReady)?;
    let refs: Vec<UtxoRef> = msg.utxo_refs.iter().map(UtxoRef::normalized).collect();

    let mut proven = None;
    for utxo_ref in &refs {
        if let Some(utxo) = get_utxo(store, &utxo_ref.txid, utxo_ref.vout)? {
            if let Some(hash) = live_address_hash(&utxo) {
                proven = Some(hash);
                break;
            }
        }
    }
    let proven = proven.ok_or(RuntimeError::NoMatchingUtxos)?;

    let inputs = ClaimPublicInputs::new(proven, &claimer, &params.chain_id);
    verifier.verify(&msg.proof, &inputs)?;

    let mut seen = BTreeSet::new();
    let mut matching = Vec::new();
    let mut skipped = 0u32;
    for utxo_ref in &refs {
        if !seen.insert((utxo_ref.txid.as_str(), utxo_ref.vout)) {
            skipped += 1;
            continue;
        }
        let hash = get_utxo(store, &utxo_ref.txid, utxo_ref.vout)?
            .as_ref()
            .and_then(live_address_hash);
        if hash == Some(proven) {
            matching.push(utxo_ref);
        } else {
            debug!(utxo = %utxo_ref, "skipping ref outside proven address");
            skipped += 1;
        }
    }
    if matching.is_empty() {
        return Err(RuntimeError::NoMatchingUtxos);
    }

    let mut staged = Staged::new(store);
    let mut result = ClaimResult {
        count_skipped: skipped,
        ..ClaimResult::default()
    };
    for utxo_ref in matching {
        result.total_claimed += claim_utxo(&mut staged, params, &utxo_ref.txid, utxo_ref.vout, Some(&claimer))?;
        result.count_claimed += 1;
    }
    staged.commit()?;
    info!(
        claimer = %msg.claimer,
        claimed = result.count_claimed,
        skipped = result.count_skipped,
        total = result.total_claimed,
        backend = verifier.backend_id(),
        "proof claim applied"
    );
    Ok(result)
}
