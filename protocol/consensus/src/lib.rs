//! Attestation quorum: decides whether a set of validator signatures over an
//! observed Bitcoin block carries more than two thirds of bonded power.

use bitgate_state::{format_address, parse_address, Address, BondedValidator};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestation {
    /// Hex consensus address of the signing validator.
    pub validator: String,
    pub signature: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum QuorumError {
    #[error("insufficient attestation power: have {accumulated}, need more than {required}")]
    InsufficientPower { accumulated: u64, required: u64 },
    #[error("bonded validator set is empty")]
    NoBondedPower,
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuorumReport {
    pub accumulated: u64,
    pub required: u64,
    pub total: u64,
    pub signers: Vec<Address>,
}

/// Largest power that is still *not* a quorum: ⌊total·2/3⌋.
pub fn quorum_threshold(total_power: u64) -> u64 {
    ((total_power as u128 * 2) / 3) as u64
}

#[derive(Debug, Default, Clone)]
struct AttestationTally {
    power: u64,
    seen: BTreeSet<Address>,
    signers: Vec<Address>,
}

pub fn verify_signature_bytes(pubkey: &[u8], signature: &[u8], msg: &[u8]) -> Result<(), QuorumError> {
    let pk: [u8; 32] = pubkey
        .try_into()
        .map_err(|_| QuorumError::InvalidSignature("pubkey must be 32 bytes".into()))?;
    let key = VerifyingKey::from_bytes(&pk).map_err(|e| QuorumError::InvalidSignature(e.to_string()))?;
    let sig = Signature::from_slice(signature).map_err(|e| QuorumError::InvalidSignature(e.to_string()))?;
    key.verify(msg, &sig)
        .map_err(|e| QuorumError::InvalidSignature(e.to_string()))
}

pub fn sign_attestation(raw_block: &[u8], signing_key: &SigningKey) -> Attestation {
    let pubkey = signing_key.verifying_key().to_bytes();
    Attestation {
        validator: format_address(&bitgate_state::address_from_pubkey(&pubkey)),
        signature: signing_key.sign(raw_block).to_bytes().to_vec(),
    }
}

/// Accumulates power from attestations over `raw_block`. Each consensus
/// address counts at most once (first occurrence wins); unknown, unbonded or
/// badly signed entries are skipped rather than failing the whole set.
pub fn check_quorum(
    raw_block: &[u8],
    attestations: &[Attestation],
    validators: &[BondedValidator],
) -> Result<QuorumReport, QuorumError> {
    let mut by_address: BTreeMap<Address, &BondedValidator> = BTreeMap::new();
    let mut total: u64 = 0;
    for v in validators.iter().filter(|v| v.is_bonded()) {
        by_address.insert(v.cons_address(), v);
        total = total.saturating_add(v.power);
    }
    if total == 0 {
        return Err(QuorumError::NoBondedPower);
    }
    let required = quorum_threshold(total);

    let mut tally = AttestationTally::default();
    for att in attestations {
        let Some(address) = parse_address(&att.validator) else {
            debug!(validator = %att.validator, "skipping attestation with malformed address");
            continue;
        };
        if !tally.seen.insert(address) {
            continue; // first occurrence per address wins
        }
        let Some(validator) = by_address.get(&address) else {
            debug!(validator = %att.validator, "skipping attestation from unknown or unbonded validator");
            continue;
        };
        if let Err(err) = verify_signature_bytes(&validator.pubkey, &att.signature, raw_block) {
            warn!(validator = %att.validator, "skipping attestation with bad signature: {err}");
            continue;
        }
        tally.power = tally.power.saturating_add(validator.power);
        tally.signers.push(address);
    }

    if tally.power <= required {
        return Err(QuorumError::InsufficientPower {
            accumulated: tally.power,
            required,
        });
    }
    Ok(QuorumReport {
        accumulated: tally.power,
        required,
        total,
        signers: tally.signers,
    })
}
