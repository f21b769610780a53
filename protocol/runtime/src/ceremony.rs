//! Threshold entropy ceremony deriving the claim verifying key.
//!
//! Bonded validators each contribute 32 bytes together with
//! `sha256(entropy || validator)`. Once enough have contributed, the entropy is
//! XOR-folded, hashed with the contributor list into a seed, and the seed
//! drives deterministic key generation. Entropy and commitment arrive in the
//! same message, so the commitment does not hide anything from later
//! submitters.

use bitgate_state::{format_address, parse_address, read, write, Address, BondedValidator, KvStore};
use bitgate_zk::ClaimKeys;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::params::Params;
use crate::{RuntimeError, RuntimeResult};

pub const SETUP_DOMAIN_TAG: &[u8] = b"bitgate/zk-setup/v1";

const STATE_KEY: &[u8] = b"zk/entropy_state";
const SETUP_KEYS_KEY: &[u8] = b"zk/setup_keys";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZkEntropySubmission {
    pub validator: Address,
    pub entropy: [u8; 32],
    pub commitment: [u8; 32],
    pub submitted_at_block: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZkEntropyState {
    pub collection_active: bool,
    pub collection_start_block: u64,
    pub submissions: Vec<ZkEntropySubmission>,
    pub setup_finalized: bool,
    pub combined_seed: Vec<u8>,
    pub finalized_at_block: u64,
}

impl ZkEntropyState {
    fn has_submitted(&self, validator: &Address) -> bool {
        self.submissions.iter().any(|s| &s.validator == validator)
    }

    fn window_closed(&self, height: u64, window: u64) -> bool {
        self.collection_active && height > self.collection_start_block.saturating_add(window)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZkSetupKeys {
    /// Compressed Groth16 verifying key.
    pub verifying_key: Vec<u8>,
    pub seed_hash: [u8; 32],
    pub generated_at_block: u64,
    pub contributing_validators: Vec<Address>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitZkEntropy {
    /// Hex operator address of the contributing validator.
    pub validator: String,
    pub entropy: [u8; 32],
    pub commitment: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted { submissions: usize, threshold: u32 },
    Finalized(ZkSetupKeys),
}

pub fn entropy_commitment(entropy: &[u8; 32], validator: &Address) -> [u8; 32] {
    Sha256::new()
        .chain_update(entropy)
        .chain_update(validator)
        .finalize()
        .into()
}

pub fn load_state(store: &dyn KvStore) -> RuntimeResult<ZkEntropyState> {
    Ok(read::<ZkEntropyState>(store, STATE_KEY)?.unwrap_or_default())
}

pub fn load_setup_keys(store: &dyn KvStore) -> RuntimeResult<Option<ZkSetupKeys>> {
    Ok(read::<ZkSetupKeys>(store, SETUP_KEYS_KEY)?)
}

fn bonded_count(validators: &[BondedValidator]) -> usize {
    validators.iter().filter(|v| v.is_bonded()).count()
}

pub fn submit_entropy(
    store: &mut dyn KvStore,
    params: &Params,
    msg: &SubmitZkEntropy,
    height: u64,
    validators: &[BondedValidator],
) -> RuntimeResult<SubmitOutcome> {
    let validator = parse_address(&msg.validator)
        .ok_or_else(|| RuntimeError::invalid(format!("validator {:?} is not a chain address", msg.validator)))?;
    if !validators
        .iter()
        .any(|v| v.operator == validator && v.is_bonded())
    {
        return Err(RuntimeError::Unauthorized(format!(
            "validator {} is not bonded",
            msg.validator
        )));
    }

    let mut state = load_state(store)?;
    if state.setup_finalized {
        return Err(RuntimeError::Ceremony("setup already finalized".into()));
    }
    if state.has_submitted(&validator) {
        return Err(RuntimeError::AlreadySubmitted(format_address(&validator)));
    }
    if entropy_commitment(&msg.entropy, &validator) != msg.commitment {
        return Err(RuntimeError::CommitmentMismatch);
    }

    let threshold = params.zk_entropy_threshold;
    if !state.collection_active {
        let bonded = bonded_count(validators);
        if bonded < threshold as usize {
            return Err(RuntimeError::Ceremony(format!(
                "{bonded} bonded validators, ceremony needs {threshold}"
            )));
        }
        state.collection_active = true;
        state.collection_start_block = height;
        info!(height, threshold, "entropy collection started");
    }
    if state.window_closed(height, params.zk_entropy_window) {
        return Err(RuntimeError::Ceremony(format!(
            "collection window closed at block {}",
            state.collection_start_block + params.zk_entropy_window
        )));
    }

    state.submissions.push(ZkEntropySubmission {
        validator,
        entropy: msg.entropy,
        commitment: msg.commitment,
        submitted_at_block: height,
    });
    info!(
        validator = %msg.validator,
        submissions = state.submissions.len(),
        threshold,
        "entropy submitted"
    );

    if state.submissions.len() >= threshold as usize {
        let keys = finalize(store, &mut state, height)?;
        return Ok(SubmitOutcome::Finalized(keys));
    }
    write(store, STATE_KEY, &state)?;
    Ok(SubmitOutcome::Accepted {
        submissions: state.submissions.len(),
        threshold,
    })
}

/// Finalizes when the threshold was reached without finalization having run,
/// for example after governance lowered the threshold.
pub fn end_block(
    store: &mut dyn KvStore,
    params: &Params,
    height: u64,
) -> RuntimeResult<Option<ZkSetupKeys>> {
    let mut state = load_state(store)?;
    if state.setup_finalized || !state.collection_active {
        return Ok(None);
    }
    if state.submissions.len() >= params.zk_entropy_threshold as usize {
        return finalize(store, &mut state, height).map(Some);
    }
    let deadline = state
        .collection_start_block
        .saturating_add(params.zk_entropy_window);
    if height == deadline.saturating_add(1) {
        warn!(
            submissions = state.submissions.len(),
            threshold = params.zk_entropy_threshold,
            "entropy window expired before threshold"
        );
    }
    Ok(None)
}

pub fn combine_entropy(submissions: &[ZkEntropySubmission]) -> Vec<u8> {
    let Some(first) = submissions.first() else {
        return Vec::new();
    };
    let mut combined = first.entropy.to_vec();
    for submission in &submissions[1..] {
        for (acc, byte) in combined.iter_mut().zip(submission.entropy.iter()) {
            *acc ^= byte;
        }
    }
    combined
}

pub fn derive_seed(combined: &[u8], contributors: &[Address]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(SETUP_DOMAIN_TAG);
    hasher.update(combined);
    for validator in contributors {
        hasher.update(validator);
    }
    hasher.finalize().into()
}

fn finalize(
    store: &mut dyn KvStore,
    state: &mut ZkEntropyState,
    height: u64,
) -> RuntimeResult<ZkSetupKeys> {
    let combined = combine_entropy(&state.submissions);
    let contributors: Vec<Address> = state.submissions.iter().map(|s| s.validator).collect();
    let seed = derive_seed(&combined, &contributors);
    let keys = ClaimKeys::derive(&seed)?;

    let setup = ZkSetupKeys {
        verifying_key: keys.verifying_key_bytes()?,
        seed_hash: seed,
        generated_at_block: height,
        contributing_validators: contributors,
    };
    state.combined_seed = combined;
    state.setup_finalized = true;
    state.finalized_at_block = height;
    write(store, SETUP_KEYS_KEY, &setup)?;
    write(store, STATE_KEY, &*state)?;
    info!(
        height,
        contributors = setup.contributing_validators.len(),
        "zk setup finalized"
    );
    Ok(setup)
}
