use ark_bn254::{Bn254, Fr};
use ark_ff::PrimeField;
use ark_groth16::{Groth16, PreparedVerifyingKey, Proof, ProvingKey, VerifyingKey};
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use ark_snark::SNARK;
use ark_std::rand::{CryptoRng, RngCore};
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha20Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

pub mod circuit;

pub use circuit::{address_for_secret, ClaimCircuit, ADDRESS_BYTES};

pub type Hash = [u8; 32];

pub const MIN_PROOF_BYTES: usize = 100;
pub const MAX_PROOF_BYTES: usize = 51_200;

#[derive(Debug, Error)]
pub enum ZkError {
    #[error("proof rejected: {0}")]
    ProofRejected(String),
    #[error("proof size {0} outside {MIN_PROOF_BYTES}..={MAX_PROOF_BYTES} bytes")]
    ProofSize(usize),
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
    #[error("invalid witness: {0}")]
    InvalidWitness(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type ZkResult<T> = Result<T, ZkError>;

/// Values a claim proof is checked against. Both are computed by the chain,
/// never taken from the claimant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimPublicInputs {
    pub address_hash: [u8; ADDRESS_BYTES],
    pub message_hash: Hash,
}

impl ClaimPublicInputs {
    pub fn new(address_hash: [u8; ADDRESS_BYTES], claimer: &[u8], chain_id: &str) -> Self {
        Self {
            address_hash,
            message_hash: claim_message_hash(&address_hash, claimer, chain_id),
        }
    }

    fn field_elements(&self) -> [Fr; 3] {
        [
            Fr::from_be_bytes_mod_order(&self.address_hash),
            Fr::from_be_bytes_mod_order(&self.message_hash[..16]),
            Fr::from_be_bytes_mod_order(&self.message_hash[16..]),
        ]
    }
}

/// `SHA256(address_hash ‖ SHA256(claimer) ‖ SHA256(chain_id))`
pub fn claim_message_hash(address_hash: &[u8], claimer: &[u8], chain_id: &str) -> Hash {
    let claimer_hash = Sha256::digest(claimer);
    let chain_hash = Sha256::digest(chain_id.as_bytes());
    Sha256::new()
        .chain_update(address_hash)
        .chain_update(claimer_hash)
        .chain_update(chain_hash)
        .finalize()
        .into()
}

/// Checks that a proof binds an address hash to a claimer on this chain.
///
/// The relation behind [`Groth16ClaimVerifier`] is knowledge of a MiMC
/// preimage of the 20-byte address hash. It stands in for ownership of the
/// secp256k1 key whose HASH160 is that address, so holders of ordinary
/// Bitcoin keys cannot produce proofs for it. A backend proving the real
/// relation plugs in behind this trait unchanged.
pub trait ClaimProofVerifier: Send + Sync {
    fn backend_id(&self) -> &'static str;
    fn verify(&self, proof: &[u8], inputs: &ClaimPublicInputs) -> ZkResult<()>;
}

pub struct Groth16ClaimVerifier {
    pvk: PreparedVerifyingKey<Bn254>,
}

impl Groth16ClaimVerifier {
    pub fn new(vk: &VerifyingKey<Bn254>) -> ZkResult<Self> {
        let pvk = Groth16::<Bn254>::process_vk(vk)
            .map_err(|e| ZkError::KeyDerivation(e.to_string()))?;
        Ok(Self { pvk })
    }

    pub fn from_verifying_key_bytes(bytes: &[u8]) -> ZkResult<Self> {
        let vk = VerifyingKey::<Bn254>::deserialize_compressed(bytes)
            .map_err(|e| ZkError::Serialization(format!("verifying key: {e}")))?;
        Self::new(&vk)
    }
}

impl ClaimProofVerifier for Groth16ClaimVerifier {
    fn backend_id(&self) -> &'static str {
        "groth16-bn254"
    }

    fn verify(&self, proof: &[u8], inputs: &ClaimPublicInputs) -> ZkResult<()> {
        if !(MIN_PROOF_BYTES..=MAX_PROOF_BYTES).contains(&proof.len()) {
            return Err(ZkError::ProofSize(proof.len()));
        }
        let proof = Proof::<Bn254>::deserialize_compressed(proof)
            .map_err(|e| ZkError::ProofRejected(format!("proof decode error: {e}")))?;
        let ok = Groth16::<Bn254>::verify_with_processed_vk(&self.pvk, &inputs.field_elements(), &proof)
            .map_err(|e| ZkError::ProofRejected(e.to_string()))?;
        if !ok {
            return Err(ZkError::ProofRejected(
                "proof does not bind the expected address and message".into(),
            ));
        }
        Ok(())
    }
}

/// Proving and verifying keys for the claim circuit. Derivation is a pure
/// function of the seed, so every validator arrives at the same keys.
pub struct ClaimKeys {
    pub proving_key: ProvingKey<Bn254>,
    pub verifying_key: VerifyingKey<Bn254>,
}

impl ClaimKeys {
    pub fn derive(seed: &Hash) -> ZkResult<Self> {
        let mut rng = ChaCha20Rng::from_seed(*seed);
        let (proving_key, verifying_key) =
            Groth16::<Bn254>::circuit_specific_setup(ClaimCircuit::default(), &mut rng)
                .map_err(|e| ZkError::KeyDerivation(e.to_string()))?;
        debug!(seed = %hex::encode(&seed[..4]), "derived claim circuit keys");
        Ok(Self {
            proving_key,
            verifying_key,
        })
    }

    pub fn verifying_key_bytes(&self) -> ZkResult<Vec<u8>> {
        let mut out = Vec::new();
        self.verifying_key
            .serialize_compressed(&mut out)
            .map_err(|e| ZkError::Serialization(e.to_string()))?;
        Ok(out)
    }

    pub fn verifier(&self) -> ZkResult<Groth16ClaimVerifier> {
        Groth16ClaimVerifier::new(&self.verifying_key)
    }

    pub fn prove<R: RngCore + CryptoRng>(
        &self,
        secret: &[u8; 32],
        inputs: &ClaimPublicInputs,
        rng: &mut R,
    ) -> ZkResult<Vec<u8>> {
        if address_for_secret(secret) != inputs.address_hash {
            return Err(ZkError::InvalidWitness(
                "secret does not control the requested address".into(),
            ));
        }
        let [address, message_hi, message_lo] = inputs.field_elements();
        let circuit = ClaimCircuit {
            secret: Some(circuit::secret_to_field(secret)),
            address: Some(address),
            message_hi: Some(message_hi),
            message_lo: Some(message_lo),
        };
        let proof = Groth16::<Bn254>::prove(&self.proving_key, circuit, rng)
            .map_err(|e| ZkError::InvalidWitness(e.to_string()))?;
        let mut out = Vec::new();
        proof
            .serialize_compressed(&mut out)
            .map_err(|e| ZkError::Serialization(e.to_string()))?;
        Ok(out)
    }
}
