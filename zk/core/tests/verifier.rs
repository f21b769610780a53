use bitgate_zk::{
    address_for_secret, claim_message_hash, ClaimKeys, ClaimProofVerifier, ClaimPublicInputs,
    Groth16ClaimVerifier, ZkError, MAX_PROOF_BYTES,
};
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha20Rng;
use std::sync::OnceLock;

const CHAIN_ID: &str = "bitgate-testnet";

fn keys() -> &'static ClaimKeys {
    static KEYS: OnceLock<ClaimKeys> = OnceLock::new();
    KEYS.get_or_init(|| ClaimKeys::derive(&[42u8; 32]).unwrap())
}

fn proof_for(secret: &[u8; 32], claimer: &[u8]) -> (Vec<u8>, ClaimPublicInputs) {
    let inputs = ClaimPublicInputs::new(address_for_secret(secret), claimer, CHAIN_ID);
    let mut rng = ChaCha20Rng::seed_from_u64(7);
    let proof = keys().prove(secret, &inputs, &mut rng).unwrap();
    (proof, inputs)
}

#[test]
fn honest_proof_verifies() {
    let (proof, inputs) = proof_for(&[1u8; 32], &[9u8; 32]);
    assert_eq!(proof.len(), 128);
    let verifier = keys().verifier().unwrap();
    assert_eq!(verifier.backend_id(), "groth16-bn254");
    verifier.verify(&proof, &inputs).unwrap();
}

#[test]
fn proof_is_bound_to_claimer_and_chain() {
    let (proof, inputs) = proof_for(&[1u8; 32], &[9u8; 32]);
    let verifier = keys().verifier().unwrap();

    let other_claimer = ClaimPublicInputs::new(inputs.address_hash, &[8u8; 32], CHAIN_ID);
    assert!(matches!(
        verifier.verify(&proof, &other_claimer),
        Err(ZkError::ProofRejected(_))
    ));

    let other_chain = ClaimPublicInputs::new(inputs.address_hash, &[9u8; 32], "elsewhere");
    assert!(verifier.verify(&proof, &other_chain).is_err());
}

#[test]
fn proof_is_bound_to_address() {
    let (proof, inputs) = proof_for(&[1u8; 32], &[9u8; 32]);
    let mut address = inputs.address_hash;
    address[0] ^= 0x80;
    let swapped = ClaimPublicInputs::new(address, &[9u8; 32], CHAIN_ID);
    assert!(keys().verifier().unwrap().verify(&proof, &swapped).is_err());
}

#[test]
fn tampered_or_oversized_proofs_are_rejected() {
    let (mut proof, inputs) = proof_for(&[2u8; 32], &[3u8; 32]);
    let verifier = keys().verifier().unwrap();
    proof[10] ^= 0x01;
    assert!(verifier.verify(&proof, &inputs).is_err());

    assert!(matches!(
        verifier.verify(&[0u8; 99], &inputs),
        Err(ZkError::ProofSize(99))
    ));
    assert!(matches!(
        verifier.verify(&vec![0u8; MAX_PROOF_BYTES + 1], &inputs),
        Err(ZkError::ProofSize(_))
    ));
}

#[test]
fn prover_refuses_secret_for_other_address() {
    let inputs = ClaimPublicInputs::new(address_for_secret(&[5u8; 32]), &[1u8; 32], CHAIN_ID);
    let mut rng = ChaCha20Rng::seed_from_u64(1);
    assert!(matches!(
        keys().prove(&[6u8; 32], &inputs, &mut rng),
        Err(ZkError::InvalidWitness(_))
    ));
}

#[test]
fn key_derivation_is_deterministic() {
    let again = ClaimKeys::derive(&[42u8; 32]).unwrap();
    assert_eq!(
        again.verifying_key_bytes().unwrap(),
        keys().verifying_key_bytes().unwrap()
    );
    let other = ClaimKeys::derive(&[43u8; 32]).unwrap();
    assert_ne!(
        other.verifying_key_bytes().unwrap(),
        keys().verifying_key_bytes().unwrap()
    );
}

#[test]
fn verifier_reloads_from_key_bytes() {
    let bytes = keys().verifying_key_bytes().unwrap();
    let reloaded = Groth16ClaimVerifier::from_verifying_key_bytes(&bytes).unwrap();
    let (proof, inputs) = proof_for(&[4u8; 32], &[4u8; 32]);
    reloaded.verify(&proof, &inputs).unwrap();

    // proof made under the reloaded key fails under a different ceremony's key
    let other = ClaimKeys::derive(&[1u8; 32]).unwrap().verifier().unwrap();
    assert!(other.verify(&proof, &inputs).is_err());
}

#[test]
fn message_hash_layout() {
    use sha2::{Digest, Sha256};
    let addr = [0xabu8; 20];
    let claimer = [0x01u8; 32];
    let mut buf = addr.to_vec();
    buf.extend_from_slice(&Sha256::digest(claimer));
    buf.extend_from_slice(&Sha256::digest(CHAIN_ID.as_bytes()));
    let expected: [u8; 32] = Sha256::digest(&buf).into();
    assert_eq!(claim_message_hash(&addr, &claimer, CHAIN_ID), expected);
}
