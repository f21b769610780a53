//! R1CS relation behind a claim proof.
//!
//! The prover knows a claim secret `s` such that the low 160 bits of
//! `MiMC7_s(0) + s` equal the public address hash. The two message limbs are
//! public inputs, so a proof is only valid for the message it was made for.

use ark_bn254::Fr;
use ark_ff::{BigInteger, Field, One, PrimeField, Zero};
use ark_relations::lc;
use ark_relations::r1cs::{
    ConstraintSynthesizer, ConstraintSystemRef, LinearCombination, SynthesisError, Variable,
};
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

pub const MIMC_ROUNDS: usize = 91;
pub const ADDRESS_BYTES: usize = 20;
const HIGH_BITS: usize = 94;

fn round_constants() -> &'static [Fr] {
    static CONSTANTS: OnceLock<Vec<Fr>> = OnceLock::new();
    CONSTANTS.get_or_init(|| {
        (0..MIMC_ROUNDS as u32)
            .map(|i| {
                let digest = Sha256::new()
                    .chain_update(b"bitgate/mimc7")
                    .chain_update(i.to_be_bytes())
                    .finalize();
                Fr::from_be_bytes_mod_order(&digest)
            })
            .collect()
    })
}

pub fn mimc_commit(secret: Fr) -> Fr {
    let mut x = Fr::zero();
    for c in round_constants() {
        let t = x + secret + c;
        let t2 = t.square();
        let t6 = t2.square() * t2;
        x = t6 * t;
    }
    x + secret
}

fn split_commitment(commitment: Fr) -> ([u8; ADDRESS_BYTES], Fr) {
    let bytes = commitment.into_bigint().to_bytes_be();
    let mut low = [0u8; ADDRESS_BYTES];
    low.copy_from_slice(&bytes[bytes.len() - ADDRESS_BYTES..]);
    let high = Fr::from_be_bytes_mod_order(&bytes[..bytes.len() - ADDRESS_BYTES]);
    (low, high)
}

pub fn secret_to_field(secret: &[u8; 32]) -> Fr {
    Fr::from_be_bytes_mod_order(secret)
}

/// Address hash a claim secret controls.
pub fn address_for_secret(secret: &[u8; 32]) -> [u8; ADDRESS_BYTES] {
    split_commitment(mimc_commit(secret_to_field(secret))).0
}

#[derive(Clone, Default)]
pub struct ClaimCircuit {
    pub secret: Option<Fr>,
    pub address: Option<Fr>,
    pub message_hi: Option<Fr>,
    pub message_lo: Option<Fr>,
}

fn witness(
    cs: &ConstraintSystemRef<Fr>,
    value: Option<Fr>,
) -> Result<Variable, SynthesisError> {
    cs.new_witness_variable(|| value.ok_or(SynthesisError::AssignmentMissing))
}

impl ConstraintSynthesizer<Fr> for ClaimCircuit {
    fn generate_constraints(self, cs: ConstraintSystemRef<Fr>) -> Result<(), SynthesisError> {
        let address = cs.new_input_variable(|| self.address.ok_or(SynthesisError::AssignmentMissing))?;
        let message_hi =
            cs.new_input_variable(|| self.message_hi.ok_or(SynthesisError::AssignmentMissing))?;
        let message_lo =
            cs.new_input_variable(|| self.message_lo.ok_or(SynthesisError::AssignmentMissing))?;
        let secret_val = self.secret;
        let secret = witness(&cs, secret_val)?;

        cs.enforce_constraint(lc!() + message_hi, lc!() + Variable::One, lc!() + message_hi)?;
        cs.enforce_constraint(lc!() + message_lo, lc!() + Variable::One, lc!() + message_lo)?;

        let mut x_val = Some(Fr::zero());
        let mut x_lc: LinearCombination<Fr> = lc!();
        for c in round_constants() {
            let t_val = x_val.zip(secret_val).map(|(x, s)| x + s + c);
            let t_lc = x_lc.clone() + secret + (*c, Variable::One);

            let t2_val = t_val.map(|t| t.square());
            let t2 = witness(&cs, t2_val)?;
            cs.enforce_constraint(t_lc.clone(), t_lc.clone(), lc!() + t2)?;

            let t4_val = t2_val.map(|v| v.square());
            let t4 = witness(&cs, t4_val)?;
            cs.enforce_constraint(lc!() + t2, lc!() + t2, lc!() + t4)?;

            let t6_val = t4_val.zip(t2_val).map(|(a, b)| a * b);
            let t6 = witness(&cs, t6_val)?;
            cs.enforce_constraint(lc!() + t4, lc!() + t2, lc!() + t6)?;

            let next_val = t6_val.zip(t_val).map(|(a, b)| a * b);
            let next = witness(&cs, next_val)?;
            cs.enforce_constraint(lc!() + t6, t_lc, lc!() + next)?;

            x_val = next_val;
            x_lc = lc!() + next;
        }
        let commitment_lc = x_lc + secret;
        let commitment_val = x_val.zip(secret_val).map(|(x, s)| x + s);

        // commitment = high·2^160 + address, with high range-checked
        let high_bits = commitment_val.map(|c| split_commitment(c).1.into_bigint().to_bits_le());
        let mut recomposed = lc!() + address;
        let mut coeff = Fr::from(2u64).pow([(ADDRESS_BYTES * 8) as u64]);
        for i in 0..HIGH_BITS {
            let bit_val = high_bits
                .as_ref()
                .map(|bits| if bits[i] { Fr::one() } else { Fr::zero() });
            let bit = witness(&cs, bit_val)?;
            cs.enforce_constraint(lc!() + bit, lc!() + Variable::One - bit, lc!())?;
            recomposed = recomposed + (coeff, bit);
            coeff.double_in_place();
        }
        cs.enforce_constraint(commitment_lc, lc!() + Variable::One, recomposed)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ark_relations::r1cs::ConstraintSystem;

    fn limbs(message: &[u8; 32]) -> (Fr, Fr) {
        (
            Fr::from_be_bytes_mod_order(&message[..16]),
            Fr::from_be_bytes_mod_order(&message[16..]),
        )
    }

    #[test]
    fn honest_assignment_satisfies() {
        let secret = [7u8; 32];
        let address = address_for_secret(&secret);
        let (hi, lo) = limbs(&[3u8; 32]);
        let cs = ConstraintSystem::<Fr>::new_ref();
        ClaimCircuit {
            secret: Some(secret_to_field(&secret)),
            address: Some(Fr::from_be_bytes_mod_order(&address)),
            message_hi: Some(hi),
            message_lo: Some(lo),
        }
        .generate_constraints(cs.clone())
        .unwrap();
        assert!(cs.is_satisfied().unwrap());
    }

    #[test]
    fn wrong_address_is_unsatisfied() {
        let secret = [7u8; 32];
        let mut address = address_for_secret(&secret);
        address[19] ^= 1;
        let (hi, lo) = limbs(&[3u8; 32]);
        let cs = ConstraintSystem::<Fr>::new_ref();
        ClaimCircuit {
            secret: Some(secret_to_field(&secret)),
            address: Some(Fr::from_be_bytes_mod_order(&address)),
            message_hi: Some(hi),
            message_lo: Some(lo),
        }
        .generate_constraints(cs.clone())
        .unwrap();
        assert!(!cs.is_satisfied().unwrap());
    }
}
