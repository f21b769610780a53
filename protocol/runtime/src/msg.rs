use serde::{Deserialize, Serialize};

use crate::ceremony::SubmitZkEntropy;
use crate::claim::{ClaimWithProof, GovClaimUtxo};
use crate::ingest::AttestedBlock;
use crate::params::UpdateParams;
use crate::{RuntimeError, RuntimeResult};

/// Every message the chain accepts. Dispatch matches exhaustively, so a new
/// variant has to be handled before it compiles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Msg {
    AttestedBlock(AttestedBlock),
    GovClaimUtxo(GovClaimUtxo),
    ClaimWithProof(ClaimWithProof),
    SubmitZkEntropy(SubmitZkEntropy),
    UpdateParams(UpdateParams),
}

impl Msg {
    pub fn kind(&self) -> &'static str {
        match self {
            Msg::AttestedBlock(_) => "attested_block",
            Msg::GovClaimUtxo(_) => "gov_claim_utxo",
            Msg::ClaimWithProof(_) => "claim_with_proof",
            Msg::SubmitZkEntropy(_) => "submit_zk_entropy",
            Msg::UpdateParams(_) => "update_params",
        }
    }

    pub fn encode(&self) -> RuntimeResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| RuntimeError::Codec(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> RuntimeResult<Self> {
        bincode::deserialize(bytes).map_err(|e| RuntimeError::Codec(e.to_string()))
    }

    /// Checks that need no state. Handlers repeat what they depend on.
    pub fn validate_basic(&self) -> RuntimeResult<()> {
        match self {
            Msg::AttestedBlock(block) => block.validate_basic(),
            Msg::GovClaimUtxo(msg) => {
                if msg.utxos.is_empty() {
                    return Err(RuntimeError::invalid("no utxo refs given"));
                }
                Ok(())
            }
            Msg::ClaimWithProof(msg) => msg.validate_basic().map(|_| ()),
            Msg::SubmitZkEntropy(msg) => {
                if bitgate_state::parse_address(&msg.validator).is_none() {
                    return Err(RuntimeError::invalid("validator is not a chain address"));
                }
                Ok(())
            }
            Msg::UpdateParams(msg) => msg.params.validate(),
        }
    }
}
