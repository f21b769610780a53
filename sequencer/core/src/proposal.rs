use bitgate_runtime::{AttestedBlock, Msg};
use std::ops::ControlFlow;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::{CacheError, InjectCache};

/// Turns pending attested blocks into transactions for the next proposal.
#[derive(Clone)]
pub struct ProposalBuilder {
    cache: Arc<InjectCache<AttestedBlock>>,
    proposer: String,
}

impl ProposalBuilder {
    pub fn new(cache: Arc<InjectCache<AttestedBlock>>, proposer: impl Into<String>) -> Self {
        Self {
            cache,
            proposer: proposer.into(),
        }
    }

    pub fn proposer(&self) -> &str {
        &self.proposer
    }

    /// Encoded `Msg::AttestedBlock` transactions that fit in `max_bytes`,
    /// plus the bytes they use. Each block is restamped with the local
    /// proposer. Selection stops at the first block that does not fit.
    pub fn proposal_inject_txs(
        &self,
        height: u64,
        max_bytes: usize,
    ) -> Result<(Vec<Vec<u8>>, usize), CacheError> {
        let mut used = 0usize;
        let txs = self.cache.process_for_proposal(
            |mut block| {
                block.signer = self.proposer.clone();
                block
            },
            |block| {
                Msg::AttestedBlock(block.clone())
                    .encode()
                    .map_err(|e| CacheError::Marshal(e.to_string()))
            },
            |_, bytes| {
                if used + bytes.len() > max_bytes {
                    return ControlFlow::Break(());
                }
                used += bytes.len();
                ControlFlow::Continue(())
            },
        )?;
        debug!(height, count = txs.len(), used, max_bytes, "injected attested blocks");
        Ok((txs, used))
    }
}

/// Decodes every injected transaction and checks its structure. One bad
/// transaction rejects the whole proposal.
pub fn verify_injected_txs(txs: &[Vec<u8>]) -> Result<Vec<Msg>, CacheError> {
    txs.iter()
        .enumerate()
        .map(|(index, bytes)| {
            let checked = Msg::decode(bytes)
                .map_err(|e| e.to_string())
                .and_then(|msg| msg.validate_basic().map(|_| msg).map_err(|e| e.to_string()));
            checked.map_err(|reason| {
                warn!(index, %reason, "rejecting proposal");
                CacheError::InvalidInjectedTx { index, reason }
            })
        })
        .collect()
}
