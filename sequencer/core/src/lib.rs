pub mod cache;
pub mod proposal;

use async_trait::async_trait;
use bitgate_runtime::AttestedBlock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

pub use cache::{AddOutcome, CacheConfig, CacheError, CacheEvent, CacheItem, InjectCache};
pub use proposal::{verify_injected_txs, ProposalBuilder};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub accepted: bool,
    /// True when the block merged into an entry that was already pending.
    pub merged: bool,
    pub pending: usize,
}

/// Entry point for indexers pushing attested blocks.
#[async_trait]
pub trait BlockSink: Send + Sync {
    async fn send_block(&self, block: AttestedBlock) -> Result<Ack, CacheError>;
    fn subscribe(&self, event_type: Option<String>) -> mpsc::Receiver<CacheEvent>;
}

#[derive(Clone)]
pub struct InjectService {
    pub cache: Arc<InjectCache<AttestedBlock>>,
}

impl InjectService {
    pub fn new(cache: Arc<InjectCache<AttestedBlock>>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl BlockSink for InjectService {
    async fn send_block(&self, block: AttestedBlock) -> Result<Ack, CacheError> {
        block
            .validate_basic()
            .map_err(|e| CacheError::Rejected(e.to_string()))?;
        info!("received attested block {} at height {}", block.hash, block.height);
        let outcome = self.cache.add_item(block);
        Ok(Ack {
            accepted: true,
            merged: matches!(outcome, AddOutcome::Merged { .. }),
            pending: self.cache.len(),
        })
    }

    fn subscribe(&self, event_type: Option<String>) -> mpsc::Receiver<CacheEvent> {
        self.cache.subscribe(event_type)
    }
}
