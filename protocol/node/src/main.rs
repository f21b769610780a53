use anyhow::Context;
use bitgate_api::ApiServer;
use bitgate_inject::{
    verify_injected_txs, CacheConfig, CacheError, CacheItem, InjectCache, InjectService, ProposalBuilder,
};
use bitgate_runtime::ceremony::entropy_commitment;
use bitgate_runtime::genesis::{export_utxos, import_utxos, load_genesis_from_file};
use bitgate_runtime::{
    App, AttestedBlock, DeliverOutcome, GenesisConfig, IngestOutcome, Msg, SubmitZkEntropy,
};
use bitgate_state::{address_from_pubkey, format_address, Address};
use ed25519_dalek::SigningKey;
use parking_lot::Mutex;
use rand::RngCore;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct NodeConfig {
    node_id: String,
    api_listen: SocketAddr,
    block_time: Duration,
    cache_ttl: Duration,
    cache_keep_blocks: u64,
    max_inject_bytes: usize,
    genesis_path: Option<PathBuf>,
    genesis_utxo_dir: Option<PathBuf>,
    export_utxo_dir: Option<PathBuf>,
}

impl NodeConfig {
    fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        Ok(Self {
            node_id: lookup("NODE_ID").unwrap_or_else(|| "node-0".into()),
            api_listen: parse_or(&lookup, "API_LISTEN", "0.0.0.0:7545".parse()?)?,
            block_time: Duration::from_millis(parse_or(&lookup, "BLOCK_TIME_MS", 1_000)?),
            cache_ttl: Duration::from_secs(parse_or(&lookup, "CACHE_TTL_SECS", 600)?),
            cache_keep_blocks: parse_or(&lookup, "CACHE_KEEP_BLOCKS", 100)?,
            max_inject_bytes: parse_or(&lookup, "MAX_INJECT_BYTES", 4 * 1024 * 1024)?,
            genesis_path: lookup("GENESIS_PATH").map(PathBuf::from),
            genesis_utxo_dir: lookup("GENESIS_UTXO_DIR").map(PathBuf::from),
            export_utxo_dir: lookup("EXPORT_UTXO_DIR").map(PathBuf::from),
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().with_context(|| format!("invalid {key}: {raw:?}")),
        None => Ok(default),
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct BlockReport {
    height: u64,
    txs: usize,
    applied: usize,
    failed: usize,
}

#[derive(Clone)]
struct Node {
    id: String,
    app: Arc<Mutex<App>>,
    cache: Arc<InjectCache<AttestedBlock>>,
    builder: ProposalBuilder,
    mempool: Arc<Mutex<Vec<Vec<u8>>>>,
    operator: Option<Address>,
    keep_blocks: u64,
    max_inject_bytes: usize,
}

impl Node {
    fn new(config: &NodeConfig, app: App) -> Self {
        let signing_key = derive_signing_key(&config.node_id);
        let pubkey = signing_key.verifying_key().to_bytes();
        let proposer = format_address(&address_from_pubkey(&pubkey));
        let operator = app
            .validators()
            .iter()
            .find(|v| v.is_bonded() && v.pubkey == pubkey)
            .map(|v| v.operator);
        let cache = Arc::new(InjectCache::new(CacheConfig {
            ttl: config.cache_ttl,
            ..CacheConfig::default()
        }));
        Self {
            id: config.node_id.clone(),
            app: Arc::new(Mutex::new(app)),
            builder: ProposalBuilder::new(cache.clone(), proposer),
            cache,
            mempool: Arc::new(Mutex::new(Vec::new())),
            operator,
            keep_blocks: config.cache_keep_blocks,
            max_inject_bytes: config.max_inject_bytes,
        }
    }

    /// Queues this node's entropy contribution when it is a bonded validator
    /// and the ceremony still needs it.
    fn queue_entropy(&self) -> anyhow::Result<bool> {
        let Some(operator) = self.operator else {
            return Ok(false);
        };
        let state = self.app.lock().entropy_state()?;
        if state.setup_finalized || state.submissions.iter().any(|s| s.validator == operator) {
            return Ok(false);
        }
        let mut entropy = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut entropy);
        let msg = Msg::SubmitZkEntropy(SubmitZkEntropy {
            validator: format_address(&operator),
            entropy,
            commitment: entropy_commitment(&entropy, &operator),
        });
        self.mempool.lock().push(msg.encode()?);
        info!("{} queued entropy contribution", self.id);
        Ok(true)
    }

    /// Injected attested blocks first, then host transactions in the space
    /// they leave.
    fn prepare_proposal(
        &self,
        height: u64,
        max_bytes: usize,
        host_txs: Vec<Vec<u8>>,
    ) -> Result<Vec<Vec<u8>>, CacheError> {
        let (mut txs, used) = self.builder.proposal_inject_txs(height, max_bytes)?;
        let mut remaining = max_bytes.saturating_sub(used);
        for tx in host_txs {
            if tx.len() > remaining {
                debug!(len = tx.len(), remaining, "host tx deferred");
                self.mempool.lock().push(tx);
                continue;
            }
            remaining -= tx.len();
            txs.push(tx);
        }
        Ok(txs)
    }

    fn process_proposal(&self, txs: &[Vec<u8>]) -> Result<Vec<Msg>, CacheError> {
        verify_injected_txs(txs)
    }

    fn finalize_block(&self, height: u64, msgs: &[Msg]) -> anyhow::Result<BlockReport> {
        let mut report = BlockReport {
            height,
            txs: msgs.len(),
            ..BlockReport::default()
        };
        let mut app = self.app.lock();
        for msg in msgs {
            let result = app.deliver(height, msg);
            match &result {
                Ok(_) => report.applied += 1,
                Err(_) => report.failed += 1,
            }
            if let Msg::AttestedBlock(block) = msg {
                if settled(block, &result) {
                    self.cache.mark_attestations_confirmed(&block.key());
                    self.cache.add_to_block(height, block.key());
                }
            }
        }
        app.end_block(height)?;
        drop(app);
        self.cache.clean_old_blocks(height, self.keep_blocks);
        Ok(report)
    }

    fn produce_block(&self, height: u64) -> anyhow::Result<BlockReport> {
        let host_txs = std::mem::take(&mut *self.mempool.lock());
        let txs = self.prepare_proposal(height, self.max_inject_bytes, host_txs)?;
        let msgs = self.process_proposal(&txs)?;
        let report = self.finalize_block(height, &msgs)?;
        if report.txs > 0 {
            let root = hex::encode(self.app.lock().state_root());
            info!(
                "committed block {} ({} txs, {} failed, root {})",
                report.height, report.txs, report.failed, root
            );
        }
        Ok(report)
    }
}

/// Whether a delivered attested block no longer needs to stay pending.
/// Blocks ahead of the watermark and blocks still short of quorum are kept.
fn settled(block: &AttestedBlock, result: &bitgate_runtime::RuntimeResult<DeliverOutcome>) -> bool {
    match result {
        Ok(DeliverOutcome::Block(IngestOutcome::Skipped { last_processed })) => block.height < *last_processed,
        Ok(_) => true,
        Err(_) => false,
    }
}

fn derive_signing_key(node_id: &str) -> SigningKey {
    let digest = blake3::hash(node_id.as_bytes());
    SigningKey::from_bytes(digest.as_bytes())
}

fn load_app(config: &NodeConfig) -> anyhow::Result<App> {
    let genesis = match &config.genesis_path {
        Some(path) => {
            info!("loading genesis from {}", path.display());
            load_genesis_from_file(path).with_context(|| format!("genesis {}", path.display()))?
        }
        None => {
            warn!("GENESIS_PATH not set, starting from an empty devnet genesis");
            GenesisConfig::default()
        }
    };
    let mut app = App::from_genesis(&genesis)?;
    if let Some(dir) = &config.genesis_utxo_dir {
        let count = import_utxos(app.store_mut(), dir)
            .with_context(|| format!("utxo import from {}", dir.display()))?;
        info!("imported {} genesis utxos", count);
    }
    Ok(app)
}

fn spawn_block_production(node: Node, period: Duration, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(period);
        let mut height = 0u64;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    height += 1;
                    if let Err(err) = node.produce_block(height) {
                        warn!("block {} failed: {err:#}", height);
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
        info!("block production stopped at height {}", height);
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    let config = NodeConfig::from_env()?;
    info!("bitgate node starting ({})", config.node_id);

    let node = Node::new(&config, load_app(&config)?);
    node.queue_entropy()?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let pruner = node.cache.spawn_pruner(stop_rx.clone());
    let producer = spawn_block_production(node.clone(), config.block_time, stop_rx);

    let api = Arc::new(ApiServer::new(Arc::new(InjectService::new(node.cache.clone()))));
    let listener = TcpListener::bind(config.api_listen)
        .await
        .with_context(|| format!("bind {}", config.api_listen))?;
    let serving = api.clone();
    let server = tokio::spawn(async move { serving.serve(listener).await });

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    let _ = stop_tx.send(true);
    api.shutdown();
    producer.await?;
    pruner.await?;
    server.await??;

    if let Some(dir) = &config.export_utxo_dir {
        let files = export_utxos(node.app.lock().store(), dir)?;
        info!("exported utxos to {} files in {}", files.len(), dir.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::blockdata::constants::genesis_block;
    use bitcoin::Network;
    use bitgate_consensus::sign_attestation;
    use bitgate_runtime::bitcoin_block::compress;
    use bitgate_runtime::{GenesisValidator, Params};
    use std::collections::HashMap;

    fn config(node_id: &str) -> NodeConfig {
        NodeConfig::from_lookup(|key| (key == "NODE_ID").then(|| node_id.to_string())).unwrap()
    }

    fn single_validator_node(node_id: &str) -> Node {
        let key = derive_signing_key(node_id);
        let genesis = GenesisConfig {
            params: Params {
                zk_entropy_threshold: 1,
                ..Params::default()
            },
            validators: vec![GenesisValidator {
                operator: format_address(&[7u8; 32]),
                pubkey: hex::encode(key.verifying_key().to_bytes()),
                power: 10,
                status: bitgate_state::ValidatorStatus::Bonded,
            }],
            ..GenesisConfig::default()
        };
        Node::new(&config(node_id), App::from_genesis(&genesis).unwrap())
    }

    fn attested_bitcoin_genesis(key: &SigningKey) -> AttestedBlock {
        let block = genesis_block(Network::Bitcoin);
        let raw = bitcoin::consensus::serialize(&block);
        AttestedBlock {
            height: 800_000,
            hash: block.block_hash().to_string(),
            block_content: compress(&raw).unwrap(),
            attestations: vec![sign_attestation(&raw, key)],
            signer: format_address(&[1u8; 32]),
        }
    }

    #[test]
    fn config_reads_overrides_and_rejects_garbage() {
        let vars: HashMap<&str, &str> = [
            ("NODE_ID", "node-9"),
            ("BLOCK_TIME_MS", "250"),
            ("CACHE_KEEP_BLOCKS", "12"),
            ("GENESIS_UTXO_DIR", "/tmp/utxos"),
        ]
        .into_iter()
        .collect();
        let cfg = NodeConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.node_id, "node-9");
        assert_eq!(cfg.block_time, Duration::from_millis(250));
        assert_eq!(cfg.cache_keep_blocks, 12);
        assert_eq!(cfg.cache_ttl, Duration::from_secs(600));
        assert_eq!(cfg.genesis_utxo_dir, Some(PathBuf::from("/tmp/utxos")));

        let err = NodeConfig::from_lookup(|k| (k == "MAX_INJECT_BYTES").then(|| "lots".into())).unwrap_err();
        assert!(err.to_string().contains("MAX_INJECT_BYTES"));
    }

    #[test]
    fn host_txs_fill_the_space_left_by_injected_blocks() {
        let node = single_validator_node("node-a");
        node.cache.add_item(attested_bitcoin_genesis(&derive_signing_key("node-a")));
        let (injected, used) = node.builder.proposal_inject_txs(1, usize::MAX).unwrap();

        let small = vec![1u8; 8];
        let large = vec![2u8; 64];
        let txs = node
            .prepare_proposal(1, used + 10, vec![large.clone(), small.clone()])
            .unwrap();
        assert_eq!(txs, vec![injected[0].clone(), small]);
        assert_eq!(*node.mempool.lock(), vec![large]);
    }

    #[test]
    fn proposal_with_a_foreign_tx_is_rejected() {
        let node = single_validator_node("node-b");
        assert!(node.process_proposal(&[vec![0xde, 0xad]]).is_err());

        let mut unsigned = attested_bitcoin_genesis(&derive_signing_key("node-b"));
        unsigned.attestations.clear();
        let tx = Msg::AttestedBlock(unsigned).encode().unwrap();
        assert!(matches!(
            node.process_proposal(&[tx]),
            Err(CacheError::InvalidInjectedTx { index: 0, .. })
        ));
    }

    #[test]
    fn pending_block_survives_bookkeeping_cleanup() {
        let mut node = single_validator_node("node-f");
        node.keep_blocks = 2;
        let mut attested = attested_bitcoin_genesis(&derive_signing_key("node-f"));
        // unknown signer, so quorum is never reached
        attested.attestations = vec![sign_attestation(b"other", &derive_signing_key("stranger"))];
        node.cache.add_item(attested.clone());
        for height in 1..=6 {
            let report = node.produce_block(height).unwrap();
            assert_eq!(report.failed, 1, "height {height}");
        }
        assert_eq!(node.cache.len(), 1);
    }

    #[test]
    fn produced_block_ingests_and_confirms() {
        let node = single_validator_node("node-c");
        let attested = attested_bitcoin_genesis(&derive_signing_key("node-c"));
        node.cache.add_item(attested.clone());

        let report = node.produce_block(1).unwrap();
        assert_eq!(report.applied, 1);
        assert!(node.cache.is_empty());
        assert_eq!(node.cache.confirmed_at(1), vec![attested.key()]);
        let app = node.app.lock();
        assert_eq!(app.last_processed_height().unwrap(), 800_000);
        let (utxos, _) = app.utxos(None, 10).unwrap();
        assert_eq!(utxos.len(), 1);
        assert_eq!(utxos[0].amount, 5_000_000_000);
    }

    #[test]
    fn local_validator_completes_the_ceremony() {
        let node = single_validator_node("node-d");
        assert!(node.queue_entropy().unwrap());
        let report = node.produce_block(1).unwrap();
        assert_eq!(report.applied, 1);
        assert!(node.app.lock().has_verifier());
        assert!(!node.queue_entropy().unwrap());
    }

    #[test]
    fn non_validator_does_not_contribute() {
        let node = single_validator_node("node-e");
        let other = Node::new(&config("stranger"), App::from_genesis(&GenesisConfig::default()).unwrap());
        assert!(node.operator.is_some());
        assert!(other.operator.is_none());
        assert!(!other.queue_entropy().unwrap());
    }
}
