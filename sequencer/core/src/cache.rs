//! Pending attested blocks waiting to be injected into a proposal.
//!
//! Items are keyed by logical identity so a resubmission with extra
//! attestations merges into the pending entry instead of duplicating it.
//! Subscribers receive events over bounded channels and are dropped when they
//! fall behind.

use bitgate_consensus::Attestation;
use bitgate_runtime::AttestedBlock;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::btree_map::{self, BTreeMap};
use std::fmt::Debug;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const EVENT_BLOCK_RECEIVED: &str = "block_received";
pub const EVENT_BLOCK_CONFIRMED: &str = "block_confirmed";

const MIN_PRUNE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("marshal failed: {0}")]
    Marshal(String),
    #[error("injected tx {index} is invalid: {reason}")]
    InvalidInjectedTx { index: usize, reason: String },
}

/// What the cache needs from a pending item: a stable identity and a set of
/// attestations that can be merged.
pub trait CacheItem: Clone + Send + Sync + Serialize + 'static {
    type Key: Ord + Clone + Debug + Send + Sync;
    type Attestation: Clone + PartialEq + Send + Sync;

    fn key(&self) -> Self::Key;
    fn height(&self) -> u64;
    fn attestations(&self) -> &[Self::Attestation];
    fn attestations_mut(&mut self) -> &mut Vec<Self::Attestation>;
}

impl CacheItem for AttestedBlock {
    /// Height first so iteration order is the proposal order.
    type Key = (u64, String);
    type Attestation = Attestation;

    fn key(&self) -> Self::Key {
        (self.height, self.hash.to_ascii_lowercase())
    }

    fn height(&self) -> u64 {
        self.height
    }

    fn attestations(&self) -> &[Attestation] {
        &self.attestations
    }

    fn attestations_mut(&mut self) -> &mut Vec<Attestation> {
        &mut self.attestations
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEvent {
    pub event_type: String,
    pub payload: serde_json::Value,
    pub unix_timestamp: i64,
}

impl CacheEvent {
    pub fn new(event_type: &str, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            payload,
            unix_timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Inserted,
    /// Existing entry absorbed `added` new attestations.
    Merged { added: usize },
}

#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub subscriber_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(600),
            subscriber_capacity: 64,
        }
    }
}

struct Slot<T> {
    item: T,
    inserted_at: Instant,
}

struct Pending<T: CacheItem> {
    items: BTreeMap<T::Key, Slot<T>>,
    /// Chain height -> keys that went into that height's proposal.
    blocks: BTreeMap<u64, Vec<T::Key>>,
}

#[derive(Clone)]
struct Subscriber {
    id: u64,
    event_type: Option<String>,
    tx: mpsc::Sender<CacheEvent>,
}

pub struct InjectCache<T: CacheItem> {
    pending: Mutex<Pending<T>>,
    subscribers: Mutex<Vec<Subscriber>>,
    next_subscriber: AtomicU64,
    config: CacheConfig,
}

impl<T: CacheItem> InjectCache<T> {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            pending: Mutex::new(Pending {
                items: BTreeMap::new(),
                blocks: BTreeMap::new(),
            }),
            subscribers: Mutex::new(Vec::new()),
            next_subscriber: AtomicU64::new(0),
            config,
        }
    }

    /// Inserts `item`, or merges its attestations into the pending entry with
    /// the same identity. The merged entry is written back and its age reset.
    pub fn add_item(&self, item: T) -> AddOutcome {
        let key = item.key();
        let outcome = {
            let mut pending = self.pending.lock();
            match pending.items.entry(key.clone()) {
                btree_map::Entry::Occupied(mut slot) => {
                    let slot = slot.get_mut();
                    let existing = slot.item.attestations_mut();
                    let mut added = 0;
                    for att in item.attestations() {
                        if !existing.contains(att) {
                            existing.push(att.clone());
                            added += 1;
                        }
                    }
                    slot.inserted_at = Instant::now();
                    AddOutcome::Merged { added }
                }
                btree_map::Entry::Vacant(slot) => {
                    slot.insert(Slot {
                        item: item.clone(),
                        inserted_at: Instant::now(),
                    });
                    AddOutcome::Inserted
                }
            }
        };
        debug!(?key, height = item.height(), ?outcome, "cached item");
        self.broadcast_item(EVENT_BLOCK_RECEIVED, &item);
        outcome
    }

    /// Pending items in identity order.
    pub fn get(&self) -> Vec<T> {
        self.pending
            .lock()
            .items
            .values()
            .map(|e| e.item.clone())
            .collect()
    }

    /// Removes the item at `index` of the order `get` returns.
    pub fn remove_at(&self, index: usize) -> Option<T> {
        let mut pending = self.pending.lock();
        let key = pending.items.keys().nth(index).cloned()?;
        pending.items.remove(&key).map(|e| e.item)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshots the pending items, applies `transform`, orders them by
    /// height then hash and marshals each one. `on_each` sees every encoded
    /// item and may stop the walk. Items stay pending until confirmed.
    pub fn process_for_proposal<F, M, E>(
        &self,
        mut transform: F,
        mut marshal: M,
        mut on_each: E,
    ) -> Result<Vec<Vec<u8>>, CacheError>
    where
        F: FnMut(T) -> T,
        M: FnMut(&T) -> Result<Vec<u8>, CacheError>,
        E: FnMut(&T, &[u8]) -> ControlFlow<()>,
    {
        let mut items: Vec<T> = self.get().into_iter().map(&mut transform).collect();
        items.sort_by_key(|item| item.key());

        let mut encoded = Vec::with_capacity(items.len());
        for item in &items {
            let bytes = marshal(item)?;
            if on_each(item, &bytes).is_break() {
                break;
            }
            encoded.push(bytes);
        }
        Ok(encoded)
    }

    /// Records that `key` was confirmed at chain height `height`. Pending
    /// items are untouched.
    pub fn add_to_block(&self, height: u64, key: T::Key) {
        let mut pending = self.pending.lock();
        let keys = pending.blocks.entry(height).or_default();
        if !keys.contains(&key) {
            keys.push(key);
        }
    }

    /// Keys recorded as confirmed at `height`.
    pub fn confirmed_at(&self, height: u64) -> Vec<T::Key> {
        self.pending.lock().blocks.get(&height).cloned().unwrap_or_default()
    }

    /// Forgets confirmation bookkeeping more than `keep_n` heights behind
    /// `current`. Returns the number of keys dropped from the index; pending
    /// items only leave through confirmation or TTL expiry.
    pub fn clean_old_blocks(&self, current: u64, keep_n: u64) -> usize {
        let cutoff = current.saturating_sub(keep_n);
        let mut pending = self.pending.lock();
        let retained = pending.blocks.split_off(&cutoff);
        let stale = std::mem::replace(&mut pending.blocks, retained);
        let dropped: usize = stale.values().map(Vec::len).sum();
        if dropped > 0 {
            debug!(dropped, current, keep_n, "pruned confirmed-height index");
        }
        dropped
    }

    /// Drops the pending entry for `key` once its block has been applied.
    pub fn mark_attestations_confirmed(&self, key: &T::Key) -> Option<T> {
        let removed = self.pending.lock().items.remove(key).map(|e| e.item);
        if let Some(item) = &removed {
            self.broadcast_item(EVENT_BLOCK_CONFIRMED, item);
        }
        removed
    }

    /// Registers a subscriber. `event_type` narrows the stream to one type.
    pub fn subscribe(&self, event_type: Option<String>) -> mpsc::Receiver<CacheEvent> {
        let (tx, rx) = mpsc::channel(self.config.subscriber_capacity.max(1));
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push(Subscriber { id, event_type, tx });
        debug!(id, "subscriber registered");
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Sends without blocking. Subscribers whose channel is full or closed
    /// are removed.
    pub fn broadcast_event(&self, event: CacheEvent) {
        let targets = self.subscribers.lock().clone();
        let mut dropped = Vec::new();
        for sub in &targets {
            if sub
                .event_type
                .as_deref()
                .is_some_and(|wanted| wanted != event.event_type)
            {
                continue;
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(id = sub.id, "subscriber lagging, dropped");
                    dropped.push(sub.id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dropped.push(sub.id),
            }
        }
        if !dropped.is_empty() {
            self.subscribers.lock().retain(|s| !dropped.contains(&s.id));
        }
    }

    fn broadcast_item(&self, event_type: &str, item: &T) {
        match serde_json::to_value(item) {
            Ok(payload) => self.broadcast_event(CacheEvent::new(event_type, payload)),
            Err(err) => warn!(%err, event_type, "event payload not encodable"),
        }
    }

    /// Removes entries older than the configured ttl as of `now`.
    pub fn prune_expired(&self, now: Instant) -> usize {
        let ttl = self.config.ttl;
        let mut pending = self.pending.lock();
        let before = pending.items.len();
        pending
            .items
            .retain(|_, e| now.saturating_duration_since(e.inserted_at) < ttl);
        let pruned = before - pending.items.len();
        if pruned > 0 {
            debug!(pruned, "expired cache entries");
        }
        pruned
    }

    /// Runs `prune_expired` every `max(ttl / 10, 1s)` until `stop` flips to
    /// true or its sender goes away.
    pub fn spawn_pruner(self: &Arc<Self>, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let period = (cache.config.ttl / 10).max(MIN_PRUNE_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        cache.prune_expired(Instant::now());
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("cache pruner stopped");
        })
    }
}
