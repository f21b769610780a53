use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::trace;

use crate::{fold_hashes, hash_leaf, Hash};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("codec error at {key}: {reason}")]
    Codec { key: String, reason: String },
    #[error("backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Page size used when a walk asks for zero entries.
pub const DEFAULT_PAGE_LIMIT: usize = 100;

/// One page of a prefix walk. `next_key` is set when more entries remain and
/// is meant to be passed back as `start_after`.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub items: Vec<(Vec<u8>, Vec<u8>)>,
    pub next_key: Option<Vec<u8>>,
}

/// Ordered key-value store backing the ledger, params and ceremony records.
pub trait KvStore {
    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>>;
    fn set(&mut self, key: &[u8], value: Vec<u8>) -> StoreResult<()>;
    fn remove(&mut self, key: &[u8]) -> StoreResult<()>;
    /// Entries under `prefix` in ascending key order.
    fn scan_prefix(&self, prefix: &[u8]) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>>;

    /// A `limit` of zero means `DEFAULT_PAGE_LIMIT`.
    fn walk(&self, prefix: &[u8], start_after: Option<&[u8]>, limit: usize) -> StoreResult<Page> {
        let limit = if limit == 0 { DEFAULT_PAGE_LIMIT } else { limit };
        let mut page = Page::default();
        for (key, value) in self.scan_prefix(prefix)? {
            if let Some(after) = start_after {
                if key.as_slice() <= after {
                    continue;
                }
            }
            if page.items.len() == limit {
                page.next_key = page.items.last().map(|(k, _)| k.clone());
                break;
            }
            page.items.push((key, value));
        }
        Ok(page)
    }
}

pub fn read<T: DeserializeOwned>(store: &dyn KvStore, key: &[u8]) -> StoreResult<Option<T>> {
    let Some(bytes) = store.get(key)? else {
        return Ok(None);
    };
    bincode::deserialize(&bytes)
        .map(Some)
        .map_err(|e| StoreError::Codec {
            key: String::from_utf8_lossy(key).into_owned(),
            reason: e.to_string(),
        })
}

pub fn write<T: Serialize>(store: &mut dyn KvStore, key: &[u8], value: &T) -> StoreResult<()> {
    let bytes = bincode::serialize(value).map_err(|e| StoreError::Codec {
        key: String::from_utf8_lossy(key).into_owned(),
        reason: e.to_string(),
    })?;
    store.set(key, bytes)
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Commitment over every entry in key order.
    pub fn root(&self) -> Hash {
        let leaves = self
            .entries
            .iter()
            .map(|(k, v)| {
                let mut buf = Vec::with_capacity(k.len() + v.len() + 8);
                buf.extend_from_slice(&(k.len() as u64).to_le_bytes());
                buf.extend_from_slice(k);
                buf.extend_from_slice(v);
                hash_leaf(&buf)
            })
            .collect();
        fold_hashes(leaves)
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &[u8], value: Vec<u8>) -> StoreResult<()> {
        self.entries.insert(key.to_vec(), value);
        Ok(())
    }

    fn remove(&mut self, key: &[u8]) -> StoreResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .entries
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Write overlay on top of another store. Reads see staged writes first;
/// nothing reaches the parent until [`Staged::commit`]. Dropping the overlay
/// discards it.
pub struct Staged<'a> {
    parent: &'a mut dyn KvStore,
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl<'a> Staged<'a> {
    pub fn new(parent: &'a mut dyn KvStore) -> Self {
        Self {
            parent,
            writes: BTreeMap::new(),
        }
    }

    pub fn commit(self) -> StoreResult<()> {
        let Staged { parent, writes } = self;
        trace!(writes = writes.len(), "committing staged writes");
        for (key, value) in writes {
            match value {
                Some(bytes) => parent.set(&key, bytes)?,
                None => parent.remove(&key)?,
            }
        }
        Ok(())
    }
}

impl KvStore for Staged<'_> {
    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        match self.writes.get(key) {
            Some(staged) => Ok(staged.clone()),
            None => self.parent.get(key),
        }
    }

    fn set(&mut self, key: &[u8], value: Vec<u8>) -> StoreResult<()> {
        self.writes.insert(key.to_vec(), Some(value));
        Ok(())
    }

    fn remove(&mut self, key: &[u8]) -> StoreResult<()> {
        self.writes.insert(key.to_vec(), None);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> =
            self.parent.scan_prefix(prefix)?.into_iter().collect();
        for (key, value) in self
            .writes
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
        {
            match value {
                Some(bytes) => {
                    merged.insert(key.clone(), bytes.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staged_writes_invisible_until_commit() {
        let mut base = MemoryStore::new();
        base.set(b"a/1", vec![1]).unwrap();
        base.set(b"a/2", vec![2]).unwrap();
        let before = base.root();

        {
            let mut staged = Staged::new(&mut base);
            staged.set(b"a/3", vec![3]).unwrap();
            staged.remove(b"a/1").unwrap();
            let keys: Vec<_> = staged
                .scan_prefix(b"a/")
                .unwrap()
                .into_iter()
                .map(|(k, _)| k)
                .collect();
            assert_eq!(keys, vec![b"a/2".to_vec(), b"a/3".to_vec()]);
            // dropped without commit
        }
        assert_eq!(base.root(), before);

        let mut staged = Staged::new(&mut base);
        staged.set(b"a/3", vec![3]).unwrap();
        staged.remove(b"a/1").unwrap();
        staged.commit().unwrap();
        assert_eq!(base.get(b"a/1").unwrap(), None);
        assert_eq!(base.get(b"a/3").unwrap(), Some(vec![3]));
    }

    #[test]
    fn zero_limit_walks_a_default_page() {
        let mut store = MemoryStore::new();
        for i in 0..(DEFAULT_PAGE_LIMIT + 5) {
            store.set(format!("w/{i:04}").as_bytes(), vec![1]).unwrap();
        }
        let first = store.walk(b"w/", None, 0).unwrap();
        assert_eq!(first.items.len(), DEFAULT_PAGE_LIMIT);
        let cursor = first.next_key.expect("more entries remain");
        let rest = store.walk(b"w/", Some(&cursor), 0).unwrap();
        assert_eq!(rest.items.len(), 5);
        assert!(rest.next_key.is_none());
    }

    #[test]
    fn nested_stage_commits_into_outer_only() {
        let mut base = MemoryStore::new();
        let mut outer = Staged::new(&mut base);
        {
            let mut inner = Staged::new(&mut outer);
            inner.set(b"k", vec![9]).unwrap();
            inner.commit().unwrap();
        }
        assert_eq!(outer.get(b"k").unwrap(), Some(vec![9]));
        drop(outer);
        assert!(base.is_empty());
    }

    #[test]
    fn walk_pages_through_prefix() {
        let mut base = MemoryStore::new();
        for i in 0..5u8 {
            base.set(&[b'p', b'/', i], vec![i]).unwrap();
        }
        base.set(b"q/0", vec![0]).unwrap();

        let first = base.walk(b"p/", None, 2).unwrap();
        assert_eq!(first.items.len(), 2);
        let second = base.walk(b"p/", first.next_key.as_deref(), 2).unwrap();
        assert_eq!(second.items[0].1, vec![2]);
        let third = base.walk(b"p/", second.next_key.as_deref(), 2).unwrap();
        assert_eq!(third.items.len(), 1);
        assert!(third.next_key.is_none());
    }

    proptest::proptest! {
        #[test]
        fn staged_commit_matches_direct_writes(
            ops in proptest::collection::vec((0u8..8, proptest::option::of(0u8..255)), 0..40)
        ) {
            let mut direct = MemoryStore::new();
            let mut base = MemoryStore::new();
            {
                let mut staged = Staged::new(&mut base);
                for (key, value) in &ops {
                    let key = [b'k', *key];
                    match value {
                        Some(v) => {
                            direct.set(&key, vec![*v]).unwrap();
                            staged.set(&key, vec![*v]).unwrap();
                        }
                        None => {
                            direct.remove(&key).unwrap();
                            staged.remove(&key).unwrap();
                        }
                    }
                }
                proptest::prop_assert_eq!(
                    staged.scan_prefix(b"k").unwrap(),
                    direct.scan_prefix(b"k").unwrap()
                );
                staged.commit().unwrap();
            }
            proptest::prop_assert_eq!(base.root(), direct.root());
        }
    }
}
