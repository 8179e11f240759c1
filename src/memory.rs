//! In-process sharded cache implementing [`CacheFacade`].
//!
//! Entries are spread over `DashMap` shards chosen by an `ahash` of the
//! primary key. Each shard keeps forward indexes for every installed
//! extractor, mapping an extracted value to the keys carrying it.

use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::Arc;

use ahash::RandomState;
use anyhow::Result;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;

use crate::facade::{CacheFacade, Extractor, Filter};
use crate::record::{Batch, Record};

type IndexKey = (Extractor, String);

#[derive(Debug)]
pub struct Shard {
    pub entries: DashMap<u64, Record>,
    pub index: DashMap<IndexKey, DashSet<u64>>,
}

impl Shard {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            index: DashMap::new(),
        }
    }

    fn index_entry(&self, extractor: Extractor, key: u64, record: &Record) {
        self.index
            .entry((extractor, extractor.extract(key, record)))
            .or_insert_with(DashSet::new)
            .insert(key);
    }

    fn unindex_entry(&self, extractor: Extractor, key: u64, record: &Record) {
        let ik = (extractor, extractor.extract(key, record));
        if let Some(keys) = self.index.get(&ik) {
            keys.remove(&key);
            let empty = keys.is_empty();
            drop(keys);
            if empty {
                self.index.remove_if(&ik, |_, keys| keys.is_empty());
            }
        }
    }
}

impl Default for Shard {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub puts: u64,
    pub queries: u64,
    pub index_lookups: u64,
    pub scans: u64,
    pub removals: u64,
    pub clears: u64,
}

#[derive(Debug)]
pub struct ShardedCache {
    shards: Vec<Shard>,
    indexed: RwLock<SmallVec<[Extractor; 4]>>,
    stats: Arc<Mutex<CacheStats>>,
    hasher: RandomState,
}

impl ShardedCache {
    pub fn new(num_shards: usize) -> Self {
        assert!(num_shards > 0, "num_shards must be > 0");
        let mut shards = Vec::with_capacity(num_shards);
        for _ in 0..num_shards {
            shards.push(Shard::new());
        }

        Self {
            shards,
            indexed: RwLock::new(SmallVec::new()),
            stats: Arc::new(Mutex::new(CacheStats::default())),
            hasher: RandomState::new(),
        }
    }

    fn shard_for(&self, key: u64) -> &Shard {
        let mut hasher = self.hasher.build_hasher();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    pub fn insert(&self, key: u64, record: Record) {
        let indexed = self.indexed.read();
        let shard = self.shard_for(key);

        let old = shard.entries.insert(key, record.clone());
        for extractor in indexed.iter().copied() {
            if let Some(old) = &old {
                shard.unindex_entry(extractor, key, old);
            }
            shard.index_entry(extractor, key, &record);
        }
        self.stats.lock().puts += 1;
    }

    pub fn get(&self, key: u64) -> Option<Record> {
        self.shard_for(key).entries.get(&key).map(|e| e.value().clone())
    }

    pub fn delete(&self, key: u64) -> Option<Record> {
        let indexed = self.indexed.read();
        let shard = self.shard_for(key);
        let (_, record) = shard.entries.remove(&key)?;
        for extractor in indexed.iter().copied() {
            shard.unindex_entry(extractor, key, &record);
        }
        self.stats.lock().removals += 1;
        Some(record)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn install_index(&self, extractor: Extractor) {
        let mut indexed = self.indexed.write();
        if indexed.contains(&extractor) {
            return;
        }
        indexed.push(extractor);
        // Back-fill while holding the write lock so no put slips between.
        for shard in &self.shards {
            let existing: Vec<(u64, Record)> = shard
                .entries
                .iter()
                .map(|e| (*e.key(), e.value().clone()))
                .collect();
            for (key, record) in existing {
                shard.index_entry(extractor, key, &record);
            }
        }
    }

    pub fn is_indexed(&self, extractor: Extractor) -> bool {
        self.indexed.read().contains(&extractor)
    }

    pub fn wipe(&self) {
        for shard in &self.shards {
            shard.entries.clear();
            shard.index.clear();
        }
        self.stats.lock().clears += 1;
    }

    /// Entries matching `filter`, served from an index when one exists.
    pub fn select(&self, filter: &Filter) -> Vec<(u64, Record)> {
        self.stats.lock().queries += 1;
        match filter {
            Filter::In { extractor, values } if self.is_indexed(*extractor) => {
                self.stats.lock().index_lookups += 1;
                let mut result = Vec::new();
                for shard in &self.shards {
                    for value in values {
                        let keys: Vec<u64> = match shard.index.get(&(*extractor, value.clone())) {
                            Some(keys) => keys.iter().map(|k| *k).collect(),
                            None => continue,
                        };
                        for key in keys {
                            if let Some(entry) = shard.entries.get(&key) {
                                // The index may briefly lag a concurrent remove.
                                if filter.matches(key, entry.value()) {
                                    result.push((key, entry.value().clone()));
                                }
                            }
                        }
                    }
                }
                result
            }
            _ => {
                self.stats.lock().scans += 1;
                let mut result = Vec::new();
                for shard in &self.shards {
                    for entry in shard.entries.iter() {
                        if filter.matches(*entry.key(), entry.value()) {
                            result.push((*entry.key(), entry.value().clone()));
                        }
                    }
                }
                result
            }
        }
    }

    pub fn get_stats(&self) -> CacheStats {
        self.stats.lock().clone()
    }
}

#[async_trait]
impl CacheFacade for ShardedCache {
    async fn clear(&self) -> Result<()> {
        self.wipe();
        Ok(())
    }

    async fn add_index(&self, extractor: Extractor) -> Result<()> {
        self.install_index(extractor);
        Ok(())
    }

    async fn put_all(&self, batch: Batch) -> Result<()> {
        for (key, record) in batch {
            self.insert(key, record);
        }
        Ok(())
    }

    async fn size(&self) -> Result<usize> {
        Ok(self.len())
    }

    async fn query(&self, filter: &Filter) -> Result<Vec<(u64, Record)>> {
        Ok(self.select(filter))
    }

    async fn remove_matching(&self, filter: &Filter) -> Result<usize> {
        let keys: Vec<u64> = self.select(filter).into_iter().map(|(k, _)| k).collect();
        Ok(keys.into_iter().filter(|k| self.delete(*k).is_some()).count())
    }

    async fn remove(&self, key: u64) -> Result<Option<Record>> {
        Ok(self.delete(key))
    }
}
