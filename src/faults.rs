//! Fault-injecting decorator for any [`CacheFacade`].
//!
//! Simulates the anomalies a soak run is meant to surface: entries that
//! are not (yet) visible to an index query, duplicate index hits,
//! transport errors, and removals that silently do nothing.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Result};
use async_trait::async_trait;
use dashmap::DashSet;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::facade::{CacheFacade, Extractor, Filter};
use crate::record::{Batch, Record};

/// Per-query fault probabilities, each in `0.0..=1.0`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FaultProfile {
    pub drop_rate: f64,
    pub duplicate_rate: f64,
    pub error_rate: f64,
}

impl FaultProfile {
    pub fn is_quiet(&self) -> bool {
        self.drop_rate <= 0.0 && self.duplicate_rate <= 0.0 && self.error_rate <= 0.0
    }
}

#[derive(Debug, Default)]
pub struct FaultStats {
    pub dropped: AtomicU64,
    pub duplicated: AtomicU64,
    pub errored: AtomicU64,
    pub pinned_removals: AtomicU64,
}

pub struct FaultyCache<F> {
    inner: F,
    profile: FaultProfile,
    rng: Mutex<StdRng>,
    hidden: DashSet<u64>,
    pinned: DashSet<u64>,
    stats: FaultStats,
}

impl<F: CacheFacade> FaultyCache<F> {
    pub fn new(inner: F, profile: FaultProfile, seed: u64) -> Self {
        Self {
            inner,
            profile,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            hidden: DashSet::new(),
            pinned: DashSet::new(),
            stats: FaultStats::default(),
        }
    }

    /// Queries never return `key`, as if it had been evicted.
    pub fn hide(&self, key: u64) {
        self.hidden.insert(key);
    }

    /// Removals of `key` report success-less no-ops and leave it in place.
    pub fn pin(&self, key: u64) {
        self.pinned.insert(key);
    }

    pub fn inner(&self) -> &F {
        &self.inner
    }

    pub fn stats(&self) -> &FaultStats {
        &self.stats
    }

    fn roll(&self, p: f64) -> bool {
        p > 0.0 && self.rng.lock().gen_bool(p.min(1.0))
    }
}

#[async_trait]
impl<F: CacheFacade> CacheFacade for FaultyCache<F> {
    async fn clear(&self) -> Result<()> {
        self.inner.clear().await
    }

    async fn add_index(&self, extractor: Extractor) -> Result<()> {
        self.inner.add_index(extractor).await
    }

    async fn put_all(&self, batch: Batch) -> Result<()> {
        self.inner.put_all(batch).await
    }

    async fn size(&self) -> Result<usize> {
        self.inner.size().await
    }

    async fn query(&self, filter: &Filter) -> Result<Vec<(u64, Record)>> {
        if self.roll(self.profile.error_rate) {
            self.stats.errored.fetch_add(1, Ordering::Relaxed);
            bail!("injected transport fault");
        }
        let mut found = self.inner.query(filter).await?;
        if !self.hidden.is_empty() {
            let before = found.len();
            found.retain(|(k, _)| !self.hidden.contains(k));
            self.stats.dropped.fetch_add((before - found.len()) as u64, Ordering::Relaxed);
        }
        if !found.is_empty() && self.roll(self.profile.drop_rate) {
            self.stats.dropped.fetch_add(found.len() as u64, Ordering::Relaxed);
            found.clear();
        }
        if let Some(first) = found.first().cloned() {
            if self.roll(self.profile.duplicate_rate) {
                self.stats.duplicated.fetch_add(1, Ordering::Relaxed);
                found.push(first);
            }
        }
        Ok(found)
    }

    async fn remove_matching(&self, filter: &Filter) -> Result<usize> {
        if self.pinned.is_empty() {
            return self.inner.remove_matching(filter).await;
        }
        let mut removed = 0;
        for (key, _) in self.inner.query(filter).await? {
            if self.pinned.contains(&key) {
                self.stats.pinned_removals.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            if self.inner.remove(key).await?.is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn remove(&self, key: u64) -> Result<Option<Record>> {
        if self.pinned.contains(&key) {
            self.stats.pinned_removals.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }
        self.inner.remove(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ShardedCache;

    #[tokio::test]
    async fn hidden_key_is_invisible_but_still_stored() {
        let cache = FaultyCache::new(ShardedCache::new(2), FaultProfile::default(), 1);
        cache.put_all([(9, Record::for_key(9))].into_iter().collect()).await.unwrap();
        cache.hide(9);
        assert!(cache.query(&Filter::for_key(Extractor::Key, 9)).await.unwrap().is_empty());
        assert_eq!(cache.size().await.unwrap(), 1);
        assert_eq!(cache.stats().dropped.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn certain_faults_always_fire() {
        let profile = FaultProfile { error_rate: 1.0, ..Default::default() };
        let cache = FaultyCache::new(ShardedCache::new(1), profile, 7);
        assert!(cache.query(&Filter::Always).await.is_err());

        let profile = FaultProfile { duplicate_rate: 1.0, ..Default::default() };
        let cache = FaultyCache::new(ShardedCache::new(1), profile, 7);
        cache.put_all([(1, Record::for_key(1))].into_iter().collect()).await.unwrap();
        assert_eq!(cache.query(&Filter::for_key(Extractor::Key, 1)).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn pinned_key_survives_removal() {
        let cache = FaultyCache::new(ShardedCache::new(2), FaultProfile::default(), 3);
        cache
            .put_all([(1, Record::for_key(1)), (2, Record::for_key(2))].into_iter().collect())
            .await
            .unwrap();
        cache.pin(1);
        assert_eq!(cache.remove(1).await.unwrap(), None);
        assert_eq!(cache.remove_matching(&Filter::Always).await.unwrap(), 1);
        assert_eq!(cache.size().await.unwrap(), 1);
    }
}
