//! The narrow capability set the harness needs from a cache.
//!
//! Anything that can bulk-load, clear, count, run an indexed membership
//! query and remove entries can be soaked. The harness never reaches past
//! this trait, so transport and storage stay the collaborator's business.

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::record::{Batch, Record};

/// Attribute an index is built over and a filter matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Extractor {
    /// The primary key itself, rendered as decimal.
    Key,
    /// The record's business id.
    Id,
    Payload,
}

impl Extractor {
    pub fn extract(&self, key: u64, record: &Record) -> String {
        match self {
            Extractor::Key => key.to_string(),
            Extractor::Id => record.id.clone(),
            Extractor::Payload => record.payload.clone(),
        }
    }

    /// Value a freshly generated record under `key` is expected to carry.
    pub fn expected_value(&self, key: u64) -> String {
        match self {
            Extractor::Key => key.to_string(),
            _ => self.extract(key, &Record::for_key(key)),
        }
    }
}

/// Entry filter understood by [`CacheFacade::query`] and
/// [`CacheFacade::remove_matching`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Always,
    /// Entries whose extracted value is a member of `values`.
    In { extractor: Extractor, values: HashSet<String> },
}

impl Filter {
    pub fn in_set<I>(extractor: Extractor, values: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        Filter::In { extractor, values: values.into_iter().collect() }
    }

    /// Singleton membership filter selecting the entry generated for `key`.
    pub fn for_key(extractor: Extractor, key: u64) -> Self {
        Self::in_set(extractor, std::iter::once(extractor.expected_value(key)))
    }

    pub fn matches(&self, key: u64, record: &Record) -> bool {
        match self {
            Filter::Always => true,
            Filter::In { extractor, values } => values.contains(&extractor.extract(key, record)),
        }
    }
}

#[async_trait]
pub trait CacheFacade: Send + Sync {
    /// Removes every entry; returns once the cache accepted the clear.
    async fn clear(&self) -> Result<()>;

    /// Installs a forward index on `extractor`. Idempotent.
    async fn add_index(&self, extractor: Extractor) -> Result<()>;

    async fn put_all(&self, batch: Batch) -> Result<()>;

    /// Approximate entry count; advisory only.
    async fn size(&self) -> Result<usize>;

    async fn query(&self, filter: &Filter) -> Result<Vec<(u64, Record)>>;

    /// Conditionally removes every entry matching `filter`, returning how many went.
    async fn remove_matching(&self, filter: &Filter) -> Result<usize>;

    async fn remove(&self, key: u64) -> Result<Option<Record>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn for_key_filter_selects_only_its_record() {
        let filter = Filter::for_key(Extractor::Id, 42);
        assert!(filter.matches(42, &Record::for_key(42)));
        assert!(!filter.matches(43, &Record::for_key(43)));

        let by_key = Filter::for_key(Extractor::Key, 42);
        assert!(by_key.matches(42, &Record::new("other", "other")));
        assert!(!by_key.matches(7, &Record::for_key(42)));
        assert!(Filter::Always.matches(1, &Record::for_key(9)));
    }
}
