//! Records and the primary-key sequence they are keyed by.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{SoakError, SoakResult};

/// Value stored in the cache under a sequence-assigned primary key.
///
/// `id` is the business key and is distinct from the primary key the
/// record is stored under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub payload: String,
}

impl Record {
    pub fn new<I: Into<String>, P: Into<String>>(id: I, payload: P) -> Self {
        Self { id: id.into(), payload: payload.into() }
    }

    /// Deterministic record for primary key `n`, so mismatches can be grepped.
    pub fn for_key(n: u64) -> Self {
        Self { id: format!("id#{n}"), payload: format!("value#{n}") }
    }
}

/// One fill batch: primary key -> record.
pub type Batch = HashMap<u64, Record>;

/// Monotonic primary-key source.
///
/// `next` is an atomic increment-and-read; it never wraps and fails with
/// [`SoakError::SequenceExhausted`] once `u64::MAX` has been handed out.
#[derive(Debug)]
pub struct Sequence {
    last: AtomicU64,
}

impl Sequence {
    /// Seeds from the wall clock in nanoseconds so repeated runs against the
    /// same cache do not reuse keys.
    pub fn from_clock() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos().min(u128::from(u64::MAX / 2)) as u64)
            .unwrap_or(0);
        Self::starting_at(nanos)
    }

    /// The first value returned by `next` is `start + 1`.
    pub fn starting_at(start: u64) -> Self {
        Self { last: AtomicU64::new(start) }
    }

    pub fn next(&self) -> SoakResult<u64> {
        self.last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_add(1))
            .map(|prev| prev + 1)
            .map_err(|last| SoakError::SequenceExhausted { last })
    }

    pub fn last(&self) -> u64 {
        self.last.load(Ordering::Acquire)
    }
}

/// Builds `count` records with distinct primary keys drawn from `sequence`.
pub fn generate(sequence: &Sequence, count: usize) -> SoakResult<Batch> {
    let mut batch = HashMap::with_capacity(count);
    for _ in 0..count {
        let key = sequence.next()?;
        batch.insert(key, Record::for_key(key));
    }
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn generate_from_100_yields_next_three_keys() {
        let seq = Sequence::starting_at(100);
        let batch = generate(&seq, 3).unwrap();
        let mut keys: Vec<u64> = batch.keys().copied().collect();
        keys.sort_unstable();
        assert_eq!(keys, vec![101, 102, 103]);
        assert_eq!(batch[&102], Record::new("id#102", "value#102"));
    }

    #[test]
    fn generate_returns_exact_count() {
        let seq = Sequence::starting_at(0);
        for n in [0usize, 1, 7, 1500] {
            assert_eq!(generate(&seq, n).unwrap().len(), n);
        }
    }

    #[test]
    fn sequence_refuses_to_wrap() {
        let seq = Sequence::starting_at(u64::MAX - 1);
        assert_eq!(seq.next().unwrap(), u64::MAX);
        assert!(matches!(seq.next(), Err(SoakError::SequenceExhausted { last: u64::MAX })));
        assert!(generate(&Sequence::starting_at(u64::MAX - 2), 5).is_err());
    }

    #[test]
    fn sequence_unique_and_increasing_across_threads() {
        let seq = Arc::new(Sequence::from_clock());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let seq = seq.clone();
                thread::spawn(move || {
                    let mut seen = Vec::with_capacity(1000);
                    for _ in 0..1000 {
                        seen.push(seq.next().unwrap());
                    }
                    seen
                })
            })
            .collect();

        let mut all = HashSet::new();
        for h in handles {
            let seen = h.join().unwrap();
            assert!(seen.windows(2).all(|w| w[0] < w[1]), "per-thread values must increase");
            all.extend(seen);
        }
        assert_eq!(all.len(), 8000);
    }

    #[test]
    fn records_compare_structurally() {
        assert_eq!(Record::for_key(5), Record::new("id#5", "value#5"));
        assert_ne!(Record::new("id#5", "a"), Record::new("id#5", "b"));
    }
}
