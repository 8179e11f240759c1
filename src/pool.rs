//! Bounded verification worker pool.
//!
//! A fixed set of tokio workers pull per-key jobs from one queue. Each job
//! runs an indexed lookup for its key, expects exactly one hit, and drains
//! the entry on success. Outcomes come back over oneshot channels and are
//! tallied only once every job of a call has answered.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use futures::FutureExt;
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::{RemovalMode, SuccessCriteria, VerifyConfig};
use crate::facade::{CacheFacade, Filter};

/// Mismatch details kept per call; the rest are only counted.
pub const MAX_SAMPLES: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Verified,
    /// Lookup returned a cardinality other than one.
    Mismatch { found: usize },
    /// Strict mode only: the lookup succeeded but the drain did not remove one entry.
    RemovalMismatch { removed: usize },
    /// A facade call failed or the task panicked.
    Fault(String),
}

impl VerifyOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, VerifyOutcome::Verified)
    }
}

#[derive(Debug, Clone)]
pub struct KeyResult {
    pub key: u64,
    pub outcome: VerifyOutcome,
    /// Set whenever the drain missed, including in lenient mode.
    pub removal_missed: bool,
    pub latency: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MismatchSample {
    pub key: u64,
    pub found: usize,
}

#[derive(Debug, Clone)]
pub struct VerifySummary {
    pub attempted: u64,
    pub succeeded: u64,
    pub mismatches: u64,
    pub removal_mismatches: u64,
    pub faults: u64,
    /// Jobs that never answered, because the pool was shut down or the
    /// caller stopped waiting.
    pub abandoned: u64,
    pub samples: Vec<MismatchSample>,
    /// Per-key verification latency in microseconds.
    pub latency: Histogram<u64>,
}

pub fn latency_histogram() -> Histogram<u64> {
    Histogram::new(3).expect("3 significant figures is a valid precision")
}

impl Default for VerifySummary {
    fn default() -> Self {
        Self {
            attempted: 0,
            succeeded: 0,
            mismatches: 0,
            removal_mismatches: 0,
            faults: 0,
            abandoned: 0,
            samples: Vec::new(),
            latency: latency_histogram(),
        }
    }
}

impl VerifySummary {
    fn record(&mut self, result: KeyResult) {
        self.attempted += 1;
        self.latency
            .saturating_record(u64::try_from(result.latency.as_micros()).unwrap_or(u64::MAX));
        if result.removal_missed {
            self.removal_mismatches += 1;
        }
        match result.outcome {
            VerifyOutcome::Verified => self.succeeded += 1,
            VerifyOutcome::Mismatch { found } => {
                self.mismatches += 1;
                if self.samples.len() < MAX_SAMPLES {
                    self.samples.push(MismatchSample { key: result.key, found });
                }
            }
            VerifyOutcome::RemovalMismatch { .. } => {}
            VerifyOutcome::Fault(_) => self.faults += 1,
        }
    }

    fn record_abandoned(&mut self) {
        self.attempted += 1;
        self.abandoned += 1;
    }
}

/// Looks `key` up through the configured index and drains it on success.
pub async fn verify_key(facade: &dyn CacheFacade, cfg: &VerifyConfig, key: u64) -> KeyResult {
    let started = Instant::now();
    let (outcome, removal_missed) = check_and_drain(facade, cfg, key).await;
    KeyResult { key, outcome, removal_missed, latency: started.elapsed() }
}

async fn check_and_drain(
    facade: &dyn CacheFacade,
    cfg: &VerifyConfig,
    key: u64,
) -> (VerifyOutcome, bool) {
    let filter = Filter::for_key(cfg.extractor, key);
    let found = match facade.query(&filter).await {
        Ok(found) => found,
        Err(e) => {
            warn!(key, error = %e, "lookup failed");
            return (VerifyOutcome::Fault(e.to_string()), false);
        }
    };
    if found.len() != 1 {
        warn!(key, expected = 1, found = found.len(), entries = ?found, "verification mismatch");
        return (VerifyOutcome::Mismatch { found: found.len() }, false);
    }
    if !cfg.remove_matched {
        return (VerifyOutcome::Verified, false);
    }

    let removed = match cfg.removal {
        RemovalMode::Filter => facade.remove_matching(&filter).await,
        RemovalMode::Key => facade.remove(key).await.map(|r| usize::from(r.is_some())),
    };
    match removed {
        Ok(1) => (VerifyOutcome::Verified, false),
        Ok(removed) => {
            warn!(key, removed, mode = ?cfg.removal, "removal mismatch");
            match cfg.success {
                SuccessCriteria::Strict => (VerifyOutcome::RemovalMismatch { removed }, true),
                SuccessCriteria::Lenient => (VerifyOutcome::Verified, true),
            }
        }
        Err(e) => {
            warn!(key, error = %e, "removal failed");
            (VerifyOutcome::Fault(e.to_string()), true)
        }
    }
}

struct Job {
    key: u64,
    reply: oneshot::Sender<KeyResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ShutdownStatus {
    Clean,
    TimedOut { abandoned: usize },
}

pub struct VerifyPool {
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    pending: Arc<AtomicUsize>,
    size: usize,
}

impl VerifyPool {
    /// Spawns `workers` (at least one) on the current tokio runtime.
    pub fn start(facade: Arc<dyn CacheFacade>, cfg: VerifyConfig, workers: usize) -> Self {
        let size = workers.max(1);
        let (tx, rx) = mpsc::channel::<Job>(size * 64);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let pending = Arc::new(AtomicUsize::new(0));

        let handles = (0..size)
            .map(|id| {
                let rx = rx.clone();
                let facade = facade.clone();
                let pending = pending.clone();
                tokio::spawn(async move {
                    loop {
                        let job = { rx.lock().await.recv().await };
                        let Some(job) = job else { break };
                        let started = Instant::now();
                        let run = AssertUnwindSafe(verify_key(facade.as_ref(), &cfg, job.key));
                        let result = match run.catch_unwind().await {
                            Ok(result) => result,
                            Err(_) => {
                                warn!(worker = id, key = job.key, "verification task panicked");
                                KeyResult {
                                    key: job.key,
                                    outcome: VerifyOutcome::Fault("task panicked".into()),
                                    removal_missed: false,
                                    latency: started.elapsed(),
                                }
                            }
                        };
                        pending.fetch_sub(1, Ordering::AcqRel);
                        let _ = job.reply.send(result);
                    }
                    debug!(worker = id, "verification worker exiting");
                })
            })
            .collect();

        Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
            pending,
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Jobs queued or running right now.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Verifies every key and waits for all of them before tallying.
    ///
    /// No ordering holds between keys. A failing or panicking job only
    /// fails its own key.
    pub async fn verify_all(&self, keys: &[u64]) -> VerifySummary {
        self.verify_all_until(keys, std::future::pending::<()>()).await
    }

    /// Like [`verify_all`](Self::verify_all), but stops waiting once `abandon`
    /// resolves. Keys not answered by then are counted as abandoned; their
    /// jobs stay queued or running until the pool is shut down.
    pub async fn verify_all_until<F>(&self, keys: &[u64], abandon: F) -> VerifySummary
    where
        F: Future<Output = ()>,
    {
        let mut summary = VerifySummary::default();
        let tx = self.tx.lock().clone();
        let Some(tx) = tx else {
            warn!(keys = keys.len(), "verification pool already shut down");
            keys.iter().for_each(|_| summary.record_abandoned());
            return summary;
        };
        tokio::pin!(abandon);

        let mut replies = Vec::with_capacity(keys.len());
        for (sent, &key) in keys.iter().enumerate() {
            let (reply, rx) = oneshot::channel();
            self.pending.fetch_add(1, Ordering::AcqRel);
            let delivered = tokio::select! {
                res = tx.send(Job { key, reply }) => res.is_ok(),
                _ = &mut abandon => {
                    self.pending.fetch_sub(1, Ordering::AcqRel);
                    let unanswered = replies.len() + keys.len() - sent;
                    warn!(unanswered, "verification abandoned while queueing");
                    (0..unanswered).for_each(|_| summary.record_abandoned());
                    return summary;
                }
            };
            if !delivered {
                self.pending.fetch_sub(1, Ordering::AcqRel);
                summary.record_abandoned();
                continue;
            }
            replies.push(rx);
        }
        drop(tx);

        let mut replies = replies.into_iter();
        while let Some(rx) = replies.next() {
            tokio::select! {
                res = rx => match res {
                    Ok(result) => summary.record(result),
                    Err(_) => summary.record_abandoned(),
                },
                _ = &mut abandon => {
                    let unanswered = 1 + replies.len();
                    warn!(unanswered, "verification abandoned while waiting");
                    (0..unanswered).for_each(|_| summary.record_abandoned());
                    break;
                }
            }
        }
        summary
    }

    /// Closes the queue and waits up to `grace` for workers to drain it.
    ///
    /// Workers still busy after `grace` are aborted; their jobs are not counted.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownStatus {
        drop(self.tx.lock().take());
        let mut workers = std::mem::take(&mut *self.workers.lock());

        if timeout(grace, join_all(workers.iter_mut())).await.is_ok() {
            debug!(workers = self.size, "verification pool drained");
            return ShutdownStatus::Clean;
        }
        let abandoned = self.pending();
        for handle in &workers {
            handle.abort();
        }
        warn!(
            abandoned,
            grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
            "verification pool shutdown timed out"
        );
        ShutdownStatus::TimedOut { abandoned }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_latency_is_recorded_not_wrapped() {
        let mut summary = VerifySummary::default();
        summary.record(KeyResult {
            key: 1,
            outcome: VerifyOutcome::Verified,
            removal_missed: false,
            latency: Duration::MAX,
        });
        assert_eq!(summary.latency.len(), 1);
        assert!(summary.latency.max() > 0);
        assert_eq!(summary.succeeded, 1);
    }
}
