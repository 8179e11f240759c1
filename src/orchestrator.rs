//! Fill → verify → report cycle driver.

use std::sync::Arc;
use std::time::{Duration, Instant};

use hdrhistogram::Histogram;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::SoakConfig;
use crate::error::{SoakError, SoakResult};
use crate::facade::CacheFacade;
use crate::fill::fill;
use crate::pool::{latency_histogram, ShutdownStatus, VerifyPool, VerifySummary};
use crate::record::Sequence;

/// Run-wide tallies. Only the orchestrator mutates them, after each wait-all.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub total: u64,
    pub total_success: u64,
    /// Reporting windows elapsed.
    pub iterations: u64,
    pub cycles: u64,
    pub mismatches: u64,
    pub removal_mismatches: u64,
    pub faults: u64,
    pub abandoned: u64,
    pub fill_faults: u64,
    pub fill_shortfall: u64,
}

impl Counters {
    pub fn success_percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            100.0 * self.total_success as f64 / self.total as f64
        }
    }

    fn absorb(&mut self, summary: &VerifySummary) {
        self.total += summary.attempted;
        self.total_success += summary.succeeded;
        self.mismatches += summary.mismatches;
        self.removal_mismatches += summary.removal_mismatches;
        self.faults += summary.faults;
        self.abandoned += summary.abandoned;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowReport {
    pub iteration: u64,
    pub total_success: u64,
    pub total: u64,
    pub percent: f64,
    /// `None` when the size lookup failed.
    pub cache_size: Option<usize>,
    pub keys_per_sec: f64,
    pub p50_us: u64,
    pub p99_us: u64,
    pub mismatches: u64,
    pub removal_mismatches: u64,
    pub faults: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    IterationCap,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub counters: Counters,
    pub windows: Vec<WindowReport>,
    pub stop: StopReason,
    pub shutdown: ShutdownStatus,
    pub elapsed_ms: u64,
}

/// Stop signal shared between the orchestrator and whoever may cancel it.
pub fn stop_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

struct Driven {
    counters: Counters,
    windows: Vec<WindowReport>,
    reason: StopReason,
    /// The shutdown grace was already used up waiting on a stuck verify.
    grace_spent: bool,
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    if stop.wait_for(|s| *s).await.is_err() {
        // Sender gone: nobody can cancel any more.
        std::future::pending::<()>().await;
    }
}

struct Window {
    started: Instant,
    keys: u64,
    latency: Histogram<u64>,
}

impl Window {
    fn new() -> Self {
        Self { started: Instant::now(), keys: 0, latency: latency_histogram() }
    }
}

pub struct Orchestrator {
    facade: Arc<dyn CacheFacade>,
    config: SoakConfig,
    sequence: Sequence,
}

impl Orchestrator {
    pub fn new(facade: Arc<dyn CacheFacade>, config: SoakConfig) -> Self {
        Self { facade, config, sequence: Sequence::from_clock() }
    }

    pub fn with_sequence(mut self, sequence: Sequence) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn sequence(&self) -> &Sequence {
        &self.sequence
    }

    pub fn config(&self) -> &SoakConfig {
        &self.config
    }

    /// Runs cycles until `stop` flips to true or the iteration cap is hit.
    ///
    /// Only startup failures and sequence exhaustion are errors; every
    /// per-key problem ends up in the returned counters.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) -> SoakResult<RunReport> {
        let cfg = &self.config;
        let started = Instant::now();
        info!(
            batch_size = cfg.batch_size,
            workers = cfg.workers,
            window_ms = millis(cfg.report_window),
            max_iterations = ?cfg.max_iterations,
            extractor = ?cfg.verify.extractor,
            removal = ?cfg.verify.removal,
            success = ?cfg.verify.success,
            "starting"
        );

        info!("clearing cache");
        self.facade
            .clear()
            .await
            .map_err(|source| SoakError::Startup { stage: "clearing cache", source })?;
        self.facade
            .add_index(cfg.verify.extractor)
            .await
            .map_err(|source| SoakError::Startup { stage: "installing index", source })?;
        debug!(extractor = ?cfg.verify.extractor, "index installed");

        let pool = VerifyPool::start(self.facade.clone(), cfg.verify, cfg.workers);
        let outcome = self.drive(&pool, &mut stop).await;
        let grace = match &outcome {
            Ok(driven) if driven.grace_spent => Duration::ZERO,
            _ => cfg.shutdown_grace,
        };
        let shutdown = pool.shutdown(grace).await;
        let Driven { counters, windows, reason: stop_reason, .. } = outcome?;

        info!(
            total = counters.total,
            total_success = counters.total_success,
            stop = ?stop_reason,
            shutdown = ?shutdown,
            "Done!"
        );
        Ok(RunReport {
            counters,
            windows,
            stop: stop_reason,
            shutdown,
            elapsed_ms: millis(started.elapsed()),
        })
    }

    async fn drive(
        &self,
        pool: &VerifyPool,
        stop: &mut watch::Receiver<bool>,
    ) -> SoakResult<Driven> {
        let cfg = &self.config;
        let mut counters = Counters::default();
        let mut windows = Vec::new();
        let mut window = Window::new();
        let mut grace_spent = false;

        let reason = loop {
            if *stop.borrow() {
                break StopReason::Cancelled;
            }

            if cfg.clear_each_cycle {
                if let Err(e) = self.facade.clear().await {
                    warn!(error = %e, "per-cycle clear failed");
                }
            }

            counters.cycles += 1;
            match fill(self.facade.as_ref(), &self.sequence, cfg.batch_size, cfg.check_fill_size).await {
                Ok(filled) => {
                    counters.fill_shortfall += filled.shortfall as u64;
                    debug!(keys = filled.keys.len(), "reading");
                    // A stop mid-verify allows the grace period, then abandons what is left.
                    let grace = cfg.shutdown_grace;
                    let abandon = async {
                        stopped(stop).await;
                        info!(grace_ms = millis(grace), "stop requested, waiting for in-flight keys");
                        tokio::time::sleep(grace).await;
                    };
                    let summary = pool.verify_all_until(&filled.keys, abandon).await;
                    if summary.abandoned > 0 && *stop.borrow() {
                        warn!(abandoned = summary.abandoned, "verify abandoned after grace period");
                        grace_spent = true;
                    }
                    counters.absorb(&summary);
                    window.keys += summary.attempted;
                    if let Err(e) = window.latency.add(&summary.latency) {
                        debug!(error = %e, "latency histogram merge failed");
                    }
                }
                Err(SoakError::Facade(e)) => {
                    counters.fill_faults += 1;
                    warn!(error = %e, cycle = counters.cycles, "fill failed");
                }
                Err(e) => return Err(e),
            }

            if window.started.elapsed() >= cfg.report_window {
                counters.iterations += 1;
                windows.push(self.report(&counters, &window).await);
                window = Window::new();
            }

            if cfg.max_iterations.is_some_and(|cap| counters.iterations >= cap) {
                break StopReason::IterationCap;
            }

            tokio::select! {
                _ = tokio::time::sleep(cfg.cycle_pause) => {}
                _ = stopped(stop) => {}
            }
        };
        Ok(Driven { counters, windows, reason, grace_spent })
    }

    async fn report(&self, counters: &Counters, window: &Window) -> WindowReport {
        let cache_size = match self.facade.size().await {
            Ok(size) => Some(size),
            Err(e) => {
                warn!(error = %e, "cache size lookup failed");
                None
            }
        };
        let secs = window.started.elapsed().as_secs_f64().max(f64::EPSILON);
        let report = WindowReport {
            iteration: counters.iterations,
            total_success: counters.total_success,
            total: counters.total,
            percent: counters.success_percent(),
            cache_size,
            keys_per_sec: window.keys as f64 / secs,
            p50_us: window.latency.value_at_quantile(0.50),
            p99_us: window.latency.value_at_quantile(0.99),
            mismatches: counters.mismatches,
            removal_mismatches: counters.removal_mismatches,
            faults: counters.faults,
        };
        let size = cache_size.map_or_else(|| "?".to_string(), |s| s.to_string());
        info!(
            iteration = report.iteration,
            keys_per_sec = report.keys_per_sec.round() as u64,
            p50_us = report.p50_us,
            p99_us = report.p99_us,
            mismatches = report.mismatches,
            faults = report.faults,
            "{}/{} = {:.2}%, cache size = {}",
            report.total_success,
            report.total,
            report.percent,
            size
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millis_saturates_instead_of_truncating() {
        assert_eq!(millis(Duration::from_millis(1_500)), 1_500);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }
}
