#![allow(dead_code)]

use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use cachesoak::{Batch, CacheFacade, Extractor, Filter, Record, ShardedCache, SoakConfig};
use parking_lot::Mutex;
use tracing::subscriber::DefaultGuard;

/// Sharded cache with scriptable misbehaviour for orchestration tests.
pub struct ScriptedCache {
    pub inner: ShardedCache,
    pub query_delay: Option<Duration>,
    pub hang_queries: bool,
    pub panic_on: Option<u64>,
    pub fail_clear: bool,
    pub fail_put: bool,
    pub fail_size: bool,
}

impl ScriptedCache {
    pub fn new() -> Self {
        Self {
            inner: ShardedCache::new(4),
            query_delay: None,
            hang_queries: false,
            panic_on: None,
            fail_clear: false,
            fail_put: false,
            fail_size: false,
        }
    }
}

#[async_trait]
impl CacheFacade for ScriptedCache {
    async fn clear(&self) -> Result<()> {
        if self.fail_clear {
            bail!("cluster unreachable");
        }
        self.inner.clear().await
    }

    async fn add_index(&self, extractor: Extractor) -> Result<()> {
        self.inner.add_index(extractor).await
    }

    async fn put_all(&self, batch: Batch) -> Result<()> {
        if self.fail_put {
            bail!("put rejected");
        }
        self.inner.put_all(batch).await
    }

    async fn size(&self) -> Result<usize> {
        if self.fail_size {
            bail!("size unavailable");
        }
        self.inner.size().await
    }

    async fn query(&self, filter: &Filter) -> Result<Vec<(u64, Record)>> {
        if self.hang_queries {
            return std::future::pending().await;
        }
        if let Some(key) = self.panic_on {
            if *filter == Filter::for_key(Extractor::Key, key) {
                panic!("scripted panic for key {key}");
            }
        }
        if let Some(delay) = self.query_delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.query(filter).await
    }

    async fn remove_matching(&self, filter: &Filter) -> Result<usize> {
        self.inner.remove_matching(filter).await
    }

    async fn remove(&self, key: u64) -> Result<Option<Record>> {
        self.inner.remove(key).await
    }
}

/// Small, fast configuration: every cycle closes a window.
pub fn quick_config(batch_size: usize, max_iterations: Option<u64>) -> SoakConfig {
    SoakConfig {
        batch_size,
        workers: 4,
        report_window: Duration::ZERO,
        max_iterations,
        cycle_pause: Duration::from_millis(1),
        shutdown_grace: Duration::from_secs(2),
        ..SoakConfig::default()
    }
}

/// In-memory sink for tracing output, so tests can assert on log lines.
#[derive(Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    /// Routes this thread's tracing events into the buffer until the guard drops.
    pub fn capture(&self) -> DefaultGuard {
        let sink = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || sink.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
