use tracing::{debug, warn};

use crate::error::SoakResult;
use crate::facade::CacheFacade;
use crate::record::{generate, Sequence};

/// Result of one fill: the submitted primary keys plus the size check result.
#[derive(Debug, Clone, Default)]
pub struct FillReport {
    pub keys: Vec<u64>,
    /// Entries the cache appears to be missing right after the bulk put.
    pub shortfall: usize,
}

/// Generates `count` records and writes them with a single `put_all`.
///
/// Every returned key was submitted; it may not be visible yet. With
/// `check_size` the cache size is sampled around the put and a shortfall
/// is logged and reported instead of being ignored. The size check is
/// advisory: if either sample fails the keys are still returned and no
/// shortfall is reported.
pub async fn fill(
    facade: &dyn CacheFacade,
    sequence: &Sequence,
    count: usize,
    check_size: bool,
) -> SoakResult<FillReport> {
    debug!(count, "generating");
    let batch = generate(sequence, count)?;
    let keys: Vec<u64> = batch.keys().copied().collect();

    let before = if check_size { sample_size(facade, "before").await } else { None };
    debug!(count, "filling");
    facade.put_all(batch).await?;

    let mut shortfall = 0;
    let after = match before {
        Some(_) => sample_size(facade, "after").await,
        None => None,
    };
    if let (Some(before), Some(after)) = (before, after) {
        let expected = before + keys.len();
        if after < expected {
            shortfall = expected - after;
            warn!(before, after, expected, shortfall, "cache size below expected after fill");
        }
    }

    Ok(FillReport { keys, shortfall })
}

async fn sample_size(facade: &dyn CacheFacade, when: &'static str) -> Option<usize> {
    match facade.size().await {
        Ok(size) => Some(size),
        Err(e) => {
            warn!(error = %e, when, "cache size sample failed, skipping fill size check");
            None
        }
    }
}
