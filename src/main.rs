use std::sync::Arc;

use cachesoak::{stop_channel, Args, CacheFacade, FaultyCache, Orchestrator, ShardedCache};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = args.soak_config();
    let faults = args.fault_profile();

    // The cache under test lives in-process; a remote client only has to implement CacheFacade.
    let cache = ShardedCache::new(args.shards.max(1));
    let facade: Arc<dyn CacheFacade> = if faults.is_quiet() {
        Arc::new(cache)
    } else {
        info!(
            drop_rate = faults.drop_rate,
            duplicate_rate = faults.duplicate_rate,
            error_rate = faults.error_rate,
            seed = args.seed,
            "fault injection enabled"
        );
        Arc::new(FaultyCache::new(cache, faults, args.seed))
    };

    let (stop_tx, stop_rx) = stop_channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, finishing current cycle");
            let _ = stop_tx.send(true);
        }
    });

    let report = Orchestrator::new(facade, config).run(stop_rx).await?;
    info!(report = %serde_json::to_string(&report)?, "run report");
    Ok(())
}
