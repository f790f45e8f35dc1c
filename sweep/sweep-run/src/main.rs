use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, info};

use bg_snapshot_store::BgSnapshotStore;
use sweep::SensorPipeline;
use sweep_config_data::parse_config_file;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct SweepRunCliArgs {
    /// Pipeline configuration TOML file
    config_file: std::path::PathBuf,
}

fn main() -> anyhow::Result<()> {
    let _tracing_guard = env_tracing_logger::init_with_default("sweep_run=info,sweep=info,error");

    let args = SweepRunCliArgs::parse();
    debug!("{:?}", args);

    let cfg = parse_config_file(&args.config_file)
        .context(format!("loading configuration {}", args.config_file.display()))?;
    debug!("{:?}", cfg);

    let store = match &cfg.snapshot_db {
        Some(path) => Some(Arc::new(BgSnapshotStore::open(path).context(format!(
            "opening snapshot store {}",
            path.display()
        ))?)),
        None => None,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(4)
        .thread_name("sweep-runtime")
        .build()?;

    runtime.block_on(async move {
        let mut pipeline = SensorPipeline::new(&cfg, store, None).await?;
        info!(
            "{}: pipeline listening at {}",
            cfg.sensor_id,
            pipeline.local_addr()?
        );

        let token = tokio_util::sync::CancellationToken::new();
        let token2 = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                token2.cancel();
            }
        });

        let result = pipeline.start(token).await;
        pipeline.close();
        result
    })?;

    info!("pipeline stopped");
    Ok(())
}
