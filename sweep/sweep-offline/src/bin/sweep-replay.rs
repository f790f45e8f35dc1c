use anyhow::Context;
use clap::Parser;
use tracing::info;

use lidar_bg_model::BackgroundGrid;
use sweep::ForegroundForwarder;
use sweep_offline::{RealtimeReplayer, RecordFileSource, ReplayOptions};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Input capture record file
    #[arg(short = 'd', long)]
    data_src: std::path::PathBuf,
    /// Pipeline configuration TOML file; defaults apply when omitted
    #[arg(long)]
    config: Option<std::path::PathBuf>,
    /// Replay speed multiplier (1.0 = original timing)
    #[arg(long, default_value_t = 1.0)]
    speed: f64,
    /// Skip this many seconds of capture time before starting
    #[arg(long, default_value_t = 0.0)]
    start_offset: f64,
    /// Stop after this many seconds of capture time (negative = until end)
    #[arg(long, default_value_t = -1.0)]
    duration: f64,
    /// Skip this many packets before starting
    #[arg(long, default_value_t = 0)]
    packet_offset: u64,
    /// Initial packets that update the background without emitting
    #[arg(long, default_value_t = 0)]
    warmup: u64,
    /// Emit re-encoded foreground packets to this address
    #[arg(long)]
    foreground_addr: Option<String>,
    /// Disable periodic progress logging
    #[arg(long)]
    no_progress: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _tracing_guard =
        env_tracing_logger::init_with_default("sweep_replay=info,sweep_offline=info,sweep=info,error");
    let opt = Cli::parse();

    let cfg = match &opt.config {
        Some(path) => sweep_config_data::parse_config_file(path)
            .context(format!("loading configuration {}", path.display()))?,
        None => sweep_config_data::SweepConfig::default(),
    };

    let mut source = RecordFileSource::open(&opt.data_src)
        .context(format!("opening capture file {}", opt.data_src.display()))?;

    let grid = BackgroundGrid::new(cfg.channels, cfg.azimuth_bins, cfg.background.clone());
    let mut replayer = RealtimeReplayer::new(ReplayOptions {
        speed_multiplier: opt.speed,
        start_offset_s: opt.start_offset,
        duration_s: opt.duration,
        packet_offset: opt.packet_offset,
        warmup_packets: opt.warmup,
        ..Default::default()
    })?
    .with_grid(grid)?;

    let foreground_addr = opt.foreground_addr.or(cfg.foreground_addr);
    if let Some(dest) = &foreground_addr {
        let forwarder = ForegroundForwarder::new(
            dest,
            cfg.foreground_queue_capacity,
            pandar_types::EncoderConfig {
                motor_rpm: cfg.motor_rpm,
                channels: cfg.channels as u8,
            },
            std::time::Duration::from_secs_f64(cfg.log_interval_secs),
        )?;
        info!("emitting foreground packets to {dest}");
        replayer = replayer.with_foreground_sink(Box::new(forwarder));
    }

    if !opt.no_progress {
        replayer = replayer.with_progress_callback(Box::new(|current, total| {
            if current % 1000 == 0 {
                match total {
                    Some(total) => info!("replayed {current}/{total} packets"),
                    None => info!("replayed {current} packets"),
                }
            }
        }));
    }

    let token = tokio_util::sync::CancellationToken::new();
    let token2 = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token2.cancel();
        }
    });

    let summary = replayer.run(&mut source, &token).await?;
    info!(
        "replay done: {} packets, {} points, {} foreground points, {} parse errors{}",
        summary.packets_processed,
        summary.points_parsed,
        summary.foreground_points,
        summary.parse_errors,
        if summary.cancelled { " (cancelled)" } else { "" },
    );
    Ok(())
}
