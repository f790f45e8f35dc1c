use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use bg_snapshot_store::{BgSnapshotStore, NewSnapshot};
use lidar_bg_model::{BackgroundGrid, ForegroundExtractor, SnapshotReason};
use pandar_types::{EncoderConfig, PolarPoint};
use sweep_config_data::SweepConfig;

use crate::{
    ForegroundForwarder, ForegroundSink, FrameSink, PacketForwarder, Result, StatsCollector,
    UdpListener,
};

/// Runs the background grid against each parsed packet, pushes confirmed
/// foreground points toward the re-emitter and persists snapshots when the
/// grid asks for one. Optionally chains to a further (external) frame sink.
struct GridFrameSink {
    sensor_id: String,
    grid: BackgroundGrid,
    foreground: Option<ForegroundForwarder>,
    store: Option<Arc<BgSnapshotStore>>,
    downstream: Option<Box<dyn FrameSink>>,
}

impl GridFrameSink {
    fn persist_snapshot(&mut self, reason: SnapshotReason, now_ns: i64) {
        let Some(store) = &self.store else { return };
        let payload = match self.grid.take_snapshot(reason, now_ns) {
            Ok(p) => p,
            Err(e) => {
                warn!("{}: snapshot serialisation failed: {e}", self.sensor_id);
                return;
            }
        };
        let row = NewSnapshot {
            sensor_id: self.sensor_id.clone(),
            taken_unix_nanos: now_ns,
            rings: payload.rings,
            azimuth_bins: payload.azimuth_bins,
            params_json: Some(payload.params_json),
            grid_blob: payload.grid_blob,
            changed_cells_count: payload.changed_cells_count as i64,
            reason: Some(payload.reason.as_str().to_string()),
        };
        match store.insert(&row) {
            Ok(id) => info!(
                "{}: stored background snapshot {id} ({})",
                self.sensor_id,
                payload.reason.as_str()
            ),
            Err(e) => warn!("{}: snapshot insert failed: {e}", self.sensor_id),
        }
    }
}

impl FrameSink for GridFrameSink {
    fn on_frame(&mut self, points: &[PolarPoint], motor_rpm: u16) {
        let now_ns = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0);
        let result = self.grid.process_frame(points, now_ns);

        if let Some(foreground) = &self.foreground {
            let batch: Vec<PolarPoint> = points
                .iter()
                .zip(result.mask.iter())
                .filter(|&(_, &fg)| fg)
                .map(|(p, _)| p.clone())
                .collect();
            if !batch.is_empty() {
                foreground.forward_batch(batch);
            }
        }

        if let Some(reason) = self.grid.poll_snapshot(now_ns) {
            self.persist_snapshot(reason, now_ns);
        }

        if let Some(downstream) = self.downstream.as_mut() {
            downstream.on_frame(points, motor_rpm);
        }
    }
}

/// Everything belonging to one sensor, wired together: listener, raw
/// mirror, background grid, foreground re-emitter, snapshot persistence.
pub struct SensorPipeline {
    listener: UdpListener,
}

impl SensorPipeline {
    /// Construct the pipeline. A latest matching snapshot seeds the grid;
    /// a snapshot with other dimensions is ignored with a warning and the
    /// pipeline starts with a fresh grid.
    pub async fn new(
        cfg: &SweepConfig,
        store: Option<Arc<BgSnapshotStore>>,
        external_sink: Option<Box<dyn FrameSink>>,
    ) -> Result<Self> {
        let log_interval = Duration::from_secs_f64(cfg.log_interval_secs);
        let stats = Arc::new(StatsCollector::new(&cfg.sensor_id, log_interval));

        let forwarder = match &cfg.forward_addr {
            Some(dest) => Some(PacketForwarder::new(
                dest,
                cfg.packet_queue_capacity,
                log_interval,
            )?),
            None => None,
        };

        let foreground = match &cfg.foreground_addr {
            Some(dest) => Some(ForegroundForwarder::new(
                dest,
                cfg.foreground_queue_capacity,
                EncoderConfig {
                    motor_rpm: cfg.motor_rpm,
                    channels: cfg.channels as u8,
                },
                log_interval,
            )?),
            None => None,
        };

        let mut grid =
            BackgroundGrid::new(cfg.channels, cfg.azimuth_bins, cfg.background.clone());
        if let Some(store) = &store {
            match store.get_latest(&cfg.sensor_id)? {
                Some(row) => {
                    if let Err(e) = grid.seed_from_snapshot(&row.grid_blob) {
                        warn!(
                            "{}: ignoring stored snapshot {}: {e}",
                            cfg.sensor_id, row.snapshot_id
                        );
                    } else {
                        info!(
                            "{}: seeded grid from snapshot {} taken at {}",
                            cfg.sensor_id, row.snapshot_id, row.taken_unix_nanos
                        );
                    }
                }
                None => info!("{}: no stored snapshot, starting fresh", cfg.sensor_id),
            }
        }

        let sink: Box<dyn FrameSink> = Box::new(GridFrameSink {
            sensor_id: cfg.sensor_id.clone(),
            grid,
            foreground,
            store,
            downstream: external_sink,
        });

        let listener = UdpListener::bind(
            &cfg.listen_addr,
            cfg.recv_buffer_bytes,
            stats,
            forwarder,
            Some(sink),
            cfg.parse_packets,
        )
        .await?;

        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Blocks until cancellation or a non-recoverable socket error.
    pub async fn start(&mut self, token: CancellationToken) -> Result<()> {
        self.listener.start(token).await
    }

    pub fn close(&mut self) {
        self.listener.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use lidar_bg_model::BackgroundParams;

    #[tokio::test]
    async fn pipeline_ingests_and_shuts_down() {
        let cfg = SweepConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            background: BackgroundParams {
                neighbor_confirmation_count: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let store = Arc::new(BgSnapshotStore::open_in_memory().unwrap());
        let mut pipeline = SensorPipeline::new(&cfg, Some(store), None).await.unwrap();
        let addr = pipeline.local_addr().unwrap();

        let token = CancellationToken::new();
        let token2 = token.clone();
        let handle = tokio::spawn(async move {
            let r = pipeline.start(token2).await;
            pipeline.close();
            r
        });

        let sender = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let blocks = std::array::from_fn(|i| pandar_types::BlockSpec::empty(i as u16 * 3600));
        let tail = pandar_types::TailSpec {
            motor_rpm: 600,
            timestamp_ns: 1_700_000_000_000_000_000,
            return_mode: 0x37,
        };
        let packet = pandar_types::serialize_packet(&blocks, &tail, None).unwrap();
        for _ in 0..5 {
            sender.send_to(&packet, addr).await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        token.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
