//! Per-sensor lidar ingest pipeline.
//!
//! One [`SensorPipeline`] owns the UDP listener, the raw packet mirror, the
//! background grid and the foreground re-emitter for a single sensor. The
//! listener task is the only mutator of the grid; the forwarders each drain
//! a bounded queue on their own thread and never exert back-pressure on the
//! ingest path.

use pandar_types::PolarPoint;

mod stats;
pub use crate::stats::StatsCollector;

mod forwarder;
pub use crate::forwarder::{ForegroundForwarder, PacketForwarder};

mod udp_listener;
pub use crate::udp_listener::UdpListener;

mod pipeline;
pub use crate::pipeline::SensorPipeline;

pub type Result<T> = std::result::Result<T, SweepError>;

#[derive(thiserror::Error, Debug)]
pub enum SweepError {
    #[error("IoError: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
    #[error("conversion to socket address failed")]
    SocketAddressConversionFailed,
    #[error("listener already closed")]
    ListenerClosed,
    #[error("{0}")]
    BgModel(#[from] lidar_bg_model::BgModelError),
    #[error("{0}")]
    SnapshotStore(#[from] bg_snapshot_store::StoreError),
}

/// Consumer of parsed point batches (the external frame builder seam).
///
/// Called on the listener (or replayer) task, one call per packet, in
/// packet-arrival order.
pub trait FrameSink: Send {
    fn on_frame(&mut self, points: &[PolarPoint], motor_rpm: u16);
}

/// Capability of accepting foreground point batches for re-emission.
pub trait ForegroundSink: Send + Sync {
    /// Must never block; implementations drop on overload.
    fn forward_batch(&self, batch: Vec<PolarPoint>);
}
