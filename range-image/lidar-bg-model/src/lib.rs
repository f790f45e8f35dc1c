//! Range-image background model for a spinning multi-beam lidar.
//!
//! The sensor's returns are keyed into a `(ring, azimuth bin)` grid of
//! cells. Each cell learns an online estimate of its static background
//! distance and of its measurement noise; a return sufficiently closer
//! than the learned background is foreground. The grid is mutated by
//! exactly one thread (the thread processing frames for its sensor);
//! snapshot serialisation reads a consistent view from that same thread.

use pandar_types::PolarPoint;

mod grid;
pub use crate::grid::{BackgroundCell, BackgroundGrid, ALGORITHM_NAME, MIN_NOISE_M};

mod snapshot;
pub use crate::snapshot::{pack_cells, unpack_cells, SnapshotPayload, SnapshotReason};

mod hybrid;
pub use crate::hybrid::{HybridExtractor, HybridFrame, MergeMode};

pub use lidar_bg_model_types::{BackgroundParams, DebugWindow};

pub type Result<T> = std::result::Result<T, BgModelError>;

#[derive(thiserror::Error, Debug)]
pub enum BgModelError {
    #[error("snapshot dimensions {got_rings}x{got_bins} do not match grid {rings}x{bins}")]
    DimensionMismatch {
        rings: u16,
        bins: u16,
        got_rings: u16,
        got_bins: u16,
    },
    #[error("malformed snapshot blob: {0}")]
    MalformedBlob(&'static str),
    #[error("IoError: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
    #[error("JsonError: {source}")]
    JsonError {
        #[from]
        source: serde_json::Error,
    },
}

/// Typed per-frame counters of one extractor run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameMetrics {
    pub foreground_count: usize,
    pub background_count: usize,
    /// Background-classified update events this frame.
    pub cells_updated: usize,
    pub cells_seeded: usize,
    pub cells_reseeded: usize,
    /// Points whose ring did not fit the grid.
    pub points_out_of_range: usize,
    pub processing_us: u64,
}

/// Result of classifying one frame's points.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameResult {
    pub algorithm: String,
    /// `mask[i]` is true iff `points[i]` is foreground. Always the same
    /// length as the input.
    pub mask: Vec<bool>,
    pub metrics: FrameMetrics,
    /// Set when the extractor failed; the mask is then all-background.
    pub error: Option<String>,
}

impl FrameResult {
    pub fn failed(algorithm: &str, n_points: usize, error: String) -> Self {
        Self {
            algorithm: algorithm.to_string(),
            mask: vec![false; n_points],
            metrics: FrameMetrics::default(),
            error: Some(error),
        }
    }
}

/// The capability shared by all foreground extractors.
///
/// One frame's points go in, a mask of equal length comes out. Extractors
/// are stateful (they learn) and owned by a single processing thread.
pub trait ForegroundExtractor: Send {
    fn name(&self) -> &str;
    fn process_frame(&mut self, points: &[PolarPoint], now_ns: i64) -> FrameResult;
    fn reset(&mut self);
}
