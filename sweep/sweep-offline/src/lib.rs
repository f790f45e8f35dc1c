//! Drives the sensor pipeline from a file of captured packets, pacing
//! emission to reproduce the original timing at a configurable speed.
//!
//! Packet-capture file parsing proper is out of scope; anything that can
//! produce `(capture timestamp, payload)` records implements
//! [`PacketSource`] and plugs in here. The bundled [`RecordFileSource`]
//! reads the simple length-prefixed record file written by the capture
//! tooling.

use std::io::{BufReader, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use lidar_bg_model::{BackgroundGrid, ForegroundExtractor};
use pandar_types::{parse_packet, PolarPoint};
use sweep::{ForegroundSink, FrameSink};

pub type Result<T> = std::result::Result<T, ReplayError>;

#[derive(thiserror::Error, Debug)]
pub enum ReplayError {
    #[error("speed multiplier must be positive")]
    InvalidSpeed,
    #[error("an external frame sink and the internal background grid are mutually exclusive")]
    ConflictingSinks,
    #[error("IoError: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
}

/// One captured datagram.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedPacket {
    pub capture_ts_ns: i64,
    pub payload: Vec<u8>,
}

/// Source of captured packets in capture order.
pub trait PacketSource {
    /// Get the next record. `Ok(None)` when the source is exhausted.
    fn next_packet(&mut self) -> Result<Option<CapturedPacket>>;

    /// Total record count when known, for progress reporting.
    fn total_packets(&self) -> Option<u64> {
        None
    }
}

/// Reads the length-prefixed record file: per record an i64 capture
/// timestamp in UTC nanoseconds, a u32 payload length, and the payload,
/// all little-endian.
pub struct RecordFileSource {
    reader: BufReader<std::fs::File>,
}

impl RecordFileSource {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self {
            reader: BufReader::new(std::fs::File::open(path)?),
        })
    }
}

impl PacketSource for RecordFileSource {
    fn next_packet(&mut self) -> Result<Option<CapturedPacket>> {
        let capture_ts_ns = match self.reader.read_i64::<LittleEndian>() {
            Ok(ts) => ts,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let len = self.reader.read_u32::<LittleEndian>()? as usize;
        let mut payload = vec![0u8; len];
        self.reader.read_exact(&mut payload)?;
        Ok(Some(CapturedPacket {
            capture_ts_ns,
            payload,
        }))
    }
}

/// Append one record in [`RecordFileSource`] format.
pub fn append_record<W: Write>(writer: &mut W, capture_ts_ns: i64, payload: &[u8]) -> Result<()> {
    writer.write_i64::<LittleEndian>(capture_ts_ns)?;
    writer.write_u32::<LittleEndian>(payload.len() as u32)?;
    writer.write_all(payload)?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ReplayOptions {
    /// 1.0 replays in wall time, 2.0 twice as fast.
    pub speed_multiplier: f64,
    /// Skip this much capture time before starting.
    pub start_offset_s: f64,
    /// Stop after this much capture time; negative means until the end.
    pub duration_s: f64,
    /// Skip this many records before doing anything else.
    pub packet_offset: u64,
    /// This many initial packets update the grid without emitting
    /// foreground downstream.
    pub warmup_packets: u64,
    /// Flush the foreground buffer at this many accumulated points...
    pub max_fg_points: usize,
    /// ...or at this many accumulated packets, whichever comes first.
    pub max_fg_packets: usize,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            speed_multiplier: 1.0,
            start_offset_s: 0.0,
            duration_s: -1.0,
            packet_offset: 0,
            warmup_packets: 0,
            max_fg_points: 1200,
            max_fg_packets: 20,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplaySummary {
    pub packets_processed: u64,
    pub points_parsed: u64,
    pub foreground_points: u64,
    pub parse_errors: u64,
    pub cancelled: bool,
}

pub type ProgressFn = Box<dyn FnMut(u64, Option<u64>) + Send>;
pub type FrameFn = Box<dyn FnMut(&BackgroundGrid, &[PolarPoint]) + Send>;

/// Replays captured packets with original timing.
///
/// Pacing is self-correcting: each packet's target wall-clock offset is
/// computed from its capture timestamp, so processing jitter does not
/// accumulate. Holds either the internal background grid or an external
/// frame sink, never both; running the grid here while an external frame
/// builder also consumes the stream would count every observation into the
/// online mean twice.
pub struct RealtimeReplayer {
    opts: ReplayOptions,
    grid: Option<BackgroundGrid>,
    external_sink: Option<Box<dyn FrameSink>>,
    foreground: Option<Box<dyn ForegroundSink>>,
    on_progress: Option<ProgressFn>,
    on_frame: Option<FrameFn>,
}

impl RealtimeReplayer {
    pub fn new(opts: ReplayOptions) -> Result<Self> {
        if !(opts.speed_multiplier > 0.0) {
            return Err(ReplayError::InvalidSpeed);
        }
        Ok(Self {
            opts,
            grid: None,
            external_sink: None,
            foreground: None,
            on_progress: None,
            on_frame: None,
        })
    }

    pub fn with_grid(mut self, grid: BackgroundGrid) -> Result<Self> {
        if self.external_sink.is_some() {
            return Err(ReplayError::ConflictingSinks);
        }
        self.grid = Some(grid);
        Ok(self)
    }

    pub fn with_external_sink(mut self, sink: Box<dyn FrameSink>) -> Result<Self> {
        if self.grid.is_some() {
            return Err(ReplayError::ConflictingSinks);
        }
        self.external_sink = Some(sink);
        Ok(self)
    }

    pub fn with_foreground_sink(mut self, sink: Box<dyn ForegroundSink>) -> Self {
        self.foreground = Some(sink);
        self
    }

    pub fn with_progress_callback(mut self, cb: ProgressFn) -> Self {
        self.on_progress = Some(cb);
        self
    }

    pub fn with_frame_callback(mut self, cb: FrameFn) -> Self {
        self.on_frame = Some(cb);
        self
    }

    /// The grid after a run, for inspection or snapshotting.
    pub fn into_grid(self) -> Option<BackgroundGrid> {
        self.grid
    }

    pub async fn run(
        &mut self,
        source: &mut dyn PacketSource,
        token: &CancellationToken,
    ) -> Result<ReplaySummary> {
        let total = source.total_packets();
        let mut summary = ReplaySummary::default();

        for _ in 0..self.opts.packet_offset {
            if source.next_packet()?.is_none() {
                return Ok(summary);
            }
        }

        let speed = self.opts.speed_multiplier;
        let mut effective_start_ns: Option<i64> = None;
        let mut end_threshold_ns: Option<i64> = None;
        let mut replay_start: Option<tokio::time::Instant> = None;

        let mut fg_buffer: Vec<PolarPoint> = Vec::new();
        let mut fg_buffer_packets = 0usize;

        'replay: while let Some(record) = source.next_packet()? {
            let ts = record.capture_ts_ns;
            let start_ns = *effective_start_ns.get_or_insert_with(|| {
                let start = ts + (self.opts.start_offset_s * 1e9) as i64;
                if self.opts.duration_s >= 0.0 {
                    end_threshold_ns = Some(start + (self.opts.duration_s * 1e9) as i64);
                }
                start
            });
            if ts < start_ns {
                continue;
            }
            if let Some(end) = end_threshold_ns {
                if ts > end {
                    break;
                }
            }

            // Self-correcting pacing relative to the first emitted packet.
            let replay_start = *replay_start.get_or_insert_with(tokio::time::Instant::now);
            let target =
                std::time::Duration::from_secs_f64((ts - start_ns).max(0) as f64 / 1e9 / speed);
            let actual = replay_start.elapsed();
            if target > actual {
                tokio::select! {
                    _ = token.cancelled() => {
                        summary.cancelled = true;
                        break 'replay;
                    }
                    _ = tokio::time::sleep(target - actual) => {}
                }
            }

            self.process_record(&record, &mut summary, &mut fg_buffer, &mut fg_buffer_packets);
            summary.packets_processed += 1;
            if let Some(cb) = self.on_progress.as_mut() {
                cb(summary.packets_processed, total);
            }
        }

        // The remaining buffer is flushed even on cancellation.
        self.flush_foreground(&mut fg_buffer, &mut fg_buffer_packets, &mut summary);
        if let Some(cb) = self.on_progress.as_mut() {
            cb(summary.packets_processed, total);
        }
        Ok(summary)
    }

    fn process_record(
        &mut self,
        record: &CapturedPacket,
        summary: &mut ReplaySummary,
        fg_buffer: &mut Vec<PolarPoint>,
        fg_buffer_packets: &mut usize,
    ) {
        let parsed = match parse_packet(&record.payload) {
            Ok(p) => p,
            Err(e) => {
                summary.parse_errors += 1;
                debug!("rejected captured datagram: {e}");
                return;
            }
        };
        summary.points_parsed += parsed.points.len() as u64;

        if let Some(sink) = self.external_sink.as_mut() {
            sink.on_frame(&parsed.points, parsed.tail.motor_rpm);
            return;
        }
        let Some(grid) = self.grid.as_mut() else {
            return;
        };

        let result = grid.process_frame(&parsed.points, record.capture_ts_ns);
        if let Some(cb) = self.on_frame.as_mut() {
            cb(grid, &parsed.points);
        }

        if summary.packets_processed < self.opts.warmup_packets {
            return;
        }
        *fg_buffer_packets += 1;
        for (point, &fg) in parsed.points.iter().zip(result.mask.iter()) {
            if fg {
                fg_buffer.push(point.clone());
            }
        }
        if fg_buffer.len() >= self.opts.max_fg_points || *fg_buffer_packets >= self.opts.max_fg_packets
        {
            self.flush_foreground(fg_buffer, fg_buffer_packets, summary);
        }
    }

    fn flush_foreground(
        &mut self,
        fg_buffer: &mut Vec<PolarPoint>,
        fg_buffer_packets: &mut usize,
        summary: &mut ReplaySummary,
    ) {
        *fg_buffer_packets = 0;
        if fg_buffer.is_empty() {
            return;
        }
        summary.foreground_points += fg_buffer.len() as u64;
        let batch = std::mem::take(fg_buffer);
        if let Some(sink) = &self.foreground {
            sink.forward_batch(batch);
        }
    }
}
