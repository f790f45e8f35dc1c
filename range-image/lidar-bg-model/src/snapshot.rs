use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::{BackgroundCell, BgModelError, Result};

/// Magic prefix of the packed cell array; the trailing digit is the format
/// version.
const BLOB_MAGIC: &[u8; 4] = b"LBG1";

/// Bytes per packed cell: f32 distance, f32 noise, u32 count, i64
/// last-updated, i64 freeze-until.
const CELL_PACKED_SIZE: usize = 28;

/// Why a snapshot was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotReason {
    SettlingComplete,
    PeriodicUpdate,
    Manual,
}

impl SnapshotReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotReason::SettlingComplete => "settling_complete",
            SnapshotReason::PeriodicUpdate => "periodic_update",
            SnapshotReason::Manual => "manual",
        }
    }
}

/// A serialised grid, ready for the snapshot store.
#[derive(Debug, Clone)]
pub struct SnapshotPayload {
    pub rings: u16,
    pub azimuth_bins: u16,
    /// The tuning that produced this grid, as JSON.
    pub params_json: String,
    /// Self-describing compressed encoding of the full cell array.
    pub grid_blob: Vec<u8>,
    /// Cell changes since the previous snapshot.
    pub changed_cells_count: u64,
    pub reason: SnapshotReason,
}

/// Pack and gzip the cell array. The blob round-trips losslessly through
/// [`unpack_cells`].
pub fn pack_cells(rings: u16, azimuth_bins: u16, cells: &[BackgroundCell]) -> Result<Vec<u8>> {
    debug_assert_eq!(cells.len(), rings as usize * azimuth_bins as usize);

    let mut raw = Vec::with_capacity(8 + cells.len() * CELL_PACKED_SIZE);
    raw.extend_from_slice(BLOB_MAGIC);
    raw.write_u16::<LittleEndian>(rings)?;
    raw.write_u16::<LittleEndian>(azimuth_bins)?;
    for cell in cells {
        raw.write_f32::<LittleEndian>(cell.bg_distance_m)?;
        raw.write_f32::<LittleEndian>(cell.noise_est_m)?;
        raw.write_u32::<LittleEndian>(cell.observation_count)?;
        raw.write_i64::<LittleEndian>(cell.last_updated_ns)?;
        raw.write_i64::<LittleEndian>(cell.freeze_until_ns)?;
    }

    let mut encoder = libflate::gzip::Encoder::new(Vec::new())?;
    encoder.write_all(&raw)?;
    Ok(encoder.finish().into_result()?)
}

/// Decompress and decode a blob produced by [`pack_cells`].
pub fn unpack_cells(blob: &[u8]) -> Result<(u16, u16, Vec<BackgroundCell>)> {
    let mut decoder = libflate::gzip::Decoder::new(blob)?;
    let mut raw = Vec::new();
    decoder.read_to_end(&mut raw)?;

    if raw.len() < 8 || &raw[..4] != BLOB_MAGIC {
        return Err(BgModelError::MalformedBlob("bad magic"));
    }
    let mut rdr = &raw[4..];
    let rings = rdr.read_u16::<LittleEndian>()?;
    let azimuth_bins = rdr.read_u16::<LittleEndian>()?;
    let n = rings as usize * azimuth_bins as usize;
    if rdr.len() != n * CELL_PACKED_SIZE {
        return Err(BgModelError::MalformedBlob("truncated cell array"));
    }

    let mut cells = Vec::with_capacity(n);
    for _ in 0..n {
        let mut cell = BackgroundCell::unseeded();
        cell.bg_distance_m = rdr.read_f32::<LittleEndian>()?;
        cell.noise_est_m = rdr.read_f32::<LittleEndian>()?;
        cell.observation_count = rdr.read_u32::<LittleEndian>()?;
        cell.last_updated_ns = rdr.read_i64::<LittleEndian>()?;
        cell.freeze_until_ns = rdr.read_i64::<LittleEndian>()?;
        cells.push(cell);
    }
    Ok((rings, azimuth_bins, cells))
}
