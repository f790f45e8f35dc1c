//! Wire format of the Pandar40P-compatible spinning lidar.
//!
//! A datagram is 10 data blocks of 124 bytes followed by a 22 byte tail, 1262
//! bytes in total, or 1266 bytes when the 4 byte UDP sequence trailer is
//! present. Each block is one azimuth's worth of 40 channel returns.

// Copyright 2023-2025 Andrew D. Straw.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use serde::{Deserialize, Serialize};

mod wire;
pub use crate::wire::{parse_packet, serialize_packet, BlockSpec, TailSpec};

mod encoder;
pub use crate::encoder::{EncodeStats, EncoderConfig, ForegroundEncoder, MAX_POINTS_PER_PACKET};

pub type Result<T> = std::result::Result<T, PandarTypesError>;

#[derive(thiserror::Error, Debug)]
pub enum PandarTypesError {
    #[error("unexpected datagram length {0}")]
    BadDatagramLength(usize),
    #[error("bad preamble in block {0}")]
    BadBlockPreamble(usize),
    #[error("block {block} azimuth {azimuth} out of range")]
    AzimuthOutOfRange { block: usize, azimuth: u16 },
    #[error("tail date fields do not form a valid timestamp")]
    BadTailDate,
    #[error("IoError: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
}

/// Vertical beams of the sensor.
pub const CHANNELS: usize = 40;
/// Data blocks per datagram.
pub const BLOCKS_PER_PACKET: usize = 10;
/// Bytes per channel return: u16 distance, u8 intensity.
pub const CHANNEL_SIZE: usize = 3;
/// Bytes of block header: 2 byte preamble, u16 azimuth.
pub const BLOCK_HEADER_SIZE: usize = 4;
pub const BLOCK_SIZE: usize = BLOCK_HEADER_SIZE + CHANNELS * CHANNEL_SIZE;
pub const TAIL_OFFSET: usize = BLOCKS_PER_PACKET * BLOCK_SIZE;
pub const TAIL_SIZE: usize = 22;
/// Datagram size without the UDP sequence trailer.
pub const PACKET_SIZE: usize = TAIL_OFFSET + TAIL_SIZE;
/// Datagram size with the 4 byte UDP sequence trailer.
pub const PACKET_SIZE_WITH_SEQ: usize = PACKET_SIZE + 4;

pub const BLOCK_PREAMBLE: [u8; 2] = [0xFF, 0xEE];
/// Azimuth fields are hundredths of a degree, `0..=35999`.
pub const MAX_AZIMUTH_CENTI_DEG: u16 = 35999;

/// Distance unit of the wire format: 4 mm per count.
pub const DISTANCE_LSB_M: f32 = 0.004;
/// Inverse of [`DISTANCE_LSB_M`], used when encoding.
pub const COUNTS_PER_METER: f32 = 250.0;
/// Raw distance value meaning "no return on this channel".
pub const DIST_NO_RETURN: u16 = 0xFFFF;
/// Largest encodable distance; larger measurements clamp here.
pub const DIST_CLAMP_MAX: u16 = 0xFFFE;

pub const RETURN_MODE_STRONGEST: u8 = 0x37;

/// One channel return in polar sensor coordinates.
///
/// Points are ephemeral: they are owned by the frame currently being
/// processed and never cross a thread boundary by reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolarPoint {
    /// Vertical beam index, `0..CHANNELS`.
    pub ring: u8,
    /// Horizontal angle in degrees, `[0, 360)`.
    pub azimuth_deg: f32,
    /// Measured distance in meters. `0.0` means no return.
    pub distance_m: f32,
    /// Reflectivity, `0..=255`.
    pub intensity: u8,
    /// Data block this return came from, `0..BLOCKS_PER_PACKET`.
    pub block_id: u8,
    /// Packet timestamp in UTC nanoseconds.
    pub timestamp_ns: i64,
    /// UDP sequence number of the carrying datagram. `0` means absent.
    pub udp_seq: u32,
    /// Native hundredths-of-degree block azimuth, preserved for replay.
    pub raw_block_azimuth: u16,
}

/// Decoded 22 byte packet tail.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketTail {
    /// Motor speed in RPM.
    pub motor_rpm: u16,
    /// UTC nanoseconds reconstructed from the date bytes and the
    /// microsecond-within-second field.
    pub timestamp_ns: i64,
    pub return_mode: u8,
    pub factory: u8,
}

/// Result of decoding one datagram.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPacket {
    /// All `BLOCKS_PER_PACKET * CHANNELS` returns, including no-returns
    /// (`distance_m == 0.0`), in block then channel order.
    pub points: Vec<PolarPoint>,
    pub tail: PacketTail,
    /// `0` when the datagram had no sequence trailer.
    pub udp_seq: u32,
}
