use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use chrono::{DateTime, Datelike, NaiveDate, Timelike};

use crate::{
    PacketTail, PandarTypesError, ParsedPacket, PolarPoint, Result, BLOCKS_PER_PACKET,
    BLOCK_HEADER_SIZE, BLOCK_PREAMBLE, BLOCK_SIZE, CHANNELS, CHANNEL_SIZE, DISTANCE_LSB_M,
    DIST_NO_RETURN, MAX_AZIMUTH_CENTI_DEG, PACKET_SIZE, PACKET_SIZE_WITH_SEQ, TAIL_OFFSET,
    TAIL_SIZE,
};

/// Decode one datagram into polar points and tail metadata.
///
/// Pure function: a 1262 byte datagram decodes with `udp_seq == 0`, a 1266
/// byte datagram takes the sequence from its trailer. Any other length and
/// any malformed block is a typed error; the caller decides whether that is
/// fatal (for the listener it never is).
pub fn parse_packet(buf: &[u8]) -> Result<ParsedPacket> {
    let udp_seq = match buf.len() {
        PACKET_SIZE => 0,
        PACKET_SIZE_WITH_SEQ => LittleEndian::read_u32(&buf[PACKET_SIZE..]),
        n => return Err(PandarTypesError::BadDatagramLength(n)),
    };

    let tail = parse_tail(&buf[TAIL_OFFSET..TAIL_OFFSET + TAIL_SIZE])?;

    let mut points = Vec::with_capacity(BLOCKS_PER_PACKET * CHANNELS);
    for (block_id, block) in buf[..TAIL_OFFSET].chunks_exact(BLOCK_SIZE).enumerate() {
        if block[..2] != BLOCK_PREAMBLE {
            return Err(PandarTypesError::BadBlockPreamble(block_id));
        }
        let azimuth = LittleEndian::read_u16(&block[2..4]);
        if azimuth > MAX_AZIMUTH_CENTI_DEG {
            return Err(PandarTypesError::AzimuthOutOfRange {
                block: block_id,
                azimuth,
            });
        }
        let azimuth_deg = azimuth as f32 / 100.0;
        for (ring, chunk) in block[BLOCK_HEADER_SIZE..]
            .chunks_exact(CHANNEL_SIZE)
            .enumerate()
        {
            let raw_dist = LittleEndian::read_u16(&chunk[..2]);
            let distance_m = if raw_dist == DIST_NO_RETURN {
                0.0
            } else {
                raw_dist as f32 * DISTANCE_LSB_M
            };
            points.push(PolarPoint {
                ring: ring as u8,
                azimuth_deg,
                distance_m,
                intensity: chunk[2],
                block_id: block_id as u8,
                timestamp_ns: tail.timestamp_ns,
                udp_seq,
                raw_block_azimuth: azimuth,
            });
        }
    }

    Ok(ParsedPacket {
        points,
        tail,
        udp_seq,
    })
}

fn parse_tail(tail: &[u8]) -> Result<PacketTail> {
    // Bytes 0-7 are reserved/flags and ignored.
    let motor_rpm = LittleEndian::read_u16(&tail[8..10]);
    let micros = LittleEndian::read_u32(&tail[10..14]);
    let return_mode = tail[14];
    let factory = tail[15];

    let date = NaiveDate::from_ymd_opt(2000 + tail[16] as i32, tail[17] as u32, tail[18] as u32)
        .ok_or(PandarTypesError::BadTailDate)?;
    let datetime = date
        .and_hms_opt(tail[19] as u32, tail[20] as u32, tail[21] as u32)
        .ok_or(PandarTypesError::BadTailDate)?;
    let base_ns = datetime
        .and_utc()
        .timestamp_nanos_opt()
        .ok_or(PandarTypesError::BadTailDate)?;

    Ok(PacketTail {
        motor_rpm,
        timestamp_ns: base_ns + micros as i64 * 1_000,
        return_mode,
        factory,
    })
}

/// One data block's worth of encoder input.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockSpec {
    pub azimuth_centi_deg: u16,
    /// `(raw distance counts, intensity)` per channel. `(0, 0)` encodes an
    /// unused channel.
    pub channels: [(u16, u8); CHANNELS],
}

impl BlockSpec {
    pub fn empty(azimuth_centi_deg: u16) -> Self {
        Self {
            azimuth_centi_deg,
            channels: [(0, 0); CHANNELS],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TailSpec {
    pub motor_rpm: u16,
    pub timestamp_ns: i64,
    pub return_mode: u8,
}

/// Assemble a wire-format datagram. With `udp_seq` the 1266 byte variant is
/// produced, without it the 1262 byte variant.
pub fn serialize_packet(
    blocks: &[BlockSpec; BLOCKS_PER_PACKET],
    tail: &TailSpec,
    udp_seq: Option<u32>,
) -> Result<Vec<u8>> {
    let expected_len = if udp_seq.is_some() {
        PACKET_SIZE_WITH_SEQ
    } else {
        PACKET_SIZE
    };
    let mut result = Vec::with_capacity(expected_len);

    for block in blocks.iter() {
        result.extend_from_slice(&BLOCK_PREAMBLE);
        result.write_u16::<LittleEndian>(block.azimuth_centi_deg % 36000)?;
        for &(dist, intensity) in block.channels.iter() {
            result.write_u16::<LittleEndian>(dist)?;
            result.write_u8(intensity)?;
        }
    }

    let stamp = DateTime::from_timestamp_nanos(tail.timestamp_ns);
    result.extend_from_slice(&[0u8; 8]);
    result.write_u16::<LittleEndian>(tail.motor_rpm)?;
    result.write_u32::<LittleEndian>(stamp.timestamp_subsec_micros())?;
    result.write_u8(tail.return_mode)?;
    result.write_u8(0)?; // factory info
    result.write_u8((stamp.year().clamp(2000, 2255) - 2000) as u8)?;
    result.write_u8(stamp.month() as u8)?;
    result.write_u8(stamp.day() as u8)?;
    result.write_u8(stamp.hour() as u8)?;
    result.write_u8(stamp.minute() as u8)?;
    result.write_u8(stamp.second() as u8)?;

    if let Some(seq) = udp_seq {
        result.write_u32::<LittleEndian>(seq)?;
    }

    debug_assert_eq!(result.len(), expected_len);
    Ok(result)
}
