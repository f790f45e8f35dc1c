use tracing::debug;

use crate::{
    serialize_packet, BlockSpec, PolarPoint, Result, TailSpec, BLOCKS_PER_PACKET, CHANNELS,
    COUNTS_PER_METER, DIST_CLAMP_MAX, RETURN_MODE_STRONGEST,
};

/// Upper bound on returns a single datagram can carry.
pub const MAX_POINTS_PER_PACKET: usize = BLOCKS_PER_PACKET * CHANNELS;

/// Inter-point gap treated as a packet boundary when grouping replayed
/// points whose sequence numbers do not discriminate.
const REPLAY_GAP_NS: i64 = 200_000;

/// Width of one re-bin azimuth bucket in degrees.
const BUCKET_WIDTH_DEG: f32 = 360.0 / BLOCKS_PER_PACKET as f32;

/// Points this close below 360 degrees wrap into the last bucket.
const WRAP_EPS_DEG: f32 = 0.25;

#[derive(Debug, Clone, PartialEq)]
pub struct EncoderConfig {
    /// Motor speed written into every reconstructed tail.
    pub motor_rpm: u16,
    /// Channel count; points with `ring >= channels` are dropped.
    pub channels: u8,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            motor_rpm: 600,
            channels: CHANNELS as u8,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncodeStats {
    pub packets_emitted: usize,
    pub points_encoded: usize,
    /// Points rejected by channel-range validation.
    pub points_dropped: usize,
}

/// Reconstructs wire-format datagrams from filtered foreground points.
///
/// When the points still carry their original packet framing (nonzero
/// `udp_seq`, `raw_block_azimuth`, `block_id`) the original packet
/// boundaries are replayed. Otherwise points are re-binned into ten
/// azimuth buckets per packet. Both paths encode distance at
/// [`COUNTS_PER_METER`] counts per meter (the 4 mm wire LSB).
pub struct ForegroundEncoder {
    cfg: EncoderConfig,
}

impl ForegroundEncoder {
    pub fn new(cfg: EncoderConfig) -> Self {
        Self { cfg }
    }

    /// Encode one batch of foreground points into zero or more datagrams.
    pub fn encode_batch(&self, points: &[PolarPoint]) -> Result<(Vec<Vec<u8>>, EncodeStats)> {
        let mut stats = EncodeStats::default();

        let valid: Vec<&PolarPoint> = points
            .iter()
            .filter(|p| {
                let ok = p.ring < self.cfg.channels && (p.block_id as usize) < BLOCKS_PER_PACKET;
                if !ok {
                    stats.points_dropped += 1;
                }
                ok
            })
            .collect();
        if stats.points_dropped > 0 {
            debug!(
                "dropped {} out-of-range points while encoding",
                stats.points_dropped
            );
        }
        if valid.is_empty() {
            return Ok((Vec::new(), stats));
        }

        let packets = if valid.iter().all(|p| p.udp_seq != 0) {
            self.encode_replay(&valid, &mut stats)?
        } else {
            self.encode_rebin(valid, &mut stats)?
        };

        stats.packets_emitted = packets.len();
        Ok((packets, stats))
    }

    /// Replay path: one datagram per original packet, boundaries taken from
    /// the sequence number with block wrap-around and time gaps as backup.
    fn encode_replay(
        &self,
        points: &[&PolarPoint],
        stats: &mut EncodeStats,
    ) -> Result<Vec<Vec<u8>>> {
        let mut packets = Vec::new();
        let mut group: Vec<&PolarPoint> = Vec::new();

        for &p in points {
            let boundary = group.last().is_some_and(|prev| {
                p.udp_seq != prev.udp_seq
                    || p.block_id < prev.block_id
                    || p.timestamp_ns - prev.timestamp_ns > REPLAY_GAP_NS
            });
            if boundary {
                packets.push(self.emit_replay_group(&group, stats)?);
                group.clear();
            }
            group.push(p);
        }
        if !group.is_empty() {
            packets.push(self.emit_replay_group(&group, stats)?);
        }
        Ok(packets)
    }

    fn emit_replay_group(
        &self,
        group: &[&PolarPoint],
        stats: &mut EncodeStats,
    ) -> Result<Vec<u8>> {
        let first = group[0];
        let mut blocks: [BlockSpec; BLOCKS_PER_PACKET] =
            std::array::from_fn(|_| BlockSpec::empty(first.raw_block_azimuth));
        let mut block_seen = [false; BLOCKS_PER_PACKET];

        for &p in group {
            let b = p.block_id as usize;
            if !block_seen[b] {
                blocks[b].azimuth_centi_deg = p.raw_block_azimuth;
                block_seen[b] = true;
            }
            let slot = &mut blocks[b].channels[p.ring as usize];
            if *slot == (0, 0) {
                *slot = (encode_distance(p.distance_m), p.intensity);
                stats.points_encoded += 1;
            }
        }

        let tail = TailSpec {
            motor_rpm: self.cfg.motor_rpm,
            timestamp_ns: first.timestamp_ns,
            return_mode: RETURN_MODE_STRONGEST,
        };
        serialize_packet(&blocks, &tail, Some(first.udp_seq))
    }

    /// Re-bin path: sort by azimuth, emit at most ceil(n / 400) datagrams of
    /// ten 36 degree buckets each.
    fn encode_rebin(
        &self,
        mut points: Vec<&PolarPoint>,
        stats: &mut EncodeStats,
    ) -> Result<Vec<Vec<u8>>> {
        points.sort_by(|a, b| a.azimuth_deg.total_cmp(&b.azimuth_deg));

        let mut packets = Vec::new();
        for chunk in points.chunks(MAX_POINTS_PER_PACKET) {
            let mut buckets: [Vec<&PolarPoint>; BLOCKS_PER_PACKET] =
                std::array::from_fn(|_| Vec::new());
            for &p in chunk {
                buckets[bucket_index(p.azimuth_deg)].push(p);
            }

            let mut blocks: [BlockSpec; BLOCKS_PER_PACKET] =
                std::array::from_fn(|i| BlockSpec::empty(bucket_center_centi(i)));
            for (i, bucket) in buckets.iter().enumerate() {
                if bucket.is_empty() {
                    continue;
                }
                blocks[i].azimuth_centi_deg = median_azimuth_centi(bucket);
                for &p in bucket {
                    let slot = &mut blocks[i].channels[p.ring as usize];
                    if *slot == (0, 0) {
                        *slot = (encode_distance(p.distance_m), p.intensity);
                        stats.points_encoded += 1;
                    }
                }
            }

            let tail = TailSpec {
                motor_rpm: self.cfg.motor_rpm,
                timestamp_ns: chunk[0].timestamp_ns,
                return_mode: RETURN_MODE_STRONGEST,
            };
            packets.push(serialize_packet(&blocks, &tail, None)?);
        }
        Ok(packets)
    }
}

fn encode_distance(distance_m: f32) -> u16 {
    let counts = (distance_m * COUNTS_PER_METER).round();
    counts.clamp(0.0, DIST_CLAMP_MAX as f32) as u16
}

fn bucket_index(azimuth_deg: f32) -> usize {
    if azimuth_deg < WRAP_EPS_DEG {
        // Wrap-around window of the last bucket.
        return BLOCKS_PER_PACKET - 1;
    }
    ((azimuth_deg / BUCKET_WIDTH_DEG) as usize).min(BLOCKS_PER_PACKET - 1)
}

fn bucket_center_centi(bucket: usize) -> u16 {
    (((bucket as f32 + 0.5) * BUCKET_WIDTH_DEG * 100.0) as u16) % 36000
}

fn median_azimuth_centi(bucket: &[&PolarPoint]) -> u16 {
    let mut azimuths: Vec<f32> = bucket.iter().map(|p| p.azimuth_deg).collect();
    azimuths.sort_by(|a, b| a.total_cmp(b));
    let median = azimuths[azimuths.len() / 2];
    ((median * 100.0).round() as u32 % 36000) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_edges() {
        assert_eq!(bucket_index(0.0), 9);
        assert_eq!(bucket_index(0.3), 0);
        assert_eq!(bucket_index(35.99), 0);
        assert_eq!(bucket_index(36.0), 1);
        assert_eq!(bucket_index(359.99), 9);
    }

    #[test]
    fn distance_clamps_at_wire_max() {
        assert_eq!(encode_distance(0.0), 0);
        assert_eq!(encode_distance(12.34), 3085);
        assert_eq!(encode_distance(1.0e6), DIST_CLAMP_MAX);
    }
}
