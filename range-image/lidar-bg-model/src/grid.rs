use tracing::{debug, warn};

use pandar_types::PolarPoint;

use crate::{
    pack_cells, unpack_cells, BackgroundParams, BgModelError, ForegroundExtractor, FrameMetrics,
    FrameResult, Result, SnapshotPayload, SnapshotReason,
};

/// Smallest admissible noise estimate in meters.
pub const MIN_NOISE_M: f32 = 0.01;

/// Damping applied to the learning step when a return is farther than
/// background by more than the threshold, so the cell does not snap to a
/// spuriously far return.
const RECEDE_DAMPING: f32 = 0.25;

/// Consecutive consistent returns required to seed a cell when
/// `seed_from_first_observation` is off.
const SEED_STABLE_COUNT: u8 = 3;

/// Width of the trailing window over which the updated-cell fraction is
/// measured for the settling decision.
const SETTLING_WINDOW_NS: i64 = 1_000_000_000;

pub const ALGORITHM_NAME: &str = "background-grid";

/// One `(ring, azimuth bin)` cell of the range image.
///
/// Either `observation_count == 0` (unseeded) or `bg_distance_m > 0` and
/// `noise_est_m > 0`.
#[derive(Debug, Clone, PartialEq)]
pub struct BackgroundCell {
    pub bg_distance_m: f32,
    pub noise_est_m: f32,
    pub observation_count: u32,
    pub last_updated_ns: i64,
    /// While `now < freeze_until_ns` the cell classifies but does not learn.
    pub freeze_until_ns: i64,
    // Seeding stability state; ephemeral, not serialized.
    pub(crate) pending_distance_m: f32,
    pub(crate) pending_count: u8,
}

impl BackgroundCell {
    pub(crate) fn unseeded() -> Self {
        Self {
            bg_distance_m: 0.0,
            noise_est_m: 0.0,
            observation_count: 0,
            last_updated_ns: 0,
            freeze_until_ns: 0,
            pending_distance_m: 0.0,
            pending_count: 0,
        }
    }
}

enum CellOutcome {
    /// Background-classified, cell state modified.
    BackgroundChanged,
    /// Background-classified, no state change (frozen or no-op).
    Background,
    /// Candidate foreground; never updates statistics.
    Tentative,
}

/// The range-image background model.
///
/// Dimensions are fixed at construction. All mutation happens on the one
/// thread that processes frames for this sensor.
pub struct BackgroundGrid {
    rings: u16,
    azimuth_bins: u16,
    params: BackgroundParams,
    cells: Vec<BackgroundCell>,

    // per-frame scratch for neighbour confirmation
    cell_tentative: Vec<bool>,
    touched: Vec<usize>,

    // settling / snapshot bookkeeping
    first_frame_ns: i64,
    window_start_ns: i64,
    updated_in_window: usize,
    last_window_fraction: f32,
    have_window: bool,
    settled: bool,
    changed_since_snapshot: u64,
    last_snapshot_ns: i64,
}

impl BackgroundGrid {
    pub fn new(rings: u16, azimuth_bins: u16, params: BackgroundParams) -> Self {
        assert!(rings > 0 && azimuth_bins > 0);
        let n = rings as usize * azimuth_bins as usize;
        Self {
            rings,
            azimuth_bins,
            params,
            cells: vec![BackgroundCell::unseeded(); n],
            cell_tentative: vec![false; n],
            touched: Vec::new(),
            first_frame_ns: 0,
            window_start_ns: 0,
            updated_in_window: 0,
            last_window_fraction: 0.0,
            have_window: false,
            settled: false,
            changed_since_snapshot: 0,
            last_snapshot_ns: 0,
        }
    }

    pub fn rings(&self) -> u16 {
        self.rings
    }

    pub fn azimuth_bins(&self) -> u16 {
        self.azimuth_bins
    }

    pub fn params(&self) -> &BackgroundParams {
        &self.params
    }

    pub fn is_settled(&self) -> bool {
        self.settled
    }

    /// Azimuth bin of a horizontal angle in degrees.
    pub fn azimuth_bin_for(&self, azimuth_deg: f32) -> u16 {
        let bins = self.azimuth_bins as i64;
        let b = (azimuth_deg / 360.0 * self.azimuth_bins as f32).floor() as i64;
        b.rem_euclid(bins) as u16
    }

    pub fn cell_at(&self, ring: u8, azimuth_bin: u16) -> Option<&BackgroundCell> {
        if ring as u16 >= self.rings || azimuth_bin >= self.azimuth_bins {
            return None;
        }
        Some(&self.cells[ring as usize * self.azimuth_bins as usize + azimuth_bin as usize])
    }

    fn cell_index(&self, ring: u8, azimuth_deg: f32) -> Option<usize> {
        if ring as u16 >= self.rings {
            return None;
        }
        let bin = self.azimuth_bin_for(azimuth_deg) as usize;
        Some(ring as usize * self.azimuth_bins as usize + bin)
    }

    /// Operator action: force a cell's background to `new_value` and hold it
    /// there for the configured freeze duration.
    pub fn reseed_cell(&mut self, ring: u8, azimuth_bin: u16, new_value: f32, now_ns: i64) {
        if ring as u16 >= self.rings || azimuth_bin >= self.azimuth_bins {
            warn!("reseed outside grid: ring {ring} bin {azimuth_bin}");
            return;
        }
        let idx = ring as usize * self.azimuth_bins as usize + azimuth_bin as usize;
        reseed(&mut self.cells[idx], &self.params, new_value, now_ns);
        self.changed_since_snapshot += 1;
    }

    /// Decide whether a snapshot is due. Once per grid lifetime this yields
    /// `SettlingComplete`; afterwards `PeriodicUpdate` at the configured
    /// cadence while cells keep drifting.
    pub fn poll_snapshot(&mut self, now_ns: i64) -> Option<SnapshotReason> {
        if self.first_frame_ns == 0 {
            return None;
        }
        if !self.settled {
            let elapsed_s = (now_ns - self.first_frame_ns) as f64 / 1e9;
            if elapsed_s >= self.params.settling_min_elapsed_secs
                && self.have_window
                && self.last_window_fraction < self.params.settling_updated_fraction
            {
                self.settled = true;
                return Some(SnapshotReason::SettlingComplete);
            }
            return None;
        }
        let interval_ns = (self.params.snapshot_interval_secs * 1e9) as i64;
        if now_ns - self.last_snapshot_ns >= interval_ns && self.changed_since_snapshot > 0 {
            return Some(SnapshotReason::PeriodicUpdate);
        }
        None
    }

    /// Serialise the full cell array. Resets the changed-cell counter.
    pub fn take_snapshot(
        &mut self,
        reason: SnapshotReason,
        now_ns: i64,
    ) -> Result<SnapshotPayload> {
        let payload = SnapshotPayload {
            rings: self.rings,
            azimuth_bins: self.azimuth_bins,
            params_json: serde_json::to_string(&self.params)?,
            grid_blob: pack_cells(self.rings, self.azimuth_bins, &self.cells)?,
            changed_cells_count: self.changed_since_snapshot,
            reason,
        };
        self.changed_since_snapshot = 0;
        self.last_snapshot_ns = now_ns;
        Ok(payload)
    }

    /// Replace the cell array with a previously-snapshotted one. The grid is
    /// then considered settled. Dimension mismatch is an error and leaves
    /// the grid untouched.
    pub fn seed_from_snapshot(&mut self, grid_blob: &[u8]) -> Result<()> {
        let (got_rings, got_bins, cells) = unpack_cells(grid_blob)?;
        if got_rings != self.rings || got_bins != self.azimuth_bins {
            return Err(BgModelError::DimensionMismatch {
                rings: self.rings,
                bins: self.azimuth_bins,
                got_rings,
                got_bins,
            });
        }
        self.cells = cells;
        self.settled = true;
        debug!(
            "seeded {}x{} background grid from snapshot",
            got_rings, got_bins
        );
        Ok(())
    }

    fn note_frame(&mut self, now_ns: i64) {
        if self.first_frame_ns == 0 {
            self.first_frame_ns = now_ns;
            self.window_start_ns = now_ns;
            return;
        }
        if now_ns - self.window_start_ns >= SETTLING_WINDOW_NS {
            self.last_window_fraction = self.updated_in_window as f32 / self.cells.len() as f32;
            self.have_window = true;
            self.window_start_ns = now_ns;
            self.updated_in_window = 0;
        }
    }

    fn count_tentative_neighbors(&self, idx: usize) -> usize {
        let bins = self.azimuth_bins as i64;
        let ring = (idx / self.azimuth_bins as usize) as i64;
        let bin = (idx % self.azimuth_bins as usize) as i64;
        let mut count = 0;
        for dr in -1..=1i64 {
            let r = ring + dr;
            if r < 0 || r >= self.rings as i64 {
                continue;
            }
            for db in -1..=1i64 {
                if dr == 0 && db == 0 {
                    continue;
                }
                let b = (bin + db).rem_euclid(bins);
                if self.cell_tentative[r as usize * bins as usize + b as usize] {
                    count += 1;
                }
            }
        }
        count
    }
}

fn reseed(cell: &mut BackgroundCell, params: &BackgroundParams, new_value: f32, now_ns: i64) {
    cell.bg_distance_m = new_value;
    cell.noise_est_m = (params.noise_relative_fraction * new_value).max(MIN_NOISE_M);
    cell.observation_count = 1;
    cell.last_updated_ns = now_ns;
    cell.freeze_until_ns = now_ns + params.freeze_duration_ns;
    cell.pending_count = 0;
}

fn classify_and_update(
    cell: &mut BackgroundCell,
    params: &BackgroundParams,
    distance_m: f32,
    now_ns: i64,
    metrics: &mut FrameMetrics,
) -> CellOutcome {
    if cell.observation_count == 0 {
        if params.seed_from_first_observation {
            cell.bg_distance_m = distance_m;
            cell.noise_est_m = (params.noise_relative_fraction * distance_m).max(MIN_NOISE_M);
            cell.observation_count = 1;
            cell.last_updated_ns = now_ns;
            metrics.cells_seeded += 1;
            return CellOutcome::BackgroundChanged;
        }
        // Seed only after a run of mutually-consistent returns.
        let tolerance = params.closeness_sensitivity
            * (params.noise_relative_fraction * cell.pending_distance_m).max(MIN_NOISE_M);
        if cell.pending_count > 0 && (distance_m - cell.pending_distance_m).abs() <= tolerance {
            cell.pending_count += 1;
            cell.pending_distance_m +=
                (distance_m - cell.pending_distance_m) / cell.pending_count as f32;
        } else {
            cell.pending_distance_m = distance_m;
            cell.pending_count = 1;
        }
        if cell.pending_count >= SEED_STABLE_COUNT {
            let seed_value = cell.pending_distance_m;
            cell.bg_distance_m = seed_value;
            cell.noise_est_m = (params.noise_relative_fraction * seed_value).max(MIN_NOISE_M);
            cell.observation_count = 1;
            cell.last_updated_ns = now_ns;
            cell.pending_count = 0;
            metrics.cells_seeded += 1;
            return CellOutcome::BackgroundChanged;
        }
        return CellOutcome::Tentative;
    }

    let delta = cell.bg_distance_m - distance_m;
    let threshold = params.closeness_sensitivity * cell.noise_est_m + params.safety_margin_m;

    if now_ns < cell.freeze_until_ns {
        // Classify against the held background, never learn.
        return if delta > threshold {
            CellOutcome::Tentative
        } else {
            CellOutcome::Background
        };
    }

    if delta > threshold {
        // Closer than background: candidate foreground. A cell that went
        // unconfirmed for long enough takes this return as its new
        // background instead (the old background is gone).
        if params.stale_reseed_secs > 0.0 {
            let stale_ns = (params.stale_reseed_secs * 1e9) as i64;
            if now_ns - cell.last_updated_ns > stale_ns {
                reseed(cell, params, distance_m, now_ns);
                metrics.cells_reseeded += 1;
                return CellOutcome::BackgroundChanged;
            }
        }
        return CellOutcome::Tentative;
    }

    // Within the band: ordinary learning step. Farther than the band: the
    // background appears to have receded, learn with a damped step.
    let alpha = if delta.abs() <= threshold {
        params.update_fraction
    } else {
        params.update_fraction * RECEDE_DAMPING
    };
    cell.bg_distance_m += alpha * (distance_m - cell.bg_distance_m);
    let noise_target = (distance_m - cell.bg_distance_m)
        .abs()
        .max(params.noise_relative_fraction * cell.bg_distance_m);
    cell.noise_est_m += alpha * (noise_target - cell.noise_est_m);
    cell.noise_est_m = cell.noise_est_m.max(MIN_NOISE_M);
    cell.observation_count = cell.observation_count.saturating_add(1);
    cell.last_updated_ns = now_ns;
    metrics.cells_updated += 1;
    CellOutcome::BackgroundChanged
}

impl ForegroundExtractor for BackgroundGrid {
    fn name(&self) -> &str {
        ALGORITHM_NAME
    }

    fn process_frame(&mut self, points: &[PolarPoint], now_ns: i64) -> FrameResult {
        let start = std::time::Instant::now();
        let mut metrics = FrameMetrics::default();

        for &idx in &self.touched {
            self.cell_tentative[idx] = false;
        }
        self.touched.clear();

        // Pass 1: per-cell classification and learning.
        let mut tentative_at: Vec<Option<usize>> = vec![None; points.len()];
        for (i, p) in points.iter().enumerate() {
            if p.distance_m <= 0.0 {
                // no return on this channel
                continue;
            }
            let Some(idx) = self.cell_index(p.ring, p.azimuth_deg) else {
                metrics.points_out_of_range += 1;
                continue;
            };
            let outcome = classify_and_update(
                &mut self.cells[idx],
                &self.params,
                p.distance_m,
                now_ns,
                &mut metrics,
            );
            match outcome {
                CellOutcome::BackgroundChanged => {
                    self.changed_since_snapshot += 1;
                    self.updated_in_window += 1;
                }
                CellOutcome::Background => {}
                CellOutcome::Tentative => {
                    tentative_at[i] = Some(idx);
                    if !self.cell_tentative[idx] {
                        self.cell_tentative[idx] = true;
                        self.touched.push(idx);
                    }
                }
            }
        }

        // Pass 2: neighbour confirmation over this frame's candidates.
        let need = self.params.neighbor_confirmation_count as usize;
        let mut mask = vec![false; points.len()];
        let mut in_debug_window = 0usize;
        for (i, t) in tentative_at.iter().enumerate() {
            let Some(idx) = t else { continue };
            if need == 0 || self.count_tentative_neighbors(*idx) >= need {
                mask[i] = true;
                metrics.foreground_count += 1;
                if let Some(w) = &self.params.debug_window {
                    if w.contains(points[i].ring, points[i].azimuth_deg) {
                        in_debug_window += 1;
                    }
                }
            }
        }
        metrics.background_count = points.len() - metrics.foreground_count;
        if in_debug_window > 0 {
            debug!("debug window: {in_debug_window} foreground returns this frame");
        }

        self.note_frame(now_ns);
        metrics.processing_us = start.elapsed().as_micros() as u64;

        FrameResult {
            algorithm: ALGORITHM_NAME.to_string(),
            mask,
            metrics,
            error: None,
        }
    }

    fn reset(&mut self) {
        for cell in self.cells.iter_mut() {
            *cell = BackgroundCell::unseeded();
        }
        for &idx in &self.touched {
            self.cell_tentative[idx] = false;
        }
        self.touched.clear();
        self.first_frame_ns = 0;
        self.window_start_ns = 0;
        self.updated_in_window = 0;
        self.last_window_fraction = 0.0;
        self.have_window = false;
        self.settled = false;
        self.changed_since_snapshot = 0;
        self.last_snapshot_ns = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NS_PER_FRAME: i64 = 100_000_000; // 10 Hz frames

    fn point(ring: u8, azimuth_deg: f32, distance_m: f32) -> PolarPoint {
        PolarPoint {
            ring,
            azimuth_deg,
            distance_m,
            intensity: 100,
            block_id: 0,
            timestamp_ns: 0,
            udp_seq: 0,
            raw_block_azimuth: (azimuth_deg * 100.0) as u16,
        }
    }

    fn fast_settling_params() -> BackgroundParams {
        BackgroundParams {
            update_fraction: 0.1,
            neighbor_confirmation_count: 0,
            settling_min_elapsed_secs: 2.0,
            settling_updated_fraction: 0.5,
            stale_reseed_secs: 0.0,
            ..Default::default()
        }
    }

    /// One ring's worth of an empty scene: every degree, constant range.
    fn empty_scene() -> Vec<PolarPoint> {
        (0..360).map(|az| point(10, az as f32, 20.0)).collect()
    }

    #[test]
    fn mask_length_and_count_sum() {
        let mut grid = BackgroundGrid::new(40, 360, fast_settling_params());
        let points = empty_scene();
        let result = grid.process_frame(&points, NS_PER_FRAME);
        assert_eq!(result.mask.len(), points.len());
        assert_eq!(
            result.metrics.foreground_count + result.metrics.background_count,
            points.len()
        );
    }

    #[test]
    fn empty_scene_settles_once() {
        let mut grid = BackgroundGrid::new(40, 360, fast_settling_params());
        let points = empty_scene();

        let mut settle_snapshots = 0;
        let mut late_foreground = 0;
        for frame in 0..1000u32 {
            let now = (frame as i64 + 1) * NS_PER_FRAME;
            let result = grid.process_frame(&points, now);
            assert!(result.error.is_none());
            if frame >= 100 {
                late_foreground += result.metrics.foreground_count;
            }
            if let Some(reason) = grid.poll_snapshot(now) {
                if reason == SnapshotReason::SettlingComplete {
                    settle_snapshots += 1;
                    let payload = grid.take_snapshot(reason, now).unwrap();
                    assert_eq!(payload.reason, SnapshotReason::SettlingComplete);
                    assert!(payload.changed_cells_count > 0);
                }
            }
        }
        assert_eq!(settle_snapshots, 1);
        assert!(grid.is_settled());
        assert_eq!(late_foreground, 0);
    }

    #[test]
    fn closer_return_is_foreground_and_does_not_update() {
        let mut grid = BackgroundGrid::new(40, 360, fast_settling_params());
        grid.reseed_cell(10, grid.azimuth_bin_for(120.0), 20.0, 0);
        let before = grid.cell_at(10, grid.azimuth_bin_for(120.0)).unwrap().clone();

        let points = vec![point(10, 120.0, 5.0)];
        let result = grid.process_frame(&points, NS_PER_FRAME);

        assert_eq!(result.mask, vec![true]);
        assert_eq!(result.metrics.foreground_count, 1);
        assert_eq!(result.metrics.cells_updated, 0);
        let after = grid.cell_at(10, grid.azimuth_bin_for(120.0)).unwrap();
        assert_eq!(after.bg_distance_m, before.bg_distance_m);
        assert_eq!(after.observation_count, before.observation_count);
    }

    #[test]
    fn lone_candidate_demoted_by_neighbor_confirmation() {
        let params = BackgroundParams {
            neighbor_confirmation_count: 3,
            stale_reseed_secs: 0.0,
            ..Default::default()
        };
        let mut grid = BackgroundGrid::new(40, 360, params);
        // Stable 20 m background in the whole neighbourhood.
        for ring in 9..=11 {
            for bin in 118..=122 {
                grid.reseed_cell(ring, bin, 20.0, 0);
            }
        }

        let points = vec![point(10, 120.0, 5.0)];
        let result = grid.process_frame(&points, NS_PER_FRAME);
        assert_eq!(result.mask, vec![false]);
        assert_eq!(result.metrics.foreground_count, 0);
        assert_eq!(result.metrics.background_count, 1);
    }

    #[test]
    fn confirmed_when_neighbors_agree() {
        let params = BackgroundParams {
            neighbor_confirmation_count: 2,
            stale_reseed_secs: 0.0,
            ..Default::default()
        };
        let mut grid = BackgroundGrid::new(40, 360, params);
        for ring in 9..=11 {
            for bin in 118..=122 {
                grid.reseed_cell(ring, bin, 20.0, 0);
            }
        }

        // Three vertically adjacent candidate returns.
        let points = vec![
            point(9, 120.0, 5.0),
            point(10, 120.0, 5.0),
            point(11, 120.0, 5.0),
        ];
        let result = grid.process_frame(&points, NS_PER_FRAME);
        // The middle point has two candidate neighbours; the outer ones one.
        assert_eq!(result.mask, vec![false, true, false]);
    }

    #[test]
    fn background_update_is_bounded() {
        let params = fast_settling_params();
        let alpha = params.update_fraction;
        let mut grid = BackgroundGrid::new(40, 360, params);
        let bin = grid.azimuth_bin_for(50.0);
        grid.reseed_cell(5, bin, 20.0, 0);

        let before = grid.cell_at(5, bin).unwrap().bg_distance_m;
        let distance = 20.3; // inside the closeness band
        let result = grid.process_frame(&[point(5, 50.0, distance)], NS_PER_FRAME);
        assert_eq!(result.metrics.cells_updated, 1);

        let after = grid.cell_at(5, bin).unwrap().bg_distance_m;
        assert!((after - before).abs() <= alpha * (distance - before).abs() + 1e-6);
    }

    #[test]
    fn background_count_matches_updates_on_seeded_cells() {
        let mut grid = BackgroundGrid::new(40, 360, fast_settling_params());
        for az in 0..50 {
            grid.reseed_cell(3, grid.azimuth_bin_for(az as f32), 15.0, 0);
        }
        let points: Vec<PolarPoint> = (0..50).map(|az| point(3, az as f32, 15.05)).collect();
        let result = grid.process_frame(&points, NS_PER_FRAME);
        assert_eq!(result.metrics.foreground_count, 0);
        assert_eq!(result.metrics.cells_updated, result.metrics.background_count);
    }

    #[test]
    fn frozen_cell_classifies_but_does_not_learn() {
        let params = BackgroundParams {
            freeze_duration_ns: 10 * NS_PER_FRAME,
            neighbor_confirmation_count: 0,
            stale_reseed_secs: 0.0,
            ..Default::default()
        };
        let mut grid = BackgroundGrid::new(40, 360, params);
        let bin = grid.azimuth_bin_for(200.0);
        grid.reseed_cell(20, bin, 10.0, 0);

        let result = grid.process_frame(&[point(20, 200.0, 10.1)], NS_PER_FRAME);
        assert_eq!(result.mask, vec![false]);
        assert_eq!(result.metrics.cells_updated, 0);
        let cell = grid.cell_at(20, bin).unwrap();
        assert_eq!(cell.bg_distance_m, 10.0);
        assert_eq!(cell.observation_count, 1);

        // A close return still classifies foreground while frozen.
        let result = grid.process_frame(&[point(20, 200.0, 2.0)], 2 * NS_PER_FRAME);
        assert_eq!(result.mask, vec![true]);

        // After the freeze expires, learning resumes.
        let result = grid.process_frame(&[point(20, 200.0, 10.1)], 20 * NS_PER_FRAME);
        assert_eq!(result.metrics.cells_updated, 1);
    }

    #[test]
    fn deferred_seeding_requires_stable_returns() {
        let params = BackgroundParams {
            seed_from_first_observation: false,
            neighbor_confirmation_count: 0,
            stale_reseed_secs: 0.0,
            ..Default::default()
        };
        let mut grid = BackgroundGrid::new(40, 360, params);
        let bin = grid.azimuth_bin_for(30.0);

        // First two consistent returns stay foreground and do not seed.
        for frame in 1..=2 {
            let result = grid.process_frame(&[point(7, 30.0, 12.0)], frame * NS_PER_FRAME);
            assert_eq!(result.mask, vec![true]);
            assert_eq!(grid.cell_at(7, bin).unwrap().observation_count, 0);
        }
        // The third seeds the cell and classifies background.
        let result = grid.process_frame(&[point(7, 30.0, 12.0)], 3 * NS_PER_FRAME);
        assert_eq!(result.mask, vec![false]);
        assert_eq!(result.metrics.cells_seeded, 1);
        let cell = grid.cell_at(7, bin).unwrap();
        assert_eq!(cell.observation_count, 1);
        assert!((cell.bg_distance_m - 12.0).abs() < 1e-5);
    }

    #[test]
    fn receding_background_learns_with_damped_step() {
        let params = fast_settling_params();
        let alpha = params.update_fraction;
        let mut grid = BackgroundGrid::new(40, 360, params);
        let bin = grid.azimuth_bin_for(80.0);
        grid.reseed_cell(2, bin, 20.0, 0);

        let far = 30.0; // well beyond the closeness band
        let result = grid.process_frame(&[point(2, 80.0, far)], NS_PER_FRAME);
        assert_eq!(result.mask, vec![false]);
        assert_eq!(result.metrics.cells_updated, 1);

        let cell = grid.cell_at(2, bin).unwrap();
        let expected = 20.0 + alpha * RECEDE_DAMPING * (far - 20.0);
        approx::assert_relative_eq!(cell.bg_distance_m, expected, epsilon = 1e-4);
    }

    #[test]
    fn stale_cell_reseeds_from_candidate() {
        let params = BackgroundParams {
            stale_reseed_secs: 1.0,
            freeze_duration_ns: 0,
            ..Default::default()
        };
        let mut grid = BackgroundGrid::new(40, 360, params);
        let bin = grid.azimuth_bin_for(300.0);
        grid.reseed_cell(30, bin, 50.0, 0);

        // Two seconds later, a much closer return reseeds instead of
        // classifying foreground.
        let now = 2_000_000_000;
        let result = grid.process_frame(&[point(30, 300.0, 8.0)], now);
        assert_eq!(result.mask, vec![false]);
        assert_eq!(result.metrics.cells_reseeded, 1);
        let cell = grid.cell_at(30, bin).unwrap();
        assert!((cell.bg_distance_m - 8.0).abs() < 1e-5);
        assert_eq!(cell.observation_count, 1);
    }

    #[test]
    fn snapshot_round_trip_preserves_cells() {
        let mut grid = BackgroundGrid::new(8, 90, fast_settling_params());
        for az in (0..360).step_by(4) {
            grid.reseed_cell(4, grid.azimuth_bin_for(az as f32), 10.0 + az as f32 * 0.01, 7);
        }
        let payload = grid
            .take_snapshot(SnapshotReason::Manual, NS_PER_FRAME)
            .unwrap();
        assert_eq!(payload.reason, SnapshotReason::Manual);
        assert_eq!(payload.rings, 8);
        assert_eq!(payload.azimuth_bins, 90);
        assert!(payload.params_json.contains("update_fraction"));

        let mut restored = BackgroundGrid::new(8, 90, fast_settling_params());
        restored.seed_from_snapshot(&payload.grid_blob).unwrap();
        assert!(restored.is_settled());
        for bin in 0..90 {
            assert_eq!(restored.cell_at(4, bin).unwrap(), grid.cell_at(4, bin).unwrap());
        }
    }

    #[test]
    fn snapshot_dimension_mismatch_is_rejected() {
        let mut small = BackgroundGrid::new(8, 90, fast_settling_params());
        let payload = small
            .take_snapshot(SnapshotReason::Manual, NS_PER_FRAME)
            .unwrap();

        let mut other = BackgroundGrid::new(16, 90, fast_settling_params());
        match other.seed_from_snapshot(&payload.grid_blob) {
            Err(BgModelError::DimensionMismatch { got_rings, .. }) => {
                assert_eq!(got_rings, 8);
            }
            other => panic!("expected dimension mismatch, got {other:?}"),
        }
    }
}
