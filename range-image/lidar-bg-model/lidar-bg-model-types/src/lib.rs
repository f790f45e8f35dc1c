//! Configuration types for the range-image background model.
//!
//! These parameters govern how incoming lidar returns are classified as
//! moving foreground or slowly-learned static background, and how the
//! learned background is snapshotted.

// Copyright 2023-2025 Andrew D. Straw.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use serde::{Deserialize, Serialize};

/// Restricts diagnostic tagging to a polar window. Classification is never
/// affected by this.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DebugWindow {
    pub ring_min: u8,
    pub ring_max: u8,
    pub az_min_deg: f32,
    pub az_max_deg: f32,
}

impl DebugWindow {
    pub fn contains(&self, ring: u8, azimuth_deg: f32) -> bool {
        ring >= self.ring_min
            && ring <= self.ring_max
            && azimuth_deg >= self.az_min_deg
            && azimuth_deg <= self.az_max_deg
    }
}

/// Parameters of the per-cell online background estimate.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackgroundParams {
    /// How much to weight a new observation when updating a cell's
    /// background distance.
    ///
    /// Valid range is (0.0, 1.0]. Small values learn slowly, 1.0 means
    /// complete replacement on every background-classified return.
    #[serde(default = "default_update_fraction")]
    pub update_fraction: f32,
    /// Number of noise estimates a return must be closer than background
    /// by to become candidate foreground.
    ///
    /// Valid range is 1.0 - infinity. Larger values are more permissive
    /// toward background.
    #[serde(default = "default_closeness_sensitivity")]
    pub closeness_sensitivity: f32,
    /// Absolute margin in meters added on top of the noise-scaled
    /// closeness threshold.
    #[serde(default = "default_safety_margin_m")]
    pub safety_margin_m: f32,
    /// A candidate foreground point is confirmed only if at least this
    /// many of its 8 grid neighbours are also candidates in the same
    /// frame. 0 disables neighbour confirmation.
    #[serde(default = "default_neighbor_confirmation_count")]
    pub neighbor_confirmation_count: u8,
    /// Floor of the per-cell noise estimate, as a fraction of the cell's
    /// background distance. Prevents zero-noise fixation.
    ///
    /// Valid range is (0.0, 1.0).
    #[serde(default = "default_noise_relative_fraction")]
    pub noise_relative_fraction: f32,
    /// If true an unseeded cell takes its first valid return as
    /// background. Otherwise the cell seeds only after a run of
    /// consecutive mutually-consistent returns.
    #[serde(default = "default_true")]
    pub seed_from_first_observation: bool,
    /// After a reseed the cell's background is held constant this long.
    #[serde(default)]
    pub freeze_duration_ns: i64,
    /// A cell whose background has not been updated for this long is
    /// reseeded from the next candidate foreground return it sees.
    /// 0 disables stale reseeding.
    #[serde(default = "default_stale_reseed_secs")]
    pub stale_reseed_secs: f64,
    /// Settling requires at least this much wall clock since the first
    /// processed frame.
    #[serde(default = "default_settling_min_elapsed_secs")]
    pub settling_min_elapsed_secs: f64,
    /// Settling requires the fraction of cells updated within the
    /// trailing second to drop below this.
    #[serde(default = "default_settling_updated_fraction")]
    pub settling_updated_fraction: f32,
    /// Cadence of periodic snapshots once settled.
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: f64,
    /// Optional diagnostic window.
    #[serde(default)]
    pub debug_window: Option<DebugWindow>,
}

fn default_update_fraction() -> f32 {
    0.02
}

fn default_closeness_sensitivity() -> f32 {
    3.0
}

fn default_safety_margin_m() -> f32 {
    0.3
}

fn default_neighbor_confirmation_count() -> u8 {
    1
}

fn default_noise_relative_fraction() -> f32 {
    0.01
}

fn default_true() -> bool {
    true
}

fn default_stale_reseed_secs() -> f64 {
    60.0
}

fn default_settling_min_elapsed_secs() -> f64 {
    300.0
}

fn default_settling_updated_fraction() -> f32 {
    0.01
}

fn default_snapshot_interval_secs() -> f64 {
    600.0
}

impl Default for BackgroundParams {
    fn default() -> Self {
        Self {
            update_fraction: default_update_fraction(),
            closeness_sensitivity: default_closeness_sensitivity(),
            safety_margin_m: default_safety_margin_m(),
            neighbor_confirmation_count: default_neighbor_confirmation_count(),
            noise_relative_fraction: default_noise_relative_fraction(),
            seed_from_first_observation: default_true(),
            freeze_duration_ns: 0,
            stale_reseed_secs: default_stale_reseed_secs(),
            settling_min_elapsed_secs: default_settling_min_elapsed_secs(),
            settling_updated_fraction: default_settling_updated_fraction(),
            snapshot_interval_secs: default_snapshot_interval_secs(),
            debug_window: None,
        }
    }
}
