use serde::{Deserialize, Serialize};

use lidar_bg_model_types::BackgroundParams;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("lookup error on variable: {source}")]
    ShellExpandLookupVarError {
        #[from]
        source: shellexpand::LookupError<std::env::VarError>,
    },
    #[error("IO error: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
    #[error("TOML deserialization error: {source}")]
    TomlDeError {
        #[from]
        source: toml::de::Error,
    },
}

type Result<T> = std::result::Result<T, Error>;

fn default_listen_addr() -> String {
    "0.0.0.0:2368".to_string()
}

fn default_recv_buffer_bytes() -> usize {
    4 * 1024 * 1024
}

fn default_motor_rpm() -> u16 {
    600
}

fn default_channels() -> u16 {
    40
}

fn default_azimuth_bins() -> u16 {
    1800
}

fn default_packet_queue_capacity() -> usize {
    1000
}

fn default_foreground_queue_capacity() -> usize {
    100
}

fn default_log_interval_secs() -> f64 {
    10.0
}

fn default_true() -> bool {
    true
}

/// Configuration of one sensor pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SweepConfig {
    /// Identifies this sensor in logs and in the snapshot store.
    pub sensor_id: String,
    /// Address the UDP listener binds.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Requested SO_RCVBUF size; failure to apply is only a warning.
    #[serde(default = "default_recv_buffer_bytes")]
    pub recv_buffer_bytes: usize,
    /// Mirror every raw datagram to this address.
    #[serde(default)]
    pub forward_addr: Option<String>,
    /// Emit re-encoded foreground packets to this address.
    #[serde(default)]
    pub foreground_addr: Option<String>,
    /// Whether incoming datagrams are parsed into points at all.
    #[serde(default = "default_true")]
    pub parse_packets: bool,
    #[serde(default = "default_motor_rpm")]
    pub motor_rpm: u16,
    #[serde(default = "default_channels")]
    pub channels: u16,
    #[serde(default = "default_azimuth_bins")]
    pub azimuth_bins: u16,
    #[serde(default)]
    pub background: BackgroundParams,
    #[serde(default = "default_packet_queue_capacity")]
    pub packet_queue_capacity: usize,
    #[serde(default = "default_foreground_queue_capacity")]
    pub foreground_queue_capacity: usize,
    /// Cadence of stats flushes and of drop summaries.
    #[serde(default = "default_log_interval_secs")]
    pub log_interval_secs: f64,
    /// SQLite file holding background snapshots. None disables
    /// persistence.
    #[serde(default)]
    pub snapshot_db: Option<std::path::PathBuf>,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            sensor_id: "lidar0".to_string(),
            listen_addr: default_listen_addr(),
            recv_buffer_bytes: default_recv_buffer_bytes(),
            forward_addr: None,
            foreground_addr: None,
            parse_packets: true,
            motor_rpm: default_motor_rpm(),
            channels: default_channels(),
            azimuth_bins: default_azimuth_bins(),
            background: BackgroundParams::default(),
            packet_queue_capacity: default_packet_queue_capacity(),
            foreground_queue_capacity: default_foreground_queue_capacity(),
            log_interval_secs: default_log_interval_secs(),
            snapshot_db: None,
        }
    }
}

/// If `path` is relative, make it relative to `dirname`.
///
/// `path` must be utf-8 encoded and can start with a tilde, which is
/// expanded to the home directory.
fn fixup_relative_path(path: &mut std::path::PathBuf, dirname: &std::path::Path) -> Result<()> {
    let pathstr = path.as_os_str().to_str().unwrap();
    let expanded = shellexpand::full(&pathstr)?;
    *path = std::path::PathBuf::from(expanded.to_string());

    if path.is_relative() {
        *path = dirname.join(&path);
    }
    Ok(())
}

/// Read and parse a configuration file, fixing up relative paths.
pub fn parse_config_file<P: AsRef<std::path::Path>>(path: P) -> Result<SweepConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)?;
    let mut cfg: SweepConfig = toml::from_str(&contents)?;
    if let Some(db) = cfg.snapshot_db.as_mut() {
        let dirname = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        fixup_relative_path(db, dirname)?;
    }
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let cfg: SweepConfig = toml::from_str("sensor_id = \"roof-ne\"").unwrap();
        assert_eq!(cfg.sensor_id, "roof-ne");
        assert_eq!(cfg.listen_addr, "0.0.0.0:2368");
        assert_eq!(cfg.motor_rpm, 600);
        assert_eq!(cfg.channels, 40);
        assert_eq!(cfg.azimuth_bins, 1800);
        assert_eq!(cfg.packet_queue_capacity, 1000);
        assert_eq!(cfg.foreground_queue_capacity, 100);
        assert!(cfg.forward_addr.is_none());
        assert!(cfg.parse_packets);
    }

    #[test]
    fn nested_background_params() {
        let cfg: SweepConfig = toml::from_str(
            "sensor_id = \"s\"\n\
             [background]\n\
             update_fraction = 0.05\n\
             neighbor_confirmation_count = 3\n",
        )
        .unwrap();
        assert_eq!(cfg.background.update_fraction, 0.05);
        assert_eq!(cfg.background.neighbor_confirmation_count, 3);
        // untouched fields keep their defaults
        assert_eq!(cfg.background.safety_margin_m, 0.3);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(toml::from_str::<SweepConfig>("sensor_id = \"s\"\nbogus = 1\n").is_err());
    }
}
