//! Configuration for the dispatcher process
//!
//! Supports YAML files with CLI overrides applied by the binary. Defaults
//! match a single-host development setup.

use crate::session::ModelSession;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration for the dispatcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// UDP port the datagram RPC server listens on
    pub udp_port: u16,

    /// Port for the stream control RPC service
    pub rpc_port: u16,

    /// Number of datagram receive tasks (each paired with one worker)
    pub num_udp_threads: usize,

    /// CPU affinity list. Empty, or exactly `2 * num_udp_threads` entries
    /// (one receive and one worker CPU per UDP thread).
    pub pin_cpus: Vec<usize>,

    /// Interval between scheduler beacons, in seconds
    pub beacon_interval_sec: u32,

    /// Forced epoch-schedule interval, in seconds
    pub epoch_interval_sec: u32,

    /// Minimum interval between triggered epoch schedules, in seconds
    pub min_epoch_sec: u32,

    /// Moving-average window for request-rate estimation, in seconds
    pub avg_interval_sec: u32,

    /// Whether the periodic epoch scheduler runs at all
    pub epoch_schedule: bool,

    /// A node missing this many consecutive beacons is declared dead
    pub dead_beacon_count: u32,

    /// Capacity of each delegate's outbound command channel
    pub delegate_channel_capacity: usize,

    /// Capacity of the ingress datagram queue
    pub ingress_queue_capacity: usize,

    /// Path to the YAML model-profile table
    pub profile_file: Option<PathBuf>,

    /// Path to the YAML static-workload file
    pub workload_file: Option<PathBuf>,

    /// Log filter, e.g. "info" or "lane_dispatch=debug"
    pub log_level: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            udp_port: 7001,
            rpc_port: 7002,
            num_udp_threads: 1,
            pin_cpus: Vec::new(),
            beacon_interval_sec: 1,
            epoch_interval_sec: 30,
            min_epoch_sec: 10,
            avg_interval_sec: 10,
            epoch_schedule: true,
            dead_beacon_count: 3,
            delegate_channel_capacity: 1024,
            ingress_queue_capacity: 4096,
            profile_file: None,
            workload_file: None,
            log_level: "info".to_string(),
        }
    }
}

impl DispatcherConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Write configuration to a YAML file
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path.as_ref(), yaml)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.num_udp_threads == 0 {
            return Err(Error::config("num_udp_threads must be at least 1"));
        }
        if !self.pin_cpus.is_empty() && self.pin_cpus.len() != 2 * self.num_udp_threads {
            return Err(Error::config(format!(
                "pin_cpus must contain exactly 2 * num_udp_threads = {} entries, got {}",
                2 * self.num_udp_threads,
                self.pin_cpus.len()
            )));
        }
        if self.beacon_interval_sec == 0 {
            return Err(Error::config("beacon_interval_sec must be positive"));
        }
        if self.min_epoch_sec > self.epoch_interval_sec {
            return Err(Error::config(
                "min_epoch_sec must not exceed epoch_interval_sec",
            ));
        }
        if self.delegate_channel_capacity == 0 || self.ingress_queue_capacity == 0 {
            return Err(Error::config("channel capacities must be positive"));
        }
        Ok(())
    }

    /// Number of per-beacon rate samples kept per model session
    pub fn history_len(&self) -> usize {
        let avg = self.avg_interval_sec * 3;
        ((avg + self.beacon_interval_sec - 1) / self.beacon_interval_sec) as usize
    }
}

/// One model workload in a static backend assignment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticWorkloadEntry {
    /// The model session this slot serves
    #[serde(flatten)]
    pub session: ModelSession,

    /// Fixed throughput share in queries per second
    #[serde(default)]
    pub rate: f64,

    /// When set, this backend acts as a backup for the session instead of
    /// serving a share of its traffic
    #[serde(default)]
    pub backup: bool,
}

/// Load the static-workload file: one entry per backend slot, each a list
/// of model workloads assigned to whichever backend takes the slot
pub fn load_static_workloads(path: impl AsRef<Path>) -> Result<Vec<Vec<StaticWorkloadEntry>>> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    Ok(serde_yaml::from_str(&contents)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = DispatcherConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.epoch_schedule);
    }

    #[test]
    fn test_pin_cpus_length_is_enforced() {
        let mut config = DispatcherConfig {
            num_udp_threads: 2,
            pin_cpus: vec![0, 1, 2, 3],
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        config.pin_cpus = vec![0, 1, 2];
        assert!(config.validate().is_err());

        config.pin_cpus.clear();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_history_len_rounds_up() {
        let config = DispatcherConfig {
            beacon_interval_sec: 1,
            avg_interval_sec: 10,
            ..Default::default()
        };
        assert_eq!(config.history_len(), 30);

        let config = DispatcherConfig {
            beacon_interval_sec: 7,
            avg_interval_sec: 10,
            ..Default::default()
        };
        // ceil(30 / 7) = 5
        assert_eq!(config.history_len(), 5);
    }

    #[test]
    fn test_yaml_round_trip() {
        let config = DispatcherConfig {
            udp_port: 9100,
            num_udp_threads: 4,
            pin_cpus: vec![0, 1, 2, 3, 4, 5, 6, 7],
            ..Default::default()
        };
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: DispatcherConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_static_workload_yaml() {
        let yaml = r#"
- - framework: tensorflow
    model_name: resnet50
    version: 1
    latency_sla_us: 50000
    rate: 120.0
  - framework: tensorflow
    model_name: vgg16
    version: 1
    latency_sla_us: 100000
    rate: 0.0
    backup: true
"#;
        let workloads: Vec<Vec<StaticWorkloadEntry>> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(workloads.len(), 1);
        assert_eq!(workloads[0].len(), 2);
        assert_eq!(workloads[0][0].rate, 120.0);
        assert!(workloads[0][1].backup);
    }
}
