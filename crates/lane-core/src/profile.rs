//! Calibrated model profiles and the read-only profile registry
//!
//! A model profile maps batch size to forward latency for one model on one
//! GPU. Profiles are measured offline; the dispatcher only reads them. The
//! registry is populated at startup and injected into whoever needs it, so
//! there is no process-global state.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Calibrated forward-latency model for one model on one GPU.
///
/// Forward latency is approximated as a linear function of batch size,
/// `intercept_us + slope_us * batch`, which is a close fit for CNN-style
/// workloads over the usable batch range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelProfile {
    /// Model identity this profile was measured for
    pub profile_id: String,

    /// Per-query latency slope in microseconds
    pub slope_us: f64,

    /// Fixed per-batch overhead in microseconds
    pub intercept_us: f64,

    /// Static GPU memory the loaded model occupies, in megabytes
    #[serde(default)]
    pub static_memory_mb: u64,
}

impl ModelProfile {
    /// Forward latency of one batch in microseconds
    pub fn forward_latency_us(&self, batch_size: u32) -> f64 {
        self.intercept_us + self.slope_us * f64::from(batch_size)
    }

    /// Largest batch size whose forward latency fits the full latency
    /// budget. Returns 0 when even a single query does not fit.
    pub fn max_batch_with_full_budget(&self, latency_sla_us: u64) -> u32 {
        let budget = latency_sla_us as f64;
        if self.forward_latency_us(1) > budget {
            return 0;
        }
        let batch = (budget - self.intercept_us) / self.slope_us;
        batch.floor().max(1.0) as u32
    }

    /// Queries per second the GPU sustains running this model back-to-back
    /// at its max batch under the given latency budget. Zero when the
    /// budget fits no batch at all.
    pub fn saturation_throughput(&self, latency_sla_us: u64) -> f64 {
        let max_batch = self.max_batch_with_full_budget(latency_sla_us);
        if max_batch == 0 {
            return 0.0;
        }
        f64::from(max_batch) * 1e6 / self.forward_latency_us(max_batch)
    }
}

/// One row of the on-disk profile table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileEntry {
    pub gpu_device: String,
    pub gpu_uuid: String,
    #[serde(flatten)]
    pub profile: ModelProfile,
}

/// Read-only lookup from (gpu-device, gpu-uuid, profile-id) to a model
/// profile. Populated once at startup.
#[derive(Debug, Default, Clone)]
pub struct ProfileRegistry {
    profiles: HashMap<(String, String, String), ModelProfile>,
}

impl ProfileRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the registry from a YAML profile table
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let entries: Vec<ProfileEntry> = serde_yaml::from_str(&contents)?;
        Ok(Self::from_entries(entries))
    }

    /// Build the registry from in-memory entries
    pub fn from_entries(entries: impl IntoIterator<Item = ProfileEntry>) -> Self {
        let mut registry = Self::new();
        for entry in entries {
            registry.insert(entry.gpu_device, entry.gpu_uuid, entry.profile);
        }
        registry
    }

    /// Insert a profile. Later inserts for the same key win.
    pub fn insert(
        &mut self,
        gpu_device: impl Into<String>,
        gpu_uuid: impl Into<String>,
        profile: ModelProfile,
    ) {
        let key = (gpu_device.into(), gpu_uuid.into(), profile.profile_id.clone());
        self.profiles.insert(key, profile);
    }

    /// Look up the profile for a model on a specific GPU
    pub fn get(&self, gpu_device: &str, gpu_uuid: &str, profile_id: &str) -> Option<&ModelProfile> {
        self.profiles.get(&(
            gpu_device.to_string(),
            gpu_uuid.to_string(),
            profile_id.to_string(),
        ))
    }

    /// Like [`get`](Self::get) but returns a typed error for callers that
    /// propagate
    pub fn require(&self, gpu_device: &str, gpu_uuid: &str, profile_id: &str) -> Result<&ModelProfile> {
        self.get(gpu_device, gpu_uuid, profile_id).ok_or_else(|| {
            Error::profile_missing(format!(
                "no profile for model {} on {} ({})",
                profile_id, gpu_device, gpu_uuid
            ))
        })
    }

    /// Whether any GPU in the registry has a profile for this model
    pub fn knows_model(&self, profile_id: &str) -> bool {
        self.profiles.keys().any(|(_, _, id)| id == profile_id)
    }

    /// Number of profiles loaded
    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    /// Whether the registry holds no profiles
    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(slope: f64, intercept: f64) -> ModelProfile {
        ModelProfile {
            profile_id: "tensorflow:resnet50:1".to_string(),
            slope_us: slope,
            intercept_us: intercept,
            static_memory_mb: 512,
        }
    }

    #[test]
    fn test_forward_latency_is_linear() {
        let p = profile(1000.0, 5000.0);
        assert_eq!(p.forward_latency_us(1), 6000.0);
        assert_eq!(p.forward_latency_us(10), 15000.0);
    }

    #[test]
    fn test_max_batch_fits_budget() {
        let p = profile(1000.0, 5000.0);
        // 5000 + 1000 * b <= 50000 up to b = 45
        assert_eq!(p.max_batch_with_full_budget(50_000), 45);
        assert_eq!(p.max_batch_with_full_budget(6_000), 1);
        // Even batch 1 misses a 5 ms budget
        assert_eq!(p.max_batch_with_full_budget(5_000), 0);
    }

    #[test]
    fn test_saturation_throughput() {
        let p = profile(1000.0, 5000.0);
        // max batch 45, forward latency 50 ms, so 45 / 0.05 s = 900 rps
        let rps = p.saturation_throughput(50_000);
        assert!((rps - 900.0).abs() < 1e-6, "got {}", rps);
        assert_eq!(p.saturation_throughput(5_000), 0.0);
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = ProfileRegistry::new();
        registry.insert("tesla_t4", "GPU-1234", profile(1000.0, 5000.0));

        assert!(registry.get("tesla_t4", "GPU-1234", "tensorflow:resnet50:1").is_some());
        assert!(registry.get("tesla_t4", "GPU-9999", "tensorflow:resnet50:1").is_none());
        assert!(registry.knows_model("tensorflow:resnet50:1"));
        assert!(!registry.knows_model("tensorflow:vgg16:1"));
        assert!(registry.require("tesla_t4", "GPU-9999", "tensorflow:resnet50:1").is_err());
    }
}
