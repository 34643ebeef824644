//! Model sessions and their canonical string keys
//!
//! A model session is a model identity together with its latency budget and
//! optional preprocessing metadata. The canonical string form is the unique
//! key for every per-model map in the dispatcher, so the format here must
//! stay stable.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A (model, version, preprocessing, latency-SLA) tuple. Immutable once
/// created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelSession {
    /// Framework that serves the model, e.g. "tensorflow"
    pub framework: String,

    /// Model name, e.g. "resnet50"
    pub model_name: String,

    /// Model version
    pub version: u32,

    /// Input image height for resizable CNNs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_height: Option<u32>,

    /// Input image width for resizable CNNs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_width: Option<u32>,

    /// Latency budget in microseconds
    pub latency_sla_us: u64,
}

impl ModelSession {
    /// Create a model session without preprocessing metadata
    pub fn new(
        framework: impl Into<String>,
        model_name: impl Into<String>,
        version: u32,
        latency_sla_us: u64,
    ) -> Self {
        Self {
            framework: framework.into(),
            model_name: model_name.into(),
            version,
            image_height: None,
            image_width: None,
            latency_sla_us,
        }
    }

    /// Set the input image dimensions
    pub fn with_image_size(mut self, height: u32, width: u32) -> Self {
        self.image_height = Some(height);
        self.image_width = Some(width);
        self
    }

    /// Canonical string form, the unique key for all per-model maps.
    ///
    /// `framework:model:version:sla`, with `HxW` inserted before the SLA
    /// when image dimensions are set.
    pub fn session_id(&self) -> String {
        match (self.image_height, self.image_width) {
            (Some(h), Some(w)) => format!(
                "{}:{}:{}:{}x{}:{}",
                self.framework, self.model_name, self.version, h, w, self.latency_sla_us
            ),
            _ => format!(
                "{}:{}:{}:{}",
                self.framework, self.model_name, self.version, self.latency_sla_us
            ),
        }
    }

    /// The model identity without the latency budget. Profiles are keyed by
    /// this, since forward latency does not depend on the SLA.
    pub fn profile_id(&self) -> String {
        match (self.image_height, self.image_width) {
            (Some(h), Some(w)) => format!(
                "{}:{}:{}:{}x{}",
                self.framework, self.model_name, self.version, h, w
            ),
            _ => format!("{}:{}:{}", self.framework, self.model_name, self.version),
        }
    }

    /// Parse the canonical string form back into a session
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        let (dims, sla_str) = match parts.len() {
            4 => (None, parts[3]),
            5 => (Some(parts[3]), parts[4]),
            _ => {
                return Err(Error::parse(format!("malformed model session id: {}", s)));
            }
        };
        let version: u32 = parts[2]
            .parse()
            .map_err(|_| Error::parse(format!("bad version in model session id: {}", s)))?;
        let latency_sla_us: u64 = sla_str
            .parse()
            .map_err(|_| Error::parse(format!("bad latency sla in model session id: {}", s)))?;
        let mut session = ModelSession::new(parts[0], parts[1], version, latency_sla_us);
        if let Some(dims) = dims {
            let (h, w) = dims
                .split_once('x')
                .ok_or_else(|| Error::parse(format!("bad image size in model session id: {}", s)))?;
            let h: u32 = h
                .parse()
                .map_err(|_| Error::parse(format!("bad image height in model session id: {}", s)))?;
            let w: u32 = w
                .parse()
                .map_err(|_| Error::parse(format!("bad image width in model session id: {}", s)))?;
            session = session.with_image_size(h, w);
        }
        Ok(session)
    }
}

impl fmt::Display for ModelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.session_id())
    }
}
