//! Per-model deficit-round-robin routing state
//!
//! Each model session owns one [`ModelRoute`]: an ordered list of (backend,
//! throughput) pairs with deficit counters. Over a long horizon each
//! backend's served fraction converges to its share of the total
//! throughput. The epoch scheduler rewrites routes; the dispatch path only
//! steps them.

use lane_core::{BackendInfo, BackendRate, Error, ModelRouteUpdate, NodeId, Result};
use std::collections::HashMap;
use tracing::{debug, info};

/// DRR state for one model session
#[derive(Debug, Default)]
pub struct ModelRoute {
    model_session_id: String,
    backends: Vec<BackendRate>,
    /// Deficit counter per member backend. Invariant: every member has an
    /// entry.
    quanta: HashMap<NodeId, f64>,
    /// Serving quantum, the minimum member rate. Positive whenever the
    /// member list is non-empty.
    min_rate: f64,
    cursor: usize,
    total_throughput: f64,
}

impl ModelRoute {
    /// Create an empty route for a model session
    pub fn new(model_session_id: impl Into<String>) -> Self {
        Self {
            model_session_id: model_session_id.into(),
            ..Default::default()
        }
    }

    /// Replace the member list from a route update, preserving deficits of
    /// surviving members and the cursor position when its backend survives.
    pub fn update(&mut self, update: &ModelRouteUpdate) {
        info!("Update model route for {}", update.model_session_id);

        // Remember the currently pointed-at backend
        let current_backend_id = self
            .backends
            .get(self.cursor)
            .map(|rate| rate.info.node_id.clone());

        self.model_session_id = update.model_session_id.clone();
        self.backends = update.backend_rates.clone();

        self.min_rate = f64::MAX;
        self.total_throughput = 0.0;
        let mut member_index: HashMap<NodeId, usize> = HashMap::new();
        for (i, backend) in self.backends.iter().enumerate() {
            self.min_rate = self.min_rate.min(backend.throughput);
            self.total_throughput += backend.throughput;
            debug!("  backend {}: {} rps", backend.info.node_id, backend.throughput);
            // New members start with a full quantum so they serve promptly
            self.quanta
                .entry(backend.info.node_id.clone())
                .or_insert(backend.throughput);
            member_index.insert(backend.info.node_id.clone(), i);
        }
        debug!("  total throughput: {} rps", self.total_throughput);

        // Drop deficits of departed members
        self.quanta.retain(|id, _| member_index.contains_key(id));

        // Re-seat the cursor
        match current_backend_id.and_then(|id| member_index.get(&id).copied()) {
            Some(index) => self.cursor = index,
            None => {
                self.cursor = if self.backends.is_empty() {
                    0
                } else {
                    self.cursor % self.backends.len()
                };
            }
        }
    }

    /// Pick the backend that serves the next query.
    ///
    /// Terminates within one full revolution plus one step; more indicates
    /// corrupted deficit state and is a programming error.
    pub fn get_backend(&mut self) -> Result<BackendInfo> {
        if self.backends.is_empty() {
            return Err(Error::backend_unavailable(format!(
                "empty route for {}",
                self.model_session_id
            )));
        }

        for _ in 0..=self.backends.len() {
            let entry = &self.backends[self.cursor];
            let backend_id = entry.info.node_id.clone();
            let quantum = self
                .quanta
                .get_mut(&backend_id)
                .expect("route member without a deficit entry");
            if *quantum >= self.min_rate {
                *quantum -= self.min_rate;
                return Ok(entry.info.clone());
            }
            *quantum += entry.throughput;
            self.cursor = (self.cursor + 1) % self.backends.len();
        }
        panic!(
            "deficit round robin could not decide for {}",
            self.model_session_id
        );
    }

    /// The member list as last written by [`update`](Self::update)
    pub fn backend_rates(&self) -> &[BackendRate] {
        &self.backends
    }

    /// Sum of member throughputs
    pub fn total_throughput(&self) -> f64 {
        self.total_throughput
    }

    /// Number of member backends
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Whether the route has no members
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// The backend the cursor currently points at
    pub fn current_backend(&self) -> Option<&NodeId> {
        self.backends.get(self.cursor).map(|rate| &rate.info.node_id)
    }

    /// Rebuild the route update this state was last fed with
    pub fn to_update(&self) -> ModelRouteUpdate {
        ModelRouteUpdate {
            model_session_id: self.model_session_id.clone(),
            backend_rates: self.backends.clone(),
        }
    }
}
