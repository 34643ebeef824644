//! Monotonic clock and per-query punch-clock tags
//!
//! All timestamps in the system are nanoseconds since the process monotonic
//! epoch. Hosts must agree on units; translating between hosts is the
//! transport edge's problem, not ours.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::time::Instant;

static MONOTONIC_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Nanoseconds since the process monotonic epoch
pub fn now_ns() -> u64 {
    MONOTONIC_EPOCH.elapsed().as_nanos() as u64
}

/// Monotonic nanosecond timestamps stamped onto a query at each hop.
///
/// A zero field means the hop has not been reached. Stamps are
/// non-decreasing in declaration order on any query that passed through the
/// dispatcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PunchClock {
    /// Stamped by the frontend when the user request arrived
    pub frontend_recv_ns: u64,

    /// Stamped by the dispatcher ingress when the datagram arrived
    pub dispatcher_recv_ns: u64,

    /// Stamped immediately before scheduling
    pub dispatcher_sched_ns: u64,

    /// Stamped when the batch plan is handed to the backend delegate
    pub dispatcher_dispatch_ns: u64,
}

impl PunchClock {
    /// A punch clock with only the frontend receive stamp set
    pub fn at_frontend(frontend_recv_ns: u64) -> Self {
        Self {
            frontend_recv_ns,
            ..Default::default()
        }
    }

    /// Whether the set stamps are monotonically non-decreasing in hop order
    pub fn is_ordered(&self) -> bool {
        let stamps = [
            self.frontend_recv_ns,
            self.dispatcher_recv_ns,
            self.dispatcher_sched_ns,
            self.dispatcher_dispatch_ns,
        ];
        stamps
            .iter()
            .filter(|&&ns| ns != 0)
            .try_fold(0u64, |prev, &ns| if ns >= prev { Some(ns) } else { None })
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ns_is_monotonic() {
        let a = now_ns();
        let b = now_ns();
        assert!(b >= a);
    }

    #[test]
    fn test_punch_clock_ordering() {
        let mut clock = PunchClock::at_frontend(100);
        assert!(clock.is_ordered());

        clock.dispatcher_recv_ns = 200;
        clock.dispatcher_sched_ns = 250;
        clock.dispatcher_dispatch_ns = 300;
        assert!(clock.is_ordered());

        clock.dispatcher_sched_ns = 150;
        assert!(!clock.is_ordered());
    }

    #[test]
    fn test_unset_stamps_are_skipped() {
        let clock = PunchClock {
            frontend_recv_ns: 100,
            dispatcher_recv_ns: 0,
            dispatcher_sched_ns: 250,
            dispatcher_dispatch_ns: 0,
        };
        assert!(clock.is_ordered());
    }
}
