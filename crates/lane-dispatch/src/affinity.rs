//! CPU affinity helpers
//!
//! The ingress path can pin its receive and worker threads to dedicated
//! CPUs. An affinity list that cannot be applied is a startup-time fatal
//! error; the binary validates the whole list before the runtime spins up.

use crate::Result;
use lane_core::Error;

/// Pin the calling thread to one CPU
#[cfg(target_os = "linux")]
pub fn pin_current_thread(cpu: usize) -> Result<()> {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let mut cpu_set = CpuSet::new();
    cpu_set
        .set(cpu)
        .map_err(|e| Error::affinity(format!("cpu {} out of range: {}", cpu, e)))?;
    sched_setaffinity(Pid::from_raw(0), &cpu_set)
        .map_err(|e| Error::affinity(format!("cannot pin to cpu {}: {}", cpu, e)))?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(cpu: usize) -> Result<()> {
    Err(Error::affinity(format!(
        "cpu pinning (cpu {}) is not supported on this platform",
        cpu
    ))
    .into())
}

/// Verify every CPU in the affinity list is pinnable, restoring the
/// caller's original mask afterwards
#[cfg(target_os = "linux")]
pub fn validate_pin_cpus(cpus: &[usize]) -> Result<()> {
    use nix::sched::{sched_getaffinity, sched_setaffinity};
    use nix::unistd::Pid;

    if cpus.is_empty() {
        return Ok(());
    }
    let original = sched_getaffinity(Pid::from_raw(0))
        .map_err(|e| Error::affinity(format!("cannot read affinity mask: {}", e)))?;
    let outcome = cpus.iter().try_for_each(|&cpu| pin_current_thread(cpu));
    sched_setaffinity(Pid::from_raw(0), &original)
        .map_err(|e| Error::affinity(format!("cannot restore affinity mask: {}", e)))?;
    outcome
}

#[cfg(not(target_os = "linux"))]
pub fn validate_pin_cpus(cpus: &[usize]) -> Result<()> {
    if cpus.is_empty() {
        return Ok(());
    }
    Err(Error::affinity("cpu pinning is not supported on this platform").into())
}
