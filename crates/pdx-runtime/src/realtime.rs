//! Real-time scheduling and memory locking for the periodic task thread.
//!
//! Provides platform-specific initialization for deterministic execution:
//! - Memory locking (mlockall) to prevent page faults
//! - Real-time scheduling (SCHED_FIFO/SCHED_RR) for priority execution
//! - CPU affinity to isolate the task from system housekeeping
//!
//! Everything here applies to the calling thread, so it runs on the task
//! thread itself before the first period.

#![allow(unused_imports)] // Platform-specific code may not use all imports

use pdx_common::config::{CpuAffinity, RealtimeConfig, SchedPolicy};
use pdx_common::error::{PdxError, PdxResult};
use tracing::{debug, error, info, warn};

/// Result of real-time initialization.
#[derive(Debug, Clone, Default)]
pub struct RealtimeStatus {
    /// Whether memory was locked successfully.
    pub memory_locked: bool,
    /// Applied scheduler policy.
    pub scheduler_policy: Option<SchedPolicy>,
    /// Applied scheduler priority.
    pub scheduler_priority: Option<u8>,
    /// CPUs the thread is pinned to.
    pub cpu_affinity: Option<Vec<usize>>,
}

/// Apply the real-time configuration to the calling thread.
///
/// # Errors
///
/// Returns an error if a required RT feature fails to initialize, or if
/// `fail_fast` is set and the process lacks the needed privileges.
/// Missing privileges otherwise only produce warnings.
pub fn apply_realtime(config: &RealtimeConfig, priority: u8) -> PdxResult<RealtimeStatus> {
    if !config.enabled {
        debug!("Real-time scheduling disabled in configuration");
        return Ok(RealtimeStatus::default());
    }

    if config.fail_fast {
        validate_rt_capabilities(config)?;
    }

    let memory_locked = if config.lock_memory {
        lock_memory()?
    } else {
        false
    };

    let (scheduler_policy, scheduler_priority) = set_scheduler(config.policy, priority)?;
    let cpu_affinity = set_cpu_affinity(&config.cpu_affinity)?;

    let status = RealtimeStatus {
        memory_locked,
        scheduler_policy,
        scheduler_priority,
        cpu_affinity,
    };

    info!(?status, "Real-time initialization complete");
    Ok(status)
}

/// Lock all current and future memory pages.
#[cfg(target_os = "linux")]
fn lock_memory() -> PdxResult<bool> {
    use nix::sys::mman::{mlockall, MlockAllFlags};

    match mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE) {
        Ok(()) => {
            info!("Memory locked");
            Ok(true)
        }
        Err(nix::errno::Errno::EPERM) => {
            warn!("mlockall failed with EPERM, page faults may occur during cycles");
            Ok(false)
        }
        Err(e) => Err(PdxError::Scheduler(format!("mlockall failed: {e}"))),
    }
}

#[cfg(not(target_os = "linux"))]
fn lock_memory() -> PdxResult<bool> {
    warn!("mlockall not available on this platform");
    Ok(false)
}

/// Set real-time scheduler policy and priority for the calling thread.
#[cfg(target_os = "linux")]
fn set_scheduler(
    policy: SchedPolicy,
    priority: u8,
) -> PdxResult<(Option<SchedPolicy>, Option<u8>)> {
    let linux_policy = match policy {
        SchedPolicy::Fifo => libc::SCHED_FIFO,
        SchedPolicy::Rr => libc::SCHED_RR,
        SchedPolicy::Other => {
            debug!("Using SCHED_OTHER (non-RT) scheduling");
            return Ok((Some(SchedPolicy::Other), None));
        }
    };

    let clamped = priority.clamp(1, 99);
    if clamped != priority {
        warn!(original = priority, clamped, "Task priority clamped to valid range");
    }

    let param = libc::sched_param {
        sched_priority: i32::from(clamped),
    };

    // SAFETY: param is a valid sched_param; pid 0 targets the calling thread.
    let result = unsafe { libc::sched_setscheduler(0, linux_policy, &param) };

    if result == -1 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EPERM) {
            warn!("sched_setscheduler failed with EPERM, task runs without RT priority");
            return Ok((None, None));
        }
        return Err(PdxError::Scheduler(format!(
            "sched_setscheduler failed: {err}"
        )));
    }

    info!(?policy, priority = clamped, "Real-time scheduler configured");
    Ok((Some(policy), Some(clamped)))
}

#[cfg(not(target_os = "linux"))]
fn set_scheduler(
    policy: SchedPolicy,
    priority: u8,
) -> PdxResult<(Option<SchedPolicy>, Option<u8>)> {
    warn!(?policy, priority, "Real-time scheduling not available on this platform");
    Ok((None, None))
}

/// Pin the calling thread to the configured CPUs.
#[cfg(target_os = "linux")]
fn set_cpu_affinity(affinity: &CpuAffinity) -> PdxResult<Option<Vec<usize>>> {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let cpus = match affinity {
        CpuAffinity::None => return Ok(None),
        CpuAffinity::Single(cpu) => vec![*cpu],
        CpuAffinity::Set(cpus) => cpus.clone(),
    };

    if cpus.is_empty() {
        return Ok(None);
    }

    let mut cpu_set = CpuSet::new();
    for &cpu in &cpus {
        cpu_set
            .set(cpu)
            .map_err(|e| PdxError::Config(format!("Invalid CPU index {cpu}: {e}")))?;
    }

    match sched_setaffinity(Pid::from_raw(0), &cpu_set) {
        Ok(()) => {
            info!(?cpus, "CPU affinity set");
            Ok(Some(cpus))
        }
        Err(nix::errno::Errno::EINVAL) => {
            warn!(?cpus, "Invalid CPU set - some CPUs may not exist");
            Ok(None)
        }
        Err(e) => Err(PdxError::Scheduler(format!("sched_setaffinity failed: {e}"))),
    }
}

#[cfg(not(target_os = "linux"))]
fn set_cpu_affinity(affinity: &CpuAffinity) -> PdxResult<Option<Vec<usize>>> {
    if !matches!(affinity, CpuAffinity::None) {
        warn!("CPU affinity not available on this platform");
    }
    Ok(None)
}

/// Information about real-time capabilities of the system.
#[derive(Debug, Clone, Default)]
pub struct RtCapabilities {
    /// Whether running as root.
    pub is_root: bool,
    /// RLIMIT_RTPRIO value (max RT priority allowed).
    pub rtprio_limit: Option<u64>,
    /// RLIMIT_MEMLOCK value (max lockable memory).
    pub memlock_limit: Option<u64>,
    /// Whether running on a PREEMPT_RT kernel.
    pub preempt_rt: bool,
}

impl RtCapabilities {
    /// Check if RT scheduling is likely to succeed.
    #[must_use]
    pub fn can_use_rt_scheduling(&self) -> bool {
        self.is_root || self.rtprio_limit.is_some_and(|l| l > 0)
    }

    /// Check if memory locking is likely to succeed.
    #[must_use]
    pub fn can_lock_memory(&self) -> bool {
        if self.is_root {
            return true;
        }

        #[cfg(target_family = "unix")]
        {
            self.memlock_limit.is_some_and(|l| l == libc::RLIM_INFINITY)
        }

        #[cfg(not(target_family = "unix"))]
        {
            false
        }
    }
}

/// Check if the current process has real-time capabilities.
#[cfg(target_os = "linux")]
#[must_use]
pub fn check_rt_capabilities() -> RtCapabilities {
    // SAFETY: geteuid has no preconditions.
    let mut caps = RtCapabilities {
        is_root: unsafe { libc::geteuid() } == 0,
        ..Default::default()
    };

    let mut rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: rlim is a valid, writable rlimit.
    if unsafe { libc::getrlimit(libc::RLIMIT_RTPRIO, &mut rlim) } == 0 {
        caps.rtprio_limit = Some(rlim.rlim_cur);
    }
    // SAFETY: as above.
    if unsafe { libc::getrlimit(libc::RLIMIT_MEMLOCK, &mut rlim) } == 0 {
        caps.memlock_limit = Some(rlim.rlim_cur);
    }

    if let Ok(version) = std::fs::read_to_string("/proc/version") {
        caps.preempt_rt = version.contains("PREEMPT_RT") || version.contains("PREEMPT RT");
    }

    caps
}

#[cfg(not(target_os = "linux"))]
#[must_use]
pub fn check_rt_capabilities() -> RtCapabilities {
    RtCapabilities::default()
}

/// Validate that real-time capabilities are available.
///
/// # Errors
///
/// Returns [`PdxError::Scheduler`] listing every unmet requirement. A
/// missing PREEMPT_RT kernel is only warned about.
pub fn validate_rt_capabilities(config: &RealtimeConfig) -> PdxResult<()> {
    if !config.enabled {
        return Ok(());
    }

    let caps = check_rt_capabilities();
    let mut issues = Vec::new();

    if !caps.preempt_rt {
        warn!("PREEMPT_RT kernel not detected, cycle jitter may be high");
    }

    if config.policy != SchedPolicy::Other && !caps.can_use_rt_scheduling() {
        issues.push(format!(
            "cannot use RT scheduling (SCHED_{:?}): RLIMIT_RTPRIO={:?}, is_root={}",
            config.policy, caps.rtprio_limit, caps.is_root
        ));
    }

    if config.lock_memory && !caps.can_lock_memory() {
        issues.push(format!(
            "cannot lock memory: RLIMIT_MEMLOCK={:?}, is_root={}",
            caps.memlock_limit, caps.is_root
        ));
    }

    if issues.is_empty() {
        info!("Real-time capabilities validated");
        Ok(())
    } else {
        let message = format!(
            "real-time requirements not met (fail_fast=true): {}",
            issues.join("; ")
        );
        error!("{}", message);
        Err(PdxError::Scheduler(message))
    }
}
