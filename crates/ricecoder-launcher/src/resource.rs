//! Resource policy applied to a child right after it starts
//!
//! Affinity, working-set bounds and scheduling priority. Support is platform
//! conditional:
//!
//! | feature         | Linux | macOS / FreeBSD | Windows             | other |
//! |-----------------|-------|-----------------|---------------------|-------|
//! | affinity        | yes   | no              | affinity mask       | no    |
//! | min working set | no    | not enforced    | working-set size    | no    |
//! | max working set | no    | `RLIMIT_RSS`    | working-set size    | no    |
//! | priority class  | nice  | nice            | priority class      | no    |
//! | priority boost  | no-op | no-op           | dynamic boost       | no-op |
//!
//! Unsupported features are rejected before the process is spawned.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use crate::error::{ProcessError, Result};

/// Scheduling priority of a child process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityClass {
    Idle,
    BelowNormal,
    Normal,
    AboveNormal,
    High,
    RealTime,
}

impl PriorityClass {
    /// Unix nice value for this class
    pub fn nice_value(self) -> i32 {
        match self {
            PriorityClass::Idle => 19,
            PriorityClass::BelowNormal => 10,
            PriorityClass::Normal => 0,
            PriorityClass::AboveNormal => -5,
            PriorityClass::High => -11,
            PriorityClass::RealTime => -20,
        }
    }
}

/// CPU affinity, working-set bounds and priority for a child process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourcePolicy {
    /// CPU indices the process may run on
    pub affinity: Option<BTreeSet<usize>>,
    /// Minimum working set in bytes (not enforced on macOS / FreeBSD)
    pub min_working_set: Option<u64>,
    /// Maximum working set in bytes
    pub max_working_set: Option<u64>,
    /// Scheduling priority
    pub priority_class: Option<PriorityClass>,
    /// Dynamic priority boost (Windows only, ignored elsewhere)
    pub priority_boost: Option<bool>,
}

impl ResourcePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict the process to the given CPUs
    pub fn affinity<I>(mut self, cpus: I) -> Self
    where
        I: IntoIterator<Item = usize>,
    {
        self.affinity = Some(cpus.into_iter().collect());
        self
    }

    /// Set working-set bounds in bytes
    pub fn working_set(mut self, min: Option<u64>, max: Option<u64>) -> Self {
        self.min_working_set = min;
        self.max_working_set = max;
        self
    }

    pub fn priority_class(mut self, class: PriorityClass) -> Self {
        self.priority_class = Some(class);
        self
    }

    pub fn priority_boost(mut self, enabled: bool) -> Self {
        self.priority_boost = Some(enabled);
        self
    }

    /// True when applying the policy does nothing
    pub fn is_empty(&self) -> bool {
        self.affinity.is_none()
            && self.min_working_set.is_none()
            && self.max_working_set.is_none()
            && self.priority_class.is_none()
            && self.priority_boost.is_none()
    }

    /// Platform-independent consistency checks
    pub fn validate(&self) -> Result<()> {
        if let (Some(min), Some(max)) = (self.min_working_set, self.max_working_set) {
            if min > max {
                return Err(ProcessError::InvalidArgument(format!(
                    "minimum working set ({min}) exceeds maximum ({max})"
                )));
            }
        }
        if matches!(&self.affinity, Some(cpus) if cpus.is_empty()) {
            return Err(ProcessError::InvalidArgument(
                "processor affinity must name at least one CPU".to_string(),
            ));
        }
        Ok(())
    }

    /// Reject features this platform cannot provide
    pub fn check_platform(&self) -> Result<()> {
        if self.affinity.is_some() && !cfg!(any(target_os = "linux", windows)) {
            return Err(ProcessError::PlatformNotSupported(
                "processor affinity".to_string(),
            ));
        }
        if (self.min_working_set.is_some() || self.max_working_set.is_some())
            && !cfg!(any(target_os = "macos", target_os = "freebsd", windows))
        {
            return Err(ProcessError::PlatformNotSupported(
                "working-set limits".to_string(),
            ));
        }
        if self.priority_class.is_some() && !cfg!(any(unix, windows)) {
            return Err(ProcessError::PlatformNotSupported(
                "priority class".to_string(),
            ));
        }
        Ok(())
    }

    /// Install the parts of the policy that must run in the child before exec
    #[allow(unused_variables)]
    pub(crate) fn prepare_command(&self, cmd: &mut Command) {
        #[cfg(any(target_os = "macos", target_os = "freebsd"))]
        if let Some(max) = self.max_working_set {
            use nix::libc;

            let limit = max as libc::rlim_t;
            // SAFETY: only async-signal-safe libc calls between fork and exec.
            unsafe {
                cmd.pre_exec(move || {
                    let rl = libc::rlimit {
                        rlim_cur: limit,
                        rlim_max: limit,
                    };
                    if libc::setrlimit(libc::RLIMIT_RSS, &rl) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }
    }

    /// Apply affinity and priority to a running process
    pub(crate) fn apply(&self, pid: u32) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        self.check_platform()?;

        #[cfg(windows)]
        win::apply(pid, self)?;

        #[cfg(not(windows))]
        {
            if let Some(cpus) = &self.affinity {
                apply_affinity(pid, cpus)?;
            }

            if let Some(class) = self.priority_class {
                apply_priority(pid, class)?;
            }

            if let Some(min) = self.min_working_set {
                debug!(pid, min, "Minimum working set is not enforced on this platform");
            }

            if let Some(boost) = self.priority_boost {
                debug!(pid, boost, "Priority boost has no effect on this platform");
            }
        }

        debug!(pid, policy = ?self, "Resource policy applied");
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn apply_affinity(pid: u32, cpus: &BTreeSet<usize>) -> Result<()> {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let mut set = CpuSet::new();
    for &cpu in cpus {
        set.set(cpu).map_err(|_| {
            ProcessError::InvalidArgument(format!("CPU index {cpu} out of range"))
        })?;
    }
    sched_setaffinity(Pid::from_raw(pid as i32), &set)
        .map_err(|e| ProcessError::Io(e.into()))
}

#[cfg(not(any(target_os = "linux", windows)))]
fn apply_affinity(_pid: u32, _cpus: &BTreeSet<usize>) -> Result<()> {
    Err(ProcessError::PlatformNotSupported(
        "processor affinity".to_string(),
    ))
}

#[cfg(unix)]
fn apply_priority(pid: u32, class: PriorityClass) -> Result<()> {
    use nix::libc;

    // SAFETY: plain syscall on a pid we own.
    let rc = unsafe {
        libc::setpriority(libc::PRIO_PROCESS, pid as libc::id_t, class.nice_value())
    };
    if rc != 0 {
        return Err(ProcessError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn apply_priority(_pid: u32, _class: PriorityClass) -> Result<()> {
    Err(ProcessError::PlatformNotSupported(
        "priority class".to_string(),
    ))
}

#[cfg(windows)]
mod win {
    use std::collections::BTreeSet;

    use windows_sys::Win32::Foundation::{CloseHandle, BOOL, HANDLE};
    use windows_sys::Win32::System::Threading::{
        GetProcessWorkingSetSize, OpenProcess, SetPriorityClass, SetProcessAffinityMask,
        SetProcessPriorityBoost, SetProcessWorkingSetSize, ABOVE_NORMAL_PRIORITY_CLASS,
        BELOW_NORMAL_PRIORITY_CLASS, HIGH_PRIORITY_CLASS, IDLE_PRIORITY_CLASS,
        NORMAL_PRIORITY_CLASS, PROCESS_CREATION_FLAGS, PROCESS_QUERY_INFORMATION,
        PROCESS_SET_INFORMATION, PROCESS_SET_QUOTA, REALTIME_PRIORITY_CLASS,
    };

    use super::{PriorityClass, ResourcePolicy};
    use crate::error::{ProcessError, Result};

    /// Process handle closed on drop
    struct ProcessHandle(HANDLE);

    impl ProcessHandle {
        fn open(pid: u32) -> Result<Self> {
            let access = PROCESS_SET_INFORMATION | PROCESS_SET_QUOTA | PROCESS_QUERY_INFORMATION;
            // SAFETY: plain Win32 call; the handle is owned by the returned value.
            let handle = unsafe { OpenProcess(access, 0, pid) };
            if handle == 0 {
                return Err(last_error());
            }
            Ok(Self(handle))
        }
    }

    impl Drop for ProcessHandle {
        fn drop(&mut self) {
            // SAFETY: the handle came from OpenProcess and is closed once.
            unsafe {
                CloseHandle(self.0);
            }
        }
    }

    fn last_error() -> ProcessError {
        ProcessError::Io(std::io::Error::last_os_error())
    }

    fn check(ok: BOOL) -> Result<()> {
        if ok == 0 {
            Err(last_error())
        } else {
            Ok(())
        }
    }

    fn priority_flags(class: PriorityClass) -> PROCESS_CREATION_FLAGS {
        match class {
            PriorityClass::Idle => IDLE_PRIORITY_CLASS,
            PriorityClass::BelowNormal => BELOW_NORMAL_PRIORITY_CLASS,
            PriorityClass::Normal => NORMAL_PRIORITY_CLASS,
            PriorityClass::AboveNormal => ABOVE_NORMAL_PRIORITY_CLASS,
            PriorityClass::High => HIGH_PRIORITY_CLASS,
            PriorityClass::RealTime => REALTIME_PRIORITY_CLASS,
        }
    }

    fn affinity_mask(cpus: &BTreeSet<usize>) -> Result<usize> {
        let mut mask = 0usize;
        for &cpu in cpus {
            if cpu >= usize::BITS as usize {
                return Err(ProcessError::InvalidArgument(format!(
                    "CPU index {cpu} out of range"
                )));
            }
            mask |= 1 << cpu;
        }
        Ok(mask)
    }

    fn to_size(bytes: u64) -> Result<usize> {
        usize::try_from(bytes).map_err(|_| {
            ProcessError::InvalidArgument(format!("working set of {bytes} bytes is too large"))
        })
    }

    pub(super) fn apply(pid: u32, policy: &ResourcePolicy) -> Result<()> {
        let process = ProcessHandle::open(pid)?;

        if let Some(cpus) = &policy.affinity {
            let mask = affinity_mask(cpus)?;
            // SAFETY: valid handle with PROCESS_SET_INFORMATION.
            check(unsafe { SetProcessAffinityMask(process.0, mask) })?;
        }

        if policy.min_working_set.is_some() || policy.max_working_set.is_some() {
            let (mut min, mut max) = (0usize, 0usize);
            // SAFETY: valid handle with PROCESS_QUERY_INFORMATION; out pointers are locals.
            check(unsafe { GetProcessWorkingSetSize(process.0, &mut min, &mut max) })?;
            if let Some(bytes) = policy.min_working_set {
                min = to_size(bytes)?;
            }
            if let Some(bytes) = policy.max_working_set {
                max = to_size(bytes)?;
            }
            // SAFETY: valid handle with PROCESS_SET_QUOTA.
            check(unsafe { SetProcessWorkingSetSize(process.0, min, max) })?;
        }

        if let Some(class) = policy.priority_class {
            // SAFETY: valid handle with PROCESS_SET_INFORMATION.
            check(unsafe { SetPriorityClass(process.0, priority_flags(class)) })?;
        }

        if let Some(boost) = policy.priority_boost {
            // The call takes a "disable" flag.
            let disable = BOOL::from(!boost);
            // SAFETY: valid handle with PROCESS_SET_INFORMATION.
            check(unsafe { SetProcessPriorityBoost(process.0, disable) })?;
        }

        Ok(())
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_affinity_mask() {
            let cpus: BTreeSet<usize> = [0, 2, 3].into_iter().collect();
            assert_eq!(affinity_mask(&cpus).unwrap(), 0b1101);

            let cpus: BTreeSet<usize> = [usize::BITS as usize].into_iter().collect();
            assert!(affinity_mask(&cpus).is_err());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_policy() {
        let policy = ResourcePolicy::new();
        assert!(policy.is_empty());
        assert!(policy.validate().is_ok());
        assert!(policy.check_platform().is_ok());
    }

    #[test]
    fn test_working_set_bounds() {
        let policy = ResourcePolicy::new().working_set(Some(4096), Some(1024));
        assert!(matches!(
            policy.validate(),
            Err(ProcessError::InvalidArgument(_))
        ));

        let policy = ResourcePolicy::new().working_set(Some(1024), Some(4096));
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_empty_affinity_rejected() {
        let policy = ResourcePolicy::new().affinity(Vec::new());
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_nice_values_are_ordered() {
        let classes = [
            PriorityClass::Idle,
            PriorityClass::BelowNormal,
            PriorityClass::Normal,
            PriorityClass::AboveNormal,
            PriorityClass::High,
            PriorityClass::RealTime,
        ];
        for pair in classes.windows(2) {
            assert!(pair[0].nice_value() > pair[1].nice_value());
        }
        assert_eq!(PriorityClass::Normal.nice_value(), 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_working_set_unsupported_on_linux() {
        let policy = ResourcePolicy::new().working_set(None, Some(1 << 20));
        assert!(matches!(
            policy.check_platform(),
            Err(ProcessError::PlatformNotSupported(_))
        ));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_min_working_set_unsupported_on_linux() {
        let policy = ResourcePolicy::new().working_set(Some(1 << 20), None);
        assert!(policy.validate().is_ok());
        assert!(matches!(
            policy.check_platform(),
            Err(ProcessError::PlatformNotSupported(_))
        ));
    }

    #[cfg(any(target_os = "macos", target_os = "freebsd", windows))]
    #[test]
    fn test_working_set_supported() {
        let policy = ResourcePolicy::new().working_set(Some(1 << 20), Some(1 << 30));
        assert!(policy.check_platform().is_ok());
    }

    #[cfg(windows)]
    #[test]
    fn test_full_policy_supported_on_windows() {
        let policy = ResourcePolicy::new()
            .affinity([0])
            .working_set(Some(1 << 20), None)
            .priority_class(PriorityClass::BelowNormal)
            .priority_boost(false);
        assert!(policy.check_platform().is_ok());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_affinity_supported_on_linux() {
        let policy = ResourcePolicy::new().affinity([0]);
        assert!(policy.check_platform().is_ok());
    }
}
