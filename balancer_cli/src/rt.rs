//! Real-time setup for the control thread (Linux SCHED_FIFO / affinity /
//! mlockall; elsewhere mlockall only).
//!
//! Every step is best effort: failures are logged and the loop runs with
//! whatever was applied.

use std::sync::OnceLock;

use crate::cli::{RtArgs, RtLock};

static MEMLOCK_ONCE: OnceLock<()> = OnceLock::new();

/// What `apply` managed to set up, for logging and `--stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RtOutcome {
    pub memory_locked: bool,
    pub fifo_priority: Option<i32>,
    pub cpu: Option<usize>,
}

/// Apply the requested real-time settings to the calling thread (priority,
/// affinity) and the process (memory lock, at most once).
pub fn apply(args: &RtArgs) -> RtOutcome {
    let mut out = RtOutcome::default();
    if !args.rt {
        return out;
    }

    let lock = args.rt_lock.unwrap_or_else(RtLock::os_default);
    MEMLOCK_ONCE.get_or_init(|| match lock_memory(lock) {
        Ok(()) => {
            out.memory_locked = lock != RtLock::None;
            tracing::info!(mode = ?lock, "rt: memory lock applied");
        }
        Err(e) => tracing::warn!(mode = ?lock, error = %e, "rt: mlockall failed"),
    });

    #[cfg(target_os = "linux")]
    {
        match linux::set_fifo(args.rt_prio) {
            Ok(p) => {
                out.fifo_priority = Some(p);
                tracing::info!(priority = p, "rt: SCHED_FIFO applied");
            }
            Err(e) => tracing::warn!(error = %e, "rt: SCHED_FIFO not applied"),
        }
        let cpu = args.rt_cpu.unwrap_or(0);
        match linux::pin_to(cpu) {
            Ok(()) => {
                out.cpu = Some(cpu);
                tracing::info!(cpu, "rt: control thread pinned");
            }
            Err(e) => tracing::warn!(cpu, error = %e, "rt: affinity not applied"),
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        if args.rt_prio.is_some() || args.rt_cpu.is_some() {
            tracing::warn!("rt: priority and affinity are only supported on Linux");
        }
    }
    out
}

fn lock_memory(lock: RtLock) -> eyre::Result<()> {
    let flags = match lock {
        RtLock::None => return Ok(()),
        RtLock::Current => libc::MCL_CURRENT,
        RtLock::All => libc::MCL_CURRENT | libc::MCL_FUTURE,
    };
    // SAFETY: mlockall only takes flags and touches no Rust-managed memory.
    if unsafe { libc::mlockall(flags) } == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    let retryable = matches!(err.raw_os_error(), Some(c) if c == libc::EPERM || c == libc::ENOMEM);
    if lock == RtLock::All && retryable {
        // SAFETY: as above.
        if unsafe { libc::mlockall(libc::MCL_CURRENT) } == 0 {
            tracing::warn!(error = %err, "rt: locking future pages failed; locked current pages only");
            return Ok(());
        }
    }
    let mut msg = format!("mlockall({lock:?}) failed: {err}");
    if retryable {
        if let Some(limit) = memlock_limit_kib() {
            msg.push_str(&format!("; memlock limit {limit} KiB"));
        }
        msg.push_str("; needs CAP_IPC_LOCK (or root) and a sufficient 'ulimit -l'");
    }
    Err(eyre::eyre!(msg))
}

/// Soft RLIMIT_MEMLOCK in KiB, `None` when unlimited or unknown.
fn memlock_limit_kib() -> Option<u64> {
    let mut rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: rlim is a valid, initialized out-parameter.
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_MEMLOCK, &mut rlim) };
    if rc != 0 || rlim.rlim_cur == libc::RLIM_INFINITY {
        return None;
    }
    Some(rlim.rlim_cur as u64 / 1024)
}

#[cfg(target_os = "linux")]
mod linux {
    /// Capacity of cpu_set_t in CPU indices (bits).
    const MAX_CPUSET_BITS: usize = std::mem::size_of::<libc::cpu_set_t>() * 8;
    const CAP_SYS_NICE_BIT: u64 = 1 << 23;

    /// CAP_SYS_NICE in the effective set, or running as root.
    fn may_set_fifo() -> bool {
        // SAFETY: geteuid has no preconditions.
        if unsafe { libc::geteuid() } == 0 {
            return true;
        }
        let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
            // Unknown: let sched_setscheduler decide.
            return true;
        };
        status
            .lines()
            .find_map(|l| l.strip_prefix("CapEff:"))
            .and_then(|hex| u64::from_str_radix(hex.trim(), 16).ok())
            .is_some_and(|caps| caps & CAP_SYS_NICE_BIT != 0)
    }

    /// Switch the calling thread to SCHED_FIFO; returns the priority used.
    pub fn set_fifo(prio: Option<i32>) -> eyre::Result<i32> {
        if !may_set_fifo() {
            eyre::bail!(
                "needs CAP_SYS_NICE or root (try: sudo setcap cap_sys_nice=ep $(which balancer))"
            );
        }
        // SAFETY: plain queries of the scheduler range.
        let (min, max) = unsafe {
            (
                libc::sched_get_priority_min(libc::SCHED_FIFO),
                libc::sched_get_priority_max(libc::SCHED_FIFO),
            )
        };
        let (min, max) = if min < 0 || max < 0 { (1, 99) } else { (min, max) };
        let p = prio.unwrap_or(max).clamp(min, max);
        let param = libc::sched_param { sched_priority: p };
        // SAFETY: pid 0 is the calling thread; param outlives the call.
        if unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(p)
    }

    /// Pin the calling thread to `cpu` if the current affinity mask allows it.
    pub fn pin_to(cpu: usize) -> eyre::Result<()> {
        if cpu >= MAX_CPUSET_BITS {
            eyre::bail!("CPU {cpu} exceeds cpu_set_t capacity {MAX_CPUSET_BITS}");
        }
        // SAFETY: sysconf has no preconditions.
        let online = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        if online < 1 {
            eyre::bail!("_SC_NPROCESSORS_ONLN < 1");
        }
        if cpu as libc::c_long >= online {
            eyre::bail!("requested CPU {cpu} >= online {online}");
        }
        let size = std::mem::size_of::<libc::cpu_set_t>();
        // SAFETY: cpu_set_t is plain data; all-zero is the empty set, and the
        // CPU_* macros stay inside it because cpu < MAX_CPUSET_BITS.
        unsafe {
            let mut allowed: libc::cpu_set_t = std::mem::zeroed();
            if libc::sched_getaffinity(0, size, &mut allowed) == 0 && !libc::CPU_ISSET(cpu, &allowed)
            {
                eyre::bail!("CPU {cpu} not permitted by current affinity mask");
            }
            let mut wanted: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_SET(cpu, &mut wanted);
            if libc::sched_setaffinity(0, size, &wanted) != 0 {
                return Err(std::io::Error::last_os_error().into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_rt_changes_nothing() {
        let out = apply(&RtArgs {
            rt: false,
            rt_prio: Some(50),
            rt_lock: Some(RtLock::All),
            rt_cpu: Some(0),
        });
        assert_eq!(out, RtOutcome::default());
    }

    #[test]
    fn lock_none_is_a_no_op() {
        assert!(lock_memory(RtLock::None).is_ok());
    }
}
