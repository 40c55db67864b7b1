use core_affinity::CoreId;
use tracing::warn;

/// Scheduling class for a driver agent thread. Anything other than
/// `OSDefault` asks the kernel for `SCHED_FIFO` at the mapped priority;
/// without CAP_SYS_NICE the request fails and the thread stays on the
/// default scheduler.
#[derive(Clone, Copy, Debug)]
pub enum ThreadPriority {
    OSDefault,
    Low,
    Medium,
    High,
    Custom(i32),
}

impl ThreadPriority {
    fn fifo_priority(self) -> Option<i32> {
        match self {
            ThreadPriority::OSDefault => None,
            ThreadPriority::Low => Some(35),
            ThreadPriority::Medium => Some(55),
            ThreadPriority::High => Some(70),
            ThreadPriority::Custom(priority) => Some(priority),
        }
    }
}

/// Pins the calling thread to `core` (when given) and applies the requested
/// scheduling class. Failures are logged, not fatal.
pub fn thread_boot(core: Option<usize>, prio: ThreadPriority) {
    if let Some(id) = core {
        if !core_affinity::set_for_current(CoreId { id }) {
            warn!(core = id, "couldn't pin thread to core");
        }
    }

    #[cfg(target_os = "linux")]
    if let Some(sched_priority) = prio.fifo_priority() {
        let param = libc::sched_param { sched_priority };
        let code = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
        if code != 0 {
            warn!(%code, sched_priority, "couldn't switch thread to SCHED_FIFO");
        }
    }

    #[cfg(not(target_os = "linux"))]
    if prio.fifo_priority().is_some() {
        warn!(?prio, "realtime thread priority is only supported on linux");
    }
}
