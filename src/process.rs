//! Process liveness probing.

/// Result of asking the OS whether a process id is still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// The process exists.
    Alive,
    /// The OS reported "no such process".
    Dead,
    /// The probe failed for another reason (e.g. permission denied).
    Inconclusive,
}

/// Check whether `pid` exists without signalling it.
///
/// Sends signal 0, which performs the existence and permission checks only.
/// `ESRCH` means dead; any other error, a pid that does not fit the
/// platform type, or a non-Unix platform yields [`Liveness::Inconclusive`].
#[must_use]
pub fn probe(pid: u32) -> Liveness {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return Liveness::Inconclusive;
        };
        // 0 and negative values address process groups, not a single pid.
        if raw <= 0 {
            return Liveness::Inconclusive;
        }
        match kill(Pid::from_raw(raw), None) {
            Ok(()) => Liveness::Alive,
            Err(Errno::ESRCH) => Liveness::Dead,
            Err(_) => Liveness::Inconclusive,
        }
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        Liveness::Inconclusive
    }
}
