use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

/// Answers whether a pid currently names a live process.
///
/// The lock protocol talks to the process table only through this trait, so
/// its decisions can be tested against a fake table instead of real
/// processes.
pub trait ProcessTable {
    /// Return true if a process with this pid exists right now.
    fn exists(&self, pid: u32) -> bool;

    /// Best-effort command line of the process, for diagnostics only.
    fn command_line(&self, pid: u32) -> Option<String> {
        let _ = pid;
        None
    }
}

/// The operating system's own process table.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcessTable;

impl ProcessTable for SystemProcessTable {
    fn exists(&self, pid: u32) -> bool {
        let Ok(pid) = i32::try_from(pid) else {
            return false;
        };
        // kill(0, ..) addresses our own process group, not a process.
        if pid == 0 {
            return false;
        }
        // The null signal performs the permission and existence checks
        // without delivering anything. EPERM still means the process is
        // there, we just may not signal it.
        match kill(Pid::from_raw(pid), None) {
            Ok(()) | Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    fn command_line(&self, pid: u32) -> Option<String> {
        read_proc_cmdline(pid)
    }
}

#[cfg(target_os = "linux")]
fn read_proc_cmdline(pid: u32) -> Option<String> {
    let raw = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    // Arguments are NUL separated, with a trailing NUL.
    let joined = raw
        .split(|b| *b == 0)
        .filter(|arg| !arg.is_empty())
        .map(|arg| String::from_utf8_lossy(arg).into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    (!joined.is_empty()).then_some(joined)
}

#[cfg(not(target_os = "linux"))]
fn read_proc_cmdline(_pid: u32) -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_exists() {
        assert!(SystemProcessTable.exists(std::process::id()));
    }

    #[test]
    fn pid_zero_does_not_exist() {
        assert!(!SystemProcessTable.exists(0));
    }

    #[test]
    fn absurd_pids_do_not_exist() {
        // Far above pid_max on any supported system.
        assert!(!SystemProcessTable.exists(999_999_999));
        // Does not fit in pid_t at all.
        assert!(!SystemProcessTable.exists(u32::MAX));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn own_command_line_is_readable() {
        let cmdline = SystemProcessTable
            .command_line(std::process::id())
            .expect("test binary should have a command line");
        assert!(!cmdline.is_empty());
    }

    #[test]
    fn command_line_of_dead_process_is_none() {
        assert_eq!(SystemProcessTable.command_line(999_999_999), None);
    }
}
