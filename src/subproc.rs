/// Subprocess clone helper for jail construction steps that must run in a
/// separate process (sharing filesystem state, entering namespaces).
use crate::types::{JailError, Result};
use nix::sched::{clone, CloneFlags};
use nix::sys::signal::Signal;
use nix::unistd::Pid;

const CHILD_STACK_SIZE: usize = 1024 * 1024;

/// Clone a child running `child_fn` and return its pid in the caller's
/// namespace. The closure's return value becomes the child's exit code.
/// The child terminates with SIGCHLD so the caller can reap it with
/// `waitpid`.
pub fn clone_proc<F>(flags: CloneFlags, child_fn: F) -> Result<Pid>
where
    F: FnMut() -> isize,
{
    let mut stack = vec![0u8; CHILD_STACK_SIZE];
    // The child gets its own copy of the address space (no CLONE_VM), so the
    // parent-side stack buffer may be freed as soon as clone returns.
    let pid = unsafe {
        clone(
            Box::new(child_fn),
            &mut stack,
            flags,
            Some(Signal::SIGCHLD as i32),
        )
    }
    .map_err(|e| {
        log::error!("clone({:?}): {}", flags, e);
        JailError::Process(format!("clone: {}", e))
    })?;
    Ok(pid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::wait::{waitpid, WaitStatus};

    #[test]
    fn test_child_exit_code_zero_means_success() {
        let pid = clone_proc(CloneFlags::empty(), || 0).unwrap();
        assert_eq!(waitpid(pid, None).unwrap(), WaitStatus::Exited(pid, 0));
    }

    #[test]
    fn test_child_failure_code_is_distinguishable() {
        let pid = clone_proc(CloneFlags::empty(), || 0xff).unwrap();
        assert_eq!(waitpid(pid, None).unwrap(), WaitStatus::Exited(pid, 0xff));
    }

    #[test]
    fn test_clone_fs_shares_working_directory() {
        // With CLONE_FS the child's chdir must be observable in the parent
        let before = std::env::current_dir().unwrap();
        let pid = clone_proc(CloneFlags::CLONE_FS, || {
            match nix::unistd::chdir("/tmp") {
                Ok(()) => 0,
                Err(_) => 1,
            }
        })
        .unwrap();
        assert_eq!(waitpid(pid, None).unwrap(), WaitStatus::Exited(pid, 0));
        assert_eq!(std::env::current_dir().unwrap(), std::path::PathBuf::from("/tmp"));
        std::env::set_current_dir(before).unwrap();
    }
}
