/// Core types for jail construction: error taxonomy, execution modes, and
/// the configuration record shared by the mount and cgroup subsystems.
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use thiserror::Error;

use crate::mount::MountPoint;

/// Custom error types for jail construction
#[derive(Error, Debug)]
pub enum JailError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Mount error: {0}")]
    Mount(String),

    #[error("Cgroup error: {0}")]
    Cgroup(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Process error: {0}")]
    Process(String),
}

impl From<nix::errno::Errno> for JailError {
    fn from(err: nix::errno::Errno) -> Self {
        JailError::Io(std::io::Error::from_raw_os_error(err as i32))
    }
}

/// Result type alias for jail operations
pub type Result<T> = std::result::Result<T, JailError>;

/// How the supervisor runs jailed processes. Only `StandaloneExecve` changes
/// the behavior of this crate: mounting /proc requires a process that is
/// already inside the target pid namespace, so the filesystem view is then
/// assembled by a short-lived filesystem-sharing child.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecMode {
    ListenTcp,
    StandaloneOnce,
    StandaloneExecve,
    StandaloneRerun,
}

/// Jail configuration shared between the supervising parent (cgroup
/// installation, keyed by pid) and the child (mount-namespace construction).
/// Built by the caller before cloning; nothing in it is mutated across the
/// process boundary afterwards.
#[derive(Clone, Debug)]
pub struct JailConfig {
    /// Planned filesystem assembly, applied in order. Later entries may
    /// shadow earlier ones, so insertion position matters.
    pub mountpts: VecDeque<MountPoint>,

    /// memory controller hierarchy root
    pub cgroup_mem_mount: PathBuf,
    /// parent group inside the memory hierarchy
    pub cgroup_mem_parent: String,
    /// memory limit in bytes, 0 disables the controller
    pub cgroup_mem_max: u64,

    /// pids controller hierarchy root
    pub cgroup_pids_mount: PathBuf,
    /// parent group inside the pids hierarchy
    pub cgroup_pids_parent: String,
    /// process count limit, 0 disables the controller
    pub cgroup_pids_max: u64,

    /// net_cls controller hierarchy root
    pub cgroup_net_cls_mount: PathBuf,
    /// parent group inside the net_cls hierarchy
    pub cgroup_net_cls_parent: String,
    /// network class id, 0 disables the controller
    pub cgroup_net_cls_classid: u32,

    /// cpu controller hierarchy root
    pub cgroup_cpu_mount: PathBuf,
    /// parent group inside the cpu hierarchy
    pub cgroup_cpu_parent: String,
    /// milliseconds of CPU per wall-second, 0 disables the controller
    pub cgroup_cpu_ms_per_sec: u32,

    /// uid of the invoking user, used to namespace scratch directories
    pub orig_uid: u32,

    /// chroot target, consulted only when `clone_newns` is false
    pub chroot: Option<PathBuf>,

    /// working directory inside the constructed filesystem view
    pub cwd: PathBuf,

    /// whether the child enters a fresh mount namespace
    pub clone_newns: bool,

    /// execution mode selected by the supervisor
    pub mode: ExecMode,
}

impl Default for JailConfig {
    fn default() -> Self {
        Self {
            mountpts: VecDeque::new(),
            cgroup_mem_mount: PathBuf::from("/sys/fs/cgroup/memory"),
            cgroup_mem_parent: "NSJAIL".to_string(),
            cgroup_mem_max: 0,
            cgroup_pids_mount: PathBuf::from("/sys/fs/cgroup/pids"),
            cgroup_pids_parent: "NSJAIL".to_string(),
            cgroup_pids_max: 0,
            cgroup_net_cls_mount: PathBuf::from("/sys/fs/cgroup/net_cls"),
            cgroup_net_cls_parent: "NSJAIL".to_string(),
            cgroup_net_cls_classid: 0,
            cgroup_cpu_mount: PathBuf::from("/sys/fs/cgroup/cpu"),
            cgroup_cpu_parent: "NSJAIL".to_string(),
            cgroup_cpu_ms_per_sec: 0,
            orig_uid: nix::unistd::getuid().as_raw(),
            chroot: None,
            cwd: PathBuf::from("/"),
            clone_newns: true,
            mode: ExecMode::StandaloneOnce,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_disables_all_controllers() {
        let cfg = JailConfig::default();
        assert_eq!(cfg.cgroup_mem_max, 0);
        assert_eq!(cfg.cgroup_pids_max, 0);
        assert_eq!(cfg.cgroup_net_cls_classid, 0);
        assert_eq!(cfg.cgroup_cpu_ms_per_sec, 0);
        assert!(cfg.mountpts.is_empty());
        assert!(cfg.clone_newns);
        assert_eq!(cfg.mode, ExecMode::StandaloneOnce);
    }

    #[test]
    fn test_default_config_points_at_v1_hierarchies() {
        let cfg = JailConfig::default();
        assert_eq!(cfg.cgroup_mem_mount, PathBuf::from("/sys/fs/cgroup/memory"));
        assert_eq!(cfg.cgroup_pids_mount, PathBuf::from("/sys/fs/cgroup/pids"));
        assert_eq!(
            cfg.cgroup_net_cls_mount,
            PathBuf::from("/sys/fs/cgroup/net_cls")
        );
        assert_eq!(cfg.cgroup_cpu_mount, PathBuf::from("/sys/fs/cgroup/cpu"));
        assert_eq!(cfg.cgroup_mem_parent, "NSJAIL");
    }
}
