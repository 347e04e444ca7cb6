/// Cgroup-v1 controller installation for jailed processes: one group per
/// child under each enabled controller, created and populated by the
/// supervising parent before exec, removed after the child is reaped.
use crate::fsutil;
use crate::types::{JailConfig, JailError, Result};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::unistd::{mkdir, Pid};
use std::fs;
use std::path::{Path, PathBuf};

fn child_cgroup_path(mount: &Path, parent: &str, pid: Pid) -> PathBuf {
    PathBuf::from(format!("{}/{}/NSJAIL.{}", mount.display(), parent, pid))
}

fn create_group(group: &Path, pid: Pid) -> Result<()> {
    log::debug!("create '{}' for pid={}", group.display(), pid);
    match mkdir(group, Mode::from_bits_truncate(0o700)) {
        Ok(()) | Err(Errno::EEXIST) => Ok(()),
        Err(e) => {
            log::warn!("mkdir('{}', 0700) failed: {}", group.display(), e);
            Err(JailError::Cgroup(format!(
                "mkdir('{}'): {}",
                group.display(),
                e
            )))
        }
    }
}

fn write_control_file(group: &Path, file: &str, value: &str) -> Result<()> {
    let path = group.join(file);
    log::debug!("setting '{}' to '{}'", path.display(), value);
    fsutil::write_buf_to_file(&path, value.as_bytes(), OFlag::O_WRONLY | OFlag::O_CLOEXEC)
        .map_err(|_| JailError::Cgroup(format!("could not update '{}'", path.display())))
}

fn add_pid_to_tasks(group: &Path, pid: Pid) -> Result<()> {
    let tasks = group.join("tasks");
    log::debug!("adding pid={} to '{}'", pid, tasks.display());
    fsutil::write_buf_to_file(
        &tasks,
        pid.to_string().as_bytes(),
        OFlag::O_WRONLY | OFlag::O_CLOEXEC,
    )
    .map_err(|_| JailError::Cgroup(format!("could not update '{}' task list", tasks.display())))
}

fn init_ns_from_parent_mem(cfg: &JailConfig, pid: Pid) -> Result<()> {
    if cfg.cgroup_mem_max == 0 {
        return Ok(());
    }
    let group = child_cgroup_path(&cfg.cgroup_mem_mount, &cfg.cgroup_mem_parent, pid);
    create_group(&group, pid)?;
    write_control_file(&group, "memory.limit_in_bytes", &cfg.cgroup_mem_max.to_string())?;
    // OOM-kill under memory pressure instead of freezing the group
    write_control_file(&group, "memory.oom_control", "0")?;
    add_pid_to_tasks(&group, pid)
}

fn init_ns_from_parent_pids(cfg: &JailConfig, pid: Pid) -> Result<()> {
    if cfg.cgroup_pids_max == 0 {
        return Ok(());
    }
    let group = child_cgroup_path(&cfg.cgroup_pids_mount, &cfg.cgroup_pids_parent, pid);
    create_group(&group, pid)?;
    write_control_file(&group, "pids.max", &cfg.cgroup_pids_max.to_string())?;
    add_pid_to_tasks(&group, pid)
}

fn init_ns_from_parent_net_cls(cfg: &JailConfig, pid: Pid) -> Result<()> {
    if cfg.cgroup_net_cls_classid == 0 {
        return Ok(());
    }
    let group = child_cgroup_path(&cfg.cgroup_net_cls_mount, &cfg.cgroup_net_cls_parent, pid);
    create_group(&group, pid)?;
    write_control_file(
        &group,
        "net_cls.classid",
        &format!("{:#x}", cfg.cgroup_net_cls_classid),
    )?;
    add_pid_to_tasks(&group, pid)
}

fn init_ns_from_parent_cpu(cfg: &JailConfig, pid: Pid) -> Result<()> {
    if cfg.cgroup_cpu_ms_per_sec == 0 {
        return Ok(());
    }
    let group = child_cgroup_path(&cfg.cgroup_cpu_mount, &cfg.cgroup_cpu_parent, pid);
    create_group(&group, pid)?;
    // The limit expresses milliseconds of CPU per wall-second, scheduled
    // over a one-second period
    let quota = (cfg.cgroup_cpu_ms_per_sec as u64) * 1000;
    write_control_file(&group, "cpu.cfs_quota_us", &quota.to_string())?;
    write_control_file(&group, "cpu.cfs_period_us", "1000000")?;
    add_pid_to_tasks(&group, pid)
}

/// Install every enabled controller for `pid`. Fails on the first
/// controller that cannot be fully set up; the caller is expected to abort
/// the jailed process and run `finish_from_parent` best-effort.
pub fn init_ns_from_parent(cfg: &JailConfig, pid: Pid) -> Result<()> {
    init_ns_from_parent_mem(cfg, pid)?;
    init_ns_from_parent_pids(cfg, pid)?;
    init_ns_from_parent_net_cls(cfg, pid)?;
    init_ns_from_parent_cpu(cfg, pid)
}

fn finish_one(mount: &Path, parent: &str, pid: Pid) {
    let group = child_cgroup_path(mount, parent, pid);
    log::debug!("remove '{}'", group.display());
    if let Err(e) = fs::remove_dir(&group) {
        log::warn!("rmdir('{}') failed: {}", group.display(), e);
    }
}

/// Tear down every enabled controller's per-child group. Removal failures
/// are logged and ignored: the process is gone and a lingering empty group
/// is harmless.
pub fn finish_from_parent(cfg: &JailConfig, pid: Pid) {
    if cfg.cgroup_mem_max != 0 {
        finish_one(&cfg.cgroup_mem_mount, &cfg.cgroup_mem_parent, pid);
    }
    if cfg.cgroup_pids_max != 0 {
        finish_one(&cfg.cgroup_pids_mount, &cfg.cgroup_pids_parent, pid);
    }
    if cfg.cgroup_net_cls_classid != 0 {
        finish_one(&cfg.cgroup_net_cls_mount, &cfg.cgroup_net_cls_parent, pid);
    }
    if cfg.cgroup_cpu_ms_per_sec != 0 {
        finish_one(&cfg.cgroup_cpu_mount, &cfg.cgroup_cpu_parent, pid);
    }
}
