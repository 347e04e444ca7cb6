use nix::unistd::Pid;
use nsjail::cgroup;
use nsjail::types::JailConfig;
use serial_test::serial;
use std::fs;
use std::path::Path;
use std::process::Command;

fn cgroup_v1_available(controller: &str) -> bool {
    Path::new("/sys/fs/cgroup").join(controller).join("tasks").exists()
}

fn running_as_root() -> bool {
    nix::unistd::Uid::effective().is_root()
}

#[test]
#[serial]
fn test_memory_and_cpu_install_teardown_cycle() {
    if !running_as_root() || !cgroup_v1_available("memory") || !cgroup_v1_available("cpu") {
        println!("Skipping cgroup test - needs root and cgroup-v1 memory/cpu hierarchies");
        return;
    }

    let cfg = JailConfig {
        cgroup_mem_max: 67108864,
        cgroup_cpu_ms_per_sec: 250,
        ..Default::default()
    };
    fs::create_dir_all(cfg.cgroup_mem_mount.join(&cfg.cgroup_mem_parent)).unwrap();
    fs::create_dir_all(cfg.cgroup_cpu_mount.join(&cfg.cgroup_cpu_parent)).unwrap();

    let mut child = Command::new("sleep").arg("30").spawn().unwrap();
    let pid = Pid::from_raw(child.id() as i32);

    let installed = cgroup::init_ns_from_parent(&cfg, pid);

    let mem_group = cfg
        .cgroup_mem_mount
        .join(&cfg.cgroup_mem_parent)
        .join(format!("NSJAIL.{}", pid));
    let cpu_group = cfg
        .cgroup_cpu_mount
        .join(&cfg.cgroup_cpu_parent)
        .join(format!("NSJAIL.{}", pid));

    let checks = installed.and_then(|()| {
        let limit = fs::read_to_string(mem_group.join("memory.limit_in_bytes"))?;
        assert_eq!(limit.trim(), "67108864");

        let oom = fs::read_to_string(mem_group.join("memory.oom_control"))?;
        assert!(oom.contains("oom_kill_disable 0"));

        let tasks = fs::read_to_string(mem_group.join("tasks"))?;
        assert!(tasks.lines().any(|l| l == pid.to_string()));

        let quota = fs::read_to_string(cpu_group.join("cpu.cfs_quota_us"))?;
        assert_eq!(quota.trim(), "250000");
        let period = fs::read_to_string(cpu_group.join("cpu.cfs_period_us"))?;
        assert_eq!(period.trim(), "1000000");
        Ok(())
    });

    // reap the child before teardown so the groups are empty and removable
    let _ = child.kill();
    let _ = child.wait();
    cgroup::finish_from_parent(&cfg, pid);

    checks.unwrap();
    assert!(!mem_group.exists());
    assert!(!cpu_group.exists());
}

#[test]
#[serial]
fn test_zero_limits_touch_nothing() {
    let cfg = JailConfig::default();
    let pid = Pid::from_raw(std::process::id() as i32);

    cgroup::init_ns_from_parent(&cfg, pid).unwrap();

    let group = cfg
        .cgroup_mem_mount
        .join(&cfg.cgroup_mem_parent)
        .join(format!("NSJAIL.{}", pid));
    assert!(!group.exists());

    // teardown with everything disabled is a no-op as well
    cgroup::finish_from_parent(&cfg, pid);
}

#[test]
#[serial]
fn test_failed_install_reports_cgroup_error() {
    if running_as_root() {
        // as root the interesting failure is a missing hierarchy, covered
        // by the unit tests; this test targets the unprivileged path
        println!("Skipping unprivileged cgroup failure test - running as root");
        return;
    }
    if !cgroup_v1_available("memory") {
        println!("Skipping cgroup failure test - no cgroup-v1 memory hierarchy");
        return;
    }

    let cfg = JailConfig {
        cgroup_mem_max: 1024 * 1024,
        ..Default::default()
    };
    let res = cgroup::init_ns_from_parent(&cfg, Pid::from_raw(std::process::id() as i32));
    assert!(res.is_err());
}
