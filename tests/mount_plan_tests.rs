use nix::mount::MsFlags;
use nsjail::mount::{
    add_mount_pt_head, add_mount_pt_tail, describe_mount_pt, flags_to_str, IsDirPolicy, MountSpec,
};
use nsjail::types::{JailConfig, JailError};

#[test]
fn test_assembly_plan_keeps_insertion_order() {
    let mut cfg = JailConfig::default();
    add_mount_pt_tail(&mut cfg, MountSpec::bind("/bin", "/bin")).unwrap();
    add_mount_pt_tail(&mut cfg, MountSpec::tmpfs("/tmp")).unwrap();
    add_mount_pt_head(&mut cfg, MountSpec::tmpfs("/")).unwrap();
    add_mount_pt_tail(&mut cfg, MountSpec::symlink("/lib", "/lib64")).unwrap();

    let dsts: Vec<&str> = cfg.mountpts.iter().map(|m| m.dst.as_str()).collect();
    assert_eq!(dsts, vec!["/", "/bin", "/tmp", "/lib64"]);
    assert!(cfg.mountpts.iter().all(|m| !m.mounted));
}

#[test]
fn test_unresolvable_env_fails_the_add_and_leaves_plan_unchanged() {
    let mut cfg = JailConfig::default();
    let res = add_mount_pt_tail(
        &mut cfg,
        MountSpec {
            src: "/data".to_string(),
            dst: "/data".to_string(),
            src_env: "NSJAIL_TEST_UNSET_VARIABLE".to_string(),
            ..Default::default()
        },
    );
    assert!(matches!(res, Err(JailError::Config(_))));
    assert!(cfg.mountpts.is_empty());
}

#[test]
fn test_flag_rendering_splits_into_known_names_plus_hex_residue() {
    let flags = MsFlags::from_bits_retain(
        MsFlags::MS_RDONLY.bits() | MsFlags::MS_NOSUID.bits() | (1 << 31),
    );
    let rendered = flags_to_str(flags);
    let parts: Vec<&str> = rendered.split('|').collect();

    assert!(parts.contains(&"MS_RDONLY"));
    assert!(parts.contains(&"MS_NOSUID"));
    let hex: Vec<&&str> = parts.iter().filter(|p| p.starts_with("0x")).collect();
    assert_eq!(hex.len(), 1);
    assert_eq!(*hex[0], "0x80000000");
}

#[test]
fn test_describe_lists_all_requested_attributes() {
    let mut cfg = JailConfig::default();
    add_mount_pt_tail(
        &mut cfg,
        MountSpec {
            src: "/usr/lib".to_string(),
            dst: "/usr/lib".to_string(),
            flags: MsFlags::MS_BIND | MsFlags::MS_REC | MsFlags::MS_RDONLY,
            is_dir: IsDirPolicy::Yes,
            is_mandatory: false,
            ..Default::default()
        },
    )
    .unwrap();

    let descr = describe_mount_pt(&cfg.mountpts[0]);
    assert!(descr.contains("src:'/usr/lib'"));
    assert!(descr.contains("dst:'/usr/lib'"));
    assert!(descr.contains("MS_BIND"));
    assert!(descr.contains("is_dir:true"));
    assert!(descr.contains("mandatory:false"));
}

#[test]
fn test_builder_shorthands_set_the_expected_fields() {
    let bind = MountSpec::bind("/bin", "/bin").read_only().optional();
    assert!(bind.flags.contains(MsFlags::MS_BIND | MsFlags::MS_REC | MsFlags::MS_RDONLY));
    assert!(!bind.is_mandatory);

    let tmpfs = MountSpec::tmpfs("/tmp");
    assert_eq!(tmpfs.fstype, "tmpfs");
    assert!(tmpfs.src.is_empty());

    let link = MountSpec::symlink("/lib", "/lib64");
    assert!(link.is_symlink);
}
