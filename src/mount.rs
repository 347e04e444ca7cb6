/// Mount-namespace construction: descriptor finalization, flag rendering,
/// and the assembly of a private filesystem view (scratch tmpfs root,
/// per-descriptor mounts, pivot_root, read-only re-mount pass).
use crate::fsutil;
use crate::subproc;
use crate::types::{ExecMode, JailConfig, JailError, Result};
use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::CloneFlags;
use nix::sys::stat::Mode;
use nix::sys::statvfs::{statvfs, FsFlags};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{chdir, chroot, mkdir, pivot_root, unlink};
use serde::{Deserialize, Serialize};
use std::fs;
use std::os::unix::fs::symlink;
use std::os::unix::io::FromRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// Whether a mount destination is a directory. `Maybe` is resolved during
/// descriptor finalization, before the constructor runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum IsDirPolicy {
    Yes,
    No,
    #[default]
    Maybe,
}

/// A user-requested mount, before finalization. Paths are plain strings so
/// that environment-variable prepending stays a straight concatenation.
#[derive(Clone, Debug)]
pub struct MountSpec {
    /// source path; empty means "no source" (tmpfs, procfs and friends)
    pub src: String,
    /// destination, relative to the new root
    pub dst: String,
    /// kernel filesystem type, empty for bind mounts
    pub fstype: String,
    /// options string handed to the kernel verbatim
    pub options: String,
    /// kernel mount flags
    pub flags: MsFlags,
    /// directory / file / decide-at-finalization
    pub is_dir: IsDirPolicy,
    /// whether a failure to realize this entry aborts the whole assembly
    pub is_mandatory: bool,
    /// environment variable whose value is prepended to `src`
    pub src_env: String,
    /// environment variable whose value is prepended to `dst`
    pub dst_env: String,
    /// literal file content; realized by staging a file and bind-mounting it
    pub src_content: Vec<u8>,
    /// realize as a symbolic link to `src` instead of mounting
    pub is_symlink: bool,
}

impl Default for MountSpec {
    fn default() -> Self {
        Self {
            src: String::new(),
            dst: String::new(),
            fstype: String::new(),
            options: String::new(),
            flags: MsFlags::empty(),
            is_dir: IsDirPolicy::Maybe,
            is_mandatory: true,
            src_env: String::new(),
            dst_env: String::new(),
            src_content: Vec::new(),
            is_symlink: false,
        }
    }
}

impl MountSpec {
    /// Recursive bind mount of a host path.
    pub fn bind(src: impl Into<String>, dst: impl Into<String>) -> Self {
        Self {
            src: src.into(),
            dst: dst.into(),
            flags: MsFlags::MS_BIND | MsFlags::MS_REC,
            ..Default::default()
        }
    }

    /// Fresh tmpfs at `dst`.
    pub fn tmpfs(dst: impl Into<String>) -> Self {
        Self {
            dst: dst.into(),
            fstype: "tmpfs".to_string(),
            ..Default::default()
        }
    }

    /// Symbolic link at `dst` pointing to `target`; no mount call happens.
    pub fn symlink(target: impl Into<String>, dst: impl Into<String>) -> Self {
        Self {
            src: target.into(),
            dst: dst.into(),
            is_symlink: true,
            ..Default::default()
        }
    }

    /// File at `dst` whose content is supplied in-memory.
    pub fn with_content(dst: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            dst: dst.into(),
            src_content: content,
            ..Default::default()
        }
    }

    /// Request the destination end up read-only (applied by a second
    /// re-mount pass after the whole tree is assembled).
    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.flags |= MsFlags::MS_RDONLY;
        self
    }

    /// Mark the entry optional: a failure is logged and skipped instead of
    /// aborting the assembly.
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.is_mandatory = false;
        self
    }
}

/// One finalized entry of the filesystem assembly plan.
#[derive(Clone, Debug)]
pub struct MountPoint {
    pub src: String,
    pub dst: String,
    pub fstype: String,
    pub options: String,
    pub flags: MsFlags,
    pub is_dir: bool,
    pub is_mandatory: bool,
    pub is_symlink: bool,
    pub src_content: Vec<u8>,
    /// set once the kernel mount succeeded; gates the read-only re-mount
    pub mounted: bool,
}

const MOUNT_FLAG_NAMES: &[(MsFlags, &str)] = &[
    (MsFlags::MS_RDONLY, "MS_RDONLY"),
    (MsFlags::MS_NOSUID, "MS_NOSUID"),
    (MsFlags::MS_NODEV, "MS_NODEV"),
    (MsFlags::MS_NOEXEC, "MS_NOEXEC"),
    (MsFlags::MS_SYNCHRONOUS, "MS_SYNCHRONOUS"),
    (MsFlags::MS_REMOUNT, "MS_REMOUNT"),
    (MsFlags::MS_MANDLOCK, "MS_MANDLOCK"),
    (MsFlags::MS_DIRSYNC, "MS_DIRSYNC"),
    (MsFlags::MS_NOATIME, "MS_NOATIME"),
    (MsFlags::MS_NODIRATIME, "MS_NODIRATIME"),
    (MsFlags::MS_BIND, "MS_BIND"),
    (MsFlags::MS_MOVE, "MS_MOVE"),
    (MsFlags::MS_REC, "MS_REC"),
    (MsFlags::MS_SILENT, "MS_SILENT"),
    (MsFlags::MS_POSIXACL, "MS_POSIXACL"),
    (MsFlags::MS_UNBINDABLE, "MS_UNBINDABLE"),
    (MsFlags::MS_PRIVATE, "MS_PRIVATE"),
    (MsFlags::MS_SLAVE, "MS_SLAVE"),
    (MsFlags::MS_SHARED, "MS_SHARED"),
    (MsFlags::MS_RELATIME, "MS_RELATIME"),
    (MsFlags::MS_KERNMOUNT, "MS_KERNMOUNT"),
    (MsFlags::MS_I_VERSION, "MS_I_VERSION"),
    (MsFlags::MS_STRICTATIME, "MS_STRICTATIME"),
    (MsFlags::from_bits_retain(libc::MS_LAZYTIME), "MS_LAZYTIME"),
];

/// Render a mount-flag bitmask as `NAME|NAME|...`; bits with no known name
/// are collected into a single trailing hex token.
pub fn flags_to_str(flags: MsFlags) -> String {
    let mut res = String::new();
    let mut known = MsFlags::empty();
    for (flag, name) in MOUNT_FLAG_NAMES {
        if flags.contains(*flag) {
            res.push_str(name);
            res.push('|');
        }
        known = known.union(*flag);
    }

    let residue = flags.bits() & !known.bits();
    if residue == 0 && !res.is_empty() {
        res.pop();
    } else {
        res.push_str(&format!("{:#x}", residue));
    }
    res
}

/// Diagnostic rendering of one mount point.
pub fn describe_mount_pt(mpt: &MountPoint) -> String {
    let mut descr = format!(
        "src:'{}' dst:'{}' flags:'{}' type:'{}' options:'{}' is_dir:{}",
        mpt.src,
        mpt.dst,
        flags_to_str(mpt.flags),
        mpt.fstype,
        mpt.options,
        mpt.is_dir
    );
    if !mpt.is_mandatory {
        descr.push_str(" mandatory:false");
    }
    if !mpt.src_content.is_empty() {
        descr.push_str(&format!(" src_content_len:{}", mpt.src_content.len()));
    }
    if mpt.is_symlink {
        descr.push_str(" symlink:true");
    }
    descr
}

/// Resolve environment prefixes and the is-dir tri-state, producing the
/// finalized descriptor the constructor consumes.
fn finalize(spec: MountSpec) -> Result<MountPoint> {
    let mut src = String::new();
    if !spec.src_env.is_empty() {
        match std::env::var(&spec.src_env) {
            Ok(v) => src = v,
            Err(_) => {
                log::warn!("no such envvar: '{}'", spec.src_env);
                return Err(JailError::Config(format!(
                    "unresolved environment variable '{}'",
                    spec.src_env
                )));
            }
        }
    }
    src.push_str(&spec.src);

    let mut dst = String::new();
    if !spec.dst_env.is_empty() {
        match std::env::var(&spec.dst_env) {
            Ok(v) => dst = v,
            Err(_) => {
                log::warn!("no such envvar: '{}'", spec.dst_env);
                return Err(JailError::Config(format!(
                    "unresolved environment variable '{}'",
                    spec.dst_env
                )));
            }
        }
    }
    dst.push_str(&spec.dst);

    let is_dir = match spec.is_dir {
        IsDirPolicy::Yes => true,
        IsDirPolicy::No => false,
        IsDirPolicy::Maybe => {
            if !spec.src_content.is_empty() {
                // synthesized content always becomes a file
                false
            } else if src.is_empty() {
                true
            } else if spec.flags.contains(MsFlags::MS_BIND) {
                fsutil::is_directory(Some(Path::new(&src)))
            } else {
                true
            }
        }
    };

    // synthesized content is realized as a private bind of a staged file
    let mut flags = spec.flags;
    if !spec.src_content.is_empty() {
        flags |= MsFlags::MS_BIND | MsFlags::MS_REC | MsFlags::MS_PRIVATE;
    }

    Ok(MountPoint {
        src,
        dst,
        fstype: spec.fstype,
        options: spec.options,
        flags,
        is_dir,
        is_mandatory: spec.is_mandatory,
        is_symlink: spec.is_symlink,
        src_content: spec.src_content,
        mounted: false,
    })
}

/// Finalize `spec` and prepend it to the assembly plan.
pub fn add_mount_pt_head(cfg: &mut JailConfig, spec: MountSpec) -> Result<()> {
    let mpt = finalize(spec)?;
    cfg.mountpts.push_front(mpt);
    Ok(())
}

/// Finalize `spec` and append it to the assembly plan.
pub fn add_mount_pt_tail(cfg: &mut JailConfig, spec: MountSpec) -> Result<()> {
    let mpt = finalize(spec)?;
    cfg.mountpts.push_back(mpt);
    Ok(())
}

/// Names for staged synthesized-content files; the constructor is
/// single-process, the atomic is just the safe form of a private counter.
static STAGED_FILE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Realize one descriptor under `newroot`, staging synthesized content in
/// `tmpdir`. Sets `mounted` on success.
fn mount_pt(mpt: &mut MountPoint, newroot: &Path, tmpdir: &Path) -> Result<()> {
    log::debug!("mounting '{}'", describe_mount_pt(mpt));

    let dstpath = format!("{}/{}", newroot.display(), mpt.dst);
    let mut srcpath = if mpt.src.is_empty() {
        "none".to_string()
    } else {
        mpt.src.clone()
    };

    if let Err(e) = fsutil::create_dir_recursively(Path::new(&dstpath)) {
        log::warn!("couldn't create upper directories for '{}': {}", dstpath, e);
        return Err(e);
    }

    if mpt.is_symlink {
        log::debug!("symlink('{}', '{}')", srcpath, dstpath);
        if let Err(e) = symlink(&srcpath, &dstpath) {
            log::warn!("symlink('{}', '{}'): {}", srcpath, dstpath, e);
            return Err(JailError::Mount(format!(
                "symlink('{}', '{}'): {}",
                srcpath, dstpath, e
            )));
        }
        return Ok(());
    }

    if mpt.is_dir {
        if let Err(e) = mkdir(Path::new(&dstpath), Mode::from_bits_truncate(0o711)) {
            if e != Errno::EEXIST {
                log::warn!("mkdir('{}'): {}", dstpath, e);
            }
        }
    } else {
        match open(
            Path::new(&dstpath),
            OFlag::O_CREAT | OFlag::O_RDONLY | OFlag::O_CLOEXEC,
            Mode::from_bits_truncate(0o644),
        ) {
            Ok(fd) => drop(unsafe { fs::File::from_raw_fd(fd) }),
            Err(e) => log::warn!("open('{}', O_CREAT|O_RDONLY|O_CLOEXEC, 0644): {}", dstpath, e),
        }
    }

    if !mpt.src_content.is_empty() {
        let n = STAGED_FILE_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
        srcpath = format!("{}/dynamic_file.{}", tmpdir.display(), n);
        let fd = open(
            Path::new(&srcpath),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_CLOEXEC | OFlag::O_WRONLY,
            Mode::from_bits_truncate(0o644),
        )
        .map_err(|e| {
            log::warn!("open('{}', O_CREAT|O_EXCL|O_CLOEXEC|O_WRONLY, 0644): {}", srcpath, e);
            JailError::Mount(format!("open('{}'): {}", srcpath, e))
        })?;
        let mut file = unsafe { fs::File::from_raw_fd(fd) };
        use std::io::Write;
        if let Err(e) = file.write_all(&mpt.src_content) {
            log::warn!(
                "writing {} bytes to '{}' failed: {}",
                mpt.src_content.len(),
                srcpath,
                e
            );
            return Err(e.into());
        }
        drop(file);
        mpt.flags |= MsFlags::MS_BIND | MsFlags::MS_REC | MsFlags::MS_PRIVATE;
    }

    // Mount writable first; the read-only pass after pivot applies MS_RDONLY
    let flags = mpt.flags.difference(MsFlags::MS_RDONLY);
    if let Err(e) = mount(
        Some(Path::new(&srcpath)),
        Path::new(&dstpath),
        Some(mpt.fstype.as_str()),
        flags,
        Some(mpt.options.as_str()),
    ) {
        if e == Errno::EACCES {
            log::warn!(
                "mount('{}') src:'{}' dstpath:'{}' failed: {}; try fixing this problem by \
                 applying 'chmod o+x' to the '{}' directory and its ancestors",
                describe_mount_pt(mpt),
                srcpath,
                dstpath,
                e,
                srcpath
            );
        } else {
            log::warn!(
                "mount('{}') src:'{}' dstpath:'{}' failed: {}",
                describe_mount_pt(mpt),
                srcpath,
                dstpath,
                e
            );
            if mpt.fstype == "proc" {
                log::warn!(
                    "procfs can only be mounted if the original /proc doesn't have any other \
                     file-systems mounted on top of it (e.g. /dev/null on top of /proc/kcore)"
                );
            }
        }
        return Err(JailError::Mount(format!(
            "mount src:'{}' dst:'{}': {}",
            srcpath, dstpath, e
        )));
    }
    mpt.mounted = true;

    if !mpt.src_content.is_empty() {
        // the mount pins the inode; drop the staged name
        if let Err(e) = unlink(Path::new(&srcpath)) {
            log::warn!("unlink('{}'): {}", srcpath, e);
        }
    }
    Ok(())
}

const REMOUNT_FLAG_PAIRS: &[(MsFlags, FsFlags)] = &[
    (MsFlags::MS_RDONLY, FsFlags::ST_RDONLY),
    (MsFlags::MS_NOSUID, FsFlags::ST_NOSUID),
    (MsFlags::MS_NODEV, FsFlags::ST_NODEV),
    (MsFlags::MS_NOEXEC, FsFlags::ST_NOEXEC),
    (MsFlags::MS_SYNCHRONOUS, FsFlags::ST_SYNCHRONOUS),
    (MsFlags::MS_MANDLOCK, FsFlags::ST_MANDLOCK),
    (MsFlags::MS_NOATIME, FsFlags::ST_NOATIME),
    (MsFlags::MS_NODIRATIME, FsFlags::ST_NODIRATIME),
    (MsFlags::MS_RELATIME, FsFlags::ST_RELATIME),
];

/// Re-mount a successfully mounted, read-only-requested entry as read-only,
/// preserving every flag the superblock already enforces so the remount
/// does not silently drop them.
fn remount_ro(mpt: &MountPoint) -> Result<()> {
    if !mpt.mounted {
        return Ok(());
    }
    if mpt.is_symlink {
        return Ok(());
    }
    if !mpt.flags.contains(MsFlags::MS_RDONLY) {
        return Ok(());
    }

    let vfs = loop {
        match statvfs(Path::new(&mpt.dst)) {
            Err(Errno::EINTR) => continue,
            other => break other,
        }
    }
    .map_err(|e| {
        log::warn!("statvfs('{}'): {}", mpt.dst, e);
        JailError::Mount(format!("statvfs('{}'): {}", mpt.dst, e))
    })?;

    let mut new_flags = MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | MsFlags::MS_BIND;
    for (mount_flag, vfs_flag) in REMOUNT_FLAG_PAIRS {
        if vfs.flags().contains(*vfs_flag) {
            new_flags |= *mount_flag;
        }
    }

    log::debug!(
        "re-mounting r/o '{}' (flags:{})",
        mpt.dst,
        flags_to_str(new_flags)
    );
    mount(
        Some(Path::new(&mpt.dst)),
        Path::new(&mpt.dst),
        None::<&str>,
        new_flags,
        None::<&str>,
    )
    .map_err(|e| {
        log::warn!("mount('{}', flags:{}): {}", mpt.dst, flags_to_str(new_flags), e);
        JailError::Mount(format!("remount r/o '{}': {}", mpt.dst, e))
    })
}

fn init_ns_internal(cfg: &mut JailConfig) -> Result<()> {
    // Without a fresh mount namespace any mount work would alter the global
    // namespace, so the contract degrades to a plain chroot
    if !cfg.clone_newns {
        let Some(chroot_dir) = cfg.chroot.clone() else {
            log::error!("a chroot directory is required when a new mount namespace is disabled");
            return Err(JailError::Config(
                "chroot not set and mount namespace disabled".to_string(),
            ));
        };
        chroot(&chroot_dir).map_err(|e| {
            log::error!("chroot('{}'): {}", chroot_dir.display(), e);
            JailError::Mount(format!("chroot('{}'): {}", chroot_dir.display(), e))
        })?;
        chdir("/").map_err(|e| {
            log::error!("chdir('/'): {}", e);
            JailError::Mount(format!("chdir('/'): {}", e))
        })?;
        return Ok(());
    }

    chdir("/").map_err(|e| {
        log::error!("chdir('/'): {}", e);
        JailError::Mount(format!("chdir('/'): {}", e))
    })?;

    let destdir = fsutil::scratch_dir(cfg.orig_uid, "root").map_err(|e| {
        log::error!("couldn't obtain root mount directory");
        e
    })?;

    // Make / (recursively) private so nothing propagates back to the host
    mount(
        Some("/"),
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| {
        log::error!("mount('/', '/', MS_REC|MS_PRIVATE): {}", e);
        JailError::Mount(format!("mount('/', MS_REC|MS_PRIVATE): {}", e))
    })?;

    mount(
        None::<&str>,
        &destdir,
        Some("tmpfs"),
        MsFlags::empty(),
        Some("size=16777216"),
    )
    .map_err(|e| {
        log::error!("mount('{}', 'tmpfs'): {}", destdir.display(), e);
        JailError::Mount(format!("mount('{}', 'tmpfs'): {}", destdir.display(), e))
    })?;

    let tmpdir = fsutil::scratch_dir(cfg.orig_uid, "tmp").map_err(|e| {
        log::error!("couldn't obtain temporary mount directory");
        e
    })?;
    mount(
        None::<&str>,
        &tmpdir,
        Some("tmpfs"),
        MsFlags::empty(),
        Some("size=16777216"),
    )
    .map_err(|e| {
        log::error!("mount('{}', 'tmpfs'): {}", tmpdir.display(), e);
        JailError::Mount(format!("mount('{}', 'tmpfs'): {}", tmpdir.display(), e))
    })?;

    for mpt in cfg.mountpts.iter_mut() {
        if let Err(e) = mount_pt(mpt, &destdir, &tmpdir) {
            if mpt.is_mandatory {
                return Err(e);
            }
        }
    }

    umount2(&tmpdir, MntFlags::MNT_DETACH).map_err(|e| {
        log::error!("umount2('{}', MNT_DETACH): {}", tmpdir.display(), e);
        JailError::Mount(format!("umount2('{}'): {}", tmpdir.display(), e))
    })?;

    // pivot_root with the same directory for new-root and put-old: the old
    // root ends up stacked on top of the new one, and a lazy detach of /
    // drops it. This avoids having to carry a put-old directory inside the
    // freshly assembled tree.
    pivot_root(&destdir, &destdir).map_err(|e| {
        log::error!(
            "pivot_root('{}', '{}'): {}",
            destdir.display(),
            destdir.display(),
            e
        );
        JailError::Mount(format!("pivot_root('{}'): {}", destdir.display(), e))
    })?;

    umount2("/", MntFlags::MNT_DETACH).map_err(|e| {
        log::error!("umount2('/', MNT_DETACH): {}", e);
        JailError::Mount(format!("umount2('/', MNT_DETACH): {}", e))
    })?;

    chdir(cfg.cwd.as_path()).map_err(|e| {
        log::error!("chdir('{}'): {}", cfg.cwd.display(), e);
        JailError::Mount(format!("chdir('{}'): {}", cfg.cwd.display(), e))
    })?;

    for mpt in cfg.mountpts.iter() {
        if let Err(e) = remount_ro(mpt) {
            if mpt.is_mandatory {
                return Err(e);
            }
        }
    }

    Ok(())
}

/// Construct the filesystem view described by `cfg`.
///
/// Must run inside the child's fresh mount namespace (or, with
/// `clone_newns` disabled, in a caller that accepts a plain chroot). In
/// standalone-execve mode /proc has to be mounted by a process that is
/// already inside the target pid namespace, so the construction runs in a
/// filesystem-sharing sub-child which is awaited synchronously.
pub fn init_ns(cfg: &mut JailConfig) -> Result<()> {
    if cfg.mode != ExecMode::StandaloneExecve {
        return init_ns_internal(cfg);
    }

    let pid = subproc::clone_proc(CloneFlags::CLONE_FS, || {
        match init_ns_internal(cfg) {
            Ok(()) => 0,
            Err(_) => 0xff,
        }
    })?;

    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(p, code)) if p == pid => {
                if code == 0 {
                    return Ok(());
                }
                return Err(JailError::Mount(format!(
                    "mount namespace setup child exited with code {}",
                    code
                )));
            }
            Ok(WaitStatus::Signaled(p, sig, _)) if p == pid => {
                return Err(JailError::Mount(format!(
                    "mount namespace setup child killed by {}",
                    sig
                )));
            }
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                log::error!("waitpid({}): {}", pid, e);
                return Err(JailError::Process(format!("waitpid({}): {}", pid, e)));
            }
        }
    }
}
