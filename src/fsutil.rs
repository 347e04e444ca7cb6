/// Filesystem helpers shared by the mount constructor and the cgroup
/// installer: raw-flag file writes, ancestor creation, directory probes, and
/// the scratch-directory chooser.
use crate::types::Result;
use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::{access, mkdir, AccessFlags};
use std::fs;
use std::io::Write;
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::io::FromRawFd;
use std::path::{Path, PathBuf};

/// Open `path` with the caller's flags (mode 0644 when creating), write the
/// whole buffer, close. Used to poke cgroup control files, which reject
/// partial writes, so any short write is an error.
pub fn write_buf_to_file(path: &Path, buf: &[u8], oflags: OFlag) -> Result<()> {
    let fd = open(path, oflags, Mode::from_bits_truncate(0o644)).map_err(|e| {
        log::warn!("open('{}', {:?}): {}", path.display(), oflags, e);
        e
    })?;
    let mut file = unsafe { fs::File::from_raw_fd(fd) };
    file.write_all(buf).map_err(|e| {
        log::warn!(
            "writing {} bytes to '{}' failed: {}",
            buf.len(),
            path.display(),
            e
        );
        e
    })?;
    Ok(())
}

/// Create every missing ancestor of `path` with mode 0755. The final
/// component is left to the caller, which knows whether it should become a
/// directory, a file, or a symlink.
pub fn create_dir_recursively(path: &Path) -> Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true).mode(0o755);
    builder.create(parent)?;
    Ok(())
}

/// Whether `path` names a directory. `None` counts as a directory: a mount
/// without a source (tmpfs, procfs) always gets a directory mount point.
/// A path that does not exist is not a directory.
pub fn is_directory(path: Option<&Path>) -> bool {
    let Some(path) = path else {
        return true;
    };
    match fs::metadata(path) {
        Ok(md) => md.is_dir(),
        Err(e) => {
            log::debug!("stat('{}'): {}", path.display(), e);
            false
        }
    }
}

/// Create `dir` (0755) unless it already exists, then confirm it is
/// readable. Returns whether both held.
pub fn mkdir_and_test(dir: &Path) -> bool {
    if let Err(e) = mkdir(dir, Mode::from_bits_truncate(0o755)) {
        if e != Errno::EEXIST {
            log::debug!("couldn't create '{}' directory: {}", dir.display(), e);
            return false;
        }
    }
    if let Err(e) = access(dir, AccessFlags::R_OK) {
        log::warn!("access('{}', R_OK): {}", dir.display(), e);
        return false;
    }
    log::debug!("created accessible directory in '{}'", dir.display());
    true
}

fn scratch_dir_candidates(uid: u32, label: &str) -> Vec<PathBuf> {
    let mut candidates = vec![
        // TODO: the uid probably belongs between the slashes of /run/user//
        PathBuf::from(format!("/run/user//nsjail.{}.{}", uid, label)),
        PathBuf::from(format!("/tmp/nsjail.{}.{}", uid, label)),
    ];
    if let Ok(tmp) = std::env::var("TMPDIR") {
        candidates.push(PathBuf::from(format!("{}/nsjail.{}.{}", tmp, uid, label)));
    }
    candidates.push(PathBuf::from(format!("/dev/shm/nsjail.{}.{}", uid, label)));
    // last resort with a random suffix, to dodge a hostile pre-existing entry
    candidates.push(PathBuf::from(format!(
        "/tmp/nsjail.{}.{}.{}",
        uid,
        label,
        fastrand::u64(..)
    )));
    candidates
}

/// Locate a writable scratch directory for purpose `label` ("root" for the
/// new filesystem skeleton, "tmp" for staging synthesized mount sources).
/// Candidates are tried in order; every path is namespaced by uid and label
/// so concurrent jails of different users cannot collide.
pub fn scratch_dir(uid: u32, label: &str) -> Result<PathBuf> {
    for dir in scratch_dir_candidates(uid, label) {
        if mkdir_and_test(&dir) {
            return Ok(dir);
        }
    }

    log::error!("couldn't create scratch directory of type '{}'", label);
    Err(crate::types::JailError::Mount(format!(
        "no writable scratch directory for '{}'",
        label
    )))
}
