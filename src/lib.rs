//! Process jail construction for Linux: private mount-namespace filesystem
//! views and cgroup-v1 resource limits, driven by a shared configuration
//! record. The surrounding supervisor owns CLI parsing, privilege dropping,
//! seccomp, and process lifecycle; this crate owns the kernel-state
//! assembly that has to fail closed.

pub mod cgroup;
pub mod fsutil;
pub mod mount;
pub mod subproc;
pub mod types;
