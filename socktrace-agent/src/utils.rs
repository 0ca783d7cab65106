use anyhow::Result;

/// Process-wide environment setup: logging and, on Linux, the memlock
/// rlimit required to map perf buffers.
pub fn init_env() -> Result<()> {
    env_logger::init();

    #[cfg(target_os = "linux")]
    {
        use nix::libc::RLIM_INFINITY;
        use nix::sys::resource::{setrlimit, Resource};

        if let Err(e) = setrlimit(Resource::RLIMIT_MEMLOCK, RLIM_INFINITY, RLIM_INFINITY) {
            log::warn!("failed to raise RLIMIT_MEMLOCK: {e}");
        }
    }

    Ok(())
}

/// True when `/proc/<tgid>/fd/<fd>` no longer exists, i.e. the process died
/// or closed the descriptor without the probes seeing it.
pub fn proc_fd_gone(tgid: u32, fd: u32) -> bool {
    !std::path::Path::new(&format!("/proc/{tgid}/fd/{fd}")).exists()
}
