//! PID liveness probes and child termination signals.

#[cfg(unix)]
#[allow(unsafe_code)]
pub fn pid_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    // SAFETY: kill with signal 0 performs only a permission/existence check;
    // it never delivers a signal and cannot cause undefined behavior.
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    // EPERM means the process exists but belongs to another user.
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(unix)]
#[allow(unsafe_code)]
pub fn terminate(pid: u32) {
    let Ok(pid) = i32::try_from(pid) else {
        return;
    };
    // SAFETY: pid is a valid process id; SIGTERM delivery is a plain syscall
    // with no memory-safety implications on our side.
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
pub fn kill_hard(pid: u32) {
    let Ok(pid) = i32::try_from(pid) else {
        return;
    };
    // SAFETY: as above, with SIGKILL.
    unsafe {
        libc::kill(pid, libc::SIGKILL);
    }
}

// Non-Unix hosts get conservative stubs: never claim a PID is dead (so the
// orphan sweep falls back to the mtime pass), and leave termination to the
// process handle held by the runner.

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    true
}

#[cfg(not(unix))]
pub fn terminate(_pid: u32) {}

#[cfg(not(unix))]
pub fn kill_hard(_pid: u32) {}
