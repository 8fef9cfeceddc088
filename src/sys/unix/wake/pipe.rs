use std::io;

/// Open an anonymous pipe pair as the wake channel fallback.
///
/// Uses `pipe(2)` plus `fcntl(2)` rather than `pipe2(2)` so the same path
/// builds on platforms that never grew the latter.
pub(crate) fn open_fds() -> io::Result<[libc::c_int; 2]> {
    let mut fds: [libc::c_int; 2] = [-1, -1];
    syscall!(pipe(fds.as_mut_ptr()))?;

    for fd in fds {
        if let Err(err) = set_nonblocking_cloexec(fd) {
            unsafe {
                libc::close(fds[0]);
                libc::close(fds[1]);
            }
            return Err(err);
        }
    }
    Ok(fds)
}

fn set_nonblocking_cloexec(fd: libc::c_int) -> io::Result<()> {
    syscall!(fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC))?;
    let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
    syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK)).map(|_| ())
}
