use std::io;

/// Open an `eventfd` counter descriptor.
///
/// `eventfd` is effectively a 64 bit counter. All writes must be of 8
/// bytes (64 bits) and are added to the count; reads return the count and
/// reset it to 0. Reads and writes share one descriptor, so the write
/// slot is reported as `-1`.
pub(crate) fn open_fds() -> io::Result<[libc::c_int; 2]> {
    let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
    Ok([fd, -1])
}
