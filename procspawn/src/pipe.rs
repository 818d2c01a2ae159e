use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;

/// Create an anonymous pipe whose both ends are close-on-exec.
///
/// Returns `(read, write)`. Close-on-exec keeps the pipe out of every child
/// image except where a spawn explicitly rebinds one end onto a standard
/// stream number.
pub fn pipe() -> Result<(OwnedFd, OwnedFd), Errno> {
    let mut fds: [RawFd; 2] = [-1, -1];

    #[cfg(not(target_vendor = "apple"))]
    // SAFETY: fds points to two writable c_ints.
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    #[cfg(target_vendor = "apple")]
    // SAFETY: fds points to two writable c_ints.
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    Errno::result(rc)?;

    let [read, write] = fds;
    // SAFETY: pipe succeeded, so both descriptors are open and owned by nobody else.
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(read), OwnedFd::from_raw_fd(write)) };

    #[cfg(target_vendor = "apple")]
    {
        use std::os::fd::AsRawFd;
        set_cloexec(read.as_raw_fd())?;
        set_cloexec(write.as_raw_fd())?;
    }

    Ok((read, write))
}

#[cfg(target_vendor = "apple")]
fn set_cloexec(fd: RawFd) -> Result<(), Errno> {
    // SAFETY: fcntl on an fd we own; failures are reported through errno.
    let flags = Errno::result(unsafe { libc::fcntl(fd, libc::F_GETFD) })?;
    Errno::result(unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) })?;
    Ok(())
}
