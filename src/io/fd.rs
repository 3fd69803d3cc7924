use std::io;
use std::os::unix::io::RawFd;

/// Owning handle over one OS descriptor.
///
/// Closes the descriptor exactly once on drop. [`Fd::into_raw`] disarms the
/// close and hands ownership back to the caller.
#[derive(Debug)]
pub struct Fd {
    fd: Option<RawFd>,
}

impl Fd {
    pub fn from_raw(fd: RawFd) -> Self {
        debug_assert!(fd >= 0, "invalid descriptor {fd}");
        Self { fd: Some(fd) }
    }

    /// The wrapped descriptor, still owned by this handle.
    pub fn raw(&self) -> RawFd {
        self.fd.expect("descriptor was moved out")
    }

    /// Releases ownership without closing.
    pub fn into_raw(mut self) -> RawFd {
        self.fd.take().expect("descriptor was moved out")
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        if let Some(fd) = self.fd.take()
            && unsafe { libc::close(fd) } != 0
        {
            let err = io::Error::last_os_error();
            tracing::warn!(fd, error = %err, "failed to close descriptor");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::io::IntoRawFd;

    use anyhow::Result;

    use super::*;

    fn fd_is_open(fd: RawFd) -> bool {
        (unsafe { libc::fcntl(fd, libc::F_GETFD) }) != -1
    }

    #[test]
    fn test_drop_closes_the_descriptor() -> Result<()> {
        let (read, write) = nix::unistd::pipe()?;
        let raw = write.into_raw_fd();

        let handle = Fd::from_raw(raw);
        assert_eq!(handle.raw(), raw);
        assert!(fd_is_open(raw));

        drop(handle);
        assert!(!fd_is_open(raw));
        drop(read);
        Ok(())
    }

    #[test]
    fn test_into_raw_disarms_the_close() -> Result<()> {
        let (read, write) = nix::unistd::pipe()?;

        let raw = Fd::from_raw(write.into_raw_fd()).into_raw();
        assert!(fd_is_open(raw));

        assert_eq!(unsafe { libc::close(raw) }, 0);
        drop(read);
        Ok(())
    }
}
