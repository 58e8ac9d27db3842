use std::{os::unix::io::RawFd, sync::Mutex};

use libc::SOL_SOCKET;

use crate::{
    generated::{SO_ATTACH_BPF, SO_DETACH_BPF},
    programs::{Link, Pausable, Program, ProgramError},
    sys,
};

/// A socket filter program. The caller supplies the target socket by
/// setting `socket_fd` before attaching the collection.
#[derive(Debug)]
pub struct SocketFilter {
    pub(crate) program: Program,
    pub socket_fd: Option<RawFd>,
}

impl SocketFilter {
    pub fn program(&self) -> &Program {
        &self.program
    }

    pub(crate) fn attach(&self) -> Result<SocketLink, ProgramError> {
        let socket_fd = self
            .socket_fd
            .ok_or_else(|| ProgramError::SocketFdNotSet {
                program: self.program.name.clone(),
            })?;
        SocketLink::attach(socket_fd, self.program.fd)
    }
}

/// The link of an attached socket filter.
///
/// Pausing detaches the program from the socket and resuming reattaches
/// it; the link itself stays valid throughout. Close is idempotent.
#[derive(Debug)]
pub struct SocketLink {
    sock_fd: RawFd,
    prog_fd: RawFd,
    attached: Mutex<bool>,
}

impl SocketLink {
    pub(crate) fn attach(sock_fd: RawFd, prog_fd: RawFd) -> Result<SocketLink, ProgramError> {
        let link = SocketLink {
            sock_fd,
            prog_fd,
            attached: Mutex::new(false),
        };
        link.set_attached()?;
        Ok(link)
    }

    fn set_attached(&self) -> Result<(), ProgramError> {
        let mut attached = lock(&self.attached);
        if *attached {
            return Ok(());
        }

        sys::setsockopt(self.sock_fd, SOL_SOCKET, SO_ATTACH_BPF, self.prog_fd).map_err(
            |(_, io_error)| ProgramError::SyscallError {
                call: "setsockopt SO_ATTACH_BPF",
                io_error,
            },
        )?;
        *attached = true;
        Ok(())
    }

    fn set_detached(&self) -> Result<(), ProgramError> {
        let mut attached = lock(&self.attached);
        if !*attached {
            return Ok(());
        }

        sys::setsockopt(self.sock_fd, SOL_SOCKET, SO_DETACH_BPF, self.prog_fd).map_err(
            |(_, io_error)| ProgramError::SyscallError {
                call: "setsockopt SO_DETACH_BPF",
                io_error,
            },
        )?;
        *attached = false;
        Ok(())
    }
}

fn lock(attached: &Mutex<bool>) -> std::sync::MutexGuard<'_, bool> {
    match attached.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Link for SocketLink {
    fn close(&mut self) -> Result<(), ProgramError> {
        self.set_detached()
    }

    fn pausable(&mut self) -> Option<&mut dyn Pausable> {
        Some(self)
    }
}

impl Pausable for SocketLink {
    fn pause(&mut self) -> Result<(), ProgramError> {
        self.set_detached()
    }

    fn resume(&mut self) -> Result<(), ProgramError> {
        self.set_attached()
    }
}

impl Drop for SocketLink {
    fn drop(&mut self) {
        let _ = self.set_detached();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::sys::{override_syscall, Syscall};

    use super::*;

    static ATTACHES: AtomicUsize = AtomicUsize::new(0);
    static DETACHES: AtomicUsize = AtomicUsize::new(0);

    fn counting_syscall(call: Syscall) -> crate::sys::SysResult {
        match call {
            Syscall::SetSockOpt { name, .. } if name == SO_ATTACH_BPF => {
                ATTACHES.fetch_add(1, Ordering::Relaxed);
                Ok(0)
            }
            Syscall::SetSockOpt { name, .. } if name == SO_DETACH_BPF => {
                DETACHES.fetch_add(1, Ordering::Relaxed);
                Ok(0)
            }
            _ => Err((-1, std::io::Error::from_raw_os_error(libc::EFAULT))),
        }
    }

    fn reset_counters() {
        ATTACHES.store(0, Ordering::Relaxed);
        DETACHES.store(0, Ordering::Relaxed);
    }

    // the counters are process-wide, so the tests touching them run as one
    #[test]
    fn test_socket_link_lifecycle() {
        override_syscall(counting_syscall);

        // close twice detaches once
        reset_counters();
        {
            let mut link = SocketLink::attach(10, 20).unwrap();
            assert_eq!(ATTACHES.load(Ordering::Relaxed), 1);
            link.close().unwrap();
            link.close().unwrap();
            assert_eq!(DETACHES.load(Ordering::Relaxed), 1);
        }
        // drop after close is a no-op
        assert_eq!(DETACHES.load(Ordering::Relaxed), 1);

        // pause then resume restores the attachment
        reset_counters();
        {
            let mut link = SocketLink::attach(10, 20).unwrap();
            link.pause().unwrap();
            assert_eq!(DETACHES.load(Ordering::Relaxed), 1);
            link.resume().unwrap();
            assert_eq!(ATTACHES.load(Ordering::Relaxed), 2);

            // resume while attached is a no-op
            link.resume().unwrap();
            assert_eq!(ATTACHES.load(Ordering::Relaxed), 2);

            // pause twice detaches once
            link.pause().unwrap();
            link.pause().unwrap();
            assert_eq!(DETACHES.load(Ordering::Relaxed), 2);
        }
        // dropping a paused link does not detach again
        assert_eq!(DETACHES.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_attach_failure_surfaces() {
        override_syscall(|_| Err((-1, std::io::Error::from_raw_os_error(libc::EBADF))));

        assert!(matches!(
            SocketLink::attach(10, 20),
            Err(ProgramError::SyscallError { .. })
        ));
    }
}
