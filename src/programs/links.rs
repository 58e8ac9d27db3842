//! Attachment handles.

use std::os::unix::io::RawFd;

use log::warn;

use crate::{
    generated::{PERF_EVENT_IOC_DISABLE, PERF_EVENT_IOC_ENABLE, PERF_EVENT_IOC_SET_BPF},
    programs::{probe, ProgramError},
    sys::perf_event_ioctl,
};

/// An owned program↔hook attachment. Closing is idempotent; dropping a link
/// closes it.
pub trait Link: std::fmt::Debug + Send {
    fn close(&mut self) -> Result<(), ProgramError>;

    /// Links that can be paused without being torn down return themselves
    /// here.
    fn pausable(&mut self) -> Option<&mut dyn Pausable> {
        None
    }
}

/// Detach/reattach without giving up the attachment handle.
pub trait Pausable {
    fn pause(&mut self) -> Result<(), ProgramError>;
    fn resume(&mut self) -> Result<(), ProgramError>;
}

/// A link backed by a plain file descriptor (raw tracepoints, tracing
/// programs). The kernel detaches when the fd is closed.
#[derive(Debug)]
pub(crate) struct FdLink {
    fd: Option<RawFd>,
}

impl FdLink {
    pub(crate) fn new(fd: RawFd) -> FdLink {
        FdLink { fd: Some(fd) }
    }
}

impl Link for FdLink {
    fn close(&mut self) -> Result<(), ProgramError> {
        if let Some(fd) = self.fd.take() {
            unsafe { libc::close(fd) };
        }
        Ok(())
    }
}

impl Drop for FdLink {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// A link backed by a perf event with an eBPF program set on it. Closing
/// disables the event and, for probes created through tracefs, removes the
/// probe event definition.
#[derive(Debug)]
pub(crate) struct PerfLink {
    perf_fd: Option<RawFd>,
    event: Option<probe::TraceEvent>,
}

impl PerfLink {
    pub(crate) fn attach(
        prog_fd: RawFd,
        perf_fd: RawFd,
        event: Option<probe::TraceEvent>,
    ) -> Result<PerfLink, ProgramError> {
        let mut link = PerfLink {
            perf_fd: Some(perf_fd),
            event,
        };

        if let Err((_, io_error)) = perf_event_ioctl(perf_fd, PERF_EVENT_IOC_SET_BPF, prog_fd) {
            let _ = link.close();
            return Err(ProgramError::SyscallError {
                call: "PERF_EVENT_IOC_SET_BPF",
                io_error,
            });
        }
        if let Err((_, io_error)) = perf_event_ioctl(perf_fd, PERF_EVENT_IOC_ENABLE, 0) {
            let _ = link.close();
            return Err(ProgramError::SyscallError {
                call: "PERF_EVENT_IOC_ENABLE",
                io_error,
            });
        }

        Ok(link)
    }
}

impl Link for PerfLink {
    fn close(&mut self) -> Result<(), ProgramError> {
        if let Some(fd) = self.perf_fd.take() {
            let _ = perf_event_ioctl(fd, PERF_EVENT_IOC_DISABLE, 0);
            unsafe { libc::close(fd) };

            if let Some(event) = self.event.take() {
                if let Err(e) = probe::detach_trace_event(&event) {
                    warn!("failed to remove probe event {}: {}", event.alias, e);
                }
            }
        }
        Ok(())
    }
}

impl Drop for PerfLink {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// The links created by attaching a collection.
///
/// Closes every remaining link on drop, most recently attached first.
#[derive(Debug, Default)]
pub struct LinkSet {
    links: Vec<Box<dyn Link>>,
}

impl LinkSet {
    pub(crate) fn new() -> LinkSet {
        LinkSet { links: Vec::new() }
    }

    pub(crate) fn push(&mut self, link: Box<dyn Link>) {
        self.links.push(link);
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Pauses every link that supports pausing; other links are skipped.
    /// Stops at the first error.
    pub fn pause(&mut self) -> Result<(), ProgramError> {
        for link in &mut self.links {
            if let Some(pausable) = link.pausable() {
                pausable.pause()?;
            }
        }
        Ok(())
    }

    /// Resumes every link that supports pausing; other links are skipped.
    /// Stops at the first error.
    pub fn resume(&mut self) -> Result<(), ProgramError> {
        for link in &mut self.links {
            if let Some(pausable) = link.pausable() {
                pausable.resume()?;
            }
        }
        Ok(())
    }

    /// Closes every link, most recently attached first. The first error is
    /// returned but the remaining links are still closed.
    pub fn close(mut self) -> Result<(), ProgramError> {
        let mut result = Ok(());
        for link in self.links.iter_mut().rev() {
            if let Err(e) = link.close() {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        self.links.clear();
        result
    }
}

impl Drop for LinkSet {
    fn drop(&mut self) {
        for link in self.links.iter_mut().rev() {
            if let Err(e) = link.close() {
                warn!("failed to close link: {}", e);
            }
        }
    }
}
