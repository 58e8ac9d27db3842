//! Loaded eBPF programs, classified by the kernel hook they attach to.
//!
//! Programs are loaded by [`Collection::load`](crate::Collection::load)
//! and land in one of the typed buckets ([`Kprobe`], [`Uprobe`],
//! [`Tracepoint`], [`SocketFilter`], [`Tracing`]) according to their spec.
//! Attaching produces [`Link`] handles that own the kernel attachment.

mod kprobe;
mod links;
mod probe;
mod socket_filter;
mod trace_point;
mod tracing;
mod uprobe;

use std::{
    cmp,
    ffi::{CStr, CString},
    io,
    os::unix::io::RawFd,
};

use libc::ENOSPC;
use log::debug;
use thiserror::Error;

pub use kprobe::{Kprobe, KprobeOptions};
pub use links::{Link, LinkSet, Pausable};
pub(crate) use links::{FdLink, PerfLink};
pub use socket_filter::{SocketFilter, SocketLink};
pub use trace_point::Tracepoint;
pub use tracing::Tracing;
pub use uprobe::{ResolveSymbolError, Uprobe, UprobeOptions};

use crate::{
    generated::bpf_insn,
    obj::{ProgramSpec, ProgramType},
    sys::{bpf_load_program, ProgLoadAttrs},
    util::{KernelVersion, KernelVersionError},
};

#[derive(Debug, Error)]
pub enum ProgramError {
    /// The `BPF_PROG_LOAD` syscall failed, usually because the verifier
    /// rejected the program.
    #[error("the BPF_PROG_LOAD syscall for `{program}` failed: {io_error}\nVerifier output:\n{verifier_log}")]
    LoadFailed {
        program: String,
        #[source]
        io_error: io::Error,
        verifier_log: String,
    },

    /// A syscall failed.
    #[error("`{call}` failed")]
    SyscallError {
        call: &'static str,
        #[source]
        io_error: io::Error,
    },

    /// Reading a sysfs/tracefs file failed.
    #[error("`{filename}`")]
    FileError {
        filename: String,
        #[source]
        io_error: io::Error,
    },

    /// A program name, license or probe target contains a NUL byte.
    #[error("invalid name `{name}`")]
    InvalidName { name: String },

    /// No tracefs mount was found.
    #[error("tracefs not found")]
    TraceFsNotFound,

    /// The kernel version could not be determined.
    #[error(transparent)]
    KernelVersion(#[from] KernelVersionError),

    /// A socket filter was attached before its socket fd was set.
    #[error("socket filter `{program}` has no socket fd set")]
    SocketFdNotSet { program: String },

    /// A uprobe was attached before its binary path was set.
    #[error("uprobe `{program}` has no binary path set")]
    BinaryPathNotSet { program: String },

    /// Resolving a uprobe symbol in the target binary failed.
    #[error("error resolving symbol: {0}")]
    ResolveSymbol(#[from] ResolveSymbolError),
}

/// A program loaded into the kernel. Owns the program file descriptor;
/// dropping the handle releases it.
#[derive(Debug)]
pub struct Program {
    pub(crate) name: String,
    pub(crate) fd: RawFd,
}

impl Program {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Program {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

const MAX_LOG_BUF_SIZE: usize = (u32::MAX >> 8) as usize;

pub(crate) struct VerifierLog {
    buf: Vec<u8>,
}

impl VerifierLog {
    fn new() -> VerifierLog {
        VerifierLog { buf: Vec::new() }
    }

    pub(crate) fn buf(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }

    fn grow(&mut self) {
        self.buf.reserve(cmp::max(
            1024 * 4,
            cmp::min(MAX_LOG_BUF_SIZE, self.buf.capacity() * 2),
        ));
        self.buf.resize(self.buf.capacity(), 0);
    }

    fn reset(&mut self) {
        if !self.buf.is_empty() {
            self.buf[0] = 0;
        }
    }

    fn truncate(&mut self) {
        if self.buf.is_empty() {
            return;
        }

        let pos = self
            .buf
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(self.buf.len() - 1);
        self.buf.truncate(pos + 1);
    }

    fn as_c_str(&self) -> Option<&CStr> {
        if self.buf.is_empty() {
            None
        } else {
            CStr::from_bytes_with_nul(&self.buf).ok()
        }
    }
}

pub(crate) fn load_program(
    name: &str,
    spec: &ProgramSpec,
    instructions: &[bpf_insn],
    verifier_logs: bool,
) -> Result<Program, ProgramError> {
    let c_name = CString::new(name).map_err(|_| ProgramError::InvalidName {
        name: name.to_owned(),
    })?;
    let license = CString::new(spec.license.as_str()).map_err(|_| ProgramError::InvalidName {
        name: spec.license.clone(),
    })?;

    // kprobe loads on pre-5.0 kernels are rejected without a matching version code
    let kern_version = match spec.ty {
        ProgramType::Kprobe => KernelVersion::current().map(|v| v.code()).unwrap_or(0),
        _ => 0,
    };

    let attrs = ProgLoadAttrs {
        prog_type: spec.ty.bpf_prog_type(),
        name: &c_name,
        insns: instructions,
        license: &license,
        kern_version,
        expected_attach_type: spec
            .attach_type
            .map(|ty| ty.bpf_attach_type())
            .unwrap_or(0),
        attach_btf_id: spec.attach_btf_id.unwrap_or(0),
    };

    let mut log = VerifierLog::new();
    if verifier_logs {
        log.grow();
    }

    let mut last_error = None;
    for attempt in 0..3 {
        log.reset();
        match bpf_load_program(&attrs, &mut log) {
            Ok(prog_fd) => {
                if verifier_logs {
                    log.truncate();
                    if let Some(output) = log.as_c_str() {
                        debug!("verifier output for `{}`: {}", name, output.to_string_lossy());
                    }
                }
                debug!("loaded program `{}` (fd {})", name, prog_fd);
                return Ok(Program {
                    name: name.to_owned(),
                    fd: prog_fd as RawFd,
                });
            }
            Err((_, io_error)) => {
                let retry = attempt == 0 || io_error.raw_os_error() == Some(ENOSPC);
                last_error = Some(io_error);
                if !retry {
                    break;
                }
                log.grow();
            }
        }
    }

    let io_error = last_error
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "BPF_PROG_LOAD did not run"));
    log.truncate();
    Err(ProgramError::LoadFailed {
        program: name.to_owned(),
        io_error,
        verifier_log: log
            .as_c_str()
            .map(|log| log.to_string_lossy().into_owned())
            .unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use std::{fs::File, os::unix::io::IntoRawFd};

    use assert_matches::assert_matches;

    use super::*;
    use crate::{
        generated::bpf_cmd,
        obj::Instruction,
        sys::{override_syscall, Syscall},
    };

    fn kprobe_spec() -> ProgramSpec {
        ProgramSpec {
            ty: ProgramType::Kprobe,
            section_name: "kprobe/do_sys_open".to_owned(),
            license: "GPL".to_owned(),
            attach_type: None,
            attach_btf_id: None,
            instructions: vec![Instruction::exit()],
        }
    }

    #[test]
    fn test_load_program() {
        override_syscall(|call| match call {
            Syscall::Bpf {
                cmd: bpf_cmd::BPF_PROG_LOAD,
                ..
            } => Ok(File::open("/dev/null").unwrap().into_raw_fd() as i64),
            _ => Err((-1, io::Error::from_raw_os_error(libc::EFAULT))),
        });

        let spec = kprobe_spec();
        let raw = [crate::generated::bpf_insn::new(0x95, 0, 0, 0, 0)];
        let program = load_program("open_probe", &spec, &raw, false).unwrap();
        assert_eq!(program.name(), "open_probe");
        assert!(program.fd() >= 0);
    }

    #[test]
    fn test_load_program_failed() {
        override_syscall(|call| match call {
            Syscall::Bpf {
                cmd: bpf_cmd::BPF_PROG_LOAD,
                ..
            } => Err((-1, io::Error::from_raw_os_error(libc::EACCES))),
            _ => Err((-1, io::Error::from_raw_os_error(libc::EFAULT))),
        });

        let spec = kprobe_spec();
        let raw = [crate::generated::bpf_insn::new(0x95, 0, 0, 0, 0)];
        assert_matches!(
            load_program("open_probe", &spec, &raw, false),
            Err(ProgramError::LoadFailed { ref program, .. }) if program == "open_probe"
        );
    }
}
