use std::os::unix::io::RawFd;

use crate::{
    obj::AttachType,
    programs::{FdLink, Program, ProgramError},
    sys::bpf_raw_tracepoint_open,
};

/// A tracing (fentry/fexit) program. The target function is baked in at
/// load time through the spec's BTF id.
#[derive(Debug)]
pub struct Tracing {
    pub(crate) program: Program,
    pub(crate) attach_type: AttachType,
}

impl Tracing {
    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn attach_type(&self) -> AttachType {
        self.attach_type
    }

    pub(crate) fn attach(&self) -> Result<FdLink, ProgramError> {
        let fd = bpf_raw_tracepoint_open(None, self.program.fd).map_err(|(_, io_error)| {
            ProgramError::SyscallError {
                call: "bpf_raw_tracepoint_open",
                io_error,
            }
        })? as RawFd;

        Ok(FdLink::new(fd))
    }
}
