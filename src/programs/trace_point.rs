use std::os::unix::io::RawFd;

use crate::{
    programs::{probe::find_tracefs_path, PerfLink, Program, ProgramError},
    sys::perf_event_open_trace_point,
};

/// A tracepoint program with its event group and name.
#[derive(Debug)]
pub struct Tracepoint {
    pub(crate) program: Program,
    pub(crate) group: String,
    pub(crate) name: String,
}

impl Tracepoint {
    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn attach(&self) -> Result<PerfLink, ProgramError> {
        let id = read_sys_fs_trace_point_id(&self.group, &self.name)?;
        let fd = perf_event_open_trace_point(id).map_err(|(_, io_error)| {
            ProgramError::SyscallError {
                call: "perf_event_open",
                io_error,
            }
        })? as RawFd;

        PerfLink::attach(self.program.fd, fd, None)
    }
}

fn read_sys_fs_trace_point_id(group: &str, name: &str) -> Result<u32, ProgramError> {
    let tracefs = find_tracefs_path()?;
    let file = tracefs.join("events").join(group).join(name).join("id");

    let data = std::fs::read_to_string(&file).map_err(|io_error| ProgramError::FileError {
        filename: file.display().to_string(),
        io_error,
    })?;
    data.trim().parse().map_err(|e| ProgramError::FileError {
        filename: file.display().to_string(),
        io_error: std::io::Error::new(std::io::ErrorKind::InvalidData, format!("{}", e)),
    })
}
