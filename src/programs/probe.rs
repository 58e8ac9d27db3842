use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    os::unix::io::RawFd,
    path::Path,
    process,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{
    programs::{PerfLink, ProgramError},
    sys::{perf_event_open_probe, perf_event_open_trace_point},
};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum ProbeKind {
    KProbe,
    KRetProbe,
    UProbe,
    URetProbe,
}

impl ProbeKind {
    fn pmu(&self) -> &'static str {
        match self {
            ProbeKind::KProbe | ProbeKind::KRetProbe => "kprobe",
            ProbeKind::UProbe | ProbeKind::URetProbe => "uprobe",
        }
    }

    fn is_return(&self) -> bool {
        matches!(self, ProbeKind::KRetProbe | ProbeKind::URetProbe)
    }
}

/// A probe event created through tracefs, removed again when the owning
/// link closes.
#[derive(Debug)]
pub(crate) struct TraceEvent {
    pub(crate) kind: ProbeKind,
    pub(crate) alias: String,
}

const PROBE_EVENT_GROUP: &str = "ebpf_loader";

/// Attaches `prog_fd` to a kernel or user probe.
///
/// `max_active` is only honored for kretprobes and forces the tracefs
/// path, since the perf PMU interface cannot express it.
pub(crate) fn attach_probe(
    prog_fd: RawFd,
    kind: ProbeKind,
    target: &str,
    offset: u64,
    max_active: u32,
) -> Result<PerfLink, ProgramError> {
    if kind == ProbeKind::KRetProbe && max_active != 0 {
        let alias = create_probe_event(kind, target, max_active)?;
        let event = TraceEvent { kind, alias };
        let id = read_trace_event_id(&event)?;
        let fd = match perf_event_open_trace_point(id) {
            Ok(fd) => fd as RawFd,
            Err((_, io_error)) => {
                let _ = detach_trace_event(&event);
                return Err(ProgramError::SyscallError {
                    call: "perf_event_open",
                    io_error,
                });
            }
        };
        return PerfLink::attach(prog_fd, fd, Some(event));
    }

    let perf_ty = read_sys_fs_perf_type(kind.pmu())?;
    let ret_bit = if kind.is_return() {
        Some(read_sys_fs_perf_ret_probe(kind.pmu())?)
    } else {
        None
    };

    let fd = perf_event_open_probe(perf_ty, ret_bit, target, offset, None).map_err(
        |(_, io_error)| ProgramError::SyscallError {
            call: "perf_event_open",
            io_error,
        },
    )? as RawFd;

    PerfLink::attach(prog_fd, fd, None)
}

pub(crate) fn find_tracefs_path() -> Result<&'static Path, ProgramError> {
    lazy_static::lazy_static! {
        static ref TRACE_FS: Option<&'static Path> = {
            let known_mounts = [
                Path::new("/sys/kernel/tracing"),
                Path::new("/sys/kernel/debug/tracing"),
            ];
            known_mounts
                .into_iter()
                .find(|mount| mount.join("events").exists())
        };
    }

    TRACE_FS.ok_or(ProgramError::TraceFsNotFound)
}

fn create_probe_event(
    kind: ProbeKind,
    target: &str,
    max_active: u32,
) -> Result<String, ProgramError> {
    static COUNT: AtomicUsize = AtomicUsize::new(0);

    let tracefs = find_tracefs_path()?;
    let events_file = tracefs.join(match kind {
        ProbeKind::KProbe | ProbeKind::KRetProbe => "kprobe_events",
        ProbeKind::UProbe | ProbeKind::URetProbe => "uprobe_events",
    });

    let sanitized: String = target
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let alias = format!(
        "{}_{}_{}",
        sanitized,
        process::id(),
        COUNT.fetch_add(1, Ordering::Relaxed)
    );

    let definition = match kind {
        ProbeKind::KRetProbe if max_active != 0 => {
            format!("r{}:{}/{} {}\n", max_active, PROBE_EVENT_GROUP, alias, target)
        }
        ProbeKind::KRetProbe | ProbeKind::URetProbe => {
            format!("r:{}/{} {}\n", PROBE_EVENT_GROUP, alias, target)
        }
        ProbeKind::KProbe | ProbeKind::UProbe => {
            format!("p:{}/{} {}\n", PROBE_EVENT_GROUP, alias, target)
        }
    };

    let mut events = OpenOptions::new()
        .append(true)
        .open(&events_file)
        .map_err(|io_error| ProgramError::FileError {
            filename: events_file.display().to_string(),
            io_error,
        })?;
    events
        .write_all(definition.as_bytes())
        .map_err(|io_error| ProgramError::FileError {
            filename: events_file.display().to_string(),
            io_error,
        })?;

    Ok(alias)
}

pub(crate) fn detach_trace_event(event: &TraceEvent) -> Result<(), io::Error> {
    let tracefs = match find_tracefs_path() {
        Ok(path) => path,
        Err(_) => return Err(io::Error::new(io::ErrorKind::NotFound, "tracefs not found")),
    };
    let events_file = tracefs.join(match event.kind {
        ProbeKind::KProbe | ProbeKind::KRetProbe => "kprobe_events",
        ProbeKind::UProbe | ProbeKind::URetProbe => "uprobe_events",
    });

    let mut events = OpenOptions::new().append(true).open(events_file)?;
    events.write_all(format!("-:{}/{}\n", PROBE_EVENT_GROUP, event.alias).as_bytes())
}

fn read_trace_event_id(event: &TraceEvent) -> Result<u32, ProgramError> {
    let tracefs = find_tracefs_path()?;
    let id_file = tracefs
        .join("events")
        .join(PROBE_EVENT_GROUP)
        .join(&event.alias)
        .join("id");
    read_u32_file(&id_file.display().to_string())
}

pub(crate) fn read_sys_fs_perf_type(pmu: &str) -> Result<u32, ProgramError> {
    read_u32_file(&format!("/sys/bus/event_source/devices/{}/type", pmu))
}

fn read_sys_fs_perf_ret_probe(pmu: &str) -> Result<u32, ProgramError> {
    let file = format!("/sys/bus/event_source/devices/{}/format/retprobe", pmu);

    let data = fs::read_to_string(&file).map_err(|io_error| ProgramError::FileError {
        filename: file.clone(),
        io_error,
    })?;

    // the file contains `config:<bit>`
    let config = data.trim().rsplit(':').next().unwrap_or("");
    config.parse().map_err(|e| ProgramError::FileError {
        filename: file,
        io_error: io::Error::new(io::ErrorKind::InvalidData, format!("{}", e)),
    })
}

fn read_u32_file(file: &str) -> Result<u32, ProgramError> {
    let data = fs::read_to_string(file).map_err(|io_error| ProgramError::FileError {
        filename: file.to_owned(),
        io_error,
    })?;
    data.trim().parse().map_err(|e| ProgramError::FileError {
        filename: file.to_owned(),
        io_error: io::Error::new(io::ErrorKind::InvalidData, format!("{}", e)),
    })
}
