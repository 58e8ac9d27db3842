//! Collection specs: parsed-but-not-yet-loaded programs and maps.

mod insn;
pub(crate) mod relocation;

use std::{collections::BTreeMap, fmt};

pub use insn::{Instruction, Register, Size};
pub use relocation::RelocationError;

use crate::generated::{bpf_attach_type, bpf_map_type, bpf_prog_type};

/// A bundle of named program and map specs, ready to be loaded with
/// [`Collection::load`](crate::Collection::load).
///
/// Loading consumes the spec; the bypass rewriter mutates program
/// instruction streams and the sentinel map in place before anything
/// reaches the kernel.
#[derive(Debug, Clone, Default)]
pub struct CollectionSpec {
    pub programs: BTreeMap<String, ProgramSpec>,
    pub maps: BTreeMap<String, MapSpec>,
}

impl CollectionSpec {
    pub fn new() -> CollectionSpec {
        CollectionSpec::default()
    }
}

/// A single eBPF program awaiting load.
#[derive(Debug, Clone)]
pub struct ProgramSpec {
    pub ty: ProgramType,
    /// The ELF section the program came from, e.g. `kprobe/do_sys_open`.
    /// Drives classification of kprobe-type and tracepoint programs.
    pub section_name: String,
    pub license: String,
    /// For tracing programs, how the kernel should hook them.
    pub attach_type: Option<AttachType>,
    /// BTF id of the traced kernel function, resolved by whoever parsed the
    /// object file. Only meaningful for tracing programs.
    pub attach_btf_id: Option<u32>,
    pub instructions: Vec<Instruction>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramType {
    Kprobe,
    TracePoint,
    SocketFilter,
    Tracing,
    Xdp,
    PerfEvent,
}

impl ProgramType {
    pub(crate) fn bpf_prog_type(self) -> bpf_prog_type::Type {
        use crate::generated::bpf_prog_type::*;
        match self {
            ProgramType::Kprobe => BPF_PROG_TYPE_KPROBE,
            ProgramType::TracePoint => BPF_PROG_TYPE_TRACEPOINT,
            ProgramType::SocketFilter => BPF_PROG_TYPE_SOCKET_FILTER,
            ProgramType::Tracing => BPF_PROG_TYPE_TRACING,
            ProgramType::Xdp => BPF_PROG_TYPE_XDP,
            ProgramType::PerfEvent => BPF_PROG_TYPE_PERF_EVENT,
        }
    }
}

/// How a tracing program hooks its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachType {
    FEntry,
    FExit,
    ModifyReturn,
}

impl AttachType {
    pub(crate) fn bpf_attach_type(self) -> bpf_attach_type::Type {
        use crate::generated::bpf_attach_type::*;
        match self {
            AttachType::FEntry => BPF_TRACE_FENTRY,
            AttachType::FExit => BPF_TRACE_FEXIT,
            AttachType::ModifyReturn => BPF_MODIFY_RETURN,
        }
    }
}

impl fmt::Display for AttachType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AttachType::FEntry => "fentry",
            AttachType::FExit => "fexit",
            AttachType::ModifyReturn => "fmod_ret",
        })
    }
}

/// An eBPF map definition. The bypass rewriter may grow `max_entries` and
/// upgrade `ty` before the map is created.
#[derive(Debug, Clone)]
pub struct MapSpec {
    pub ty: MapType,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub flags: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapType {
    Hash,
    Array,
    ProgArray,
    PerfEventArray,
    PerCpuHash,
    PerCpuArray,
}

impl MapType {
    pub(crate) fn bpf_map_type(self) -> bpf_map_type::Type {
        use crate::generated::bpf_map_type::*;
        match self {
            MapType::Hash => BPF_MAP_TYPE_HASH,
            MapType::Array => BPF_MAP_TYPE_ARRAY,
            MapType::ProgArray => BPF_MAP_TYPE_PROG_ARRAY,
            MapType::PerfEventArray => BPF_MAP_TYPE_PERF_EVENT_ARRAY,
            MapType::PerCpuHash => BPF_MAP_TYPE_PERCPU_HASH,
            MapType::PerCpuArray => BPF_MAP_TYPE_PERCPU_ARRAY,
        }
    }
}
