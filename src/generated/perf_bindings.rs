/// `perf_event_attr` truncated at `PERF_ATTR_SIZE_VER1`; the kernel treats
/// the missing tail as zeroes. `sample_period`, `wakeup_events`, `config1`
/// and `config2` stand in for the kernel unions at those offsets.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct perf_event_attr {
    pub type_: u32,
    pub size: u32,
    pub config: u64,
    pub sample_period: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: u64,
    pub wakeup_events: u32,
    pub bp_type: u32,
    pub config1: u64,
    pub config2: u64,
}

pub const PERF_ATTR_SIZE_VER1: u32 = 72;

pub const PERF_TYPE_TRACEPOINT: u32 = 2;

pub const PERF_FLAG_FD_CLOEXEC: u32 = 8;

/* FIXME: these are arch dependent */
pub const PERF_EVENT_IOC_ENABLE: ::libc::c_ulong = 9216;
pub const PERF_EVENT_IOC_DISABLE: ::libc::c_ulong = 9217;
pub const PERF_EVENT_IOC_SET_BPF: ::libc::c_ulong = 1074013192;
