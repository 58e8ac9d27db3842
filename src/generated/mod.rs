#![allow(dead_code, non_camel_case_types, non_snake_case, non_upper_case_globals)]

// Trimmed to the subset of the Linux UAPI definitions this crate uses.
// Layouts follow include/uapi/linux/bpf.h and include/uapi/linux/perf_event.h.

mod bpf_bindings;
mod perf_bindings;

pub use bpf_bindings::*;
pub use perf_bindings::*;
