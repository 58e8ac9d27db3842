//! Load and attach eBPF programs with runtime bypass gating.
//!
//! This crate consumes an already-parsed [`obj::CollectionSpec`] (program
//! instruction streams plus map definitions), optionally rewrites programs
//! that opt in to runtime bypassing, loads the result into the kernel and
//! classifies the loaded programs by the kind of hook they attach to
//! (kprobe/kretprobe, uprobe/uretprobe, tracepoint, socket filter, tracing).
//!
//! Programs opt in to bypassing by referencing the well-known
//! `bypass_program` symbol near their entry point while the spec carries a
//! `program_bypassed` map. The rewriter splices a gated early-return
//! sequence over the reference; [`Collection::pause`] and
//! [`Collection::resume`] then toggle each program through the shared map
//! without detaching anything.
//!
//! ```no_run
//! use ebpf_loader::{Collection, CollectionOptions};
//! # fn spec() -> ebpf_loader::obj::CollectionSpec { unimplemented!() }
//!
//! let collection = Collection::load(spec(), CollectionOptions {
//!     bypass_enabled: true,
//!     ..Default::default()
//! })?;
//! let links = collection.attach()?;
//! collection.pause()?;
//! collection.resume()?;
//! drop(links);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
#![deny(clippy::all)]

mod bypass;
mod collection;
mod features;
mod generated;
pub mod maps;
pub mod obj;
pub mod programs;
mod sys;
mod util;

pub use bypass::BypassError;
pub use collection::{AttachError, Collection, CollectionError, CollectionOptions};
pub use features::is_map_type_supported;
pub use util::{KernelVersion, KernelVersionError};

/// Marker trait for types that can safely be converted to and from byte
/// slices.
///
/// # Safety
///
/// Implementors must be valid for every bit pattern and contain no padding.
pub unsafe trait Pod: Copy + 'static {}

macro_rules! unsafe_impl_pod {
    ($($struct_name:ident),+ $(,)?) => {
        $(
            unsafe impl Pod for $struct_name { }
        )+
    }
}

unsafe_impl_pod!(i8, u8, i16, u16, i32, u32, i64, u64);
