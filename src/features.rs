//! Probes for eBPF capabilities of the host kernel.
//!
//! Kernel version alone is not a reliable signal since distros backport
//! eBPF functionality, so map-type support is detected by attempting a
//! minimal map creation.

use std::{ffi::CString, mem::size_of, os::unix::io::RawFd};

use log::debug;

use crate::{
    maps::MapError,
    obj::{MapSpec, MapType},
    sys::bpf_create_map,
};

#[derive(Debug)]
pub(crate) struct Features {
    percpu_array: bool,
}

impl Features {
    pub(crate) fn percpu_array(&self) -> bool {
        self.percpu_array
    }
}

lazy_static::lazy_static! {
    pub(crate) static ref FEATURES: Features = detect_features();
}

fn detect_features() -> Features {
    let features = Features {
        percpu_array: probe_map_create(MapType::PerCpuArray).unwrap_or(false),
    };
    debug!("eBPF feature detection: {:?}", features);
    features
}

/// Returns `true` if the host kernel supports maps of the given type.
pub fn is_map_type_supported(ty: MapType) -> Result<bool, MapError> {
    probe_map_create(ty)
}

fn probe_map_create(ty: MapType) -> Result<bool, MapError> {
    let spec = MapSpec {
        ty,
        key_size: size_of::<u32>() as u32,
        value_size: size_of::<u32>() as u32,
        max_entries: 1,
        flags: 0,
    };

    let name = CString::default();
    match bpf_create_map(&name, &spec) {
        Ok(fd) => {
            unsafe { libc::close(fd as RawFd) };
            Ok(true)
        }
        Err((code, io_error)) => match io_error.raw_os_error() {
            // EINVAL is how the kernel reports an unknown map type
            Some(libc::EINVAL) => Ok(false),
            _ => Err(MapError::CreateFailed {
                name: String::new(),
                code,
                io_error,
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::{fs::File, io, os::unix::io::IntoRawFd};

    use assert_matches::assert_matches;

    use super::*;
    use crate::{
        generated::{bpf_cmd, bpf_map_type::BPF_MAP_TYPE_PERCPU_ARRAY},
        sys::{override_syscall, Syscall},
    };

    #[test]
    fn test_probe_map_create_supported() {
        override_syscall(|call| match call {
            Syscall::Bpf {
                cmd: bpf_cmd::BPF_MAP_CREATE,
                attr,
            } => {
                let u = unsafe { &attr.map_create };
                assert_eq!(u.map_type, BPF_MAP_TYPE_PERCPU_ARRAY);
                assert_eq!(u.key_size, 4);
                assert_eq!(u.value_size, 4);
                assert_eq!(u.max_entries, 1);
                let fd = File::open("/dev/null").unwrap().into_raw_fd();
                Ok(fd as i64)
            }
            _ => panic!("unexpected syscall"),
        });

        assert_matches!(probe_map_create(MapType::PerCpuArray), Ok(true));
    }

    #[test]
    fn test_probe_map_create_unsupported() {
        override_syscall(|_| Err((-1, io::Error::from_raw_os_error(libc::EINVAL))));

        assert_matches!(probe_map_create(MapType::PerCpuArray), Ok(false));
    }

    #[test]
    fn test_probe_map_create_failed() {
        override_syscall(|_| Err((-1, io::Error::from_raw_os_error(libc::EPERM))));

        assert_matches!(
            probe_map_create(MapType::PerCpuArray),
            Err(MapError::CreateFailed { .. })
        );
    }
}
