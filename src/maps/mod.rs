//! Loaded eBPF map handles.

use std::{ffi::CString, io, mem, os::unix::io::RawFd};

use thiserror::Error;

use crate::{obj::MapSpec, sys, Pod};

#[derive(Debug, Error)]
pub enum MapError {
    /// The map name contains a NUL byte.
    #[error("invalid map name `{name}`")]
    InvalidName { name: String },

    /// The `BPF_MAP_CREATE` syscall failed.
    #[error("failed to create map `{name}`: {code}")]
    CreateFailed {
        name: String,
        code: i64,
        #[source]
        io_error: io::Error,
    },

    /// The `BPF_MAP_UPDATE_ELEM` syscall failed.
    #[error("the BPF_MAP_UPDATE_ELEM syscall failed with code {code}")]
    UpdateElementFailed {
        code: i64,
        #[source]
        io_error: io::Error,
    },
}

/// A created eBPF map. Owns the map file descriptor; dropping the handle
/// releases it.
#[derive(Debug)]
pub struct Map {
    name: String,
    fd: RawFd,
}

impl Map {
    pub(crate) fn create(name: &str, spec: &MapSpec) -> Result<Map, MapError> {
        let c_name = CString::new(name).map_err(|_| MapError::InvalidName {
            name: name.to_owned(),
        })?;

        let fd = sys::bpf_create_map(&c_name, spec).map_err(|(code, io_error)| {
            MapError::CreateFailed {
                name: name.to_owned(),
                code,
                io_error,
            }
        })? as RawFd;

        Ok(Map {
            name: name.to_owned(),
            fd,
        })
    }

    #[cfg(test)]
    pub(crate) fn from_raw_parts(name: String, fd: RawFd) -> Map {
        Map { name, fd }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Updates the entry at `key`. `flags` is one of `BPF_ANY`,
    /// `BPF_NOEXIST` or `BPF_EXIST`.
    pub fn update<K: Pod, V: Pod>(&self, key: &K, value: &V, flags: u64) -> Result<(), MapError> {
        sys::bpf_map_update_elem(self.fd, key, value, flags)
            .map(|_| ())
            .map_err(|(code, io_error)| MapError::UpdateElementFailed { code, io_error })
    }

    /// Updates a per-CPU entry at `key` with one value slot per possible
    /// CPU. The kernel expects each slot padded to 8 bytes.
    pub fn update_per_cpu<K: Pod, V: Pod>(
        &self,
        key: &K,
        values: &[V],
        flags: u64,
    ) -> Result<(), MapError> {
        let stride = (mem::size_of::<V>() + 7) & !7;
        let mut buf = vec![0u8; stride * values.len()];
        for (i, value) in values.iter().enumerate() {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    value as *const V as *const u8,
                    buf.as_mut_ptr().add(i * stride),
                    mem::size_of::<V>(),
                );
            }
        }

        sys::bpf_map_update_elem_ptr(self.fd, key as *const K, buf.as_ptr(), flags)
            .map(|_| ())
            .map_err(|(code, io_error)| MapError::UpdateElementFailed { code, io_error })
    }
}

impl Drop for Map {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}
