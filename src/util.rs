use std::{ffi::CStr, fs, io, mem};

use thiserror::Error;

const POSSIBLE_CPUS: &str = "/sys/devices/system/cpu/possible";

/// A kernel version as reported by `uname(2)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KernelVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u16,
}

/// The error type returned when the running kernel version cannot be
/// determined.
#[derive(Debug, Error)]
pub enum KernelVersionError {
    /// The `uname` syscall failed.
    #[error("uname failed")]
    Uname(#[source] io::Error),

    /// The release string did not look like `major.minor.patch`.
    #[error("unable to parse kernel release `{release}`")]
    ParseReleaseFailed {
        /// The release string reported by the kernel.
        release: String,
    },
}

impl KernelVersion {
    pub const fn new(major: u8, minor: u8, patch: u16) -> KernelVersion {
        KernelVersion {
            major,
            minor,
            patch,
        }
    }

    /// Returns the version of the currently running kernel.
    pub fn current() -> Result<KernelVersion, KernelVersionError> {
        let mut uts = unsafe { mem::zeroed::<libc::utsname>() };
        if unsafe { libc::uname(&mut uts) } != 0 {
            return Err(KernelVersionError::Uname(io::Error::last_os_error()));
        }

        let release = unsafe { CStr::from_ptr(uts.release.as_ptr()) };
        let release = release.to_string_lossy();
        Self::parse(&release).ok_or_else(|| KernelVersionError::ParseReleaseFailed {
            release: release.into_owned(),
        })
    }

    /// The `KERNEL_VERSION` encoding of this version. Patch levels above 255
    /// saturate, matching the kernel's own macro.
    pub fn code(&self) -> u32 {
        let KernelVersion {
            major,
            minor,
            patch,
        } = *self;
        (u32::from(major) << 16) | (u32::from(minor) << 8) | u32::from(patch.min(255))
    }

    // Accepts `major.minor`, `major.minor.patch` and distro releases such as
    // `5.15.0-78-generic`.
    fn parse(release: &str) -> Option<KernelVersion> {
        let mut parts = release.splitn(3, '.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = match parts.next() {
            Some(rest) => {
                let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
                if digits.is_empty() {
                    0
                } else {
                    digits.parse().ok()?
                }
            }
            None => 0,
        };
        Some(KernelVersion::new(major, minor, patch))
    }
}

pub(crate) fn possible_cpus() -> Result<Vec<u32>, io::Error> {
    let data = fs::read_to_string(POSSIBLE_CPUS)?;
    parse_cpu_ranges(data.trim()).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::Other,
            format!("unexpected {} format", POSSIBLE_CPUS),
        )
    })
}

fn parse_cpu_ranges(data: &str) -> Option<Vec<u32>> {
    let mut cpus = Vec::new();
    for range in data.split(',') {
        let mut parts = range.splitn(2, '-');
        let start: u32 = parts.next()?.parse().ok()?;
        let end = match parts.next() {
            Some(end) => end.parse().ok()?,
            None => start,
        };
        if end < start {
            return None;
        }
        cpus.extend(start..=end);
    }
    Some(cpus)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_ranges() {
        assert_eq!(parse_cpu_ranges("0").unwrap(), vec![0]);
        assert_eq!(parse_cpu_ranges("0,1,2").unwrap(), vec![0, 1, 2]);
        assert_eq!(parse_cpu_ranges("0-7").unwrap(), (0..=7).collect::<Vec<_>>());
        assert_eq!(
            parse_cpu_ranges("0-3,4-7").unwrap(),
            (0..=7).collect::<Vec<_>>()
        );
        assert_eq!(
            parse_cpu_ranges("0-5,6,7").unwrap(),
            (0..=7).collect::<Vec<_>>()
        );
        assert_eq!(parse_cpu_ranges(""), None);
        assert_eq!(parse_cpu_ranges("0-1,2-"), None);
        assert_eq!(parse_cpu_ranges("2-1"), None);
        assert_eq!(parse_cpu_ranges("foo"), None);
    }

    #[test]
    fn test_parse_kernel_version() {
        assert_eq!(
            KernelVersion::parse("4.12.0"),
            Some(KernelVersion::new(4, 12, 0))
        );
        assert_eq!(
            KernelVersion::parse("5.15.0-78-generic"),
            Some(KernelVersion::new(5, 15, 0))
        );
        assert_eq!(KernelVersion::parse("6.1"), Some(KernelVersion::new(6, 1, 0)));
        assert_eq!(KernelVersion::parse("6"), None);
        assert_eq!(KernelVersion::parse("banana"), None);
    }

    #[test]
    fn test_version_ordering() {
        assert!(KernelVersion::new(4, 11, 12) < KernelVersion::new(4, 12, 0));
        assert!(KernelVersion::new(4, 12, 0) >= KernelVersion::new(4, 12, 0));
        assert!(KernelVersion::new(5, 4, 0) > KernelVersion::new(4, 19, 250));
    }

    #[test]
    fn test_version_code() {
        assert_eq!(KernelVersion::new(4, 12, 0).code(), 0x040c00);
        assert_eq!(KernelVersion::new(5, 15, 300).code(), 0x050fff);
    }
}
