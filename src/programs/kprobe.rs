use crate::{
    programs::{
        probe::{attach_probe, ProbeKind},
        PerfLink, Program, ProgramError,
    },
    util::KernelVersion,
};

/// Attach options for kernel probes.
#[derive(Debug, Clone, Default)]
pub struct KprobeOptions {
    /// Offset from the target symbol.
    pub offset: u64,
    /// For kretprobes, the number of parallel invocations the kernel keeps
    /// state for. 0 means the kernel default. Ignored on kernels older than
    /// 4.12, which reject the setting.
    pub retprobe_max_active: u32,
}

/// A kprobe or kretprobe program with its attach target.
#[derive(Debug)]
pub struct Kprobe {
    pub(crate) program: Program,
    pub(crate) attach_to: String,
    pub(crate) retprobe: bool,
    pub options: KprobeOptions,
    pub(crate) bypass_index: u32,
}

impl Kprobe {
    pub fn program(&self) -> &Program {
        &self.program
    }

    /// The kernel symbol the program attaches to.
    pub fn attach_to(&self) -> &str {
        &self.attach_to
    }

    pub fn is_return_probe(&self) -> bool {
        self.retprobe
    }

    /// The program's index in the bypass gate map; 0 if it was not
    /// rewritten.
    pub fn bypass_index(&self) -> u32 {
        self.bypass_index
    }

    pub(crate) fn attach(&self) -> Result<PerfLink, ProgramError> {
        let (kind, max_active) = if self.retprobe {
            let max_active = if self.options.retprobe_max_active != 0 {
                retprobe_max_active(self.options.retprobe_max_active, KernelVersion::current()?)
            } else {
                0
            };
            (ProbeKind::KRetProbe, max_active)
        } else {
            (ProbeKind::KProbe, 0)
        };

        attach_probe(
            self.program.fd,
            kind,
            &self.attach_to,
            self.options.offset,
            max_active,
        )
    }
}

// maxactive support for kretprobes was added in 4.12; older kernels reject
// the perf string outright, so the option is dropped there.
fn retprobe_max_active(max_active: u32, kernel: KernelVersion) -> u32 {
    if kernel < KernelVersion::new(4, 12, 0) {
        0
    } else {
        max_active
    }
}
