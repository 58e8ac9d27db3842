use std::{fs, io, path::PathBuf};

use object::{Object as _, ObjectSection as _, ObjectSymbol as _};
use thiserror::Error;

use crate::programs::{
    probe::{attach_probe, ProbeKind},
    PerfLink, Program, ProgramError,
};

/// Attach options for user-space probes.
#[derive(Debug, Clone, Default)]
pub struct UprobeOptions {
    /// Offset added to the resolved symbol address.
    pub offset: u64,
}

/// A uprobe or uretprobe program. `binary_path` must be set before the
/// collection is attached.
#[derive(Debug)]
pub struct Uprobe {
    pub(crate) program: Program,
    pub binary_path: Option<PathBuf>,
    pub(crate) attach_to: String,
    pub(crate) retprobe: bool,
    pub options: UprobeOptions,
    pub(crate) bypass_index: u32,
}

impl Uprobe {
    pub fn program(&self) -> &Program {
        &self.program
    }

    /// The symbol in the target binary the program attaches to.
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
        let path = self
            .binary_path
            .as_ref()
            .ok_or_else(|| ProgramError::BinaryPathNotSet {
                program: self.program.name.clone(),
            })?;

        let sym_offset = resolve_symbol(path, &self.attach_to)?;
        let path = path.to_str().ok_or_else(|| ProgramError::InvalidName {
            name: path.display().to_string(),
        })?;

        let kind = if self.retprobe {
            ProbeKind::URetProbe
        } else {
            ProbeKind::UProbe
        };

        attach_probe(
            self.program.fd,
            kind,
            path,
            sym_offset + self.options.offset,
            0,
        )
    }
}

/// The error type returned when a uprobe symbol cannot be located in its
/// target binary.
#[derive(Debug, Error)]
pub enum ResolveSymbolError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("error parsing ELF")]
    Object(#[from] object::Error),

    #[error("unknown symbol `{0}`")]
    Unknown(String),

    #[error("symbol `{0}` does not appear in section")]
    NotInSection(String),

    #[error("symbol `{0}` is in a section with no file data")]
    SectionFileRangeNone(String),
}

// Translates a symbol's virtual address to the file offset uprobes expect.
// Relocatable objects carry file offsets directly.
fn resolve_symbol(path: &std::path::Path, symbol: &str) -> Result<u64, ResolveSymbolError> {
    let data = fs::read(path)?;
    let obj = object::read::File::parse(&*data)?;

    let sym = obj
        .dynamic_symbols()
        .chain(obj.symbols())
        .find(|sym| sym.name().map(|name| name == symbol).unwrap_or(false))
        .ok_or_else(|| ResolveSymbolError::Unknown(symbol.to_owned()))?;

    let needs_translation = matches!(
        obj.kind(),
        object::ObjectKind::Dynamic | object::ObjectKind::Executable
    );
    if !needs_translation {
        return Ok(sym.address());
    }

    let index = sym
        .section_index()
        .ok_or_else(|| ResolveSymbolError::NotInSection(symbol.to_owned()))?;
    let section = obj.section_by_index(index)?;
    let (offset, _) = section
        .file_range()
        .ok_or_else(|| ResolveSymbolError::SectionFileRangeNone(symbol.to_owned()))?;

    Ok(sym.address() - section.address() + offset)
}
