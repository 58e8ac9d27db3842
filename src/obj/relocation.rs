use std::collections::BTreeMap;

use thiserror::Error;

use crate::{
    generated::{bpf_insn, BPF_PSEUDO_MAP_FD},
    maps::Map,
    obj::Instruction,
};

#[derive(Debug, Error)]
pub enum RelocationError {
    /// An instruction references a map that is not part of the collection.
    #[error("program `{program}` references unknown map `{reference}`")]
    MapNotFound {
        program: String,
        reference: String,
    },
}

/// Encodes a logical instruction stream to raw instructions, patching map
/// references with the created maps' file descriptors.
pub(crate) fn encode_and_relocate(
    program: &str,
    instructions: &[Instruction],
    maps: &BTreeMap<String, Map>,
) -> Result<Vec<bpf_insn>, RelocationError> {
    let mut raw = Vec::with_capacity(instructions.len() + 1);
    for ins in instructions {
        let (mut first, second) = ins.encode();
        if let Some(reference) = ins.reference() {
            let map = maps
                .get(reference)
                .ok_or_else(|| RelocationError::MapNotFound {
                    program: program.to_owned(),
                    reference: reference.to_owned(),
                })?;
            first.set_src_reg(BPF_PSEUDO_MAP_FD);
            first.imm = map.fd();
        }
        raw.push(first);
        if let Some(second) = second {
            raw.push(second);
        }
    }
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use std::{fs::File, os::unix::io::IntoRawFd};

    use assert_matches::assert_matches;

    use super::*;
    use crate::obj::{Instruction, Register, Size};

    fn stub_map(name: &str) -> Map {
        let fd = File::open("/dev/null").unwrap().into_raw_fd();
        Map::from_raw_parts(name.to_owned(), fd)
    }

    #[test]
    fn test_relocate_map_reference() {
        let mut maps = BTreeMap::new();
        maps.insert("counters".to_owned(), stub_map("counters"));
        let fd = maps["counters"].fd();

        let insns = [
            Instruction::load_imm64(Register::R1, 0).with_reference("counters"),
            Instruction::exit(),
        ];

        let raw = encode_and_relocate("prog", &insns, &maps).unwrap();
        assert_eq!(raw.len(), 3);
        assert_eq!(raw[0].src_reg(), BPF_PSEUDO_MAP_FD);
        assert_eq!(raw[0].imm, fd);
        assert_eq!(raw[1].imm, 0);
        assert_eq!(raw[2].code, 0x95);
    }

    #[test]
    fn test_relocate_unknown_map() {
        let maps = BTreeMap::new();
        let insns = [Instruction::load_imm64(Register::R1, 0).with_reference("missing")];

        assert_matches!(
            encode_and_relocate("prog", &insns, &maps),
            Err(RelocationError::MapNotFound { ref program, ref reference })
                if program == "prog" && reference == "missing"
        );
    }

    #[test]
    fn test_encode_without_references() {
        let maps = BTreeMap::new();
        let insns = [
            Instruction::store_imm(Register::RFP, -8, 1, Size::Word),
            Instruction::exit(),
        ];
        let raw = encode_and_relocate("prog", &insns, &maps).unwrap();
        assert_eq!(raw.len(), 2);
        assert_eq!(raw[0].src_reg(), 0);
    }
}
