//! Rewrites programs that opt in to runtime bypassing.
//!
//! A program opts in by carrying an instruction that references the
//! `bypass_program` symbol within its first two slots, while its collection
//! spec defines a `program_bypassed` map. The rewriter replaces the
//! reference with a gated early-return sequence: the program looks up its
//! assigned index in the map and returns immediately when the stored value
//! is nonzero. Pausing and resuming a program is then a single map write,
//! with no detach involved.

use std::{collections::BTreeMap, io, sync::OnceLock};

use log::debug;
use thiserror::Error;

use crate::{
    features::FEATURES,
    generated::{BPF_EXIST, BPF_FUNC_map_lookup_elem},
    maps::{Map, MapError},
    obj::{CollectionSpec, Instruction, MapType, Register, Size},
    programs::{Kprobe, Uprobe},
    util::possible_cpus,
};

pub(crate) const BYPASS_MAP_NAME: &str = "program_bypassed";
const BYPASS_REFERENCE: &str = "bypass_program";

const STACK_OFFSET: i16 = -8;
// Place a limit on how far we will inject from the start of a program.
// Past that we cannot know which registers need to be saved and restored.
const MAX_REFERENCE_OFFSET: usize = 1;

#[derive(Debug, Error)]
pub enum BypassError {
    /// The `bypass_program` reference sits too deep in the instruction
    /// stream to be rewritten.
    #[error("unable to inject bypass instructions into program `{program}`: bypass reference occurs too late in program")]
    ReferenceTooLate { program: String },

    /// An instruction before the `bypass_program` reference uses a register
    /// the injected sequence would clobber.
    #[error("unable to inject bypass instructions into program `{program}`: register other than r1 used before injection point")]
    RegisterConflict { program: String },

    /// The possible-CPU count needed for per-CPU gate values could not be
    /// read.
    #[error("possible cpu count")]
    PossibleCpus(#[source] io::Error),

    /// Pause or resume was called although no program in this process was
    /// ever rewritten.
    #[error("bypass gate values are not initialized")]
    ValuesNotInitialized,

    /// Writing a program's gate entry failed.
    #[error("update bypass map for program `{program}`")]
    UpdateMap {
        program: String,
        #[source]
        source: MapError,
    },
}

/// The value written to a program's gate entry. Per-CPU array maps take one
/// slot per possible CPU, plain arrays a single scalar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum GateValue {
    Scalar(u32),
    PerCpu(Vec<u32>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct GateValues {
    pub(crate) bypass: GateValue,
    pub(crate) enable: GateValue,
}

impl GateValues {
    fn scalar() -> GateValues {
        GateValues {
            bypass: GateValue::Scalar(1),
            enable: GateValue::Scalar(0),
        }
    }

    fn per_cpu(cpus: usize) -> GateValues {
        GateValues {
            bypass: GateValue::PerCpu(vec![1; cpus]),
            enable: GateValue::PerCpu(vec![0; cpus]),
        }
    }
}

// Set once by the first rewrite that assigns an index; read-only afterwards.
// The representation must stay fixed for the lifetime of the process, since
// loaded programs bake in the map type the templates were built for.
static GATE_VALUES: OnceLock<GateValues> = OnceLock::new();

fn gate_values() -> Option<&'static GateValues> {
    GATE_VALUES.get()
}

/// Rewrites every opted-in program in `spec` and returns the gate index
/// assigned to each. Returns an empty map when the spec does not
/// participate in bypassing.
pub(crate) fn setup_bypass(
    spec: &mut CollectionSpec,
) -> Result<BTreeMap<String, u32>, BypassError> {
    let (indexes, values) = rewrite_collection(spec, || FEATURES.percpu_array())?;
    if let Some(values) = values {
        let published = GATE_VALUES.get_or_init(|| values);
        debug!("bypass gate values: {:?}", published);
    }
    Ok(indexes)
}

fn rewrite_collection(
    spec: &mut CollectionSpec,
    has_percpu_array: impl FnOnce() -> bool,
) -> Result<(BTreeMap<String, u32>, Option<GateValues>), BypassError> {
    if !spec.maps.contains_key(BYPASS_MAP_NAME) {
        return Ok((BTreeMap::new(), None));
    }

    let mut next_index: u32 = 1;
    let mut indexes = BTreeMap::new();

    for (name, program) in spec.programs.iter_mut() {
        let position = program
            .instructions
            .iter()
            .position(|ins| ins.reference() == Some(BYPASS_REFERENCE));
        let Some(position) = position else {
            continue;
        };

        if position > MAX_REFERENCE_OFFSET {
            return Err(BypassError::ReferenceTooLate {
                program: name.clone(),
            });
        }
        if position > 0 && program.instructions[position - 1].src != Register::R1 {
            return Err(BypassError::RegisterConflict {
                program: name.clone(),
            });
        }

        let source = program.instructions[position].source().map(str::to_owned);
        let mut rewritten =
            Vec::with_capacity(program.instructions.len() + PROLOGUE_INSTRUCTIONS - 1);
        rewritten.extend_from_slice(&program.instructions[..position]);
        rewritten.extend(prologue(next_index, source));
        rewritten.extend_from_slice(&program.instructions[position + 1..]);
        program.instructions = rewritten;

        indexes.insert(name.clone(), next_index);
        next_index += 1;
    }

    // no programs modified
    if next_index == 1 {
        spec.maps.remove(BYPASS_MAP_NAME);
        return Ok((indexes, None));
    }

    if let Some(map) = spec.maps.get_mut(BYPASS_MAP_NAME) {
        // reserved index 0 plus a guard slot past the last assigned index
        map.max_entries = next_index + 1;
        if has_percpu_array() {
            map.ty = MapType::PerCpuArray;
            let cpus = possible_cpus().map_err(BypassError::PossibleCpus)?.len();
            return Ok((indexes, Some(GateValues::per_cpu(cpus))));
        }
    }

    Ok((indexes, Some(GateValues::scalar())))
}

const PROLOGUE_INSTRUCTIONS: usize = 12;

// The gate sequence spliced over the `bypass_program` reference. The map
// pointer load is one logical instruction but two raw slots, so the kernel
// sees 13. Jump offsets are raw-slot counts and must track the exact shape
// below.
fn prologue(index: u32, source: Option<String>) -> Vec<Instruction> {
    vec![
        // the original line info must stay on the program's first slot or
        // the verifier rejects the rewritten body
        Instruction::mov_reg(Register::R6, Register::R1).with_source(source),
        // save the gate index to the stack
        Instruction::store_imm(Register::RFP, STACK_OFFSET, index as i64, Size::Word),
        // build a pointer to the saved index
        Instruction::mov_reg(Register::R2, Register::RFP),
        Instruction::add_imm(Register::R2, STACK_OFFSET as i32),
        Instruction::load_imm64(Register::R1, 0).with_reference(BYPASS_MAP_NAME),
        Instruction::call(BPF_FUNC_map_lookup_elem),
        // lookup miss: nothing gated, skip the early return
        Instruction::jeq_imm(Register::R0, 0, 3),
        Instruction::load_mem(Register::R1, Register::R0, 0, Size::Word),
        // gate not set: skip the early return
        Instruction::jeq_imm(Register::R1, 0, 2),
        Instruction::exit(),
        // scrub the borrowed stack slot
        Instruction::store_imm(Register::RFP, STACK_OFFSET, 0, Size::Word),
        Instruction::mov_reg(Register::R1, Register::R6),
    ]
}

#[derive(Debug, Clone, Copy)]
enum GateState {
    Bypassed,
    Enabled,
}

fn update_gate(
    program: &str,
    index: u32,
    map: Option<&Map>,
    state: GateState,
) -> Result<(), BypassError> {
    let Some(map) = map else {
        return Ok(());
    };
    if index == 0 {
        return Ok(());
    }

    let values = gate_values().ok_or(BypassError::ValuesNotInitialized)?;
    let value = match state {
        GateState::Bypassed => &values.bypass,
        GateState::Enabled => &values.enable,
    };

    let result = match value {
        GateValue::Scalar(value) => map.update(&index, value, BPF_EXIST),
        GateValue::PerCpu(values) => map.update_per_cpu(&index, values, BPF_EXIST),
    };
    result.map_err(|source| BypassError::UpdateMap {
        program: program.to_owned(),
        source,
    })
}

impl Kprobe {
    pub(crate) fn pause(&self, bypass_map: Option<&Map>) -> Result<(), BypassError> {
        update_gate(
            &self.program.name,
            self.bypass_index,
            bypass_map,
            GateState::Bypassed,
        )
    }

    pub(crate) fn resume(&self, bypass_map: Option<&Map>) -> Result<(), BypassError> {
        update_gate(
            &self.program.name,
            self.bypass_index,
            bypass_map,
            GateState::Enabled,
        )
    }
}

impl Uprobe {
    pub(crate) fn pause(&self, bypass_map: Option<&Map>) -> Result<(), BypassError> {
        update_gate(
            &self.program.name,
            self.bypass_index,
            bypass_map,
            GateState::Bypassed,
        )
    }

    pub(crate) fn resume(&self, bypass_map: Option<&Map>) -> Result<(), BypassError> {
        update_gate(
            &self.program.name,
            self.bypass_index,
            bypass_map,
            GateState::Enabled,
        )
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::obj::{MapSpec, ProgramSpec, ProgramType};

    fn sentinel() -> Instruction {
        Instruction::load_imm64(Register::R1, 0).with_reference(BYPASS_REFERENCE)
    }

    fn bypass_map_spec() -> MapSpec {
        MapSpec {
            ty: MapType::Array,
            key_size: 4,
            value_size: 4,
            max_entries: 1,
            flags: 0,
        }
    }

    fn program(instructions: Vec<Instruction>) -> ProgramSpec {
        ProgramSpec {
            ty: ProgramType::Kprobe,
            section_name: "kprobe/do_sys_open".to_owned(),
            license: "GPL".to_owned(),
            attach_type: None,
            attach_btf_id: None,
            instructions,
        }
    }

    fn spec_with(programs: Vec<(&str, ProgramSpec)>) -> CollectionSpec {
        let mut spec = CollectionSpec::new();
        spec.maps
            .insert(BYPASS_MAP_NAME.to_owned(), bypass_map_spec());
        for (name, program) in programs {
            spec.programs.insert(name.to_owned(), program);
        }
        spec
    }

    #[test]
    fn test_rewrite_single_program() {
        let tail = [
            Instruction::mov_imm(Register::R0, 0),
            Instruction::exit(),
        ];
        let mut instructions =
            vec![sentinel().with_source(Some("int probe(struct pt_regs *ctx)".to_owned()))];
        instructions.extend_from_slice(&tail);
        let mut spec = spec_with(vec![("open_probe", program(instructions))]);

        let (indexes, values) = rewrite_collection(&mut spec, || false).unwrap();

        assert_eq!(indexes.len(), 1);
        assert_eq!(indexes["open_probe"], 1);
        assert_eq!(values, Some(GateValues::scalar()));

        let map = &spec.maps[BYPASS_MAP_NAME];
        assert_eq!(map.max_entries, 3);
        assert_eq!(map.ty, MapType::Array);

        let rewritten = &spec.programs["open_probe"].instructions;
        assert_eq!(rewritten.len(), PROLOGUE_INSTRUCTIONS + tail.len());

        let mut expected = prologue(1, Some("int probe(struct pt_regs *ctx)".to_owned()));
        expected.extend_from_slice(&tail);
        assert_eq!(rewritten, &expected);

        // the injected sequence occupies 13 raw slots
        let raw: usize = rewritten[..PROLOGUE_INSTRUCTIONS]
            .iter()
            .map(|ins| if ins.is_wide() { 2 } else { 1 })
            .sum();
        assert_eq!(raw, 13);

        // line info stays on the first instruction
        assert_eq!(
            rewritten[0].source(),
            Some("int probe(struct pt_regs *ctx)")
        );

        // anchor points of the injected shape: the gate map load, the two
        // forward jumps and the early return
        assert_eq!(rewritten[0], expected[0]);
        assert_eq!(rewritten[4].reference(), Some(BYPASS_MAP_NAME));
        assert_eq!(rewritten[6].off, 3);
        assert_eq!(rewritten[8].off, 2);
        assert_eq!(rewritten[9], Instruction::exit());
        assert_eq!(rewritten[11], Instruction::mov_reg(Register::R1, Register::R6));
    }

    #[test]
    fn test_rewrite_two_programs() {
        let mut spec = spec_with(vec![
            ("a_probe", program(vec![sentinel(), Instruction::exit()])),
            ("b_probe", program(vec![sentinel(), Instruction::exit()])),
        ]);

        let (indexes, _) = rewrite_collection(&mut spec, || false).unwrap();

        assert_eq!(indexes["a_probe"], 1);
        assert_eq!(indexes["b_probe"], 2);
        assert_eq!(spec.maps[BYPASS_MAP_NAME].max_entries, 4);
    }

    #[test]
    fn test_rewrite_after_r1_initializer() {
        let mut spec = spec_with(vec![(
            "open_probe",
            program(vec![
                Instruction::mov_reg(Register::R6, Register::R1),
                sentinel(),
                Instruction::exit(),
            ]),
        )]);

        let (indexes, _) = rewrite_collection(&mut spec, || false).unwrap();
        assert_eq!(indexes["open_probe"], 1);

        let rewritten = &spec.programs["open_probe"].instructions;
        assert_eq!(rewritten[0], Instruction::mov_reg(Register::R6, Register::R1));
        assert_eq!(rewritten.len(), 1 + PROLOGUE_INSTRUCTIONS + 1);
    }

    #[test]
    fn test_reference_too_late() {
        let mut spec = spec_with(vec![(
            "late_probe",
            program(vec![
                Instruction::mov_reg(Register::R6, Register::R1),
                Instruction::mov_imm(Register::R0, 0),
                sentinel(),
                Instruction::exit(),
            ]),
        )]);
        let before = spec.clone();

        assert_matches!(
            rewrite_collection(&mut spec, || false),
            Err(BypassError::ReferenceTooLate { ref program }) if program == "late_probe"
        );

        // the spec is left untouched on error
        assert_eq!(
            spec.programs["late_probe"].instructions,
            before.programs["late_probe"].instructions
        );
        assert_eq!(spec.maps[BYPASS_MAP_NAME].max_entries, 1);
    }

    #[test]
    fn test_register_conflict() {
        let mut spec = spec_with(vec![(
            "conflict_probe",
            program(vec![
                Instruction::mov_reg(Register::R3, Register::R2),
                sentinel(),
                Instruction::exit(),
            ]),
        )]);

        assert_matches!(
            rewrite_collection(&mut spec, || false),
            Err(BypassError::RegisterConflict { ref program }) if program == "conflict_probe"
        );
    }

    #[test]
    fn test_no_sentinel_map() {
        let mut spec = CollectionSpec::new();
        spec.programs.insert(
            "open_probe".to_owned(),
            program(vec![sentinel(), Instruction::exit()]),
        );
        let before = spec.programs["open_probe"].instructions.clone();

        let (indexes, values) = rewrite_collection(&mut spec, || false).unwrap();
        assert!(indexes.is_empty());
        assert_eq!(values, None);
        assert_eq!(spec.programs["open_probe"].instructions, before);
    }

    #[test]
    fn test_unused_sentinel_map_removed() {
        let mut spec = spec_with(vec![(
            "plain_probe",
            program(vec![
                Instruction::mov_imm(Register::R0, 0),
                Instruction::exit(),
            ]),
        )]);

        let (indexes, values) = rewrite_collection(&mut spec, || false).unwrap();
        assert!(indexes.is_empty());
        assert_eq!(values, None);
        assert!(!spec.maps.contains_key(BYPASS_MAP_NAME));
    }

    #[test]
    fn test_rewrite_idempotent() {
        let mut spec = spec_with(vec![(
            "open_probe",
            program(vec![sentinel(), Instruction::exit()]),
        )]);

        rewrite_collection(&mut spec, || false).unwrap();
        let after_first = spec.programs["open_probe"].instructions.clone();

        let (indexes, _) = rewrite_collection(&mut spec, || false).unwrap();
        assert!(indexes.is_empty());
        assert_eq!(spec.programs["open_probe"].instructions, after_first);
    }

    #[test]
    fn test_percpu_upgrade() {
        let mut spec = spec_with(vec![(
            "open_probe",
            program(vec![sentinel(), Instruction::exit()]),
        )]);

        match possible_cpus() {
            Ok(cpus) => {
                let (_, values) = rewrite_collection(&mut spec, || true).unwrap();
                assert_eq!(spec.maps[BYPASS_MAP_NAME].ty, MapType::PerCpuArray);
                assert_eq!(values, Some(GateValues::per_cpu(cpus.len())));
            }
            Err(_) => {
                assert_matches!(
                    rewrite_collection(&mut spec, || true),
                    Err(BypassError::PossibleCpus(_))
                );
            }
        }
    }

    mod gate_updates {
        use std::{
            fs::File,
            io,
            os::unix::io::IntoRawFd,
            sync::atomic::{AtomicU64, Ordering},
        };

        use assert_matches::assert_matches;

        use super::super::{GateValues, BYPASS_MAP_NAME, GATE_VALUES};
        use crate::{
            generated::{bpf_cmd, BPF_EXIST},
            maps::Map,
            programs::{Kprobe, KprobeOptions, Program},
            sys::{override_syscall, Syscall},
            BypassError,
        };

        fn test_kprobe(name: &str, bypass_index: u32) -> Kprobe {
            Kprobe {
                program: Program {
                    name: name.to_owned(),
                    fd: File::open("/dev/null").unwrap().into_raw_fd(),
                },
                attach_to: "do_sys_open".to_owned(),
                retprobe: false,
                options: KprobeOptions::default(),
                bypass_index,
            }
        }

        fn test_map() -> Map {
            let fd = File::open("/dev/null").unwrap().into_raw_fd();
            Map::from_raw_parts(BYPASS_MAP_NAME.to_owned(), fd)
        }

        fn ensure_scalar_values() {
            GATE_VALUES.get_or_init(GateValues::scalar);
        }

        #[test]
        fn test_pause_resume_update_existing_entry() {
            static SEEN_FLAGS: AtomicU64 = AtomicU64::new(u64::MAX);
            static SEEN_KEY: AtomicU64 = AtomicU64::new(u64::MAX);
            static SEEN_VALUE: AtomicU64 = AtomicU64::new(u64::MAX);

            ensure_scalar_values();
            override_syscall(|call| match call {
                Syscall::Bpf {
                    cmd: bpf_cmd::BPF_MAP_UPDATE_ELEM,
                    attr,
                } => {
                    let u = unsafe { &attr.map_elem };
                    SEEN_FLAGS.store(u.flags, Ordering::Relaxed);
                    SEEN_KEY.store(unsafe { *(u.key as *const u32) } as u64, Ordering::Relaxed);
                    SEEN_VALUE.store(unsafe { *(u.value as *const u32) } as u64, Ordering::Relaxed);
                    Ok(0)
                }
                _ => Err((-1, io::Error::from_raw_os_error(libc::EFAULT))),
            });

            let kprobe = test_kprobe("open_probe", 3);
            let map = test_map();

            kprobe.pause(Some(&map)).unwrap();
            assert_eq!(SEEN_FLAGS.load(Ordering::Relaxed), BPF_EXIST);
            assert_eq!(SEEN_KEY.load(Ordering::Relaxed), 3);
            assert_eq!(SEEN_VALUE.load(Ordering::Relaxed), 1);

            kprobe.resume(Some(&map)).unwrap();
            assert_eq!(SEEN_VALUE.load(Ordering::Relaxed), 0);
        }

        #[test]
        fn test_pause_noop_without_index() {
            ensure_scalar_values();
            override_syscall(|_| panic!("no syscall expected"));

            let kprobe = test_kprobe("open_probe", 0);
            let map = test_map();
            kprobe.pause(Some(&map)).unwrap();
            kprobe.resume(Some(&map)).unwrap();
        }

        #[test]
        fn test_pause_noop_without_map() {
            ensure_scalar_values();
            override_syscall(|_| panic!("no syscall expected"));

            let kprobe = test_kprobe("open_probe", 3);
            kprobe.pause(None).unwrap();
        }

        #[test]
        fn test_pause_error_names_program() {
            ensure_scalar_values();
            override_syscall(|call| match call {
                Syscall::Bpf {
                    cmd: bpf_cmd::BPF_MAP_UPDATE_ELEM,
                    ..
                } => Err((-1, io::Error::from_raw_os_error(libc::ENOENT))),
                _ => Err((-1, io::Error::from_raw_os_error(libc::EFAULT))),
            });

            let kprobe = test_kprobe("open_probe", 3);
            let map = test_map();
            assert_matches!(
                kprobe.pause(Some(&map)),
                Err(BypassError::UpdateMap { ref program, .. }) if program == "open_probe"
            );
        }
    }

    #[test]
    fn test_gate_value_templates() {
        let scalar = GateValues::scalar();
        assert_eq!(scalar.bypass, GateValue::Scalar(1));
        assert_eq!(scalar.enable, GateValue::Scalar(0));

        let per_cpu = GateValues::per_cpu(4);
        assert_eq!(per_cpu.bypass, GateValue::PerCpu(vec![1; 4]));
        assert_eq!(per_cpu.enable, GateValue::PerCpu(vec![0; 4]));
    }
}
