//! A logical eBPF instruction stream.
//!
//! Instructions here are the unit the rewriter and relocator work on: one
//! [`Instruction`] per ISA operation, carrying the symbolic map reference
//! and source line marker that raw [`bpf_insn`] slots cannot. A 64-bit
//! immediate load encodes to two raw slots; jump offsets are expressed in
//! raw slots, exactly as the kernel interprets them.

use crate::generated::{
    bpf_insn, BPF_ADD, BPF_ALU64, BPF_CALL, BPF_DW, BPF_EXIT, BPF_IMM, BPF_JEQ, BPF_JMP, BPF_K,
    BPF_LD, BPF_LDX, BPF_MEM, BPF_MOV, BPF_ST, BPF_W, BPF_X,
};

/// An eBPF register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Register(u8);

impl Register {
    pub const R0: Register = Register(0);
    pub const R1: Register = Register(1);
    pub const R2: Register = Register(2);
    pub const R3: Register = Register(3);
    pub const R4: Register = Register(4);
    pub const R5: Register = Register(5);
    pub const R6: Register = Register(6);
    pub const R7: Register = Register(7);
    pub const R8: Register = Register(8);
    pub const R9: Register = Register(9);
    pub const R10: Register = Register(10);
    /// The frame pointer.
    pub const RFP: Register = Register::R10;

    pub fn as_u8(self) -> u8 {
        self.0
    }
}

/// Operand width of a load or store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Size {
    Byte,
    Half,
    Word,
    DWord,
}

impl Size {
    fn bits(self) -> u8 {
        use crate::generated::{BPF_B, BPF_H};
        match self {
            Size::Byte => BPF_B,
            Size::Half => BPF_H,
            Size::Word => BPF_W,
            Size::DWord => BPF_DW,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub code: u8,
    pub dst: Register,
    pub src: Register,
    pub off: i16,
    pub imm: i64,
    reference: Option<String>,
    source: Option<String>,
}

impl Instruction {
    fn base(code: u8, dst: Register, src: Register, off: i16, imm: i64) -> Instruction {
        Instruction {
            code,
            dst,
            src,
            off,
            imm,
            reference: None,
            source: None,
        }
    }

    /// `dst := src`
    pub fn mov_reg(dst: Register, src: Register) -> Instruction {
        Instruction::base(BPF_ALU64 | BPF_MOV | BPF_X, dst, src, 0, 0)
    }

    /// `dst := imm`
    pub fn mov_imm(dst: Register, imm: i32) -> Instruction {
        Instruction::base(BPF_ALU64 | BPF_MOV | BPF_K, dst, Register::R0, 0, imm as i64)
    }

    /// `dst += imm`
    pub fn add_imm(dst: Register, imm: i32) -> Instruction {
        Instruction::base(BPF_ALU64 | BPF_ADD | BPF_K, dst, Register::R0, 0, imm as i64)
    }

    /// `*(size *)(dst + off) := imm`
    pub fn store_imm(dst: Register, off: i16, imm: i64, size: Size) -> Instruction {
        Instruction::base(BPF_ST | BPF_MEM | size.bits(), dst, Register::R0, off, imm)
    }

    /// `dst := *(size *)(src + off)`
    pub fn load_mem(dst: Register, src: Register, off: i16, size: Size) -> Instruction {
        Instruction::base(BPF_LDX | BPF_MEM | size.bits(), dst, src, off, 0)
    }

    /// `dst := imm` as a 64-bit immediate load. Occupies two raw instruction
    /// slots. Attach a map reference with [`Instruction::with_reference`] to
    /// have the loader patch in the map file descriptor.
    pub fn load_imm64(dst: Register, imm: i64) -> Instruction {
        Instruction::base(BPF_LD | BPF_IMM | BPF_DW, dst, Register::R0, 0, imm)
    }

    /// Calls the numbered bpf helper.
    pub fn call(func: i32) -> Instruction {
        Instruction::base(
            BPF_JMP | BPF_CALL,
            Register::R0,
            Register::R0,
            0,
            func as i64,
        )
    }

    /// `if dst == imm goto pc + off`
    pub fn jeq_imm(dst: Register, imm: i32, off: i16) -> Instruction {
        Instruction::base(BPF_JMP | BPF_JEQ | BPF_K, dst, Register::R0, off, imm as i64)
    }

    /// Exits the program, returning `R0`.
    pub fn exit() -> Instruction {
        Instruction::base(BPF_JMP | BPF_EXIT, Register::R0, Register::R0, 0, 0)
    }

    /// The map (or symbol) this instruction refers to, if any.
    pub fn reference(&self) -> Option<&str> {
        self.reference.as_deref()
    }

    pub fn with_reference<T: Into<String>>(mut self, reference: T) -> Instruction {
        self.reference = Some(reference.into());
        self
    }

    /// The source line marker attached to this instruction, if any.
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    pub fn with_source(mut self, source: Option<String>) -> Instruction {
        self.source = source;
        self
    }

    /// True if this instruction encodes to two raw slots.
    pub(crate) fn is_wide(&self) -> bool {
        self.code == BPF_LD | BPF_IMM | BPF_DW
    }

    pub(crate) fn encode(&self) -> (bpf_insn, Option<bpf_insn>) {
        let first = bpf_insn::new(
            self.code,
            self.dst.as_u8(),
            self.src.as_u8(),
            self.off,
            self.imm as i32,
        );
        if self.is_wide() {
            let second = bpf_insn::new(0, 0, 0, 0, (self.imm >> 32) as i32);
            (first, Some(second))
        } else {
            (first, None)
        }
    }
}
