pub mod bpf_cmd {
    pub type Type = ::std::os::raw::c_uint;
    pub const BPF_MAP_CREATE: Type = 0;
    pub const BPF_MAP_LOOKUP_ELEM: Type = 1;
    pub const BPF_MAP_UPDATE_ELEM: Type = 2;
    pub const BPF_MAP_DELETE_ELEM: Type = 3;
    pub const BPF_MAP_GET_NEXT_KEY: Type = 4;
    pub const BPF_PROG_LOAD: Type = 5;
    pub const BPF_OBJ_PIN: Type = 6;
    pub const BPF_OBJ_GET: Type = 7;
    pub const BPF_PROG_ATTACH: Type = 8;
    pub const BPF_PROG_DETACH: Type = 9;
    pub const BPF_RAW_TRACEPOINT_OPEN: Type = 17;
}

pub mod bpf_prog_type {
    pub type Type = ::std::os::raw::c_uint;
    pub const BPF_PROG_TYPE_UNSPEC: Type = 0;
    pub const BPF_PROG_TYPE_SOCKET_FILTER: Type = 1;
    pub const BPF_PROG_TYPE_KPROBE: Type = 2;
    pub const BPF_PROG_TYPE_SCHED_CLS: Type = 3;
    pub const BPF_PROG_TYPE_SCHED_ACT: Type = 4;
    pub const BPF_PROG_TYPE_TRACEPOINT: Type = 5;
    pub const BPF_PROG_TYPE_XDP: Type = 6;
    pub const BPF_PROG_TYPE_PERF_EVENT: Type = 7;
    pub const BPF_PROG_TYPE_TRACING: Type = 26;
}

pub mod bpf_map_type {
    pub type Type = ::std::os::raw::c_uint;
    pub const BPF_MAP_TYPE_UNSPEC: Type = 0;
    pub const BPF_MAP_TYPE_HASH: Type = 1;
    pub const BPF_MAP_TYPE_ARRAY: Type = 2;
    pub const BPF_MAP_TYPE_PROG_ARRAY: Type = 3;
    pub const BPF_MAP_TYPE_PERF_EVENT_ARRAY: Type = 4;
    pub const BPF_MAP_TYPE_PERCPU_HASH: Type = 5;
    pub const BPF_MAP_TYPE_PERCPU_ARRAY: Type = 6;
}

pub mod bpf_attach_type {
    pub type Type = ::std::os::raw::c_uint;
    pub const BPF_TRACE_RAW_TP: Type = 23;
    pub const BPF_TRACE_FENTRY: Type = 24;
    pub const BPF_TRACE_FEXIT: Type = 25;
    pub const BPF_MODIFY_RETURN: Type = 26;
}

// BPF_MAP_UPDATE_ELEM flags
pub const BPF_ANY: u64 = 0;
pub const BPF_NOEXIST: u64 = 1;
pub const BPF_EXIST: u64 = 2;

pub const BPF_PSEUDO_MAP_FD: u8 = 1;

pub const BPF_OBJ_NAME_LEN: usize = 16;

// instruction classes
pub const BPF_LD: u8 = 0x00;
pub const BPF_LDX: u8 = 0x01;
pub const BPF_ST: u8 = 0x02;
pub const BPF_STX: u8 = 0x03;
pub const BPF_ALU: u8 = 0x04;
pub const BPF_JMP: u8 = 0x05;
pub const BPF_ALU64: u8 = 0x07;

// ld/ldx size
pub const BPF_W: u8 = 0x00;
pub const BPF_H: u8 = 0x08;
pub const BPF_B: u8 = 0x10;
pub const BPF_DW: u8 = 0x18;

// ld/ldx mode
pub const BPF_IMM: u8 = 0x00;
pub const BPF_MEM: u8 = 0x60;

// alu/jmp source
pub const BPF_K: u8 = 0x00;
pub const BPF_X: u8 = 0x08;

// alu operations
pub const BPF_ADD: u8 = 0x00;
pub const BPF_MOV: u8 = 0xb0;

// jmp operations
pub const BPF_JEQ: u8 = 0x10;
pub const BPF_CALL: u8 = 0x80;
pub const BPF_EXIT: u8 = 0x90;

// helper function ids
pub const BPF_FUNC_map_lookup_elem: i32 = 1;

pub const SO_ATTACH_BPF: ::std::os::raw::c_int = 50;
pub const SO_DETACH_BPF: ::std::os::raw::c_int = 27;

/// A single raw eBPF instruction slot. `dst_reg` occupies the low nibble of
/// `regs`, `src_reg` the high nibble.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct bpf_insn {
    pub code: u8,
    pub regs: u8,
    pub off: i16,
    pub imm: i32,
}

impl bpf_insn {
    pub fn new(code: u8, dst_reg: u8, src_reg: u8, off: i16, imm: i32) -> bpf_insn {
        bpf_insn {
            code,
            regs: (dst_reg & 0x0f) | (src_reg << 4),
            off,
            imm,
        }
    }

    pub fn dst_reg(&self) -> u8 {
        self.regs & 0x0f
    }

    pub fn src_reg(&self) -> u8 {
        self.regs >> 4
    }

    pub fn set_dst_reg(&mut self, reg: u8) {
        self.regs = (self.regs & 0xf0) | (reg & 0x0f);
    }

    pub fn set_src_reg(&mut self, reg: u8) {
        self.regs = (self.regs & 0x0f) | (reg << 4);
    }
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct bpf_attr_map_create {
    pub map_type: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub map_flags: u32,
    pub inner_map_fd: u32,
    pub numa_node: u32,
    pub map_name: [::std::os::raw::c_char; BPF_OBJ_NAME_LEN],
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct bpf_attr_map_elem {
    pub map_fd: u32,
    pub key: u64,
    // value and next_key share this slot in the kernel union
    pub value: u64,
    pub flags: u64,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct bpf_attr_prog_load {
    pub prog_type: u32,
    pub insn_cnt: u32,
    pub insns: u64,
    pub license: u64,
    pub log_level: u32,
    pub log_size: u32,
    pub log_buf: u64,
    pub kern_version: u32,
    pub prog_flags: u32,
    pub prog_name: [::std::os::raw::c_char; BPF_OBJ_NAME_LEN],
    pub prog_ifindex: u32,
    pub expected_attach_type: u32,
    pub prog_btf_fd: u32,
    pub func_info_rec_size: u32,
    pub func_info: u64,
    pub func_info_cnt: u32,
    pub line_info_rec_size: u32,
    pub line_info: u64,
    pub line_info_cnt: u32,
    pub attach_btf_id: u32,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct bpf_attr_raw_tracepoint {
    pub name: u64,
    pub prog_fd: u32,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub union bpf_attr {
    pub map_create: bpf_attr_map_create,
    pub map_elem: bpf_attr_map_elem,
    pub prog_load: bpf_attr_prog_load,
    pub raw_tracepoint: bpf_attr_raw_tracepoint,
}
