use std::{cmp, ffi::CStr, mem, os::unix::io::RawFd, slice};

use crate::{
    generated::{bpf_attr, bpf_cmd, bpf_insn, BPF_OBJ_NAME_LEN},
    obj::MapSpec,
    programs::VerifierLog,
    sys::SysResult,
    Pod,
};

use super::{syscall, Syscall};

pub(crate) fn bpf_create_map(name: &CStr, spec: &MapSpec) -> SysResult {
    let mut attr = unsafe { mem::zeroed::<bpf_attr>() };

    let u = unsafe { &mut attr.map_create };
    u.map_type = spec.ty.bpf_map_type();
    u.key_size = spec.key_size;
    u.value_size = spec.value_size;
    u.max_entries = spec.max_entries;
    u.map_flags = spec.flags;

    // map_name is 16 bytes max and must be NULL terminated
    let name_len = cmp::min(name.to_bytes().len(), BPF_OBJ_NAME_LEN - 1);
    u.map_name[..name_len]
        .copy_from_slice(unsafe { slice::from_raw_parts(name.as_ptr(), name_len) });

    sys_bpf(bpf_cmd::BPF_MAP_CREATE, &attr)
}

pub(crate) struct ProgLoadAttrs<'a> {
    pub(crate) prog_type: u32,
    pub(crate) name: &'a CStr,
    pub(crate) insns: &'a [bpf_insn],
    pub(crate) license: &'a CStr,
    pub(crate) kern_version: u32,
    pub(crate) expected_attach_type: u32,
    pub(crate) attach_btf_id: u32,
}

pub(crate) fn bpf_load_program(attrs: &ProgLoadAttrs, log: &mut VerifierLog) -> SysResult {
    let mut attr = unsafe { mem::zeroed::<bpf_attr>() };

    let u = unsafe { &mut attr.prog_load };
    u.prog_type = attrs.prog_type;
    u.expected_attach_type = attrs.expected_attach_type;
    u.attach_btf_id = attrs.attach_btf_id;
    u.insns = attrs.insns.as_ptr() as u64;
    u.insn_cnt = attrs.insns.len() as u32;
    u.license = attrs.license.as_ptr() as u64;
    u.kern_version = attrs.kern_version;

    let name_len = cmp::min(attrs.name.to_bytes().len(), BPF_OBJ_NAME_LEN - 1);
    u.prog_name[..name_len]
        .copy_from_slice(unsafe { slice::from_raw_parts(attrs.name.as_ptr(), name_len) });

    let log_buf = log.buf();
    if log_buf.capacity() > 0 {
        u.log_level = 7;
        u.log_buf = log_buf.as_mut_ptr() as u64;
        u.log_size = log_buf.capacity() as u32;
    }

    sys_bpf(bpf_cmd::BPF_PROG_LOAD, &attr)
}

pub(crate) fn bpf_map_update_elem<K: Pod, V: Pod>(
    fd: RawFd,
    key: &K,
    value: &V,
    flags: u64,
) -> SysResult {
    let mut attr = unsafe { mem::zeroed::<bpf_attr>() };

    let u = unsafe { &mut attr.map_elem };
    u.map_fd = fd as u32;
    u.key = key as *const _ as u64;
    u.value = value as *const _ as u64;
    u.flags = flags;

    sys_bpf(bpf_cmd::BPF_MAP_UPDATE_ELEM, &attr)
}

pub(crate) fn bpf_map_update_elem_ptr<K>(
    fd: RawFd,
    key: *const K,
    value: *const u8,
    flags: u64,
) -> SysResult {
    let mut attr = unsafe { mem::zeroed::<bpf_attr>() };

    let u = unsafe { &mut attr.map_elem };
    u.map_fd = fd as u32;
    u.key = key as u64;
    u.value = value as u64;
    u.flags = flags;

    sys_bpf(bpf_cmd::BPF_MAP_UPDATE_ELEM, &attr)
}

pub(crate) fn bpf_raw_tracepoint_open(name: Option<&CStr>, prog_fd: RawFd) -> SysResult {
    let mut attr = unsafe { mem::zeroed::<bpf_attr>() };

    let u = unsafe { &mut attr.raw_tracepoint };
    u.name = name.map(|n| n.as_ptr() as u64).unwrap_or(0);
    u.prog_fd = prog_fd as u32;

    sys_bpf(bpf_cmd::BPF_RAW_TRACEPOINT_OPEN, &attr)
}

fn sys_bpf(cmd: bpf_cmd::Type, attr: &bpf_attr) -> SysResult {
    syscall(Syscall::Bpf { cmd, attr })
}
