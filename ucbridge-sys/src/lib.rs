//! Raw C ABI of the Unicorn emulator engine.
//!
//! Everything here mirrors `unicorn/unicorn.h` and the per-architecture
//! headers one-to-one. The safe layer lives in the `ucbridge` crate; this
//! crate only fixes layouts, constants and callback signatures so that both a
//! linked `libunicorn` (feature `link`) and in-process engines written against
//! the same ABI can be driven through one set of types.

#![allow(non_camel_case_types)]

use std::ffi::{c_int, c_uint, c_void};

/// Opaque engine instance.
#[repr(C)]
pub struct uc_engine {
    _private: [u8; 0],
}

/// Opaque saved CPU context.
#[repr(C)]
pub struct uc_context {
    _private: [u8; 0],
}

pub type uc_hook = usize;
pub type uc_err = c_int;
pub type uc_arch = c_int;
pub type uc_mode = c_int;
pub type uc_mem_type = c_int;
pub type uc_hook_type = c_int;
pub type uc_query_type = c_int;
pub type uc_control_type = c_int;

pub const UC_API_MAJOR: c_uint = 2;
pub const UC_API_MINOR: c_uint = 1;

pub const UC_ERR_OK: uc_err = 0;
pub const UC_ERR_NOMEM: uc_err = 1;
pub const UC_ERR_ARCH: uc_err = 2;
pub const UC_ERR_HANDLE: uc_err = 3;
pub const UC_ERR_MODE: uc_err = 4;
pub const UC_ERR_VERSION: uc_err = 5;
pub const UC_ERR_READ_UNMAPPED: uc_err = 6;
pub const UC_ERR_WRITE_UNMAPPED: uc_err = 7;
pub const UC_ERR_FETCH_UNMAPPED: uc_err = 8;
pub const UC_ERR_HOOK: uc_err = 9;
pub const UC_ERR_INSN_INVALID: uc_err = 10;
pub const UC_ERR_MAP: uc_err = 11;
pub const UC_ERR_WRITE_PROT: uc_err = 12;
pub const UC_ERR_READ_PROT: uc_err = 13;
pub const UC_ERR_FETCH_PROT: uc_err = 14;
pub const UC_ERR_ARG: uc_err = 15;
pub const UC_ERR_READ_UNALIGNED: uc_err = 16;
pub const UC_ERR_WRITE_UNALIGNED: uc_err = 17;
pub const UC_ERR_FETCH_UNALIGNED: uc_err = 18;
pub const UC_ERR_HOOK_EXIST: uc_err = 19;
pub const UC_ERR_RESOURCE: uc_err = 20;
pub const UC_ERR_EXCEPTION: uc_err = 21;
pub const UC_ERR_OVERFLOW: uc_err = 22;

pub const UC_ARCH_ARM: uc_arch = 1;
pub const UC_ARCH_ARM64: uc_arch = 2;
pub const UC_ARCH_MIPS: uc_arch = 3;
pub const UC_ARCH_X86: uc_arch = 4;
pub const UC_ARCH_PPC: uc_arch = 5;
pub const UC_ARCH_SPARC: uc_arch = 6;
pub const UC_ARCH_M68K: uc_arch = 7;
pub const UC_ARCH_RISCV: uc_arch = 8;
pub const UC_ARCH_S390X: uc_arch = 9;
pub const UC_ARCH_TRICORE: uc_arch = 10;

pub const UC_MODE_LITTLE_ENDIAN: uc_mode = 0;
pub const UC_MODE_BIG_ENDIAN: uc_mode = 1 << 30;
pub const UC_MODE_ARM: uc_mode = 0;
pub const UC_MODE_16: uc_mode = 1 << 1;
pub const UC_MODE_32: uc_mode = 1 << 2;
pub const UC_MODE_64: uc_mode = 1 << 3;
pub const UC_MODE_THUMB: uc_mode = 1 << 4;
pub const UC_MODE_MCLASS: uc_mode = 1 << 5;
pub const UC_MODE_V8: uc_mode = 1 << 6;
pub const UC_MODE_ARMBE8: uc_mode = 1 << 10;
pub const UC_MODE_V9: uc_mode = 1 << 4;

pub const UC_MEM_READ: uc_mem_type = 16;
pub const UC_MEM_WRITE: uc_mem_type = 17;
pub const UC_MEM_FETCH: uc_mem_type = 18;
pub const UC_MEM_READ_UNMAPPED: uc_mem_type = 19;
pub const UC_MEM_WRITE_UNMAPPED: uc_mem_type = 20;
pub const UC_MEM_FETCH_UNMAPPED: uc_mem_type = 21;
pub const UC_MEM_WRITE_PROT: uc_mem_type = 22;
pub const UC_MEM_READ_PROT: uc_mem_type = 23;
pub const UC_MEM_FETCH_PROT: uc_mem_type = 24;
pub const UC_MEM_READ_AFTER: uc_mem_type = 25;

pub const UC_PROT_NONE: u32 = 0;
pub const UC_PROT_READ: u32 = 1;
pub const UC_PROT_WRITE: u32 = 2;
pub const UC_PROT_EXEC: u32 = 4;
pub const UC_PROT_ALL: u32 = 7;

pub const UC_HOOK_INTR: uc_hook_type = 1 << 0;
pub const UC_HOOK_INSN: uc_hook_type = 1 << 1;
pub const UC_HOOK_CODE: uc_hook_type = 1 << 2;
pub const UC_HOOK_BLOCK: uc_hook_type = 1 << 3;
pub const UC_HOOK_MEM_READ_UNMAPPED: uc_hook_type = 1 << 4;
pub const UC_HOOK_MEM_WRITE_UNMAPPED: uc_hook_type = 1 << 5;
pub const UC_HOOK_MEM_FETCH_UNMAPPED: uc_hook_type = 1 << 6;
pub const UC_HOOK_MEM_READ_PROT: uc_hook_type = 1 << 7;
pub const UC_HOOK_MEM_WRITE_PROT: uc_hook_type = 1 << 8;
pub const UC_HOOK_MEM_FETCH_PROT: uc_hook_type = 1 << 9;
pub const UC_HOOK_MEM_READ: uc_hook_type = 1 << 10;
pub const UC_HOOK_MEM_WRITE: uc_hook_type = 1 << 11;
pub const UC_HOOK_MEM_FETCH: uc_hook_type = 1 << 12;
pub const UC_HOOK_MEM_READ_AFTER: uc_hook_type = 1 << 13;
pub const UC_HOOK_INSN_INVALID: uc_hook_type = 1 << 14;
pub const UC_HOOK_EDGE_GENERATED: uc_hook_type = 1 << 15;
pub const UC_HOOK_TCG_OPCODE: uc_hook_type = 1 << 16;
pub const UC_HOOK_TLB_FILL: uc_hook_type = 1 << 17;

pub const UC_HOOK_MEM_UNMAPPED: uc_hook_type =
    UC_HOOK_MEM_READ_UNMAPPED | UC_HOOK_MEM_WRITE_UNMAPPED | UC_HOOK_MEM_FETCH_UNMAPPED;
pub const UC_HOOK_MEM_PROT: uc_hook_type =
    UC_HOOK_MEM_READ_PROT | UC_HOOK_MEM_WRITE_PROT | UC_HOOK_MEM_FETCH_PROT;
pub const UC_HOOK_MEM_INVALID: uc_hook_type = UC_HOOK_MEM_UNMAPPED | UC_HOOK_MEM_PROT;
pub const UC_HOOK_MEM_VALID: uc_hook_type =
    UC_HOOK_MEM_READ | UC_HOOK_MEM_WRITE | UC_HOOK_MEM_FETCH;

pub const UC_QUERY_MODE: uc_query_type = 1;
pub const UC_QUERY_PAGE_SIZE: uc_query_type = 2;
pub const UC_QUERY_ARCH: uc_query_type = 3;
pub const UC_QUERY_TIMEOUT: uc_query_type = 4;

pub const UC_CTL_IO_NONE: u32 = 0;
pub const UC_CTL_IO_WRITE: u32 = 1;
pub const UC_CTL_IO_READ: u32 = 2;
pub const UC_CTL_IO_READ_WRITE: u32 = 3;

pub const UC_CTL_UC_MODE: u32 = 0;
pub const UC_CTL_UC_PAGE_SIZE: u32 = 1;
pub const UC_CTL_UC_ARCH: u32 = 2;
pub const UC_CTL_UC_TIMEOUT: u32 = 3;
pub const UC_CTL_UC_USE_EXITS: u32 = 4;
pub const UC_CTL_UC_EXITS_CNT: u32 = 5;
pub const UC_CTL_UC_EXITS: u32 = 6;
pub const UC_CTL_CPU_MODEL: u32 = 7;
pub const UC_CTL_TB_REQUEST_CACHE: u32 = 8;
pub const UC_CTL_TB_REMOVE_CACHE: u32 = 9;
pub const UC_CTL_TB_FLUSH: u32 = 10;
pub const UC_CTL_TLB_FLUSH: u32 = 11;
pub const UC_CTL_TLB_TYPE: u32 = 12;

/// Encodes a control request the way the `UC_CTL` macro does: the control
/// type in the low bits, the argument count at bit 26, the I/O direction at
/// bit 30.
pub const fn uc_ctl_code(kind: u32, nr: u32, rw: u32) -> uc_control_type {
    (kind | (nr << 26) | (rw << 30)) as uc_control_type
}

pub const UC_TLB_CPU: c_int = 0;
pub const UC_TLB_VIRTUAL: c_int = 1;

pub const UC_X86_REG_GDTR: c_int = 242;
pub const UC_X86_REG_LDTR: c_int = 243;
pub const UC_X86_REG_IDTR: c_int = 244;
pub const UC_X86_REG_TR: c_int = 245;
pub const UC_X86_REG_MSR: c_int = 248;
pub const UC_ARM_REG_CP_REG: c_int = 79;
pub const UC_ARM64_REG_CP_REG: c_int = 261;

pub const UC_X86_INS_CPUID: c_int = 149;
pub const UC_X86_INS_IN: c_int = 218;
pub const UC_X86_INS_OUT: c_int = 500;
pub const UC_X86_INS_SYSENTER: c_int = 697;
pub const UC_X86_INS_SYSCALL: c_int = 699;

pub const UC_ARM64_INS_MRS: c_int = 1;
pub const UC_ARM64_INS_MSR: c_int = 2;
pub const UC_ARM64_INS_SYS: c_int = 3;
pub const UC_ARM64_INS_SYSL: c_int = 4;

pub const UC_TCG_OP_SUB: c_int = 0;
pub const UC_TCG_OP_FLAG_CMP: c_int = 1 << 0;
pub const UC_TCG_OP_FLAG_DIRECT: c_int = 1 << 1;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct uc_mem_region {
    pub begin: u64,
    pub end: u64,
    pub perms: u32,
}

/// x86 memory-management register (GDTR, LDTR, IDTR, TR).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct uc_x86_mmr {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct uc_x86_msr {
    pub rid: u32,
    pub value: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct uc_arm_cp_reg {
    pub cp: u32,
    pub is64: u32,
    pub sec: u32,
    pub crn: u32,
    pub crm: u32,
    pub opc1: u32,
    pub opc2: u32,
    pub val: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct uc_arm64_cp_reg {
    pub crn: u32,
    pub crm: u32,
    pub op0: u32,
    pub op1: u32,
    pub op2: u32,
    pub val: u64,
}

/// Translation block descriptor.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct uc_tb {
    pub pc: u64,
    pub icount: u16,
    pub size: u16,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct uc_tlb_entry {
    pub paddr: u64,
    pub perms: u32,
}

pub type uc_cb_hookintr_t =
    unsafe extern "C" fn(uc: *mut uc_engine, intno: u32, user_data: *mut c_void);
pub type uc_cb_hookcode_t =
    unsafe extern "C" fn(uc: *mut uc_engine, address: u64, size: u32, user_data: *mut c_void);
pub type uc_cb_hookmem_t = unsafe extern "C" fn(
    uc: *mut uc_engine,
    kind: uc_mem_type,
    address: u64,
    size: c_int,
    value: i64,
    user_data: *mut c_void,
);
pub type uc_cb_eventmem_t = unsafe extern "C" fn(
    uc: *mut uc_engine,
    kind: uc_mem_type,
    address: u64,
    size: c_int,
    value: i64,
    user_data: *mut c_void,
) -> bool;
pub type uc_cb_hookinsn_invalid_t =
    unsafe extern "C" fn(uc: *mut uc_engine, user_data: *mut c_void) -> bool;
pub type uc_cb_insn_in_t =
    unsafe extern "C" fn(uc: *mut uc_engine, port: u32, size: c_int, user_data: *mut c_void) -> u32;
pub type uc_cb_insn_out_t = unsafe extern "C" fn(
    uc: *mut uc_engine,
    port: u32,
    size: c_int,
    value: u32,
    user_data: *mut c_void,
);
pub type uc_cb_insn_syscall_t = unsafe extern "C" fn(uc: *mut uc_engine, user_data: *mut c_void);
pub type uc_cb_insn_cpuid_t =
    unsafe extern "C" fn(uc: *mut uc_engine, user_data: *mut c_void) -> c_int;
pub type uc_cb_insn_sys_t = unsafe extern "C" fn(
    uc: *mut uc_engine,
    reg: c_int,
    cp_reg: *const uc_arm64_cp_reg,
    user_data: *mut c_void,
) -> u32;
pub type uc_hook_edge_gen_t = unsafe extern "C" fn(
    uc: *mut uc_engine,
    cur_tb: *mut uc_tb,
    prev_tb: *mut uc_tb,
    user_data: *mut c_void,
);
pub type uc_hook_tcg_op_2 = unsafe extern "C" fn(
    uc: *mut uc_engine,
    address: u64,
    arg1: u64,
    arg2: u64,
    size: u32,
    user_data: *mut c_void,
);
pub type uc_cb_tlbevent_t = unsafe extern "C" fn(
    uc: *mut uc_engine,
    vaddr: u64,
    kind: uc_mem_type,
    result: *mut uc_tlb_entry,
    user_data: *mut c_void,
) -> bool;
pub type uc_cb_mmio_read_t =
    unsafe extern "C" fn(uc: *mut uc_engine, offset: u64, size: c_uint, user_data: *mut c_void) -> u64;
pub type uc_cb_mmio_write_t = unsafe extern "C" fn(
    uc: *mut uc_engine,
    offset: u64,
    size: c_uint,
    value: u64,
    user_data: *mut c_void,
);

#[cfg(feature = "link")]
#[link(name = "unicorn")]
unsafe extern "C" {
    pub fn uc_version(major: *mut c_uint, minor: *mut c_uint) -> c_uint;
    pub fn uc_arch_supported(arch: uc_arch) -> bool;
    pub fn uc_open(arch: uc_arch, mode: uc_mode, uc: *mut *mut uc_engine) -> uc_err;
    pub fn uc_close(uc: *mut uc_engine) -> uc_err;
    pub fn uc_query(uc: *mut uc_engine, kind: uc_query_type, result: *mut usize) -> uc_err;
    pub fn uc_ctl(uc: *mut uc_engine, control: uc_control_type, ...) -> uc_err;
    pub fn uc_errno(uc: *mut uc_engine) -> uc_err;
    pub fn uc_strerror(code: uc_err) -> *const std::ffi::c_char;
    pub fn uc_reg_write(uc: *mut uc_engine, regid: c_int, value: *const c_void) -> uc_err;
    pub fn uc_reg_read(uc: *mut uc_engine, regid: c_int, value: *mut c_void) -> uc_err;
    pub fn uc_mem_write(uc: *mut uc_engine, address: u64, bytes: *const c_void, size: usize)
    -> uc_err;
    pub fn uc_mem_read(uc: *mut uc_engine, address: u64, bytes: *mut c_void, size: usize) -> uc_err;
    pub fn uc_emu_start(uc: *mut uc_engine, begin: u64, until: u64, timeout: u64, count: usize)
    -> uc_err;
    pub fn uc_emu_stop(uc: *mut uc_engine) -> uc_err;
    pub fn uc_hook_add(
        uc: *mut uc_engine,
        hh: *mut uc_hook,
        kind: uc_hook_type,
        callback: *mut c_void,
        user_data: *mut c_void,
        begin: u64,
        end: u64,
        ...
    ) -> uc_err;
    pub fn uc_hook_del(uc: *mut uc_engine, hh: uc_hook) -> uc_err;
    pub fn uc_mem_map(uc: *mut uc_engine, address: u64, size: usize, perms: u32) -> uc_err;
    pub fn uc_mem_map_ptr(
        uc: *mut uc_engine,
        address: u64,
        size: usize,
        perms: u32,
        ptr: *mut c_void,
    ) -> uc_err;
    pub fn uc_mmio_map(
        uc: *mut uc_engine,
        address: u64,
        size: usize,
        read_cb: Option<uc_cb_mmio_read_t>,
        user_data_read: *mut c_void,
        write_cb: Option<uc_cb_mmio_write_t>,
        user_data_write: *mut c_void,
    ) -> uc_err;
    pub fn uc_mem_unmap(uc: *mut uc_engine, address: u64, size: usize) -> uc_err;
    pub fn uc_mem_protect(uc: *mut uc_engine, address: u64, size: usize, perms: u32) -> uc_err;
    pub fn uc_mem_regions(
        uc: *mut uc_engine,
        regions: *mut *mut uc_mem_region,
        count: *mut u32,
    ) -> uc_err;
    pub fn uc_context_alloc(uc: *mut uc_engine, context: *mut *mut uc_context) -> uc_err;
    pub fn uc_free(mem: *mut c_void) -> uc_err;
    pub fn uc_context_save(uc: *mut uc_engine, context: *mut uc_context) -> uc_err;
    pub fn uc_context_reg_write(ctx: *mut uc_context, regid: c_int, value: *const c_void)
    -> uc_err;
    pub fn uc_context_reg_read(ctx: *mut uc_context, regid: c_int, value: *mut c_void) -> uc_err;
    pub fn uc_context_restore(uc: *mut uc_engine, context: *mut uc_context) -> uc_err;
    pub fn uc_context_free(context: *mut uc_context) -> uc_err;
}
