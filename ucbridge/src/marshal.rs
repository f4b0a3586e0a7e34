use crate::error::{Error, Result};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use ucbridge_sys as sys;

/// Widest register any supported architecture exposes (x86 ZMM).
pub const MAX_REGISTER_BYTES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(i32)]
pub enum Arch {
    Arm = sys::UC_ARCH_ARM,
    Arm64 = sys::UC_ARCH_ARM64,
    Mips = sys::UC_ARCH_MIPS,
    X86 = sys::UC_ARCH_X86,
    Ppc = sys::UC_ARCH_PPC,
    Sparc = sys::UC_ARCH_SPARC,
    M68k = sys::UC_ARCH_M68K,
    Riscv = sys::UC_ARCH_RISCV,
    S390x = sys::UC_ARCH_S390X,
    Tricore = sys::UC_ARCH_TRICORE,
}

impl Arch {
    pub fn from_raw(raw: sys::uc_arch) -> Option<Self> {
        Some(match raw {
            sys::UC_ARCH_ARM => Arch::Arm,
            sys::UC_ARCH_ARM64 => Arch::Arm64,
            sys::UC_ARCH_MIPS => Arch::Mips,
            sys::UC_ARCH_X86 => Arch::X86,
            sys::UC_ARCH_PPC => Arch::Ppc,
            sys::UC_ARCH_SPARC => Arch::Sparc,
            sys::UC_ARCH_M68K => Arch::M68k,
            sys::UC_ARCH_RISCV => Arch::Riscv,
            sys::UC_ARCH_S390X => Arch::S390x,
            sys::UC_ARCH_TRICORE => Arch::Tricore,
            _ => return None,
        })
    }

    pub fn raw(self) -> sys::uc_arch {
        self as sys::uc_arch
    }
}

bitflags! {
    /// Engine mode word. Several architectures reuse the same bits, so the
    /// value only means something next to an [`Arch`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Mode: i32 {
        const LITTLE_ENDIAN = sys::UC_MODE_LITTLE_ENDIAN;
        const BIG_ENDIAN = sys::UC_MODE_BIG_ENDIAN;
        const ARM = sys::UC_MODE_ARM;
        const MODE_16 = sys::UC_MODE_16;
        const MODE_32 = sys::UC_MODE_32;
        const MODE_64 = sys::UC_MODE_64;
        const THUMB = sys::UC_MODE_THUMB;
        const MCLASS = sys::UC_MODE_MCLASS;
        const V8 = sys::UC_MODE_V8;
        const ARMBE8 = sys::UC_MODE_ARMBE8;
        const V9 = sys::UC_MODE_V9;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Permission: u32 {
        const NONE = sys::UC_PROT_NONE;
        const READ = sys::UC_PROT_READ;
        const WRITE = sys::UC_PROT_WRITE;
        const EXEC = sys::UC_PROT_EXEC;
        const ALL = Self::READ.bits() | Self::WRITE.bits() | Self::EXEC.bits();
    }
}

/// Access kind reported to memory and TLB hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemType {
    Read,
    Write,
    Fetch,
    ReadUnmapped,
    WriteUnmapped,
    FetchUnmapped,
    WriteProt,
    ReadProt,
    FetchProt,
    ReadAfter,
}

impl MemType {
    pub fn from_raw(raw: sys::uc_mem_type) -> Option<Self> {
        Some(match raw {
            sys::UC_MEM_READ => MemType::Read,
            sys::UC_MEM_WRITE => MemType::Write,
            sys::UC_MEM_FETCH => MemType::Fetch,
            sys::UC_MEM_READ_UNMAPPED => MemType::ReadUnmapped,
            sys::UC_MEM_WRITE_UNMAPPED => MemType::WriteUnmapped,
            sys::UC_MEM_FETCH_UNMAPPED => MemType::FetchUnmapped,
            sys::UC_MEM_WRITE_PROT => MemType::WriteProt,
            sys::UC_MEM_READ_PROT => MemType::ReadProt,
            sys::UC_MEM_FETCH_PROT => MemType::FetchProt,
            sys::UC_MEM_READ_AFTER => MemType::ReadAfter,
            _ => return None,
        })
    }

    pub fn raw(self) -> sys::uc_mem_type {
        match self {
            MemType::Read => sys::UC_MEM_READ,
            MemType::Write => sys::UC_MEM_WRITE,
            MemType::Fetch => sys::UC_MEM_FETCH,
            MemType::ReadUnmapped => sys::UC_MEM_READ_UNMAPPED,
            MemType::WriteUnmapped => sys::UC_MEM_WRITE_UNMAPPED,
            MemType::FetchUnmapped => sys::UC_MEM_FETCH_UNMAPPED,
            MemType::WriteProt => sys::UC_MEM_WRITE_PROT,
            MemType::ReadProt => sys::UC_MEM_READ_PROT,
            MemType::FetchProt => sys::UC_MEM_FETCH_PROT,
            MemType::ReadAfter => sys::UC_MEM_READ_AFTER,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    Mode,
    PageSize,
    Arch,
    /// Whether the last `emu_start` stopped because of its timeout.
    Timeout,
}

impl QueryType {
    pub fn raw(self) -> sys::uc_query_type {
        match self {
            QueryType::Mode => sys::UC_QUERY_MODE,
            QueryType::PageSize => sys::UC_QUERY_PAGE_SIZE,
            QueryType::Arch => sys::UC_QUERY_ARCH,
            QueryType::Timeout => sys::UC_QUERY_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlbMode {
    /// The emulated MMU walks page tables.
    Cpu,
    /// Virtual addresses map one-to-one unless a TLB fill hook says otherwise.
    Virtual,
}

impl TlbMode {
    pub fn raw(self) -> std::ffi::c_int {
        match self {
            TlbMode::Cpu => sys::UC_TLB_CPU,
            TlbMode::Virtual => sys::UC_TLB_VIRTUAL,
        }
    }
}

/// One mapped range as reported by `mem_regions`. `end` is inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRegion {
    pub begin: u64,
    pub end: u64,
    pub perms: Permission,
}

impl From<&sys::uc_mem_region> for MemRegion {
    fn from(raw: &sys::uc_mem_region) -> Self {
        Self {
            begin: raw.begin,
            end: raw.end,
            perms: Permission::from_bits_retain(raw.perms),
        }
    }
}

/// x86 memory-management register (GDTR, LDTR, IDTR, TR).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct X86Mmr {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    pub flags: u32,
}

impl X86Mmr {
    pub(crate) fn from_raw(raw: &sys::uc_x86_mmr) -> Self {
        Self {
            selector: raw.selector,
            base: raw.base,
            limit: raw.limit,
            flags: raw.flags,
        }
    }

    pub(crate) fn to_raw(self) -> sys::uc_x86_mmr {
        sys::uc_x86_mmr {
            selector: self.selector,
            base: self.base,
            limit: self.limit,
            flags: self.flags,
        }
    }
}

/// x86 model-specific register, addressed by `rid`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct X86Msr {
    pub rid: u32,
    pub value: u64,
}

impl X86Msr {
    pub(crate) fn to_raw(self) -> sys::uc_x86_msr {
        sys::uc_x86_msr {
            rid: self.rid,
            value: self.value,
        }
    }
}

/// Selector of an ARM (AArch32) coprocessor register. `val` carries the value
/// on writes and is ignored on reads.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ArmCpReg {
    pub cp: u32,
    pub is64: bool,
    pub sec: bool,
    pub crn: u32,
    pub crm: u32,
    pub opc1: u32,
    pub opc2: u32,
    pub val: u64,
}

impl ArmCpReg {
    pub(crate) fn to_raw(self) -> sys::uc_arm_cp_reg {
        sys::uc_arm_cp_reg {
            cp: self.cp,
            is64: self.is64 as u32,
            sec: self.sec as u32,
            crn: self.crn,
            crm: self.crm,
            opc1: self.opc1,
            opc2: self.opc2,
            val: self.val,
        }
    }
}

/// Selector of an AArch64 system register. Also what arm64 MRS/MSR/SYS/SYSL
/// hooks receive.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Arm64CpReg {
    pub crn: u32,
    pub crm: u32,
    pub op0: u32,
    pub op1: u32,
    pub op2: u32,
    pub val: u64,
}

impl Arm64CpReg {
    pub(crate) fn from_raw(raw: &sys::uc_arm64_cp_reg) -> Self {
        Self {
            crn: raw.crn,
            crm: raw.crm,
            op0: raw.op0,
            op1: raw.op1,
            op2: raw.op2,
            val: raw.val,
        }
    }

    pub(crate) fn to_raw(self) -> sys::uc_arm64_cp_reg {
        sys::uc_arm64_cp_reg {
            crn: self.crn,
            crm: self.crm,
            op0: self.op0,
            op1: self.op1,
            op2: self.op2,
            val: self.val,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TranslationBlock {
    pub pc: u64,
    pub icount: u16,
    pub size: u16,
}

impl From<&sys::uc_tb> for TranslationBlock {
    fn from(raw: &sys::uc_tb) -> Self {
        Self {
            pc: raw.pc,
            icount: raw.icount,
            size: raw.size,
        }
    }
}

/// Scratch storage every register transfer goes through, so the engine can
/// never write past a caller's buffer whatever width it thinks the register
/// has.
#[repr(C, align(16))]
pub(crate) struct RegisterBuffer(pub [u8; MAX_REGISTER_BYTES]);

impl RegisterBuffer {
    pub fn zeroed() -> Self {
        Self([0; MAX_REGISTER_BYTES])
    }

    pub fn with_u64(value: u64) -> Self {
        let mut buf = Self::zeroed();
        buf.0[..8].copy_from_slice(&value.to_ne_bytes());
        buf
    }

    pub fn with_bytes(bytes: &[u8]) -> Result<Self> {
        check_register_len(bytes.len())?;
        let mut buf = Self::zeroed();
        buf.0[..bytes.len()].copy_from_slice(bytes);
        Ok(buf)
    }

    /// The first eight bytes in host order: the 64-bit view of the buffer.
    pub fn wide(&self) -> u64 {
        let mut word = [0u8; 8];
        word.copy_from_slice(&self.0[..8]);
        u64::from_ne_bytes(word)
    }

    /// Stages a native register record.
    pub fn with_record<T: Copy>(record: T) -> Self {
        const { assert!(std::mem::size_of::<T>() <= MAX_REGISTER_BYTES) };
        let mut buf = Self::zeroed();
        // SAFETY: the buffer is 16-byte aligned and large enough for `T`.
        unsafe { buf.0.as_mut_ptr().cast::<T>().write(record) };
        buf
    }

    /// Reads back a native register record.
    ///
    /// # Safety
    /// Every bit pattern the engine may leave behind must be a valid `T`.
    pub unsafe fn record<T: Copy>(&self) -> T {
        const { assert!(std::mem::size_of::<T>() <= MAX_REGISTER_BYTES) };
        // SAFETY: aligned, in bounds, and valid per the caller.
        unsafe { self.0.as_ptr().cast::<T>().read() }
    }

    pub fn as_mut_ptr(&mut self) -> *mut std::ffi::c_void {
        self.0.as_mut_ptr().cast()
    }

    pub fn as_ptr(&self) -> *const std::ffi::c_void {
        self.0.as_ptr().cast()
    }
}

pub(crate) fn check_register_len(len: usize) -> Result<()> {
    if len > MAX_REGISTER_BYTES {
        return Err(Error::contract(format!(
            "register buffer of {len} bytes exceeds the {MAX_REGISTER_BYTES}-byte maximum"
        )));
    }
    Ok(())
}

pub(crate) fn check_register_width(width: usize) -> Result<()> {
    if !matches!(width, 1 | 2 | 4 | 8) {
        return Err(Error::contract(format!(
            "register width must be 1, 2, 4 or 8 bytes, got {width}"
        )));
    }
    Ok(())
}

/// Extracts a `width`-byte register the engine wrote at the start of a
/// 64-bit buffer. On little-endian hosts that is the low end of the word; on
/// big-endian hosts it is the high end.
pub fn narrow_from_wide(wide: u64, width: usize) -> Result<u64> {
    check_register_width(width)?;
    let bytes = wide.to_ne_bytes();
    let mut out = [0u8; 8];
    if cfg!(target_endian = "little") {
        out[..width].copy_from_slice(&bytes[..width]);
        Ok(u64::from_le_bytes(out))
    } else {
        out[8 - width..].copy_from_slice(&bytes[..width]);
        Ok(u64::from_be_bytes(out))
    }
}

/// TLB fill hooks return `-1` to veto, otherwise a physical address with the
/// permission bits folded into its low bits.
pub const TLB_FILL_VETO: i64 = -1;

pub(crate) fn split_tlb_fill(value: i64) -> Option<sys::uc_tlb_entry> {
    if value == TLB_FILL_VETO {
        return None;
    }
    let mask = sys::UC_PROT_ALL as u64;
    let value = value as u64;
    Some(sys::uc_tlb_entry {
        paddr: value & !mask,
        perms: (value & mask) as u32,
    })
}
