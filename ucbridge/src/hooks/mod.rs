//! Host-side hook types.
//!
//! Each native callback signature has its own trait. Closures of the right
//! shape implement it automatically; stateful hooks can implement it on a
//! struct and be shared through an `Arc`.

mod registry;
mod trampoline;

pub use registry::HookHandle;
pub(crate) use registry::{PendingFailure, RetiredBinding, mmio_map, register, unregister};

use crate::backend::HookExtra;
use crate::engine::Unicorn;
use crate::marshal::{Arm64CpReg, MemType, TranslationBlock};
use bitflags::bitflags;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use ucbridge_sys as sys;

/// Result of a host callback. An `Err` stops emulation and is returned from
/// the `emu_start` call that was running.
pub type HookResult<T> = anyhow::Result<T>;

/// Opaque value handed back to a hook on every invocation.
pub type UserData = Arc<dyn Any + Send + Sync>;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HookType: i32 {
        const INTR = sys::UC_HOOK_INTR;
        const INSN = sys::UC_HOOK_INSN;
        const CODE = sys::UC_HOOK_CODE;
        const BLOCK = sys::UC_HOOK_BLOCK;
        const MEM_READ_UNMAPPED = sys::UC_HOOK_MEM_READ_UNMAPPED;
        const MEM_WRITE_UNMAPPED = sys::UC_HOOK_MEM_WRITE_UNMAPPED;
        const MEM_FETCH_UNMAPPED = sys::UC_HOOK_MEM_FETCH_UNMAPPED;
        const MEM_READ_PROT = sys::UC_HOOK_MEM_READ_PROT;
        const MEM_WRITE_PROT = sys::UC_HOOK_MEM_WRITE_PROT;
        const MEM_FETCH_PROT = sys::UC_HOOK_MEM_FETCH_PROT;
        const MEM_READ = sys::UC_HOOK_MEM_READ;
        const MEM_WRITE = sys::UC_HOOK_MEM_WRITE;
        const MEM_FETCH = sys::UC_HOOK_MEM_FETCH;
        const MEM_READ_AFTER = sys::UC_HOOK_MEM_READ_AFTER;
        const INSN_INVALID = sys::UC_HOOK_INSN_INVALID;
        const EDGE_GENERATED = sys::UC_HOOK_EDGE_GENERATED;
        const TCG_OPCODE = sys::UC_HOOK_TCG_OPCODE;
        const TLB_FILL = sys::UC_HOOK_TLB_FILL;

        const MEM_UNMAPPED = sys::UC_HOOK_MEM_UNMAPPED;
        const MEM_PROT = sys::UC_HOOK_MEM_PROT;
        const MEM_INVALID = sys::UC_HOOK_MEM_INVALID;
        const MEM_VALID = sys::UC_HOOK_MEM_VALID;
    }
}

/// Instruction ids that select a dedicated `UC_HOOK_INSN` shape.
pub mod insn {
    use ucbridge_sys as sys;

    pub const X86_IN: i32 = sys::UC_X86_INS_IN;
    pub const X86_OUT: i32 = sys::UC_X86_INS_OUT;
    pub const X86_SYSCALL: i32 = sys::UC_X86_INS_SYSCALL;
    pub const X86_SYSENTER: i32 = sys::UC_X86_INS_SYSENTER;
    pub const X86_CPUID: i32 = sys::UC_X86_INS_CPUID;
    pub const ARM64_MRS: i32 = sys::UC_ARM64_INS_MRS;
    pub const ARM64_MSR: i32 = sys::UC_ARM64_INS_MSR;
    pub const ARM64_SYS: i32 = sys::UC_ARM64_INS_SYS;
    pub const ARM64_SYSL: i32 = sys::UC_ARM64_INS_SYSL;
}

/// The sixteen native callback signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookShape {
    Interrupt,
    Code,
    Block,
    MemValid,
    MemInvalid,
    InvalidInstruction,
    PortIn,
    PortOut,
    Syscall,
    Cpuid,
    Arm64Sys,
    EdgeGenerated,
    TcgOpcode,
    TlbFill,
    MmioRead,
    MmioWrite,
}

impl HookShape {
    pub const ALL: [HookShape; 16] = [
        HookShape::Interrupt,
        HookShape::Code,
        HookShape::Block,
        HookShape::MemValid,
        HookShape::MemInvalid,
        HookShape::InvalidInstruction,
        HookShape::PortIn,
        HookShape::PortOut,
        HookShape::Syscall,
        HookShape::Cpuid,
        HookShape::Arm64Sys,
        HookShape::EdgeGenerated,
        HookShape::TcgOpcode,
        HookShape::TlbFill,
        HookShape::MmioRead,
        HookShape::MmioWrite,
    ];

    pub fn name(self) -> &'static str {
        registry::descriptor(self).name
    }

    /// Picks the shape for a `uc_hook_add` call, or the engine status that
    /// rejects the combination.
    ///
    /// Only exact kinds are accepted: a single event, or a mask made purely
    /// of valid-access or purely of invalid-access memory events.
    pub fn resolve(kind: HookType, extra: HookExtra) -> Result<HookShape, crate::ErrorCode> {
        use crate::ErrorCode;

        match extra {
            HookExtra::Insn(id) => {
                if kind != HookType::INSN {
                    return Err(ErrorCode::Hook);
                }
                return match id {
                    insn::X86_IN => Ok(HookShape::PortIn),
                    insn::X86_OUT => Ok(HookShape::PortOut),
                    insn::X86_SYSCALL | insn::X86_SYSENTER => Ok(HookShape::Syscall),
                    insn::X86_CPUID => Ok(HookShape::Cpuid),
                    insn::ARM64_MRS | insn::ARM64_MSR | insn::ARM64_SYS | insn::ARM64_SYSL => {
                        Ok(HookShape::Arm64Sys)
                    }
                    _ => Err(ErrorCode::InsnInvalid),
                };
            }
            HookExtra::TcgOpcode { .. } => {
                return if kind == HookType::TCG_OPCODE {
                    Ok(HookShape::TcgOpcode)
                } else {
                    Err(ErrorCode::Hook)
                };
            }
            HookExtra::None => {}
        }

        if kind.is_empty() {
            return Err(ErrorCode::Hook);
        }
        let shape = if kind == HookType::INTR {
            HookShape::Interrupt
        } else if kind == HookType::CODE {
            HookShape::Code
        } else if kind == HookType::BLOCK {
            HookShape::Block
        } else if kind == HookType::INSN_INVALID {
            HookShape::InvalidInstruction
        } else if kind == HookType::EDGE_GENERATED {
            HookShape::EdgeGenerated
        } else if kind == HookType::TLB_FILL {
            HookShape::TlbFill
        } else if (HookType::MEM_VALID | HookType::MEM_READ_AFTER).contains(kind) {
            HookShape::MemValid
        } else if HookType::MEM_INVALID.contains(kind) {
            HookShape::MemInvalid
        } else {
            return Err(ErrorCode::Hook);
        };
        Ok(shape)
    }
}

impl fmt::Display for HookShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

macro_rules! hook_traits {
    ($(
        $(#[$meta:meta])*
        $name:ident($($arg:ident: $ty:ty),*) -> $ret:ty;
    )*) => {$(
        $(#[$meta])*
        pub trait $name: Send + Sync + 'static {
            fn call(&self, uc: &Unicorn, $($arg: $ty,)* user_data: Option<&UserData>)
                -> HookResult<$ret>;
        }

        impl<F> $name for F
        where
            F: Fn(&Unicorn, $($ty,)* Option<&UserData>) -> HookResult<$ret> + Send + Sync + 'static,
        {
            fn call(&self, uc: &Unicorn, $($arg: $ty,)* user_data: Option<&UserData>)
                -> HookResult<$ret> {
                self(uc, $($arg,)* user_data)
            }
        }
    )*};
}

hook_traits! {
    /// `UC_HOOK_INTR`: interrupt or exception number.
    InterruptHook(intno: u32) -> ();
    /// `UC_HOOK_CODE`: address and size of the instruction about to run.
    CodeHook(address: u64, size: u32) -> ();
    /// `UC_HOOK_BLOCK`: address and size of the block about to run.
    BlockHook(address: u64, size: u32) -> ();
    /// Valid memory accesses. `value` is only meaningful for writes.
    MemHook(access: MemType, address: u64, size: i32, value: i64) -> ();
    /// Invalid memory accesses. Return `true` once the fault is handled and
    /// the access should be retried, `false` to let it fault.
    MemFaultHook(access: MemType, address: u64, size: i32, value: i64) -> bool;
    /// `UC_HOOK_INSN_INVALID`. Return `true` to continue past it.
    InvalidInstructionHook() -> bool;
    /// x86 `IN`: returns the value read from `port`.
    PortInHook(port: u32, size: i32) -> u32;
    /// x86 `OUT`.
    PortOutHook(port: u32, size: i32, value: u32) -> ();
    /// x86 `SYSCALL` / `SYSENTER`.
    SyscallHook() -> ();
    /// x86 `CPUID`. Return `true` to skip the engine's own CPUID handling.
    CpuidHook() -> bool;
    /// arm64 `MRS`/`MSR`/`SYS`/`SYSL`. Return `true` to skip the instruction.
    Arm64SysHook(reg: i32, cp_reg: &Arm64CpReg) -> bool;
    /// A new translation block was generated; `prev` is the block it was
    /// reached from, if the engine knows it.
    EdgeGeneratedHook(cur: &TranslationBlock, prev: Option<&TranslationBlock>) -> ();
    /// `UC_HOOK_TCG_OPCODE` with two operands.
    TcgOpcodeHook(address: u64, arg1: u64, arg2: u64, size: u32) -> ();
    /// Virtual TLB miss. Return the physical address with the permission
    /// bits in its low three bits, or [`crate::TLB_FILL_VETO`].
    TlbFillHook(vaddr: u64, access: MemType) -> i64;
    /// MMIO read at `offset` from the start of the region.
    MmioReadHook(offset: u64, size: u32) -> u64;
    /// MMIO write at `offset` from the start of the region.
    MmioWriteHook(offset: u64, size: u32, value: u64) -> ();
}

/// A host callback tagged with its shape.
#[derive(Clone)]
pub enum HookTarget {
    Interrupt(Arc<dyn InterruptHook>),
    Code(Arc<dyn CodeHook>),
    Block(Arc<dyn BlockHook>),
    MemValid(Arc<dyn MemHook>),
    MemInvalid(Arc<dyn MemFaultHook>),
    InvalidInstruction(Arc<dyn InvalidInstructionHook>),
    PortIn(Arc<dyn PortInHook>),
    PortOut(Arc<dyn PortOutHook>),
    Syscall(Arc<dyn SyscallHook>),
    Cpuid(Arc<dyn CpuidHook>),
    Arm64Sys(Arc<dyn Arm64SysHook>),
    EdgeGenerated(Arc<dyn EdgeGeneratedHook>),
    TcgOpcode(Arc<dyn TcgOpcodeHook>),
    TlbFill(Arc<dyn TlbFillHook>),
    MmioRead(Arc<dyn MmioReadHook>),
    MmioWrite(Arc<dyn MmioWriteHook>),
}

impl HookTarget {
    pub fn shape(&self) -> HookShape {
        match self {
            HookTarget::Interrupt(_) => HookShape::Interrupt,
            HookTarget::Code(_) => HookShape::Code,
            HookTarget::Block(_) => HookShape::Block,
            HookTarget::MemValid(_) => HookShape::MemValid,
            HookTarget::MemInvalid(_) => HookShape::MemInvalid,
            HookTarget::InvalidInstruction(_) => HookShape::InvalidInstruction,
            HookTarget::PortIn(_) => HookShape::PortIn,
            HookTarget::PortOut(_) => HookShape::PortOut,
            HookTarget::Syscall(_) => HookShape::Syscall,
            HookTarget::Cpuid(_) => HookShape::Cpuid,
            HookTarget::Arm64Sys(_) => HookShape::Arm64Sys,
            HookTarget::EdgeGenerated(_) => HookShape::EdgeGenerated,
            HookTarget::TcgOpcode(_) => HookShape::TcgOpcode,
            HookTarget::TlbFill(_) => HookShape::TlbFill,
            HookTarget::MmioRead(_) => HookShape::MmioRead,
            HookTarget::MmioWrite(_) => HookShape::MmioWrite,
        }
    }

    pub fn interrupt(f: impl Fn(&Unicorn, u32, Option<&UserData>) -> HookResult<()> + Send + Sync + 'static) -> Self {
        HookTarget::Interrupt(Arc::new(f))
    }

    pub fn code(
        f: impl Fn(&Unicorn, u64, u32, Option<&UserData>) -> HookResult<()> + Send + Sync + 'static,
    ) -> Self {
        HookTarget::Code(Arc::new(f))
    }

    pub fn block(
        f: impl Fn(&Unicorn, u64, u32, Option<&UserData>) -> HookResult<()> + Send + Sync + 'static,
    ) -> Self {
        HookTarget::Block(Arc::new(f))
    }

    pub fn mem(
        f: impl Fn(&Unicorn, MemType, u64, i32, i64, Option<&UserData>) -> HookResult<()>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        HookTarget::MemValid(Arc::new(f))
    }

    pub fn mem_fault(
        f: impl Fn(&Unicorn, MemType, u64, i32, i64, Option<&UserData>) -> HookResult<bool>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        HookTarget::MemInvalid(Arc::new(f))
    }

    pub fn invalid_instruction(
        f: impl Fn(&Unicorn, Option<&UserData>) -> HookResult<bool> + Send + Sync + 'static,
    ) -> Self {
        HookTarget::InvalidInstruction(Arc::new(f))
    }

    pub fn port_in(
        f: impl Fn(&Unicorn, u32, i32, Option<&UserData>) -> HookResult<u32> + Send + Sync + 'static,
    ) -> Self {
        HookTarget::PortIn(Arc::new(f))
    }

    pub fn port_out(
        f: impl Fn(&Unicorn, u32, i32, u32, Option<&UserData>) -> HookResult<()>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        HookTarget::PortOut(Arc::new(f))
    }

    pub fn syscall(
        f: impl Fn(&Unicorn, Option<&UserData>) -> HookResult<()> + Send + Sync + 'static,
    ) -> Self {
        HookTarget::Syscall(Arc::new(f))
    }

    pub fn cpuid(
        f: impl Fn(&Unicorn, Option<&UserData>) -> HookResult<bool> + Send + Sync + 'static,
    ) -> Self {
        HookTarget::Cpuid(Arc::new(f))
    }

    pub fn arm64_sys(
        f: impl Fn(&Unicorn, i32, &Arm64CpReg, Option<&UserData>) -> HookResult<bool>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        HookTarget::Arm64Sys(Arc::new(f))
    }

    pub fn edge_generated(
        f: impl Fn(&Unicorn, &TranslationBlock, Option<&TranslationBlock>, Option<&UserData>) -> HookResult<()>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        HookTarget::EdgeGenerated(Arc::new(f))
    }

    pub fn tcg_opcode(
        f: impl Fn(&Unicorn, u64, u64, u64, u32, Option<&UserData>) -> HookResult<()>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        HookTarget::TcgOpcode(Arc::new(f))
    }

    pub fn tlb_fill(
        f: impl Fn(&Unicorn, u64, MemType, Option<&UserData>) -> HookResult<i64> + Send + Sync + 'static,
    ) -> Self {
        HookTarget::TlbFill(Arc::new(f))
    }

    pub fn mmio_read(
        f: impl Fn(&Unicorn, u64, u32, Option<&UserData>) -> HookResult<u64> + Send + Sync + 'static,
    ) -> Self {
        HookTarget::MmioRead(Arc::new(f))
    }

    pub fn mmio_write(
        f: impl Fn(&Unicorn, u64, u32, u64, Option<&UserData>) -> HookResult<()>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        HookTarget::MmioWrite(Arc::new(f))
    }
}

impl fmt::Debug for HookTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HookTarget").field(&self.shape()).finish()
    }
}
