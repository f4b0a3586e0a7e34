//! One `extern "C"` entry point per hook shape.
//!
//! Every trampoline funnels through [`dispatch`]: attach the thread, snapshot
//! the record, bail out if the record is detached or the engine already
//! carries a failure, call the host with panics caught, and on failure park
//! the error on the engine and ask it to stop.

use super::registry::{Attached, HookBinding, PendingFailure};
use super::{HookResult, HookShape, HookTarget};
use crate::marshal::{Arm64CpReg, MemType, TLB_FILL_VETO, TranslationBlock, split_tlb_fill};
use crate::runtime::{self, panic_message};
use anyhow::anyhow;
use std::ffi::{c_int, c_uint, c_void};
use tracing::trace;
use ucbridge_sys::{self as sys, uc_engine};

pub(crate) fn entry(shape: HookShape) -> *mut c_void {
    match shape {
        HookShape::Interrupt => hook_intr as sys::uc_cb_hookintr_t as *mut c_void,
        HookShape::Code => hook_code as sys::uc_cb_hookcode_t as *mut c_void,
        HookShape::Block => hook_block as sys::uc_cb_hookcode_t as *mut c_void,
        HookShape::MemValid => hook_mem as sys::uc_cb_hookmem_t as *mut c_void,
        HookShape::MemInvalid => hook_mem_invalid as sys::uc_cb_eventmem_t as *mut c_void,
        HookShape::InvalidInstruction => {
            hook_insn_invalid as sys::uc_cb_hookinsn_invalid_t as *mut c_void
        }
        HookShape::PortIn => hook_insn_in as sys::uc_cb_insn_in_t as *mut c_void,
        HookShape::PortOut => hook_insn_out as sys::uc_cb_insn_out_t as *mut c_void,
        HookShape::Syscall => hook_insn_syscall as sys::uc_cb_insn_syscall_t as *mut c_void,
        HookShape::Cpuid => hook_insn_cpuid as sys::uc_cb_insn_cpuid_t as *mut c_void,
        HookShape::Arm64Sys => hook_insn_sys as sys::uc_cb_insn_sys_t as *mut c_void,
        HookShape::EdgeGenerated => hook_edge_generated as sys::uc_hook_edge_gen_t as *mut c_void,
        HookShape::TcgOpcode => hook_tcg_op as sys::uc_hook_tcg_op_2 as *mut c_void,
        HookShape::TlbFill => hook_tlb_fill as sys::uc_cb_tlbevent_t as *mut c_void,
        HookShape::MmioRead => mmio_read as sys::uc_cb_mmio_read_t as *mut c_void,
        HookShape::MmioWrite => mmio_write as sys::uc_cb_mmio_write_t as *mut c_void,
    }
}

/// Runs the host side of one native callback and returns what the engine
/// should see. `neutral` is returned whenever the host is not reached or
/// fails.
///
/// # Safety
/// `user_data` must be null or a live [`HookBinding`], and `uc` the engine
/// making the call.
unsafe fn dispatch<T>(
    uc: *mut uc_engine,
    user_data: *mut c_void,
    neutral: T,
    call: impl FnOnce(&Attached) -> Result<T, PendingFailure>,
) -> T {
    let env = runtime::attach_current_thread();
    if user_data.is_null() {
        return neutral;
    }
    // SAFETY: the engine hands back the record registered with this
    // trampoline, which stays allocated until the hook is gone natively.
    // The host call may release the record, so nothing below reads it
    // after `env.call`.
    let (shape, snapshot) = {
        let binding = unsafe { &*user_data.cast::<HookBinding>() };
        (binding.shape(), binding.snapshot())
    };
    let Some(attached) = snapshot else {
        trace!(%shape, "dispatch to detached hook skipped");
        return neutral;
    };

    if attached.engine.has_pending_failure() {
        request_stop(&attached, uc);
        return neutral;
    }

    let outcome = match env.call(|| call(&attached)) {
        Ok(outcome) => outcome,
        Err(payload) => Err(PendingFailure::Host(anyhow!(
            "{shape} hook panicked: {}",
            panic_message(&*payload)
        ))),
    };
    match outcome {
        Ok(value) => value,
        Err(failure) => {
            trace!(%shape, "host failure recorded, stopping emulation");
            attached.engine.record_failure(failure);
            request_stop(&attached, uc);
            neutral
        }
    }
}

fn request_stop(attached: &Attached, uc: *mut uc_engine) {
    // SAFETY: `uc` is the engine currently inside one of our callbacks.
    let status = unsafe { attached.engine.backend().emu_stop(uc) };
    if status != sys::UC_ERR_OK {
        trace!(status, "emu_stop from hook failed");
    }
}

fn host<T>(result: HookResult<T>) -> Result<T, PendingFailure> {
    result.map_err(PendingFailure::Host)
}

fn mismatch<T>(target: &HookTarget, trampoline: HookShape) -> Result<T, PendingFailure> {
    Err(PendingFailure::Contract(format!(
        "{} callback reached the {trampoline} trampoline",
        target.shape()
    )))
}

fn mem_type(raw: c_int) -> Result<MemType, PendingFailure> {
    MemType::from_raw(raw)
        .ok_or_else(|| PendingFailure::Contract(format!("unknown memory access type {raw}")))
}

unsafe extern "C" fn hook_intr(uc: *mut uc_engine, intno: u32, user_data: *mut c_void) {
    unsafe {
        dispatch(uc, user_data, (), |a| match &a.target {
            HookTarget::Interrupt(h) => host(h.call(&a.engine, intno, a.user_data.as_ref())),
            other => mismatch(other, HookShape::Interrupt),
        })
    }
}

unsafe extern "C" fn hook_code(uc: *mut uc_engine, address: u64, size: u32, user_data: *mut c_void) {
    unsafe {
        dispatch(uc, user_data, (), |a| match &a.target {
            HookTarget::Code(h) => host(h.call(&a.engine, address, size, a.user_data.as_ref())),
            other => mismatch(other, HookShape::Code),
        })
    }
}

unsafe extern "C" fn hook_block(uc: *mut uc_engine, address: u64, size: u32, user_data: *mut c_void) {
    unsafe {
        dispatch(uc, user_data, (), |a| match &a.target {
            HookTarget::Block(h) => host(h.call(&a.engine, address, size, a.user_data.as_ref())),
            other => mismatch(other, HookShape::Block),
        })
    }
}

unsafe extern "C" fn hook_mem(
    uc: *mut uc_engine,
    kind: c_int,
    address: u64,
    size: c_int,
    value: i64,
    user_data: *mut c_void,
) {
    unsafe {
        dispatch(uc, user_data, (), |a| {
            let access = mem_type(kind)?;
            match &a.target {
                HookTarget::MemValid(h) => host(h.call(
                    &a.engine,
                    access,
                    address,
                    size,
                    value,
                    a.user_data.as_ref(),
                )),
                other => mismatch(other, HookShape::MemValid),
            }
        })
    }
}

unsafe extern "C" fn hook_mem_invalid(
    uc: *mut uc_engine,
    kind: c_int,
    address: u64,
    size: c_int,
    value: i64,
    user_data: *mut c_void,
) -> bool {
    unsafe {
        dispatch(uc, user_data, false, |a| {
            let access = mem_type(kind)?;
            match &a.target {
                HookTarget::MemInvalid(h) => host(h.call(
                    &a.engine,
                    access,
                    address,
                    size,
                    value,
                    a.user_data.as_ref(),
                )),
                other => mismatch(other, HookShape::MemInvalid),
            }
        })
    }
}

unsafe extern "C" fn hook_insn_invalid(uc: *mut uc_engine, user_data: *mut c_void) -> bool {
    unsafe {
        dispatch(uc, user_data, false, |a| match &a.target {
            HookTarget::InvalidInstruction(h) => host(h.call(&a.engine, a.user_data.as_ref())),
            other => mismatch(other, HookShape::InvalidInstruction),
        })
    }
}

unsafe extern "C" fn hook_insn_in(
    uc: *mut uc_engine,
    port: u32,
    size: c_int,
    user_data: *mut c_void,
) -> u32 {
    unsafe {
        dispatch(uc, user_data, 0, |a| match &a.target {
            HookTarget::PortIn(h) => host(h.call(&a.engine, port, size, a.user_data.as_ref())),
            other => mismatch(other, HookShape::PortIn),
        })
    }
}

unsafe extern "C" fn hook_insn_out(
    uc: *mut uc_engine,
    port: u32,
    size: c_int,
    value: u32,
    user_data: *mut c_void,
) {
    unsafe {
        dispatch(uc, user_data, (), |a| match &a.target {
            HookTarget::PortOut(h) => {
                host(h.call(&a.engine, port, size, value, a.user_data.as_ref()))
            }
            other => mismatch(other, HookShape::PortOut),
        })
    }
}

unsafe extern "C" fn hook_insn_syscall(uc: *mut uc_engine, user_data: *mut c_void) {
    unsafe {
        dispatch(uc, user_data, (), |a| match &a.target {
            HookTarget::Syscall(h) => host(h.call(&a.engine, a.user_data.as_ref())),
            other => mismatch(other, HookShape::Syscall),
        })
    }
}

unsafe extern "C" fn hook_insn_cpuid(uc: *mut uc_engine, user_data: *mut c_void) -> c_int {
    unsafe {
        dispatch(uc, user_data, 0, |a| match &a.target {
            HookTarget::Cpuid(h) => host(h.call(&a.engine, a.user_data.as_ref())).map(c_int::from),
            other => mismatch(other, HookShape::Cpuid),
        })
    }
}

unsafe extern "C" fn hook_insn_sys(
    uc: *mut uc_engine,
    reg: c_int,
    cp_reg: *const sys::uc_arm64_cp_reg,
    user_data: *mut c_void,
) -> u32 {
    // SAFETY: when non-null the engine passes a record valid for this call.
    let cp_reg = unsafe { cp_reg.as_ref() }.map(Arm64CpReg::from_raw);
    unsafe {
        dispatch(uc, user_data, 0, |a| {
            let Some(cp_reg) = cp_reg.as_ref() else {
                return Err(PendingFailure::Contract(
                    "arm64 system register hook received a null register descriptor".into(),
                ));
            };
            match &a.target {
                HookTarget::Arm64Sys(h) => {
                    host(h.call(&a.engine, reg, cp_reg, a.user_data.as_ref())).map(u32::from)
                }
                other => mismatch(other, HookShape::Arm64Sys),
            }
        })
    }
}

unsafe extern "C" fn hook_edge_generated(
    uc: *mut uc_engine,
    cur_tb: *mut sys::uc_tb,
    prev_tb: *mut sys::uc_tb,
    user_data: *mut c_void,
) {
    // SAFETY: when non-null both blocks are valid for the duration of the call.
    let cur = unsafe { cur_tb.as_ref() }.map(TranslationBlock::from);
    let prev = unsafe { prev_tb.as_ref() }.map(TranslationBlock::from);
    unsafe {
        dispatch(uc, user_data, (), |a| {
            let Some(cur) = cur.as_ref() else {
                return Err(PendingFailure::Contract(
                    "edge generated hook received a null current translation block".into(),
                ));
            };
            match &a.target {
                HookTarget::EdgeGenerated(h) => {
                    host(h.call(&a.engine, cur, prev.as_ref(), a.user_data.as_ref()))
                }
                other => mismatch(other, HookShape::EdgeGenerated),
            }
        })
    }
}

unsafe extern "C" fn hook_tcg_op(
    uc: *mut uc_engine,
    address: u64,
    arg1: u64,
    arg2: u64,
    size: u32,
    user_data: *mut c_void,
) {
    unsafe {
        dispatch(uc, user_data, (), |a| match &a.target {
            HookTarget::TcgOpcode(h) => host(h.call(
                &a.engine,
                address,
                arg1,
                arg2,
                size,
                a.user_data.as_ref(),
            )),
            other => mismatch(other, HookShape::TcgOpcode),
        })
    }
}

unsafe extern "C" fn hook_tlb_fill(
    uc: *mut uc_engine,
    vaddr: u64,
    kind: c_int,
    result: *mut sys::uc_tlb_entry,
    user_data: *mut c_void,
) -> bool {
    let value = unsafe {
        dispatch(uc, user_data, TLB_FILL_VETO, |a| {
            let access = mem_type(kind)?;
            match &a.target {
                HookTarget::TlbFill(h) => host(h.call(&a.engine, vaddr, access, a.user_data.as_ref())),
                other => mismatch(other, HookShape::TlbFill),
            }
        })
    };
    let Some(entry) = split_tlb_fill(value) else {
        return false;
    };
    if result.is_null() {
        return false;
    }
    // SAFETY: non-null, and the engine expects the entry written here.
    unsafe { result.write(entry) };
    true
}

pub(crate) unsafe extern "C" fn mmio_read(
    uc: *mut uc_engine,
    offset: u64,
    size: c_uint,
    user_data: *mut c_void,
) -> u64 {
    unsafe {
        dispatch(uc, user_data, 0, |a| match &a.target {
            HookTarget::MmioRead(h) => host(h.call(&a.engine, offset, size, a.user_data.as_ref())),
            other => mismatch(other, HookShape::MmioRead),
        })
    }
}

pub(crate) unsafe extern "C" fn mmio_write(
    uc: *mut uc_engine,
    offset: u64,
    size: c_uint,
    value: u64,
    user_data: *mut c_void,
) {
    unsafe {
        dispatch(uc, user_data, (), |a| match &a.target {
            HookTarget::MmioWrite(h) => {
                host(h.call(&a.engine, offset, size, value, a.user_data.as_ref()))
            }
            other => mismatch(other, HookShape::MmioWrite),
        })
    }
}
