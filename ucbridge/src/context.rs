//! Saved CPU contexts and register access shared by live engines and
//! contexts.

use crate::backend::Backend;
use crate::error::{Error, Result, check};
use crate::marshal::{
    self, ArmCpReg, Arm64CpReg, RegisterBuffer, X86Mmr, X86Msr, check_register_len,
    check_register_width,
};
use std::ffi::{c_int, c_void};
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::warn;
use ucbridge_sys::{self as sys, uc_context};

pub(crate) mod sealed {
    use crate::backend::Backend;
    use crate::engine::Live;
    use ucbridge_sys::uc_context;

    /// Where register reads and writes go. A live engine stays open while
    /// its source is held.
    pub enum Source<'a> {
        Live(Live<'a>),
        Saved(*mut uc_context),
    }

    pub trait RegisterSource {
        fn register_backend(&self) -> &dyn Backend;
        fn register_source(&self) -> crate::Result<Source<'_>>;
    }
}

use sealed::{RegisterSource, Source};

/// # Safety
/// `value` must point to at least [`marshal::MAX_REGISTER_BYTES`] writable bytes.
unsafe fn read_into<S: RegisterSource + ?Sized>(
    source: &S,
    regid: c_int,
    value: *mut c_void,
) -> Result<()> {
    let backend = source.register_backend();
    let status = match source.register_source()? {
        // SAFETY: live handle, buffer sized per the caller.
        Source::Live(live) => unsafe { backend.reg_read(live.uc(), regid, value) },
        Source::Saved(ctx) => unsafe { backend.context_reg_read(ctx, regid, value) },
    };
    check(backend, status)
}

/// # Safety
/// `value` must point to at least [`marshal::MAX_REGISTER_BYTES`] readable bytes.
unsafe fn write_from<S: RegisterSource + ?Sized>(
    source: &S,
    regid: c_int,
    value: *const c_void,
) -> Result<()> {
    let backend = source.register_backend();
    let status = match source.register_source()? {
        // SAFETY: live handle, buffer sized per the caller.
        Source::Live(live) => unsafe { backend.reg_write(live.uc(), regid, value) },
        Source::Saved(ctx) => unsafe { backend.context_reg_write(ctx, regid, value) },
    };
    check(backend, status)
}

/// Register access against either a running engine or a saved [`Context`].
///
/// Every transfer is staged through a scratch buffer as wide as the widest
/// register, so a register wider than the caller expected cannot overrun
/// caller memory.
pub trait RegisterAccess: RegisterSource {
    /// Reads a register through a 64-bit view.
    ///
    /// Registers narrower than 64 bits land at the start of that view, which
    /// is the low end of the returned value only on little-endian hosts. Use
    /// [`RegisterAccess::reg_read_narrow`] for sub-word registers when the
    /// host byte order matters.
    fn reg_read(&self, regid: i32) -> Result<u64> {
        let mut buf = RegisterBuffer::zeroed();
        // SAFETY: the scratch buffer has the maximum register width.
        unsafe { read_into(self, regid, buf.as_mut_ptr())? };
        Ok(buf.wide())
    }

    /// Reads a `width`-byte register (1, 2, 4 or 8) with the correct value on
    /// any host byte order.
    fn reg_read_narrow(&self, regid: i32, width: usize) -> Result<u64> {
        check_register_width(width)?;
        marshal::narrow_from_wide(self.reg_read(regid)?, width)
    }

    fn reg_write(&self, regid: i32, value: u64) -> Result<()> {
        let buf = RegisterBuffer::with_u64(value);
        // SAFETY: the scratch buffer has the maximum register width.
        unsafe { write_from(self, regid, buf.as_ptr()) }
    }

    /// Reads a register into `buf`, which should match the register width.
    fn reg_read_bytes(&self, regid: i32, buf: &mut [u8]) -> Result<()> {
        check_register_len(buf.len())?;
        let mut scratch = RegisterBuffer::zeroed();
        // SAFETY: the scratch buffer has the maximum register width.
        unsafe { read_into(self, regid, scratch.as_mut_ptr())? };
        buf.copy_from_slice(&scratch.0[..buf.len()]);
        Ok(())
    }

    fn reg_write_bytes(&self, regid: i32, bytes: &[u8]) -> Result<()> {
        let scratch = RegisterBuffer::with_bytes(bytes)?;
        // SAFETY: the scratch buffer has the maximum register width.
        unsafe { write_from(self, regid, scratch.as_ptr()) }
    }

    /// Reads GDTR, LDTR, IDTR or TR.
    fn reg_read_x86_mmr(&self, regid: i32) -> Result<X86Mmr> {
        let mut buf = RegisterBuffer::with_record(sys::uc_x86_mmr::default());
        // SAFETY: the scratch buffer has the maximum register width.
        unsafe { read_into(self, regid, buf.as_mut_ptr())? };
        // SAFETY: all-integer record.
        let raw = unsafe { buf.record::<sys::uc_x86_mmr>() };
        Ok(X86Mmr::from_raw(&raw))
    }

    fn reg_write_x86_mmr(&self, regid: i32, mmr: &X86Mmr) -> Result<()> {
        let buf = RegisterBuffer::with_record(mmr.to_raw());
        // SAFETY: the scratch buffer has the maximum register width.
        unsafe { write_from(self, regid, buf.as_ptr()) }
    }

    fn reg_read_x86_msr(&self, rid: u32) -> Result<u64> {
        let mut buf = RegisterBuffer::with_record(X86Msr { rid, value: 0 }.to_raw());
        // SAFETY: the scratch buffer has the maximum register width.
        unsafe { read_into(self, sys::UC_X86_REG_MSR, buf.as_mut_ptr())? };
        // SAFETY: all-integer record.
        Ok(unsafe { buf.record::<sys::uc_x86_msr>() }.value)
    }

    fn reg_write_x86_msr(&self, msr: &X86Msr) -> Result<()> {
        let buf = RegisterBuffer::with_record(msr.to_raw());
        // SAFETY: the scratch buffer has the maximum register width.
        unsafe { write_from(self, sys::UC_X86_REG_MSR, buf.as_ptr()) }
    }

    /// Reads the AArch32 coprocessor register `reg` selects.
    fn reg_read_arm_cp(&self, reg: &ArmCpReg) -> Result<u64> {
        let mut buf = RegisterBuffer::with_record(reg.to_raw());
        // SAFETY: the scratch buffer has the maximum register width.
        unsafe { read_into(self, sys::UC_ARM_REG_CP_REG, buf.as_mut_ptr())? };
        // SAFETY: all-integer record.
        Ok(unsafe { buf.record::<sys::uc_arm_cp_reg>() }.val)
    }

    /// Writes `reg.val` to the AArch32 coprocessor register `reg` selects.
    fn reg_write_arm_cp(&self, reg: &ArmCpReg) -> Result<()> {
        let buf = RegisterBuffer::with_record(reg.to_raw());
        // SAFETY: the scratch buffer has the maximum register width.
        unsafe { write_from(self, sys::UC_ARM_REG_CP_REG, buf.as_ptr()) }
    }

    fn reg_read_arm64_cp(&self, reg: &Arm64CpReg) -> Result<u64> {
        let mut buf = RegisterBuffer::with_record(reg.to_raw());
        // SAFETY: the scratch buffer has the maximum register width.
        unsafe { read_into(self, sys::UC_ARM64_REG_CP_REG, buf.as_mut_ptr())? };
        // SAFETY: all-integer record.
        Ok(unsafe { buf.record::<sys::uc_arm64_cp_reg>() }.val)
    }

    fn reg_write_arm64_cp(&self, reg: &Arm64CpReg) -> Result<()> {
        let buf = RegisterBuffer::with_record(reg.to_raw());
        // SAFETY: the scratch buffer has the maximum register width.
        unsafe { write_from(self, sys::UC_ARM64_REG_CP_REG, buf.as_ptr()) }
    }
}

/// A saved register snapshot.
///
/// Freed by [`Context::free`] or on drop. May be restored into any engine
/// opened on the same backend.
pub struct Context {
    backend: Arc<dyn Backend>,
    handle: Option<NonNull<uc_context>>,
}

// SAFETY: the context is plain engine-allocated memory with no thread
// affinity; `&mut` access is required to save into it.
unsafe impl Send for Context {}

impl Context {
    pub(crate) fn from_raw(backend: Arc<dyn Backend>, handle: NonNull<uc_context>) -> Self {
        Self {
            backend,
            handle: Some(handle),
        }
    }

    fn raw(&self) -> Result<*mut uc_context> {
        self.handle.map(NonNull::as_ptr).ok_or(Error::Closed)
    }

    /// The native handle, provided the context belongs to `backend`.
    pub(crate) fn raw_for(&self, backend: &Arc<dyn Backend>) -> Result<*mut uc_context> {
        if !std::ptr::addr_eq(Arc::as_ptr(&self.backend), Arc::as_ptr(backend)) {
            return Err(Error::contract(
                "context was allocated by a different backend",
            ));
        }
        self.raw()
    }

    pub fn free(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        // SAFETY: the handle is live and dropped from `self` above.
        check(self.backend.as_ref(), unsafe {
            self.backend.context_free(handle.as_ptr())
        })
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!(%err, "failed to free context on drop");
        }
    }
}

impl RegisterSource for Context {
    fn register_backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    fn register_source(&self) -> Result<Source<'_>> {
        self.raw().map(Source::Saved)
    }
}

impl RegisterAccess for Context {}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("handle", &self.handle)
            .finish()
    }
}
