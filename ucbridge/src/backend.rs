//! The C API surface the facade drives.
//!
//! [`Backend`] mirrors `unicorn.h` entry point for entry point, raw pointers
//! and raw status codes included. Keeping it this thin means the facade is the
//! only place that knows how statuses become errors and how user data reaches
//! the trampolines, whichever engine sits underneath.

use std::ffi::{CStr, c_int, c_void};
use ucbridge_sys::{
    uc_arch, uc_cb_mmio_read_t, uc_cb_mmio_write_t, uc_context, uc_engine, uc_err, uc_hook,
    uc_hook_type, uc_mem_region, uc_mode, uc_query_type, uc_tb,
};

/// Trailing variadic arguments of `uc_hook_add`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookExtra {
    None,
    /// Instruction id for `UC_HOOK_INSN`.
    Insn(c_int),
    /// Opcode and flags for `UC_HOOK_TCG_OPCODE`.
    TcgOpcode { opcode: c_int, flags: c_int },
}

/// One `uc_ctl` request with its typed arguments.
#[derive(Debug)]
pub enum CtlRequest<'a> {
    GetMode(&'a mut c_int),
    GetArch(&'a mut c_int),
    GetTimeout(&'a mut u64),
    GetPageSize(&'a mut u32),
    SetPageSize(u32),
    SetUseExits(bool),
    GetExitsCount(&'a mut usize),
    GetExits(&'a mut [u64]),
    SetExits(&'a [u64]),
    GetCpuModel(&'a mut c_int),
    SetCpuModel(c_int),
    RequestCache { address: u64, tb: &'a mut uc_tb },
    RemoveCache { begin: u64, end: u64 },
    FlushTb,
    FlushTlb,
    TlbMode(c_int),
}

impl CtlRequest<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            CtlRequest::GetMode(_) => "get_mode",
            CtlRequest::GetArch(_) => "get_arch",
            CtlRequest::GetTimeout(_) => "get_timeout",
            CtlRequest::GetPageSize(_) => "get_page_size",
            CtlRequest::SetPageSize(_) => "set_page_size",
            CtlRequest::SetUseExits(_) => "use_exits",
            CtlRequest::GetExitsCount(_) => "get_exits_cnt",
            CtlRequest::GetExits(_) => "get_exits",
            CtlRequest::SetExits(_) => "set_exits",
            CtlRequest::GetCpuModel(_) => "get_cpu_model",
            CtlRequest::SetCpuModel(_) => "set_cpu_model",
            CtlRequest::RequestCache { .. } => "request_cache",
            CtlRequest::RemoveCache { .. } => "remove_cache",
            CtlRequest::FlushTb => "flush_tb",
            CtlRequest::FlushTlb => "flush_tlb",
            CtlRequest::TlbMode(_) => "tlb_mode",
        }
    }
}

/// An implementation of the engine C API.
///
/// # Safety
///
/// Implementors must behave like `libunicorn`: every callback pointer handed
/// to [`Backend::hook_add`] or [`Backend::mmio_map`] must only ever be called
/// with the signature that matches the hook kind it was registered for, and
/// with the exact `user_data` pointer that accompanied it. Once
/// [`Backend::hook_del`] returns (or the engine is closed) the callback must
/// not be invoked again with that `user_data`. MMIO callbacks may be invoked
/// until the region is unmapped or the engine is closed.
pub unsafe trait Backend: Send + Sync + 'static {
    /// Combined version word `major << 24 | minor << 16 | patch << 8 | extra`.
    fn version(&self) -> u32;
    fn arch_supported(&self, arch: uc_arch) -> bool;
    /// Canonical message for a status code. Never fails.
    fn strerror(&self, code: uc_err) -> &'static CStr;

    /// # Safety
    /// `uc` must point to writable storage for one engine pointer.
    unsafe fn open(&self, arch: uc_arch, mode: uc_mode, uc: *mut *mut uc_engine) -> uc_err;
    /// # Safety
    /// `uc` must be a live engine; it is invalid afterwards.
    unsafe fn close(&self, uc: *mut uc_engine) -> uc_err;
    /// # Safety
    /// `uc` must be a live engine and `result` writable.
    unsafe fn query(&self, uc: *mut uc_engine, kind: uc_query_type, result: *mut usize) -> uc_err;
    /// # Safety
    /// `uc` must be a live engine; every pointer inside `request` must be valid.
    unsafe fn ctl(&self, uc: *mut uc_engine, request: CtlRequest<'_>) -> uc_err;
    /// # Safety
    /// `uc` must be a live engine.
    unsafe fn errno(&self, uc: *mut uc_engine) -> uc_err;

    /// # Safety
    /// `uc` must be a live engine.
    unsafe fn emu_start(
        &self,
        uc: *mut uc_engine,
        begin: u64,
        until: u64,
        timeout: u64,
        count: usize,
    ) -> uc_err;
    /// # Safety
    /// `uc` must be a live engine.
    unsafe fn emu_stop(&self, uc: *mut uc_engine) -> uc_err;

    /// # Safety
    /// `value` must be large enough for the register named by `regid`.
    unsafe fn reg_read(&self, uc: *mut uc_engine, regid: c_int, value: *mut c_void) -> uc_err;
    /// # Safety
    /// `value` must be large enough for the register named by `regid`.
    unsafe fn reg_write(&self, uc: *mut uc_engine, regid: c_int, value: *const c_void) -> uc_err;
    /// # Safety
    /// `ctx` must be a live context; `value` sized for `regid`.
    unsafe fn context_reg_read(&self, ctx: *mut uc_context, regid: c_int, value: *mut c_void)
    -> uc_err;
    /// # Safety
    /// `ctx` must be a live context; `value` sized for `regid`.
    unsafe fn context_reg_write(
        &self,
        ctx: *mut uc_context,
        regid: c_int,
        value: *const c_void,
    ) -> uc_err;

    /// # Safety
    /// `bytes` must be valid for `size` writes.
    unsafe fn mem_read(&self, uc: *mut uc_engine, address: u64, bytes: *mut u8, size: usize)
    -> uc_err;
    /// # Safety
    /// `bytes` must be valid for `size` reads.
    unsafe fn mem_write(
        &self,
        uc: *mut uc_engine,
        address: u64,
        bytes: *const u8,
        size: usize,
    ) -> uc_err;
    /// # Safety
    /// `uc` must be a live engine.
    unsafe fn mem_map(&self, uc: *mut uc_engine, address: u64, size: usize, perms: u32) -> uc_err;
    /// # Safety
    /// `ptr` must stay valid for `size` bytes until the region is unmapped or
    /// the engine closed.
    unsafe fn mem_map_ptr(
        &self,
        uc: *mut uc_engine,
        address: u64,
        size: usize,
        perms: u32,
        ptr: *mut c_void,
    ) -> uc_err;
    /// # Safety
    /// Each user-data pointer must stay valid while its callback can fire.
    #[allow(clippy::too_many_arguments)]
    unsafe fn mmio_map(
        &self,
        uc: *mut uc_engine,
        address: u64,
        size: usize,
        read_cb: Option<uc_cb_mmio_read_t>,
        user_data_read: *mut c_void,
        write_cb: Option<uc_cb_mmio_write_t>,
        user_data_write: *mut c_void,
    ) -> uc_err;
    /// # Safety
    /// `uc` must be a live engine.
    unsafe fn mem_unmap(&self, uc: *mut uc_engine, address: u64, size: usize) -> uc_err;
    /// # Safety
    /// `uc` must be a live engine.
    unsafe fn mem_protect(&self, uc: *mut uc_engine, address: u64, size: usize, perms: u32)
    -> uc_err;
    /// On success `*regions` is an array of `*count` records that must be
    /// released with [`Backend::free`].
    ///
    /// # Safety
    /// `regions` and `count` must be writable.
    unsafe fn mem_regions(
        &self,
        uc: *mut uc_engine,
        regions: *mut *mut uc_mem_region,
        count: *mut u32,
    ) -> uc_err;
    /// # Safety
    /// `mem` must come from this backend's allocator.
    unsafe fn free(&self, mem: *mut c_void) -> uc_err;

    /// # Safety
    /// `context` must be writable.
    unsafe fn context_alloc(&self, uc: *mut uc_engine, context: *mut *mut uc_context) -> uc_err;
    /// # Safety
    /// `context` must be live; it is invalid afterwards.
    unsafe fn context_free(&self, context: *mut uc_context) -> uc_err;
    /// # Safety
    /// Both handles must be live.
    unsafe fn context_save(&self, uc: *mut uc_engine, context: *mut uc_context) -> uc_err;
    /// # Safety
    /// Both handles must be live.
    unsafe fn context_restore(&self, uc: *mut uc_engine, context: *mut uc_context) -> uc_err;

    /// # Safety
    /// `callback` must be a function pointer of the signature `kind` and
    /// `extra` select, and `user_data` must stay valid until
    /// [`Backend::hook_del`] returns.
    #[allow(clippy::too_many_arguments)]
    unsafe fn hook_add(
        &self,
        uc: *mut uc_engine,
        hh: *mut uc_hook,
        kind: uc_hook_type,
        callback: *mut c_void,
        user_data: *mut c_void,
        begin: u64,
        end: u64,
        extra: HookExtra,
    ) -> uc_err;
    /// # Safety
    /// `hh` must have been produced by [`Backend::hook_add`] on `uc`.
    unsafe fn hook_del(&self, uc: *mut uc_engine, hh: uc_hook) -> uc_err;
}

#[cfg(feature = "native")]
pub use native::NativeBackend;

#[cfg(feature = "native")]
mod native {
    use super::*;
    use once_cell::sync::Lazy;
    use std::sync::Arc;
    use ucbridge_sys::{self as sys, uc_ctl_code};

    /// The system `libunicorn`.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct NativeBackend;

    static SHARED: Lazy<Arc<dyn Backend>> = Lazy::new(|| Arc::new(NativeBackend));

    impl NativeBackend {
        /// Process-wide instance, so contexts can move between engines.
        pub fn shared() -> Arc<dyn Backend> {
            SHARED.clone()
        }
    }

    unsafe impl Backend for NativeBackend {
        fn version(&self) -> u32 {
            let mut major = 0;
            let mut minor = 0;
            // SAFETY: both out-pointers are valid locals.
            unsafe { sys::uc_version(&mut major, &mut minor) }
        }

        fn arch_supported(&self, arch: uc_arch) -> bool {
            // SAFETY: pure query.
            unsafe { sys::uc_arch_supported(arch) }
        }

        fn strerror(&self, code: uc_err) -> &'static CStr {
            // SAFETY: uc_strerror returns a static string for every input.
            unsafe { CStr::from_ptr(sys::uc_strerror(code)) }
        }

        unsafe fn open(&self, arch: uc_arch, mode: uc_mode, uc: *mut *mut uc_engine) -> uc_err {
            unsafe { sys::uc_open(arch, mode, uc) }
        }

        unsafe fn close(&self, uc: *mut uc_engine) -> uc_err {
            unsafe { sys::uc_close(uc) }
        }

        unsafe fn query(&self, uc: *mut uc_engine, kind: uc_query_type, result: *mut usize) -> uc_err {
            unsafe { sys::uc_query(uc, kind, result) }
        }

        unsafe fn ctl(&self, uc: *mut uc_engine, request: CtlRequest<'_>) -> uc_err {
            use sys::{UC_CTL_IO_READ as R, UC_CTL_IO_READ_WRITE as RW, UC_CTL_IO_WRITE as W};
            unsafe {
                match request {
                    CtlRequest::GetMode(out) => {
                        sys::uc_ctl(uc, uc_ctl_code(sys::UC_CTL_UC_MODE, 1, R), out as *mut c_int)
                    }
                    CtlRequest::GetArch(out) => {
                        sys::uc_ctl(uc, uc_ctl_code(sys::UC_CTL_UC_ARCH, 1, R), out as *mut c_int)
                    }
                    CtlRequest::GetTimeout(out) => {
                        sys::uc_ctl(uc, uc_ctl_code(sys::UC_CTL_UC_TIMEOUT, 1, R), out as *mut u64)
                    }
                    CtlRequest::GetPageSize(out) => {
                        sys::uc_ctl(uc, uc_ctl_code(sys::UC_CTL_UC_PAGE_SIZE, 1, R), out as *mut u32)
                    }
                    CtlRequest::SetPageSize(size) => {
                        sys::uc_ctl(uc, uc_ctl_code(sys::UC_CTL_UC_PAGE_SIZE, 1, W), size)
                    }
                    CtlRequest::SetUseExits(enable) => {
                        sys::uc_ctl(uc, uc_ctl_code(sys::UC_CTL_UC_USE_EXITS, 1, W), enable as c_int)
                    }
                    CtlRequest::GetExitsCount(out) => {
                        sys::uc_ctl(uc, uc_ctl_code(sys::UC_CTL_UC_EXITS_CNT, 1, R), out as *mut usize)
                    }
                    CtlRequest::GetExits(buf) => sys::uc_ctl(
                        uc,
                        uc_ctl_code(sys::UC_CTL_UC_EXITS, 2, R),
                        buf.as_mut_ptr(),
                        buf.len(),
                    ),
                    CtlRequest::SetExits(buf) => sys::uc_ctl(
                        uc,
                        uc_ctl_code(sys::UC_CTL_UC_EXITS, 2, W),
                        buf.as_ptr(),
                        buf.len(),
                    ),
                    CtlRequest::GetCpuModel(out) => {
                        sys::uc_ctl(uc, uc_ctl_code(sys::UC_CTL_CPU_MODEL, 1, R), out as *mut c_int)
                    }
                    CtlRequest::SetCpuModel(model) => {
                        sys::uc_ctl(uc, uc_ctl_code(sys::UC_CTL_CPU_MODEL, 1, W), model)
                    }
                    CtlRequest::RequestCache { address, tb } => sys::uc_ctl(
                        uc,
                        uc_ctl_code(sys::UC_CTL_TB_REQUEST_CACHE, 2, RW),
                        address,
                        tb as *mut uc_tb,
                    ),
                    CtlRequest::RemoveCache { begin, end } => {
                        sys::uc_ctl(uc, uc_ctl_code(sys::UC_CTL_TB_REMOVE_CACHE, 2, W), begin, end)
                    }
                    CtlRequest::FlushTb => sys::uc_ctl(uc, uc_ctl_code(sys::UC_CTL_TB_FLUSH, 0, W)),
                    CtlRequest::FlushTlb => sys::uc_ctl(uc, uc_ctl_code(sys::UC_CTL_TLB_FLUSH, 0, W)),
                    CtlRequest::TlbMode(mode) => {
                        sys::uc_ctl(uc, uc_ctl_code(sys::UC_CTL_TLB_TYPE, 1, W), mode)
                    }
                }
            }
        }

        unsafe fn errno(&self, uc: *mut uc_engine) -> uc_err {
            unsafe { sys::uc_errno(uc) }
        }

        unsafe fn emu_start(
            &self,
            uc: *mut uc_engine,
            begin: u64,
            until: u64,
            timeout: u64,
            count: usize,
        ) -> uc_err {
            unsafe { sys::uc_emu_start(uc, begin, until, timeout, count) }
        }

        unsafe fn emu_stop(&self, uc: *mut uc_engine) -> uc_err {
            unsafe { sys::uc_emu_stop(uc) }
        }

        unsafe fn reg_read(&self, uc: *mut uc_engine, regid: c_int, value: *mut c_void) -> uc_err {
            unsafe { sys::uc_reg_read(uc, regid, value) }
        }

        unsafe fn reg_write(&self, uc: *mut uc_engine, regid: c_int, value: *const c_void) -> uc_err {
            unsafe { sys::uc_reg_write(uc, regid, value) }
        }

        unsafe fn context_reg_read(
            &self,
            ctx: *mut uc_context,
            regid: c_int,
            value: *mut c_void,
        ) -> uc_err {
            unsafe { sys::uc_context_reg_read(ctx, regid, value) }
        }

        unsafe fn context_reg_write(
            &self,
            ctx: *mut uc_context,
            regid: c_int,
            value: *const c_void,
        ) -> uc_err {
            unsafe { sys::uc_context_reg_write(ctx, regid, value) }
        }

        unsafe fn mem_read(
            &self,
            uc: *mut uc_engine,
            address: u64,
            bytes: *mut u8,
            size: usize,
        ) -> uc_err {
            unsafe { sys::uc_mem_read(uc, address, bytes.cast(), size) }
        }

        unsafe fn mem_write(
            &self,
            uc: *mut uc_engine,
            address: u64,
            bytes: *const u8,
            size: usize,
        ) -> uc_err {
            unsafe { sys::uc_mem_write(uc, address, bytes.cast(), size) }
        }

        unsafe fn mem_map(&self, uc: *mut uc_engine, address: u64, size: usize, perms: u32) -> uc_err {
            unsafe { sys::uc_mem_map(uc, address, size, perms) }
        }

        unsafe fn mem_map_ptr(
            &self,
            uc: *mut uc_engine,
            address: u64,
            size: usize,
            perms: u32,
            ptr: *mut c_void,
        ) -> uc_err {
            unsafe { sys::uc_mem_map_ptr(uc, address, size, perms, ptr) }
        }

        unsafe fn mmio_map(
            &self,
            uc: *mut uc_engine,
            address: u64,
            size: usize,
            read_cb: Option<uc_cb_mmio_read_t>,
            user_data_read: *mut c_void,
            write_cb: Option<uc_cb_mmio_write_t>,
            user_data_write: *mut c_void,
        ) -> uc_err {
            unsafe {
                sys::uc_mmio_map(uc, address, size, read_cb, user_data_read, write_cb, user_data_write)
            }
        }

        unsafe fn mem_unmap(&self, uc: *mut uc_engine, address: u64, size: usize) -> uc_err {
            unsafe { sys::uc_mem_unmap(uc, address, size) }
        }

        unsafe fn mem_protect(
            &self,
            uc: *mut uc_engine,
            address: u64,
            size: usize,
            perms: u32,
        ) -> uc_err {
            unsafe { sys::uc_mem_protect(uc, address, size, perms) }
        }

        unsafe fn mem_regions(
            &self,
            uc: *mut uc_engine,
            regions: *mut *mut uc_mem_region,
            count: *mut u32,
        ) -> uc_err {
            unsafe { sys::uc_mem_regions(uc, regions, count) }
        }

        unsafe fn free(&self, mem: *mut c_void) -> uc_err {
            unsafe { sys::uc_free(mem) }
        }

        unsafe fn context_alloc(&self, uc: *mut uc_engine, context: *mut *mut uc_context) -> uc_err {
            unsafe { sys::uc_context_alloc(uc, context) }
        }

        unsafe fn context_free(&self, context: *mut uc_context) -> uc_err {
            unsafe { sys::uc_context_free(context) }
        }

        unsafe fn context_save(&self, uc: *mut uc_engine, context: *mut uc_context) -> uc_err {
            unsafe { sys::uc_context_save(uc, context) }
        }

        unsafe fn context_restore(&self, uc: *mut uc_engine, context: *mut uc_context) -> uc_err {
            unsafe { sys::uc_context_restore(uc, context) }
        }

        unsafe fn hook_add(
            &self,
            uc: *mut uc_engine,
            hh: *mut uc_hook,
            kind: uc_hook_type,
            callback: *mut c_void,
            user_data: *mut c_void,
            begin: u64,
            end: u64,
            extra: HookExtra,
        ) -> uc_err {
            unsafe {
                match extra {
                    HookExtra::None => sys::uc_hook_add(uc, hh, kind, callback, user_data, begin, end),
                    HookExtra::Insn(insn) => {
                        sys::uc_hook_add(uc, hh, kind, callback, user_data, begin, end, insn)
                    }
                    HookExtra::TcgOpcode { opcode, flags } => sys::uc_hook_add(
                        uc, hh, kind, callback, user_data, begin, end, opcode, flags,
                    ),
                }
            }
        }

        unsafe fn hook_del(&self, uc: *mut uc_engine, hh: uc_hook) -> uc_err {
            unsafe { sys::uc_hook_del(uc, hh) }
        }
    }
}
