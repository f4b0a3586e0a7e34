use crate::backend::{Backend, CtlRequest, HookExtra};
use crate::context::{Context, sealed};
use crate::error::{Error, ErrorCode, Result, check};
use crate::hooks::{
    self, HookHandle, HookResult, HookTarget, HookType, PendingFailure, RetiredBinding, UserData,
};
use crate::marshal::{Arch, MemRegion, MemType, Mode, Permission, QueryType, TlbMode, TranslationBlock};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::ffi::{c_int, c_void};
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, trace, warn};
use ucbridge_sys::{self as sys, uc_engine};

/// A live native engine pointer. Only [`EngineHandle::open`] creates one and
/// only [`EngineHandle::close`] consumes it.
struct EngineHandle(NonNull<uc_engine>);

// SAFETY: the pointer is only ever handed to the backend, whose contract
// covers calls from any thread. Conflicting concurrent calls are the caller's
// responsibility, exactly as with the C API.
unsafe impl Send for EngineHandle {}
unsafe impl Sync for EngineHandle {}

impl EngineHandle {
    fn open(backend: &dyn Backend, arch: Arch, mode: Mode) -> Result<Self> {
        let mut uc = ptr::null_mut();
        // SAFETY: `uc` is a valid out-pointer.
        let status = unsafe { backend.open(arch.raw(), mode.bits(), &mut uc) };
        check(backend, status)?;
        NonNull::new(uc)
            .map(EngineHandle)
            .ok_or_else(|| Error::contract("engine open succeeded but returned a null handle"))
    }

    fn close(self, backend: &dyn Backend) -> Result<()> {
        // SAFETY: the handle is live and consumed here.
        check(backend, unsafe { backend.close(self.0.as_ptr()) })
    }
}

/// Host memory handed to the engine by [`Unicorn::mem_map_host`].
struct HostMapping {
    address: u64,
    buffer: NonNull<[u8]>,
}

// SAFETY: the buffer is owned exclusively and only touched by the engine.
unsafe impl Send for HostMapping {}
unsafe impl Sync for HostMapping {}

impl Drop for HostMapping {
    fn drop(&mut self) {
        // SAFETY: produced by `Box::into_raw` in `mem_map_host`.
        drop(unsafe { Box::from_raw(self.buffer.as_ptr()) });
    }
}

pub(crate) struct EngineInner {
    backend: Arc<dyn Backend>,
    arch: Arch,
    mode: Mode,
    handle: RwLock<Option<EngineHandle>>,
    running: AtomicUsize,
    pending: Mutex<Option<PendingFailure>>,
    retired: Mutex<Vec<RetiredBinding>>,
    host_mappings: Mutex<Vec<HostMapping>>,
}

/// Keeps the engine open while held. Every facade call holds one across its
/// backend calls, so [`Unicorn::close`] cannot free the handle under it.
pub struct Live<'a> {
    _guard: RwLockReadGuard<'a, Option<EngineHandle>>,
    uc: *mut uc_engine,
}

impl Live<'_> {
    pub(crate) fn uc(&self) -> *mut uc_engine {
        self.uc
    }
}

impl EngineInner {
    /// Hooks re-enter the facade while the outer call still holds its guard,
    /// hence the recursive read.
    fn live(&self) -> Result<Live<'_>> {
        let guard = self.handle.read_recursive();
        let uc = guard
            .as_ref()
            .map(|handle| handle.0.as_ptr())
            .ok_or(Error::Closed)?;
        Ok(Live { _guard: guard, uc })
    }

    pub(crate) fn is_open(&self) -> bool {
        self.handle.read_recursive().is_some()
    }

    fn regions(&self, live: &Live<'_>) -> Result<Vec<MemRegion>> {
        let mut regions: *mut sys::uc_mem_region = ptr::null_mut();
        let mut count = 0u32;
        // SAFETY: both out-pointers are valid.
        check(self.backend.as_ref(), unsafe {
            self.backend.mem_regions(live.uc(), &mut regions, &mut count)
        })?;
        if regions.is_null() {
            return Ok(Vec::new());
        }
        // SAFETY: on success the engine returns `count` records at `regions`.
        let result = unsafe { std::slice::from_raw_parts(regions, count as usize) }
            .iter()
            .map(MemRegion::from)
            .collect();
        // SAFETY: allocated by the engine for us.
        let status = unsafe { self.backend.free(regions.cast()) };
        if status != sys::UC_ERR_OK {
            warn!(status, "failed to free region list");
        }
        Ok(result)
    }

    /// Keeps a released MMIO record until its region is unmapped. A record
    /// whose region is already gone, or whose engine is closed, is freed now.
    pub(crate) fn park(&self, binding: RetiredBinding) {
        let Ok(live) = self.live() else {
            return;
        };
        match self.regions(&live) {
            Ok(regions) if !binding.still_mapped(&regions) => {
                trace!("MMIO record released after its region was unmapped");
            }
            Ok(_) => self.retired.lock().push(binding),
            Err(err) => {
                warn!(%err, "could not list regions, parking MMIO record until close");
                self.retired.lock().push(binding);
            }
        }
    }

    fn shutdown(&self) -> Result<()> {
        let handle = {
            let Some(mut slot) = self.handle.try_write() else {
                return Err(Error::contract(
                    "cannot close an engine while another call is using it",
                ));
            };
            slot.take().ok_or(Error::Closed)?
        };
        let result = handle.close(&*self.backend);
        // The engine is gone, so nothing can reach these any more.
        let retired = std::mem::take(&mut *self.retired.lock());
        let mappings = std::mem::take(&mut *self.host_mappings.lock());
        debug!(
            arch = ?self.arch,
            parked = retired.len(),
            host_mappings = mappings.len(),
            "engine closed"
        );
        drop(retired);
        drop(mappings);
        result
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        if self.handle.get_mut().is_some()
            && let Err(err) = self.shutdown()
        {
            warn!(%err, "failed to close engine on drop");
        }
    }
}

struct RunningGuard<'a>(&'a AtomicUsize);

impl<'a> RunningGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Safe facade over one native engine instance.
///
/// Cloning is cheap and yields another reference to the same engine; hooks
/// receive such a reference. The engine is closed by [`Unicorn::close`] or
/// when the last reference goes away. Every operation on a closed engine
/// fails with [`Error::Closed`].
#[derive(Clone)]
pub struct Unicorn {
    inner: Arc<EngineInner>,
}

impl Unicorn {
    pub fn open(backend: Arc<dyn Backend>, arch: Arch, mode: Mode) -> Result<Self> {
        crate::runtime::runtime();
        let handle = EngineHandle::open(&*backend, arch, mode)?;
        debug!(?arch, ?mode, "engine opened");
        Ok(Self {
            inner: Arc::new(EngineInner {
                backend,
                arch,
                mode,
                handle: RwLock::new(Some(handle)),
                running: AtomicUsize::new(0),
                pending: Mutex::new(None),
                retired: Mutex::new(Vec::new()),
                host_mappings: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Opens an engine on the system `libunicorn`.
    #[cfg(feature = "native")]
    pub fn new(arch: Arch, mode: Mode) -> Result<Self> {
        Self::open(crate::backend::NativeBackend::shared(), arch, mode)
    }

    /// Closes the engine. Hooks still attached stop firing; their handles can
    /// be released afterwards.
    pub fn close(&self) -> Result<()> {
        if self.inner.running.load(Ordering::Acquire) > 0 {
            return Err(Error::contract(
                "cannot close an engine while emu_start is running on it",
            ));
        }
        self.inner.shutdown()
    }

    pub fn is_closed(&self) -> bool {
        !self.inner.is_open()
    }

    pub fn arch(&self) -> Arch {
        self.inner.arch
    }

    pub fn mode(&self) -> Mode {
        self.inner.mode
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.inner.backend
    }

    pub(crate) fn inner(&self) -> &Arc<EngineInner> {
        &self.inner
    }

    pub(crate) fn live(&self) -> Result<Live<'_>> {
        self.inner.live()
    }

    /// Released MMIO records still waiting for their region to be unmapped.
    pub fn parked_mmio_records(&self) -> usize {
        self.inner.retired.lock().len()
    }

    pub(crate) fn has_pending_failure(&self) -> bool {
        self.inner.pending.lock().is_some()
    }

    pub(crate) fn record_failure(&self, failure: PendingFailure) {
        let mut pending = self.inner.pending.lock();
        if pending.is_none() {
            *pending = Some(failure);
        }
    }

    /// Deletes a native hook. A closed engine has no hooks left to delete.
    pub(crate) fn delete_native_hook(&self, hh: sys::uc_hook) -> Result<()> {
        let Ok(live) = self.live() else {
            return Ok(());
        };
        let uc = live.uc();
        // SAFETY: `hh` was returned by `hook_add` on this engine.
        check(self.backend().as_ref(), unsafe { self.backend().hook_del(uc, hh) })
    }

    /// Translates a facade call's status. Outside a run a host failure
    /// recorded by hooks the call fired (a cache request, an MMIO access)
    /// wins over the status, as it would for `emu_start`.
    fn status(&self, status: sys::uc_err) -> Result<()> {
        if self.inner.running.load(Ordering::Acquire) == 0
            && let Some(failure) = self.inner.pending.lock().take()
        {
            debug!("call stopped by a host failure");
            return Err(failure.into_error());
        }
        check(self.backend().as_ref(), status)
    }

    /// Runs the emulator. A host callback failure recorded during the run is
    /// returned instead of whatever status the engine reports.
    pub fn emu_start(&self, begin: u64, until: u64, timeout: u64, count: usize) -> Result<()> {
        let live = self.live()?;
        let uc = live.uc();
        if self.inner.running.load(Ordering::Acquire) == 0
            && let Some(stale) = self.inner.pending.lock().take()
        {
            warn!(?stale, "discarding host failure left over from an earlier run");
        }

        let guard = RunningGuard::enter(&self.inner.running);
        trace!(
            begin = format_args!("{begin:#x}"),
            until = format_args!("{until:#x}"),
            timeout,
            count,
            "emulation starting"
        );
        // SAFETY: `uc` is live; hooks may re-enter this facade.
        let status = unsafe { self.backend().emu_start(uc, begin, until, timeout, count) };
        drop(guard);

        if let Some(failure) = self.inner.pending.lock().take() {
            debug!("emulation stopped by a host failure");
            return Err(failure.into_error());
        }
        self.status(status)
    }

    pub fn emu_stop(&self) -> Result<()> {
        let live = self.live()?;
        let uc = live.uc();
        // SAFETY: `uc` is live.
        self.status(unsafe { self.backend().emu_stop(uc) })
    }

    /// Status of the last failed engine call, `None` if it succeeded.
    pub fn errno(&self) -> Result<Option<ErrorCode>> {
        let live = self.live()?;
        let uc = live.uc();
        // SAFETY: `uc` is live.
        Ok(ErrorCode::from_raw(unsafe { self.backend().errno(uc) }))
    }

    pub fn query(&self, query: QueryType) -> Result<usize> {
        let live = self.live()?;
        let uc = live.uc();
        let mut result = 0usize;
        // SAFETY: `result` is a valid out-pointer.
        self.status(unsafe { self.backend().query(uc, query.raw(), &mut result) })?;
        Ok(result)
    }

    pub fn mem_read(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        let live = self.live()?;
        let uc = live.uc();
        // SAFETY: `buf` is valid for `buf.len()` writes.
        self.status(unsafe {
            self.backend()
                .mem_read(uc, address, buf.as_mut_ptr(), buf.len())
        })
    }

    pub fn mem_read_as_vec(&self, address: u64, size: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; size];
        self.mem_read(address, &mut buf)?;
        Ok(buf)
    }

    pub fn mem_write(&self, address: u64, bytes: &[u8]) -> Result<()> {
        let live = self.live()?;
        let uc = live.uc();
        // SAFETY: `bytes` is valid for `bytes.len()` reads.
        self.status(unsafe {
            self.backend()
                .mem_write(uc, address, bytes.as_ptr(), bytes.len())
        })
    }

    pub fn mem_map(&self, address: u64, size: usize, perms: Permission) -> Result<()> {
        let live = self.live()?;
        let uc = live.uc();
        // SAFETY: `uc` is live.
        self.status(unsafe { self.backend().mem_map(uc, address, size, perms.bits()) })?;
        trace!(
            address = format_args!("{address:#x}"),
            size = format_args!("{size:#x}"),
            ?perms,
            "memory mapped"
        );
        Ok(())
    }

    /// Maps caller-owned memory directly.
    ///
    /// # Safety
    /// `ptr` must stay valid for `size` bytes, and not be accessed in ways
    /// that conflict with the emulated program, until the region is unmapped
    /// or the engine closed.
    pub unsafe fn mem_map_ptr(
        &self,
        address: u64,
        size: usize,
        perms: Permission,
        ptr: *mut c_void,
    ) -> Result<()> {
        if ptr.is_null() {
            return Err(Error::contract("mem_map_ptr requires a non-null host buffer"));
        }
        if size == 0 {
            return Err(Error::contract("mem_map_ptr requires a non-empty host buffer"));
        }
        let live = self.live()?;
        let uc = live.uc();
        // SAFETY: upheld by the caller.
        self.status(unsafe {
            self.backend()
                .mem_map_ptr(uc, address, size, perms.bits(), ptr)
        })
    }

    /// Maps `buffer` at `address`, keeping it alive until the region is
    /// unmapped or the engine closed.
    pub fn mem_map_host(&self, address: u64, buffer: Box<[u8]>, perms: Permission) -> Result<()> {
        if buffer.is_empty() {
            return Err(Error::contract("mem_map_host requires a non-empty host buffer"));
        }
        let size = buffer.len();
        let mapping = HostMapping {
            address,
            buffer: NonNull::from(Box::leak(buffer)),
        };
        // SAFETY: the buffer is owned by `mapping`, which the engine keeps
        // until the region is unmapped or the engine closed.
        unsafe {
            self.mem_map_ptr(
                address,
                size,
                perms,
                mapping.buffer.as_ptr().cast::<u8>().cast(),
            )?
        };
        self.inner.host_mappings.lock().push(mapping);
        Ok(())
    }

    pub fn mem_unmap(&self, address: u64, size: usize) -> Result<()> {
        let live = self.live()?;
        let uc = live.uc();
        // SAFETY: `uc` is live.
        self.status(unsafe { self.backend().mem_unmap(uc, address, size) })?;

        let end = address.saturating_add(size as u64);
        let parked = !self.inner.retired.lock().is_empty();
        let released: Vec<RetiredBinding> = match parked.then(|| self.inner.regions(&live)) {
            None => Vec::new(),
            Some(Ok(regions)) => {
                let mut retired = self.inner.retired.lock();
                let (gone, kept) = std::mem::take(&mut *retired)
                    .into_iter()
                    .partition(|binding| !binding.still_mapped(&regions));
                *retired = kept;
                gone
            }
            Some(Err(err)) => {
                warn!(%err, "could not list regions, parked MMIO records kept until close");
                Vec::new()
            }
        };
        let mappings: Vec<HostMapping> = {
            let mut host = self.inner.host_mappings.lock();
            let (gone, kept) = std::mem::take(&mut *host)
                .into_iter()
                .partition(|mapping: &HostMapping| {
                    let len = mapping.buffer.len() as u64;
                    mapping.address >= address && mapping.address.saturating_add(len) <= end
                });
            *host = kept;
            gone
        };
        if !released.is_empty() || !mappings.is_empty() {
            trace!(
                parked = released.len(),
                host_mappings = mappings.len(),
                "released storage of unmapped region"
            );
        }
        Ok(())
    }

    pub fn mem_protect(&self, address: u64, size: usize, perms: Permission) -> Result<()> {
        let live = self.live()?;
        let uc = live.uc();
        // SAFETY: `uc` is live.
        self.status(unsafe { self.backend().mem_protect(uc, address, size, perms.bits()) })
    }

    pub fn mem_regions(&self) -> Result<Vec<MemRegion>> {
        let live = self.live()?;
        self.inner.regions(&live)
    }

    pub fn context_alloc(&self) -> Result<Context> {
        let live = self.live()?;
        let uc = live.uc();
        let mut ctx = ptr::null_mut();
        // SAFETY: `ctx` is a valid out-pointer.
        let status = unsafe { self.backend().context_alloc(uc, &mut ctx) };
        if status != sys::UC_ERR_OK {
            return Err(Error::from_alloc_status(self.backend().as_ref(), status));
        }
        let ctx = NonNull::new(ctx)
            .ok_or_else(|| Error::contract("context_alloc succeeded but returned a null context"))?;
        Ok(Context::from_raw(self.backend().clone(), ctx))
    }

    pub fn context_save(&self, context: &mut Context) -> Result<()> {
        let live = self.live()?;
        let uc = live.uc();
        let ctx = context.raw_for(self.backend())?;
        // SAFETY: both handles are live.
        self.status(unsafe { self.backend().context_save(uc, ctx) })
    }

    pub fn context_restore(&self, context: &Context) -> Result<()> {
        let live = self.live()?;
        let uc = live.uc();
        let ctx = context.raw_for(self.backend())?;
        // SAFETY: both handles are live.
        self.status(unsafe { self.backend().context_restore(uc, ctx) })
    }

    /// Registers a hook for `kind` over `[begin, end]`. `begin > end` means
    /// the whole address space.
    pub fn hook_add(
        &self,
        kind: HookType,
        target: HookTarget,
        user_data: Option<UserData>,
        begin: u64,
        end: u64,
    ) -> Result<HookHandle> {
        hooks::register(self, kind, target, user_data, begin, end, HookExtra::None)
    }

    /// Registers a `UC_HOOK_INSN` hook; the instruction id picks the shape.
    pub fn hook_add_insn(
        &self,
        insn: i32,
        target: HookTarget,
        user_data: Option<UserData>,
        begin: u64,
        end: u64,
    ) -> Result<HookHandle> {
        hooks::register(
            self,
            HookType::INSN,
            target,
            user_data,
            begin,
            end,
            HookExtra::Insn(insn as c_int),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn hook_add_tcg_opcode(
        &self,
        opcode: i32,
        flags: i32,
        target: HookTarget,
        user_data: Option<UserData>,
        begin: u64,
        end: u64,
    ) -> Result<HookHandle> {
        hooks::register(
            self,
            HookType::TCG_OPCODE,
            target,
            user_data,
            begin,
            end,
            HookExtra::TcgOpcode { opcode, flags },
        )
    }

    /// Detaches a hook. The handle stays valid (and detached) until released.
    pub fn hook_del(&self, handle: &HookHandle) -> Result<()> {
        hooks::unregister(self, handle)
    }

    pub fn add_code_hook(
        &self,
        begin: u64,
        end: u64,
        f: impl Fn(&Unicorn, u64, u32, Option<&UserData>) -> HookResult<()> + Send + Sync + 'static,
    ) -> Result<HookHandle> {
        self.hook_add(HookType::CODE, HookTarget::code(f), None, begin, end)
    }

    pub fn add_block_hook(
        &self,
        begin: u64,
        end: u64,
        f: impl Fn(&Unicorn, u64, u32, Option<&UserData>) -> HookResult<()> + Send + Sync + 'static,
    ) -> Result<HookHandle> {
        self.hook_add(HookType::BLOCK, HookTarget::block(f), None, begin, end)
    }

    /// Hooks valid memory accesses of the kinds in `kind`.
    pub fn add_mem_hook(
        &self,
        kind: HookType,
        begin: u64,
        end: u64,
        f: impl Fn(&Unicorn, MemType, u64, i32, i64, Option<&UserData>) -> HookResult<()>
        + Send
        + Sync
        + 'static,
    ) -> Result<HookHandle> {
        self.hook_add(kind, HookTarget::mem(f), None, begin, end)
    }

    pub fn add_intr_hook(
        &self,
        f: impl Fn(&Unicorn, u32, Option<&UserData>) -> HookResult<()> + Send + Sync + 'static,
    ) -> Result<HookHandle> {
        self.hook_add(HookType::INTR, HookTarget::interrupt(f), None, 1, 0)
    }

    /// Maps an MMIO region. Returns one handle per callback given, read
    /// first. Either everything is registered or nothing is.
    pub fn mmio_map(
        &self,
        address: u64,
        size: usize,
        read: Option<HookTarget>,
        read_data: Option<UserData>,
        write: Option<HookTarget>,
        write_data: Option<UserData>,
    ) -> Result<Vec<HookHandle>> {
        hooks::mmio_map(
            self,
            address,
            size,
            read.map(|target| (target, read_data)),
            write.map(|target| (target, write_data)),
        )
    }

    fn ctl(&self, request: CtlRequest<'_>) -> Result<()> {
        let live = self.live()?;
        let uc = live.uc();
        trace!(request = request.name(), "ctl");
        // SAFETY: every pointer in `request` borrows from the caller's frame.
        self.status(unsafe { self.backend().ctl(uc, request) })
    }

    pub fn ctl_get_mode(&self) -> Result<Mode> {
        let mut mode: c_int = 0;
        self.ctl(CtlRequest::GetMode(&mut mode))?;
        Ok(Mode::from_bits_retain(mode))
    }

    pub fn ctl_get_arch(&self) -> Result<Arch> {
        let mut arch: c_int = 0;
        self.ctl(CtlRequest::GetArch(&mut arch))?;
        Arch::from_raw(arch)
            .ok_or_else(|| Error::contract(format!("engine reported unknown architecture {arch}")))
    }

    pub fn ctl_get_timeout(&self) -> Result<u64> {
        let mut timeout = 0;
        self.ctl(CtlRequest::GetTimeout(&mut timeout))?;
        Ok(timeout)
    }

    pub fn ctl_get_page_size(&self) -> Result<u32> {
        let mut size = 0;
        self.ctl(CtlRequest::GetPageSize(&mut size))?;
        Ok(size)
    }

    pub fn ctl_set_page_size(&self, size: u32) -> Result<()> {
        self.ctl(CtlRequest::SetPageSize(size))
    }

    pub fn ctl_exits_enabled(&self, enable: bool) -> Result<()> {
        self.ctl(CtlRequest::SetUseExits(enable))
    }

    pub fn ctl_get_exits_cnt(&self) -> Result<usize> {
        let mut count = 0;
        self.ctl(CtlRequest::GetExitsCount(&mut count))?;
        Ok(count)
    }

    pub fn ctl_get_exits(&self) -> Result<Vec<u64>> {
        let mut exits = vec![0; self.ctl_get_exits_cnt()?];
        self.ctl(CtlRequest::GetExits(&mut exits))?;
        Ok(exits)
    }

    pub fn ctl_set_exits(&self, exits: &[u64]) -> Result<()> {
        self.ctl(CtlRequest::SetExits(exits))
    }

    pub fn ctl_get_cpu_model(&self) -> Result<i32> {
        let mut model: c_int = 0;
        self.ctl(CtlRequest::GetCpuModel(&mut model))?;
        Ok(model)
    }

    pub fn ctl_set_cpu_model(&self, model: i32) -> Result<()> {
        self.ctl(CtlRequest::SetCpuModel(model))
    }

    /// Translates the block at `address` now and reports it.
    pub fn ctl_request_cache(&self, address: u64) -> Result<TranslationBlock> {
        let mut tb = sys::uc_tb::default();
        self.ctl(CtlRequest::RequestCache {
            address,
            tb: &mut tb,
        })?;
        Ok(TranslationBlock::from(&tb))
    }

    pub fn ctl_remove_cache(&self, begin: u64, end: u64) -> Result<()> {
        self.ctl(CtlRequest::RemoveCache { begin, end })
    }

    pub fn ctl_flush_tb(&self) -> Result<()> {
        self.ctl(CtlRequest::FlushTb)
    }

    pub fn ctl_flush_tlb(&self) -> Result<()> {
        self.ctl(CtlRequest::FlushTlb)
    }

    pub fn ctl_tlb_mode(&self, mode: TlbMode) -> Result<()> {
        self.ctl(CtlRequest::TlbMode(mode.raw()))
    }
}

impl sealed::RegisterSource for Unicorn {
    fn register_backend(&self) -> &dyn Backend {
        self.backend().as_ref()
    }

    fn register_source(&self) -> Result<sealed::Source<'_>> {
        self.live().map(sealed::Source::Live)
    }
}

impl crate::context::RegisterAccess for Unicorn {}

impl std::fmt::Debug for Unicorn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unicorn")
            .field("arch", &self.inner.arch)
            .field("mode", &self.inner.mode)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Version word of the engine behind `backend`:
/// `major << 24 | minor << 16 | patch << 8 | extra`.
pub fn version(backend: &dyn Backend) -> u32 {
    backend.version()
}

pub fn arch_supported(backend: &dyn Backend, arch: Arch) -> bool {
    backend.arch_supported(arch.raw())
}

/// The engine's message for a status code.
pub fn strerror(backend: &dyn Backend, code: ErrorCode) -> String {
    crate::error::strerror_lossy(backend, code.raw())
}
