//! Ownership of hook binding records.
//!
//! A record is the `user_data` the engine hands back to a trampoline. It is
//! heap-allocated at registration, owned by exactly one [`HookHandle`], and
//! torn down in two phases: detach (drop the strong references and delete the
//! native hook) and then free. MMIO records cannot be deleted natively, so a
//! released MMIO record whose region is still mapped is parked on the engine
//! until the region goes away.

use super::{HookShape, HookTarget, HookType, UserData, trampoline};
use crate::backend::HookExtra;
use crate::engine::{EngineInner, Unicorn};
use crate::error::{Error, ErrorCode, Result, strerror_lossy};
use crate::marshal::MemRegion;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::ffi::c_void;
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};
use ucbridge_sys::{self as sys, uc_hook};

/// A host failure waiting to be reported by the facade call that fired the
/// hook, `emu_start` included.
#[derive(Debug)]
pub(crate) enum PendingFailure {
    Host(anyhow::Error),
    Contract(String),
}

impl PendingFailure {
    pub(crate) fn into_error(self) -> Error {
        match self {
            PendingFailure::Host(err) => Error::Hook(err),
            PendingFailure::Contract(message) => Error::Contract(message),
        }
    }
}

#[derive(Clone, Copy)]
pub(crate) struct Callback(pub *mut c_void);

// SAFETY: a trampoline address; never dereferenced as data.
unsafe impl Send for Callback {}
unsafe impl Sync for Callback {}

pub(crate) struct ShapeDescriptor {
    pub name: &'static str,
    pub callback: Callback,
}

static SHAPES: Lazy<[ShapeDescriptor; 16]> = Lazy::new(|| {
    let table = HookShape::ALL.map(|shape| ShapeDescriptor {
        name: shape_name(shape),
        callback: Callback(trampoline::entry(shape)),
    });
    debug!(shapes = table.len(), "hook trampolines resolved");
    table
});

pub(crate) fn descriptor(shape: HookShape) -> &'static ShapeDescriptor {
    &SHAPES[shape as usize]
}

fn shape_name(shape: HookShape) -> &'static str {
    match shape {
        HookShape::Interrupt => "interrupt",
        HookShape::Code => "code",
        HookShape::Block => "block",
        HookShape::MemValid => "memory access",
        HookShape::MemInvalid => "invalid memory access",
        HookShape::InvalidInstruction => "invalid instruction",
        HookShape::PortIn => "port in",
        HookShape::PortOut => "port out",
        HookShape::Syscall => "syscall",
        HookShape::Cpuid => "cpuid",
        HookShape::Arm64Sys => "arm64 system register",
        HookShape::EdgeGenerated => "edge generated",
        HookShape::TcgOpcode => "tcg opcode",
        HookShape::TlbFill => "tlb fill",
        HookShape::MmioRead => "mmio read",
        HookShape::MmioWrite => "mmio write",
    }
}

/// The strong references a live record holds.
#[derive(Clone)]
pub(crate) struct Attached {
    pub engine: Unicorn,
    pub target: HookTarget,
    pub user_data: Option<UserData>,
}

pub(crate) struct HookBinding {
    shape: HookShape,
    /// Written by the engine during `uc_hook_add`; zero for MMIO records.
    native: uc_hook,
    mmio_region: Option<(u64, usize)>,
    owner: Weak<EngineInner>,
    attached: Mutex<Option<Attached>>,
}

impl HookBinding {
    fn new(
        shape: HookShape,
        engine: &Unicorn,
        target: HookTarget,
        user_data: Option<UserData>,
        mmio_region: Option<(u64, usize)>,
    ) -> Self {
        Self {
            shape,
            native: 0,
            mmio_region,
            owner: Arc::downgrade(engine.inner()),
            attached: Mutex::new(Some(Attached {
                engine: engine.clone(),
                target,
                user_data,
            })),
        }
    }

    pub(crate) fn shape(&self) -> HookShape {
        self.shape
    }

    /// Copies the attached references out so the host can be called without
    /// the lock held. `None` once detached.
    pub(crate) fn snapshot(&self) -> Option<Attached> {
        self.attached.lock().clone()
    }

    fn belongs_to(&self, engine: &Unicorn) -> bool {
        ptr::eq(self.owner.as_ptr(), Arc::as_ptr(engine.inner()))
    }
}

/// Detaches a record: drops its strong references, then deletes the native
/// hook. A second call is a no-op.
fn detach(binding: &HookBinding) -> Result<()> {
    let Some(attached) = binding.attached.lock().take() else {
        return Ok(());
    };
    let result = match binding.mmio_region {
        // The engine forgets MMIO callbacks together with their region.
        Some(_) => Ok(()),
        None => attached.engine.delete_native_hook(binding.native),
    };
    trace!(shape = %binding.shape, native = binding.native, "hook detached");
    drop(attached);
    result
}

/// Storage for a record the engine does not know about yet. Dropping it frees
/// the record and releases its references.
struct Unregistered(NonNull<HookBinding>);

impl Unregistered {
    fn new(binding: HookBinding) -> Self {
        Self(NonNull::from(Box::leak(Box::new(binding))))
    }

    fn as_ptr(&self) -> *mut HookBinding {
        self.0.as_ptr()
    }

    fn into_handle(self) -> HookHandle {
        let binding = self.0;
        std::mem::forget(self);
        HookHandle { binding }
    }
}

impl Drop for Unregistered {
    fn drop(&mut self) {
        // SAFETY: allocated by `new` and never shared with the engine.
        drop(unsafe { Box::from_raw(self.0.as_ptr()) });
    }
}

/// A released MMIO record kept alive while its region may still call it.
pub(crate) struct RetiredBinding(Box<HookBinding>);

impl RetiredBinding {
    /// Whether any of `regions` still overlaps this record's region.
    pub(crate) fn still_mapped(&self, regions: &[MemRegion]) -> bool {
        let Some((begin, len)) = self.0.mmio_region else {
            return false;
        };
        let last = begin.saturating_add(len as u64).saturating_sub(1);
        regions
            .iter()
            .any(|region| region.begin <= last && region.end >= begin)
    }
}

/// Owner of one registered hook.
///
/// Dropping the handle (or calling [`HookHandle::release`]) detaches the hook
/// if it is still attached and frees its record.
pub struct HookHandle {
    binding: NonNull<HookBinding>,
}

// SAFETY: the record's mutable state lives behind a mutex, everything else is
// fixed at registration, and the referenced targets are Send + Sync.
unsafe impl Send for HookHandle {}
unsafe impl Sync for HookHandle {}

impl HookHandle {
    fn binding(&self) -> &HookBinding {
        // SAFETY: the handle owns the record until drop.
        unsafe { self.binding.as_ref() }
    }

    pub fn shape(&self) -> HookShape {
        self.binding().shape
    }

    /// Native hook id; zero for MMIO handles.
    pub fn native(&self) -> uc_hook {
        self.binding().native
    }

    pub fn is_attached(&self) -> bool {
        self.binding().attached.lock().is_some()
    }

    /// Detaches the hook if needed and frees its record.
    pub fn release(self) {}
}

impl Drop for HookHandle {
    fn drop(&mut self) {
        if let Err(err) = detach(self.binding()) {
            warn!(shape = %self.shape(), %err, "failed to delete hook while releasing its handle");
        }
        // SAFETY: the handle is the only owner, and the native hook is gone.
        let binding = unsafe { Box::from_raw(self.binding.as_ptr()) };
        if binding.mmio_region.is_some()
            && let Some(engine) = binding.owner.upgrade()
        {
            trace!(shape = %binding.shape, "releasing MMIO record");
            engine.park(RetiredBinding(binding));
        }
    }
}

impl fmt::Debug for HookHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookHandle")
            .field("shape", &self.shape())
            .field("native", &self.native())
            .field("attached", &self.is_attached())
            .finish()
    }
}

fn invalid_hook(engine: &Unicorn, kind: HookType, code: ErrorCode) -> Error {
    debug!(kind = format_args!("{:#x}", kind.bits()), ?code, "rejected hook registration");
    Error::InvalidHook {
        kind: kind.bits(),
        code,
        message: strerror_lossy(engine.backend().as_ref(), code.raw()),
    }
}

fn check_target(expected: HookShape, target: &HookTarget) -> Result<()> {
    if target.shape() != expected {
        return Err(Error::contract(format!(
            "{expected} hook cannot dispatch to a {} callback",
            target.shape()
        )));
    }
    Ok(())
}

pub(crate) fn register(
    engine: &Unicorn,
    kind: HookType,
    target: HookTarget,
    user_data: Option<UserData>,
    begin: u64,
    end: u64,
    extra: HookExtra,
) -> Result<HookHandle> {
    let shape = HookShape::resolve(kind, extra).map_err(|code| invalid_hook(engine, kind, code))?;
    check_target(shape, &target)?;
    let live = engine.live()?;
    let uc = live.uc();

    let pending = Unregistered::new(HookBinding::new(shape, engine, target, user_data, None));
    let binding = pending.as_ptr();
    // SAFETY: the trampoline for `shape` has the signature `kind` and `extra`
    // select, and the record outlives the native hook: its handle deletes the
    // hook before freeing it.
    let status = unsafe {
        engine.backend().hook_add(
            uc,
            &raw mut (*binding).native,
            kind.bits(),
            descriptor(shape).callback.0,
            binding.cast(),
            begin,
            end,
            extra,
        )
    };
    if status != sys::UC_ERR_OK {
        return Err(Error::from_alloc_status(engine.backend().as_ref(), status));
    }

    let handle = pending.into_handle();
    debug!(
        %shape,
        native = handle.native(),
        begin = format_args!("{begin:#x}"),
        end = format_args!("{end:#x}"),
        "hook registered"
    );
    Ok(handle)
}

pub(crate) fn unregister(engine: &Unicorn, handle: &HookHandle) -> Result<()> {
    if !handle.binding().belongs_to(engine) {
        return Err(Error::contract("hook handle belongs to a different engine"));
    }
    detach(handle.binding())
}

fn mmio_binding(
    engine: &Unicorn,
    shape: HookShape,
    target: HookTarget,
    user_data: Option<UserData>,
    region: (u64, usize),
) -> Result<Unregistered> {
    check_target(shape, &target)?;
    Ok(Unregistered::new(HookBinding::new(
        shape,
        engine,
        target,
        user_data,
        Some(region),
    )))
}

/// Maps an MMIO region with up to two callbacks. Either every record is
/// created and the region mapped, or nothing is.
pub(crate) fn mmio_map(
    engine: &Unicorn,
    address: u64,
    size: usize,
    read: Option<(HookTarget, Option<UserData>)>,
    write: Option<(HookTarget, Option<UserData>)>,
) -> Result<Vec<HookHandle>> {
    let live = engine.live()?;
    let uc = live.uc();
    let region = (address, size);
    let read = read
        .map(|(target, data)| mmio_binding(engine, HookShape::MmioRead, target, data, region))
        .transpose()?;
    let write = write
        .map(|(target, data)| mmio_binding(engine, HookShape::MmioWrite, target, data, region))
        .transpose()?;

    let user_data = |binding: &Option<Unregistered>| {
        binding
            .as_ref()
            .map_or(ptr::null_mut(), |b| b.as_ptr().cast::<c_void>())
    };
    // SAFETY: each record stays alive until the region is unmapped or the
    // engine closed; released records are parked until then.
    let status = unsafe {
        engine.backend().mmio_map(
            uc,
            address,
            size,
            read.as_ref()
                .map(|_| trampoline::mmio_read as sys::uc_cb_mmio_read_t),
            user_data(&read),
            write
                .as_ref()
                .map(|_| trampoline::mmio_write as sys::uc_cb_mmio_write_t),
            user_data(&write),
        )
    };
    if status != sys::UC_ERR_OK {
        return Err(Error::from_alloc_status(engine.backend().as_ref(), status));
    }

    debug!(
        address = format_args!("{address:#x}"),
        size = format_args!("{size:#x}"),
        read = read.is_some(),
        write = write.is_some(),
        "mmio region mapped"
    );
    Ok(read
        .into_iter()
        .chain(write)
        .map(Unregistered::into_handle)
        .collect())
}
