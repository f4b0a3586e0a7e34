//! Attachment of native threads to the host runtime.
//!
//! The engine may call hooks on any thread, including ones Rust code never
//! spawned. Every trampoline attaches its thread before touching host state;
//! the attachment is created once per thread and lives until the thread
//! exits.

use once_cell::sync::OnceCell;
use std::any::Any;
use std::cell::{Cell, OnceCell as ThreadCell};
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::{debug, trace};

/// Process-wide state shared by every engine and thread.
#[derive(Debug)]
pub struct HostRuntime {
    attached_threads: AtomicUsize,
    attaches: AtomicU64,
    dispatches: AtomicU64,
}

static RUNTIME: OnceCell<HostRuntime> = OnceCell::new();

/// The runtime, initialised on first use.
pub fn runtime() -> &'static HostRuntime {
    RUNTIME.get_or_init(|| {
        debug!("host runtime initialised");
        HostRuntime {
            attached_threads: AtomicUsize::new(0),
            attaches: AtomicU64::new(0),
            dispatches: AtomicU64::new(0),
        }
    })
}

impl HostRuntime {
    /// Threads currently attached.
    pub fn attached_threads(&self) -> usize {
        self.attached_threads.load(Ordering::Acquire)
    }

    /// Attachments made since start, including threads that have exited.
    pub fn total_attaches(&self) -> u64 {
        self.attaches.load(Ordering::Relaxed)
    }

    /// Host callbacks invoked through trampolines since start.
    pub fn dispatches(&self) -> u64 {
        self.dispatches.load(Ordering::Relaxed)
    }
}

struct Attachment {
    depth: Cell<usize>,
}

impl Attachment {
    fn new() -> Self {
        let rt = runtime();
        rt.attached_threads.fetch_add(1, Ordering::AcqRel);
        rt.attaches.fetch_add(1, Ordering::Relaxed);
        debug!(thread = ?std::thread::current().id(), "thread attached to host runtime");
        Self {
            depth: Cell::new(0),
        }
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        runtime().attached_threads.fetch_sub(1, Ordering::AcqRel);
    }
}

thread_local! {
    static ATTACHMENT: ThreadCell<Attachment> = const { ThreadCell::new() };
}

/// Token proving the current thread is attached. Tied to the thread.
pub struct Env {
    _thread_bound: PhantomData<*const ()>,
}

/// Attaches the calling thread if it is not already attached.
pub fn attach_current_thread() -> Env {
    // During thread teardown the slot may already be gone; dispatch still
    // proceeds, just without bookkeeping.
    let _ = ATTACHMENT.try_with(|slot| {
        slot.get_or_init(Attachment::new);
    });
    Env {
        _thread_bound: PhantomData,
    }
}

pub fn is_current_thread_attached() -> bool {
    ATTACHMENT
        .try_with(|slot| slot.get().is_some())
        .unwrap_or(false)
}

impl Env {
    /// Runs one host call, catching any panic so it never unwinds into
    /// native frames.
    pub(crate) fn call<R>(&self, f: impl FnOnce() -> R) -> std::thread::Result<R> {
        runtime().dispatches.fetch_add(1, Ordering::Relaxed);
        self.adjust_depth(1);
        let result = panic::catch_unwind(AssertUnwindSafe(f));
        self.adjust_depth(-1);
        if result.is_err() {
            trace!("host call panicked");
        }
        result
    }

    /// Host calls currently on this thread's stack.
    pub fn depth(&self) -> usize {
        ATTACHMENT
            .try_with(|slot| slot.get().map_or(0, |a| a.depth.get()))
            .unwrap_or(0)
    }

    fn adjust_depth(&self, delta: isize) {
        let _ = ATTACHMENT.try_with(|slot| {
            if let Some(attachment) = slot.get() {
                let depth = attachment.depth.get().saturating_add_signed(delta);
                attachment.depth.set(depth);
            }
        });
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}
