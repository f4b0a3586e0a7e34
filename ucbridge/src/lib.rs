//! Safe bindings over a Unicorn-style CPU emulator C API, centred on hook
//! dispatch: native callbacks are routed to Rust closures or trait objects
//! with their lifetimes, failures and panics accounted for.

pub mod backend;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod marshal;
pub mod runtime;

pub use backend::{Backend, CtlRequest, HookExtra};
#[cfg(feature = "native")]
pub use backend::NativeBackend;
pub use config::{EngineConfig, RegionConfig};
pub use context::{Context, RegisterAccess};
pub use engine::{Unicorn, arch_supported, strerror, version};
pub use error::{Error, ErrorCode, Result};
pub use hooks::{HookHandle, HookResult, HookShape, HookTarget, HookType, UserData, insn};
pub use marshal::{
    Arch, Arm64CpReg, ArmCpReg, MAX_REGISTER_BYTES, MemRegion, MemType, Mode, Permission,
    QueryType, TLB_FILL_VETO, TlbMode, TranslationBlock, X86Mmr, X86Msr,
};

pub use ucbridge_sys as sys;

/// C API version this crate is written against.
pub const API_MAJOR: u32 = ucbridge_sys::UC_API_MAJOR;
pub const API_MINOR: u32 = ucbridge_sys::UC_API_MINOR;
