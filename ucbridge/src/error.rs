use crate::backend::Backend;
use ucbridge_sys as sys;

/// Failure classes reported by the engine through its status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    NoMem = sys::UC_ERR_NOMEM,
    Arch = sys::UC_ERR_ARCH,
    Handle = sys::UC_ERR_HANDLE,
    Mode = sys::UC_ERR_MODE,
    Version = sys::UC_ERR_VERSION,
    ReadUnmapped = sys::UC_ERR_READ_UNMAPPED,
    WriteUnmapped = sys::UC_ERR_WRITE_UNMAPPED,
    FetchUnmapped = sys::UC_ERR_FETCH_UNMAPPED,
    Hook = sys::UC_ERR_HOOK,
    InsnInvalid = sys::UC_ERR_INSN_INVALID,
    Map = sys::UC_ERR_MAP,
    WriteProt = sys::UC_ERR_WRITE_PROT,
    ReadProt = sys::UC_ERR_READ_PROT,
    FetchProt = sys::UC_ERR_FETCH_PROT,
    Arg = sys::UC_ERR_ARG,
    ReadUnaligned = sys::UC_ERR_READ_UNALIGNED,
    WriteUnaligned = sys::UC_ERR_WRITE_UNALIGNED,
    FetchUnaligned = sys::UC_ERR_FETCH_UNALIGNED,
    HookExist = sys::UC_ERR_HOOK_EXIST,
    Resource = sys::UC_ERR_RESOURCE,
    Exception = sys::UC_ERR_EXCEPTION,
    Overflow = sys::UC_ERR_OVERFLOW,
}

impl ErrorCode {
    /// Maps a raw status to its failure class. `UC_ERR_OK` and codes this
    /// crate does not know about yield `None`.
    pub fn from_raw(status: sys::uc_err) -> Option<Self> {
        use ErrorCode::*;
        let code = match status {
            sys::UC_ERR_NOMEM => NoMem,
            sys::UC_ERR_ARCH => Arch,
            sys::UC_ERR_HANDLE => Handle,
            sys::UC_ERR_MODE => Mode,
            sys::UC_ERR_VERSION => Version,
            sys::UC_ERR_READ_UNMAPPED => ReadUnmapped,
            sys::UC_ERR_WRITE_UNMAPPED => WriteUnmapped,
            sys::UC_ERR_FETCH_UNMAPPED => FetchUnmapped,
            sys::UC_ERR_HOOK => Hook,
            sys::UC_ERR_INSN_INVALID => InsnInvalid,
            sys::UC_ERR_MAP => Map,
            sys::UC_ERR_WRITE_PROT => WriteProt,
            sys::UC_ERR_READ_PROT => ReadProt,
            sys::UC_ERR_FETCH_PROT => FetchProt,
            sys::UC_ERR_ARG => Arg,
            sys::UC_ERR_READ_UNALIGNED => ReadUnaligned,
            sys::UC_ERR_WRITE_UNALIGNED => WriteUnaligned,
            sys::UC_ERR_FETCH_UNALIGNED => FetchUnaligned,
            sys::UC_ERR_HOOK_EXIST => HookExist,
            sys::UC_ERR_RESOURCE => Resource,
            sys::UC_ERR_EXCEPTION => Exception,
            sys::UC_ERR_OVERFLOW => Overflow,
            _ => return None,
        };
        Some(code)
    }

    pub fn raw(self) -> sys::uc_err {
        self as sys::uc_err
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The engine returned a non-OK status. `message` is the engine's own
    /// string for `code`.
    #[error("{message}")]
    Engine { code: sys::uc_err, message: String },

    /// The hook kind / argument combination does not name a known callback
    /// shape. Raised before anything is registered natively.
    #[error("{message}")]
    InvalidHook {
        kind: i32,
        code: ErrorCode,
        message: String,
    },

    /// A precondition of this layer was violated before the engine was
    /// reached.
    #[error("{0}")]
    Contract(String),

    #[error("engine handle is closed")]
    Closed,

    /// A host callback failed (or panicked) during emulation. The engine was
    /// asked to stop as soon as the failure was seen.
    #[error("hook callback failed: {0:#}")]
    Hook(anyhow::Error),

    /// The engine could not allocate a context or hook record.
    #[error("{0}")]
    OutOfResources(String),
}

impl Error {
    pub(crate) fn contract(message: impl Into<String>) -> Self {
        Error::Contract(message.into())
    }

    pub(crate) fn from_status(backend: &dyn Backend, status: sys::uc_err) -> Self {
        Error::Engine {
            code: status,
            message: strerror_lossy(backend, status),
        }
    }

    /// Like [`Error::from_status`], but reports `UC_ERR_NOMEM` as resource
    /// exhaustion. Used where the layer itself asked the engine to allocate.
    pub(crate) fn from_alloc_status(backend: &dyn Backend, status: sys::uc_err) -> Self {
        if status == sys::UC_ERR_NOMEM {
            Error::OutOfResources(strerror_lossy(backend, status))
        } else {
            Error::from_status(backend, status)
        }
    }

    /// The engine failure class behind this error, if there is one.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Error::Engine { code, .. } => ErrorCode::from_raw(*code),
            Error::InvalidHook { code, .. } => Some(*code),
            Error::OutOfResources(_) => Some(ErrorCode::NoMem),
            Error::Contract(_) | Error::Closed | Error::Hook(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Translates a native status into `Ok(())` or the engine's failure.
pub(crate) fn check(backend: &dyn Backend, status: sys::uc_err) -> Result<()> {
    if status == sys::UC_ERR_OK {
        Ok(())
    } else {
        Err(Error::from_status(backend, status))
    }
}

pub(crate) fn strerror_lossy(backend: &dyn Backend, status: sys::uc_err) -> String {
    backend.strerror(status).to_string_lossy().into_owned()
}
