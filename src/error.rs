//! Error taxonomy for loading, calling, and coordinating Spirits.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Fault raised by a Spirit through `vudo_abort`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Abort {
    pub message: String,
    pub file: String,
    pub line: u32,
}

impl std::fmt::Display for Abort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at {}:{}", self.message, self.file, self.line)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed bytes or a failed instantiation. No Spirit is produced.
    #[error("failed to load spirit: {0:#}")]
    Load(anyhow::Error),

    #[error("failed to fetch spirit bytes from '{source_name}': {reason:#}")]
    Fetch {
        source_name: String,
        reason: anyhow::Error,
    },

    #[error("function '{0}' not found in spirit exports")]
    FunctionNotFound(String),

    #[error("export '{0}' is not a callable function")]
    NotCallable(String),

    #[error("bad call to '{function}': {reason}")]
    Signature { function: String, reason: String },

    #[error("spirit trapped: {0:#}")]
    Trap(anyhow::Error),

    #[error("spirit '{0}' is already summoned")]
    SpiritExists(String),

    #[error("spirit '{0}' not found")]
    SpiritNotFound(String),

    #[error("loa '{0}' is already registered")]
    LoaExists(String),

    #[error("loa '{0}' is built in and cannot be unregistered")]
    BuiltinLoa(String),

    #[error("loa '{0}' not found")]
    LoaNotFound(String),

    #[error("cannot allocate {requested} bytes: linear memory cannot grow to {needed} bytes")]
    Allocation { requested: u32, needed: u64 },

    #[error("memory access out of bounds at {address} (+{len} bytes)")]
    MemoryAccess { address: u32, len: u64 },

    #[error("spirit aborted: {0}")]
    Abort(Abort),

    #[error("field '{field}' of gene '{gene}': {reason}")]
    Field {
        gene: String,
        field: String,
        reason: String,
    },

    #[error("invalid manifest: {0}")]
    Manifest(String),
}

impl Error {
    /// Recovers a host-raised error from a trap, falling back to `Trap`.
    pub(crate) fn from_trap(err: anyhow::Error) -> Self {
        let host_error = err
            .downcast_ref::<Error>()
            .or_else(|| err.chain().find_map(|cause| cause.downcast_ref::<Error>()));
        let recovered = match host_error {
            Some(Error::Abort(abort)) => Some(Error::Abort(abort.clone())),
            Some(Error::Allocation { requested, needed }) => Some(Error::Allocation {
                requested: *requested,
                needed: *needed,
            }),
            Some(Error::MemoryAccess { address, len }) => Some(Error::MemoryAccess {
                address: *address,
                len: *len,
            }),
            _ => None,
        };
        recovered.unwrap_or(Error::Trap(err))
    }
}
