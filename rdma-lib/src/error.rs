use syscalls::Errno;

use crate::provider::CmEventKind;

pub type Result<T> = std::result::Result<T, RdmaLibError>;

#[derive(Clone, Debug, thiserror::Error)]
pub enum RdmaLibError {
    #[error("{0}")]
    Verbs(#[from] VerbsError),
    #[error("ContextMismatch: cm id is bound to a different device context")]
    ContextMismatch,
    #[error("AllocationExhausted: {requested} bytes requested at offset {offset}, pool max {max}")]
    AllocationExhausted { offset: u64, requested: u64, max: u64 },
    #[error("NotConnected: operation requires an established connection")]
    NotConnected,
    #[error("InvalidState: {0}")]
    InvalidState(&'static str),
    #[error("UnexpectedEvent: {kind:?} while {during}")]
    UnexpectedEvent { kind: CmEventKind, during: &'static str },
    #[error("ResolveRetriesExhausted: {stage} resolution failed {attempts} times")]
    ResolveRetriesExhausted { stage: ResolveStage, attempts: u32 },
    #[error("PollerFailed: {0}")]
    PollerFailed(String),
    #[error("MetaDecode: {0}")]
    MetaDecode(&'static str),
    #[error("{0}")]
    Frame(#[from] FrameError),
    #[error("OutOfBounds: offset {offset} + length {length} exceeds region of {limit} bytes")]
    OutOfBounds { offset: u64, length: u64, limit: u64 },
    #[error("TableFull: no free connection slot")]
    TableFull,
    #[error("{0}")]
    Errno(#[from] Errno),
    #[error("RdmaLibError: {0}")]
    Custom(&'static str),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolveStage {
    Address,
    Route,
}

impl std::fmt::Display for ResolveStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolveStage::Address => f.write_str("address"),
            ResolveStage::Route => f.write_str("route"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("FrameError: {0} bytes is shorter than an empty frame")]
    Truncated(usize),
    #[error("FrameError: bad leading magic {0:#x}")]
    BadLeadingMagic(u32),
    #[error("FrameError: bad trailing magic {0:#x}")]
    BadTrailingMagic(u32),
    #[error("FrameError: payload of {0} bytes does not fit the length field")]
    TooLarge(usize),
    #[error("FrameError: declared payload of {declared} bytes, buffer holds {available}")]
    LengthMismatch { declared: usize, available: usize },
}

#[derive(Clone, Debug, thiserror::Error)]
#[error("VerbsError: code {code}, context: {context}")]
pub struct VerbsError {
    pub code: Errno,
    pub context: &'static str,
}

impl VerbsError {
    pub fn with_last_os_error(context: &'static str) -> Self {
        Self {
            code: Errno::new(
                std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
            ),
            context,
        }
    }

    pub fn with_code(code: i32, context: &'static str) -> Self {
        Self { code: Errno::new(code), context }
    }
}
