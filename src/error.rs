//! Unified error types for the brewing engine.
//!
//! A single `Error` enum every subsystem converts into, keeping the
//! top-level loops' error handling uniform. Variants that cross loop
//! boundaries are `Copy` so they can be passed around without
//! allocation.

use core::fmt;

use crate::probes::ProbeError;

// ---------------------------------------------------------------------------
// Top-level engine error
// ---------------------------------------------------------------------------

/// Every fallible operation in the engine funnels into this type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A probe could not be read or returned out-of-range data.
    Probe(ProbeError),
    /// The settings store rejected an operation.
    Store(StoreError),
    /// A command carried missing or ill-typed fields.
    Protocol(String),
    /// Peripheral initialisation failed.
    Init(&'static str),
    /// Configuration is invalid.
    Config(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Probe(e) => write!(f, "probe: {e}"),
            Self::Store(e) => write!(f, "store: {e}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Init(msg) => write!(f, "init: {msg}"),
            Self::Config(msg) => write!(f, "config: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

// ---------------------------------------------------------------------------
// Settings store errors
// ---------------------------------------------------------------------------

/// Errors from the key/value settings store. Never fatal: absent keys
/// seed defaults and oversized strings fall back to blob storage, so
/// these only surface for genuine backend failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    /// Requested key does not exist.
    NotFound,
    /// Storage partition is full.
    Full,
    /// Stored bytes failed deserialization.
    Corrupted,
    /// Generic I/O error from the storage backend.
    Io,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "key not found"),
            Self::Full => write!(f, "storage full"),
            Self::Corrupted => write!(f, "stored value corrupted"),
            Self::Io => write!(f, "I/O error"),
        }
    }
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<ProbeError> for Error {
    fn from(e: ProbeError) -> Self {
        Self::Probe(e)
    }
}

/// Engine-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
