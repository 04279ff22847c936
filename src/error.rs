//! Error types for heap operations.
//!
//! Uses thiserror for clean, idiomatic error definitions. Constructors for
//! the diagnosable kinds (corruption, foreign pointers, overflow) emit the
//! diagnostic at the point the error is built, so callers that flatten
//! errors to null returns still leave a trace.

use std::io;

use thiserror::Error;
use tracing::{error, warn};

use crate::config::{ALIGNMENT, MIN_PAYLOAD_SIZE};

/// Result type for heap operations.
pub type HeapResult<T> = Result<T, HeapError>;

/// Errors surfaced by heap operations.
#[must_use = "errors should be handled"]
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum HeapError {
    /// A caller-supplied argument made the operation a no-op.
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: &'static str },

    /// The operating system refused a mapping request.
    #[error("os memory operation '{op}' failed: {source}")]
    OsFailure {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// A pointer failed sentinel validation.
    #[error("corrupt block at {addr:#x}: {source}")]
    Corruption {
        addr: usize,
        #[source]
        source: BlockIntegrityError,
    },

    /// The pointer's recorded arena is not on the arena list.
    #[error("pointer {addr:#x} does not belong to any arena (recorded arena id {arena_id})")]
    ForeignPointer { addr: usize, arena_id: u64 },

    /// No arena could satisfy the request, even after growth.
    #[error("no free block for a request of {requested} bytes")]
    Exhausted { requested: usize },

    /// `count * size` overflowed in a zeroed allocation.
    #[error("zeroed allocation of {count} x {size} bytes overflows")]
    SizeOverflow { count: usize, size: usize },

    /// The global heap was initialized twice.
    #[error("allocator already initialized")]
    AlreadyInitialized,

    /// The global heap was used before initialization.
    #[error("allocator not initialized")]
    NotInitialized,
}

impl HeapError {
    /// Stable error code for categorization and log filtering.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument { .. } => "HEAP:ARG:INVALID",
            Self::OsFailure { .. } => "HEAP:OS:FAILED",
            Self::Corruption { .. } => "HEAP:BLOCK:CORRUPT",
            Self::ForeignPointer { .. } => "HEAP:BLOCK:FOREIGN",
            Self::Exhausted { .. } => "HEAP:ALLOC:EXHAUSTED",
            Self::SizeOverflow { .. } => "HEAP:ALLOC:OVERFLOW",
            Self::AlreadyInitialized => "HEAP:STATE:REINIT",
            Self::NotInitialized => "HEAP:STATE:UNINIT",
        }
    }

    /// Creates a silent invalid-argument error.
    pub fn invalid_argument(reason: &'static str) -> Self {
        Self::InvalidArgument { reason }
    }

    /// Creates an OS-failure error.
    pub fn os_failure(op: &'static str, source: io::Error) -> Self {
        warn!(op, %source, "os memory operation failed");
        Self::OsFailure { op, source }
    }

    /// Creates a corruption error, emitting the diagnostic.
    pub fn corruption(addr: usize, source: BlockIntegrityError) -> Self {
        error!(addr, %source, "block validation failed");
        Self::Corruption { addr, source }
    }

    /// Creates a foreign-pointer error, emitting the diagnostic.
    pub fn foreign_pointer(addr: usize, arena_id: u64) -> Self {
        error!(addr, arena_id, "pointer not owned by any arena");
        Self::ForeignPointer { addr, arena_id }
    }

    /// Creates a multiplication-overflow error, emitting the diagnostic.
    pub fn size_overflow(count: usize, size: usize) -> Self {
        warn!(count, size, "zeroed allocation size overflows");
        Self::SizeOverflow { count, size }
    }

    /// True for the kinds the public façade flattens to a silent null.
    #[must_use]
    pub fn is_silent_null(&self) -> bool {
        matches!(self, Self::InvalidArgument { .. })
    }
}

/// Per-check failures reported by block validation.
///
/// Each variant corresponds to one validation step, so callers can tell a
/// stomped sentinel apart from a torn size field.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockIntegrityError {
    #[error("null block pointer")]
    NullPointer,

    #[error("magic word {found:#010x} does not match the block sentinel")]
    BadMagic { found: u32 },

    #[error("payload address {addr:#x} is not {}-byte aligned", ALIGNMENT)]
    MisalignedPayload { addr: usize },

    #[error("payload capacity {size} is below the minimum of {}", MIN_PAYLOAD_SIZE)]
    UndersizedBlock { size: usize },

    #[error("free flag holds {value}, expected 0 or 1")]
    InvalidFreeFlag { value: u32 },

    #[error("block is already free (double free or stale pointer)")]
    AlreadyFree,
}
