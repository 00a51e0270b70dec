//! Error types for VenomQueue

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for VenomQueue operations
pub type Result<T> = std::result::Result<T, QueueError>;

/// Errors that can occur in VenomQueue operations
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to create shared memory (resource exhaustion or name collision)
    #[error("Failed to allocate shared memory '{name}': {source}")]
    Allocation {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Segment descriptor does not resolve
    #[error("Shared memory segment '{name}' not found: {source}")]
    SegmentNotFound {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to map memory
    #[error("Failed to map memory: {0}")]
    Mmap(#[source] io::Error),

    /// Failed to truncate shared memory
    #[error("Failed to set shared memory size: {0}")]
    Truncate(#[source] io::Error),

    /// Failed to unlink shared memory
    #[error("Failed to tear down shared memory '{name}': {source}")]
    Teardown {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Region does not carry a queue segment header
    #[error("Invalid segment magic number: expected 0x{expected:08X}, got 0x{got:08X}")]
    InvalidMagic { expected: u32, got: u32 },

    /// Segment was laid out by an incompatible library version
    #[error("Incompatible segment version: expected {expected}, got {got}")]
    IncompatibleVersion { expected: u32, got: u32 },

    /// Region is smaller than its header claims
    #[error("Segment is truncated: need {need} bytes, mapped {got}")]
    Truncated { need: usize, got: usize },

    /// Header geometry does not describe a valid layout
    #[error("Corrupt segment header: {0}")]
    CorruptHeader(String),

    /// Segment parameters out of range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Segment name too long
    #[error("Segment name too long: max {max} chars, got {got}")]
    NameTooLong { max: usize, got: usize },

    /// Key is empty or contains an interior NUL
    #[error("Invalid key: {0:?}")]
    InvalidKey(String),

    /// Key exceeds the fixed key slot
    #[error("Key too long: max {max} bytes, got {got} bytes")]
    KeyTooLong { max: usize, got: usize },

    /// Payload exceeds the configured slot payload size
    #[error("Payload too large: max {max} bytes, got {got} bytes")]
    PayloadTooLarge { max: usize, got: usize },

    /// Write with a key that is already live in the queue
    #[error("Duplicate key '{0}'")]
    DuplicateKey(String),

    /// Lookup or removal of a key that is not in the queue
    #[error("Key '{0}' not found")]
    KeyNotFound(String),

    /// No free slot left
    #[error("Queue is full ({capacity} entries)")]
    QueueFull { capacity: usize },

    /// Another consumer already claimed the entry
    #[error("Entry '{key}' already claimed by pid {pid}")]
    AlreadyClaimed { key: String, pid: u32 },

    /// Entry is in a state the operation cannot act on
    #[error("Entry '{key}' is {state}")]
    InvalidState { key: String, state: &'static str },

    /// Poll budget exhausted
    #[error("Timed out after {attempts} attempts ({elapsed:?})")]
    Timeout { attempts: u32, elapsed: Duration },

    /// Payload failed to parse or lacks required fields
    #[error("Malformed payload: {reason}")]
    MalformedPayload { reason: String },

    /// Worker answered with an error response
    #[error("Worker for '{function}' failed: {message}")]
    WorkerFailed { function: String, message: String },
}

impl QueueError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        QueueError::MalformedPayload {
            reason: reason.into(),
        }
    }

    /// Whether the failure is a lookup miss (absent key or segment)
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            QueueError::KeyNotFound(_) | QueueError::SegmentNotFound { .. }
        )
    }

    /// Stable numeric code reported through the C ABI
    pub fn status_code(&self) -> i32 {
        match self {
            QueueError::Allocation { .. } => -1,
            QueueError::SegmentNotFound { .. } | QueueError::KeyNotFound(_) => -2,
            QueueError::DuplicateKey(_) => -3,
            QueueError::QueueFull { .. } => -4,
            QueueError::Timeout { .. } => -5,
            QueueError::MalformedPayload { .. } => -6,
            QueueError::AlreadyClaimed { .. } | QueueError::InvalidState { .. } => -7,
            QueueError::InvalidKey(_)
            | QueueError::KeyTooLong { .. }
            | QueueError::PayloadTooLarge { .. }
            | QueueError::NameTooLong { .. }
            | QueueError::InvalidConfig(_) => -8,
            QueueError::WorkerFailed { .. } => -9,
            QueueError::Mmap(_)
            | QueueError::Truncate(_)
            | QueueError::Teardown { .. }
            | QueueError::InvalidMagic { .. }
            | QueueError::CorruptHeader(_)
            | QueueError::IncompatibleVersion { .. }
            | QueueError::Truncated { .. } => -10,
        }
    }
}
