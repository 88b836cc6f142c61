//! The error taxonomy surfaced by [`crate::Trace::open`].
//!
//! Header-level errors abort construction before any operation is
//! retained. `Overflow` and `Corrupt` abort construction mid-stream and
//! release whatever was partially built. A torn trailing record is *not*
//! one of these — it is absorbed silently so that captures from a crashed
//! producer still parse to the last intact record.

use std::io;

/// Errors that can occur while opening and parsing a capture file.
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    /// The file could not be opened or read, or was empty.
    #[error("i/o error reading capture file: {0}")]
    IoError(#[from] io::Error),

    /// The first 16 bytes did not match `"Malloc Monitor!\0"`.
    #[error("not a Malloc Monitor capture file (bad signature)")]
    BadSignature,

    /// The protocol version byte was not `1`.
    #[error("unsupported capture protocol version: {0}")]
    UnsupportedVersion(u8),

    /// The producer's pointer width exceeds what this consumer can represent.
    #[error("producer pointer width of {0} bytes is not supported by this consumer")]
    IncompatiblePointerWidth(u8),

    /// A length field (string length, frame count) exceeded the implementation cap.
    #[error("{field} exceeds the implementation cap of {cap}")]
    Overflow {
        /// Which field overflowed (`"frame_count"`, `"id"`, `"binary_path"`).
        field: &'static str,
        /// The cap that was exceeded.
        cap: usize,
    },

    /// An operation tag outside the known set was encountered mid-stream.
    #[error("corrupt capture stream: unknown operation tag {0}")]
    Corrupt(u8),
}

pub type Result<T> = std::result::Result<T, TraceError>;
