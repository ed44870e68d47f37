use std::io;

use thiserror::Error;

/// Failure while decompressing a single page.
#[derive(Debug, Error)]
pub enum DecompressError {
    #[error(transparent)]
    Lz4(#[from] lz4_flex::block::DecompressError),

    #[error("page decompressed to {got} bytes, expected {expected}")]
    SizeMismatch { got: usize, expected: usize },
}

/// Everything that can stop a snapshot restore.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("unsupported snapshot index version {0}, expected 1")]
    FormatVersionMismatch(u32),

    #[error("snapshot references RAM block '{0}' which was not registered")]
    UnknownBlock(String),

    #[error("snapshot index is corrupt: {0}")]
    InvalidIndex(String),

    #[error("cannot register RAM block '{id}': {reason}")]
    InvalidBlock { id: String, reason: &'static str },

    #[error("loading was already started")]
    AlreadyStarted,

    #[error("reading page {addr:#x} returned {got} of {expected} bytes at offset {pos}")]
    ShortRead {
        addr: usize,
        pos: u64,
        got: usize,
        expected: usize,
    },

    #[error("decompressing page {addr:#x} failed")]
    DecompressionFailure {
        addr: usize,
        #[source]
        source: DecompressError,
    },

    #[error("memory access watch failed to initialize")]
    FaultWatchInitFailure,

    #[error("failed to watch memory range {start:#x}+{len:#x}")]
    RegisterRange {
        start: usize,
        len: usize,
        #[source]
        source: io::Error,
    },

    #[error("filling page {addr:#x} into guest memory failed")]
    FillFailed {
        addr: usize,
        #[source]
        source: io::Error,
    },

    #[error("page {addr:#x} failed to load")]
    PageFailed { addr: usize },

    #[error("address {0:#x} is not inside any registered RAM block")]
    UnmappedAddress(usize),

    #[error(transparent)]
    Io(#[from] io::Error),
}
