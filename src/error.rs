//! Error types.
//!
//! Factories are all-or-nothing: any error returned here means no loader was produced.
//! Problems with a single relocation or binding entry are never errors; they are logged
//! and the surrounding pass keeps going.

use std::path::PathBuf;

use thiserror::Error;

use crate::arch::Arch;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse error: {0}")]
    Parse(#[from] object::read::Error),

    #[error("malformed binary: {0}")]
    Malformed(String),

    #[error("not a {expected} file")]
    UnsupportedFormat { expected: &'static str },

    #[error("architecture {0} is not supported by the target system")]
    UnsupportedArch(Arch),

    #[error("no slice matches architecture {0}")]
    NoMatchingArch(Arch),

    #[error("mmap() of 0x{size:x} bytes failed")]
    MmapFailed { size: u64 },

    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    #[error("argument contains a NUL byte")]
    NulArgument(#[from] std::ffi::NulError),
}

impl Error {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Error::Malformed(msg.into())
    }
}
