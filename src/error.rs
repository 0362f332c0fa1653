//! Error handling utils.
//!
//! Every fallible routine of the crate returns the crate-wide [`Error`] enum
//! wrapped in the [`Result`] alias. System-level failures keep the platform
//! errno inside the embedded [`std::io::Error`], so callers can still match
//! on `raw_os_error()` when they need the exact cause.

use std::io;

/// A specialized [`Result`] type for the crate
pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////
// Error
////////////////////////////////////////////////////////////////////////////////

/// Represents all error cases for all routines of the crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// End of file (stream, iterator).
    #[error("end of file")]
    Eof,

    /// Resource is already acquired.
    #[error("resource is busy")]
    Busy,

    /// Memory allocation failed.
    #[error("out of memory")]
    OutOfMemory,

    /// Object not found.
    #[error("object not found")]
    NotFound,

    /// Bad argument.
    #[error("bad argument: {0}")]
    BadArgument(&'static str),

    /// System error, errno is preserved inside.
    #[error("system error: {0}")]
    System(#[from] io::Error),

    /// The operation is already in progress.
    #[error("operation is already in progress")]
    InProgress,

    /// Unexpected behaviour, most likely a bug in the caller or the runtime.
    #[error("unexpected state: {0}")]
    UnexpectedState(&'static str),

    /// Functionality is not implemented yet.
    #[error("not implemented")]
    NotImplemented,

    /// Integer overflow.
    #[error("overflow")]
    Overflow,

    /// Protocol violation.
    #[error("protocol violation")]
    Protocol,

    /// Timeout has expired.
    #[error("timeout")]
    Timeout,
}

impl From<Error> for io::Error {
    fn from(error: Error) -> Self {
        match error {
            Error::System(io) => io,
            Error::Timeout => io::ErrorKind::TimedOut.into(),
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}

impl Error {
    /// Shortcut for capturing the calling thread's last OS error.
    #[inline(always)]
    pub fn last_os_error() -> Self {
        Self::System(io::Error::last_os_error())
    }

    /// Returns the name of the variant as it is spelled in the source code.
    pub const fn variant_name(&self) -> &'static str {
        match self {
            Self::Eof => "Eof",
            Self::Busy => "Busy",
            Self::OutOfMemory => "OutOfMemory",
            Self::NotFound => "NotFound",
            Self::BadArgument(_) => "BadArgument",
            Self::System(_) => "System",
            Self::InProgress => "InProgress",
            Self::UnexpectedState(_) => "UnexpectedState",
            Self::NotImplemented => "NotImplemented",
            Self::Overflow => "Overflow",
            Self::Protocol => "Protocol",
            Self::Timeout => "Timeout",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_empty_description() {
        let errors = [
            Error::Eof,
            Error::Busy,
            Error::OutOfMemory,
            Error::NotFound,
            Error::BadArgument("fd"),
            Error::System(io::Error::from_raw_os_error(libc::EAGAIN)),
            Error::InProgress,
            Error::UnexpectedState("no scheduler"),
            Error::NotImplemented,
            Error::Overflow,
            Error::Protocol,
            Error::Timeout,
        ];
        for e in &errors {
            assert!(!e.to_string().is_empty());
            assert!(!e.variant_name().is_empty());
        }
    }

    #[test]
    fn errno_is_preserved() {
        let e = Error::System(io::Error::from_raw_os_error(libc::ECONNRESET));
        match e {
            Error::System(io) => assert_eq!(io.raw_os_error(), Some(libc::ECONNRESET)),
            other => panic!("unexpected variant: {}", other.variant_name()),
        }
    }
}
