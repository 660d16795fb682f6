// SPDX-License-Identifier: Apache-2.0

use std::{error, fmt::Display, io};

use libc::c_int;

use crate::migration::{session::SessionState, Gfn};
use crate::support::Technology;

/// Error conditions raised while preparing or driving an encrypted guest
/// migration.
///
/// Every one of them aborts the migration session it was raised in. None
/// is retried at this layer and none downgrades to a partial success.
#[derive(Debug)]
pub enum Error {
    /// Something went wrong when reading or writing the migration stream.
    IoError(io::Error),

    /// The confidential guest support object has not been marked ready.
    NotReady,

    /// The technology cannot migrate encrypted memory.
    Unsupported(Technology),

    /// An operation was issued in the wrong session state.
    InvalidState {
        /// The state the operation requires.
        expected: SessionState,

        /// The state the session was actually in.
        actual: SessionState,
    },

    /// The session already failed and must not be used further.
    Aborted,

    /// Certificate material handed to `save_setup` was rejected.
    InvalidCertificate(String),

    /// A page buffer had the wrong size (actual, expected).
    InvalidPageSize(usize, usize),

    /// A record read from the stream is malformed.
    InvalidRecord(String),

    /// An incoming page failed its integrity check.
    IntegrityFailure,

    /// The shared/private classification of a page disagrees between the
    /// stream and the reconstructed shared-region list.
    ClassificationMismatch(Gfn),

    /// The platform firmware rejected a command with the given status code.
    Firmware(u32),
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(e) => write!(f, "Migration stream I/O error: {e}"),
            Error::NotReady => write!(f, "Confidential guest support is not ready"),
            Error::Unsupported(technology) => {
                write!(f, "{technology} does not support encrypted migration")
            }
            Error::InvalidState { expected, actual } => write!(
                f,
                "Invalid migration session state (expected {expected}, found {actual})"
            ),
            Error::Aborted => write!(f, "Migration session was aborted"),
            Error::InvalidCertificate(msg) => write!(f, "Invalid certificate: {msg}"),
            Error::InvalidPageSize(actual, expected) => {
                write!(f, "Invalid page size ({actual} vs {expected})")
            }
            Error::InvalidRecord(msg) => write!(f, "Malformed migration record: {msg}"),
            Error::IntegrityFailure => write!(f, "Incoming page failed its integrity check"),
            Error::ClassificationMismatch(gfn) => {
                write!(f, "Shared/private classification mismatch for gfn {gfn}")
            }
            Error::Firmware(code) => write!(f, "Platform firmware error {code:#x}"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::IoError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(error: io::Error) -> Error {
        Error::IoError(error)
    }
}

impl From<bincode::Error> for Error {
    fn from(error: bincode::Error) -> Error {
        Error::InvalidRecord(error.to_string())
    }
}

impl From<Error> for io::Error {
    #[inline]
    fn from(error: Error) -> io::Error {
        match error {
            Error::IoError(e) => e,
            e => io::Error::new(io::ErrorKind::Other, e),
        }
    }
}

impl From<Error> for c_int {
    /// Negative errno for callers that expect the "zero is success"
    /// convention.
    fn from(error: Error) -> Self {
        let errno = match error {
            Error::IoError(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::NotReady => libc::EPERM,
            Error::Unsupported(_) => libc::ENOTSUP,
            Error::InvalidState { .. } => libc::EINVAL,
            Error::Aborted => libc::ECANCELED,
            Error::InvalidCertificate(_) => libc::EINVAL,
            Error::InvalidPageSize(_, _) => libc::EINVAL,
            Error::InvalidRecord(_) => libc::EBADMSG,
            Error::IntegrityFailure => libc::EBADMSG,
            Error::ClassificationMismatch(_) => libc::EBADMSG,
            Error::Firmware(_) => libc::EIO,
        };

        -errno
    }
}

/// Errors encountered when parsing configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// The named confidential guest support type does not exist.
    UnknownTechnology(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::UnknownTechnology(name) => {
                write!(f, "Unknown confidential guest support type: {name}")
            }
        }
    }
}

impl error::Error for ConfigError {}
