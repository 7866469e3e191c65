//! Error types and utilities.

use std::error::Error as StdError;
use std::fmt;

/// The result of a trampoline operation.
pub type Result<T> = std::result::Result<T, Error>;

/// A representation of all possible errors.
#[derive(Debug)]
pub enum Error {
  /// `target`/`callback` was null, or `min_bytes_to_reloc` was zero.
  InvalidArgument,
  /// The engine is not in a state where the requested operation is valid
  /// (e.g. the readable region at `target` is smaller than
  /// `min_bytes_to_reloc`, or the pool was never initialized for `free`).
  InvalidOperation,
  /// No trampoline chunk can be placed within `+/-2GiB` reach of every
  /// address the relocated prologue depends on.
  OutOfRange,
  /// The decoder rejected a byte sequence inside the prologue.
  DecodeFailed,
  /// An instruction was encountered that the active rewrite flags do not
  /// permit relocating.
  UnsupportedInstruction,
  /// A platform memory operation (query, reserve, commit, protect, release)
  /// failed.
  PlatformCallFailed(region::Error),
}

impl StdError for Error {
  fn source(&self) -> Option<&(dyn StdError + 'static)> {
    if let Error::PlatformCallFailed(error) = self {
      Some(error)
    } else {
      None
    }
  }
}

impl fmt::Display for Error {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Error::InvalidArgument => write!(f, "invalid argument"),
      Error::InvalidOperation => write!(f, "operation is not valid in the current state"),
      Error::OutOfRange => write!(f, "no reachable location for the trampoline"),
      Error::DecodeFailed => write!(f, "could not decode an instruction in the prologue"),
      Error::UnsupportedInstruction => {
        write!(f, "prologue contains an instruction the active flags do not permit rewriting")
      },
      Error::PlatformCallFailed(ref error) => write!(f, "platform call failed: {}", error),
    }
  }
}

impl From<region::Error> for Error {
  fn from(error: region::Error) -> Self {
    Error::PlatformCallFailed(error)
  }
}
