// Crate-wide error model.
//
// Every fallible operation in the runtime returns one of the kinds below.
// Collaborator failures (transport, RPC codec) are converted to these kinds at
// the seam; nothing crosses component boundaries as a panic.

use std::fmt;

use thiserror::Error;

/// The failure kinds a participant operation can surface.
#[derive(Debug, Clone, Error)]
pub enum Error {
  /// The operation is not allowed in the current lifecycle or service state.
  #[error("invalid state: {0}")]
  InvalidState(String),

  /// A parameter was rejected.
  #[error("invalid argument: {0}")]
  InvalidArg(String),

  /// A named thing (clock, client, service, profile) is unknown.
  #[error("not found: {0}")]
  NotFound(String),

  /// A named thing is already present and duplicates are rejected.
  #[error("already registered: {0}")]
  AlreadyRegistered(String),

  /// A weak reference was already expired when it was needed.
  #[error("expired reference: {0}")]
  Pointer(String),

  /// An internal invariant did not hold.
  #[error("unexpected: {0}")]
  Unexpected(String),

  /// The underlying transport failed to set up or deliver.
  #[error("transport failure: {0}")]
  BadDevice(String),

  /// The operation was abandoned because of shutdown.
  #[error("cancelled: {0}")]
  Cancelled(String),

  /// An I/O level failure (sockets, poll registration).
  #[error("i/o failure: {0}")]
  IoFailure(String),

  /// A bounded wait elapsed without the awaited condition.
  #[error("timeout: {0}")]
  Timeout(String),

  /// The request is recognized but not supported.
  #[error("unsupported: {0}")]
  Unsupported(String),
}

impl Error {
  /// Stable integer code, used by the RPC services in their
  /// `{result, description}` responses. `0` is reserved for success.
  pub fn code(&self) -> i32 {
    match self {
      Error::InvalidState(_) => -10,
      Error::InvalidArg(_) => -11,
      Error::NotFound(_) => -12,
      Error::AlreadyRegistered(_) => -13,
      Error::Pointer(_) => -14,
      Error::Unexpected(_) => -15,
      Error::BadDevice(_) => -16,
      Error::Cancelled(_) => -17,
      Error::IoFailure(_) => -18,
      Error::Timeout(_) => -19,
      Error::Unsupported(_) => -20,
    }
  }

  /// Short kind name, mostly for logs and RPC descriptions.
  pub fn kind_name(&self) -> &'static str {
    match self {
      Error::InvalidState(_) => "InvalidState",
      Error::InvalidArg(_) => "InvalidArg",
      Error::NotFound(_) => "NotFound",
      Error::AlreadyRegistered(_) => "AlreadyRegistered",
      Error::Pointer(_) => "Pointer",
      Error::Unexpected(_) => "Unexpected",
      Error::BadDevice(_) => "BadDevice",
      Error::Cancelled(_) => "Cancelled",
      Error::IoFailure(_) => "IOFailure",
      Error::Timeout(_) => "Timeout",
      Error::Unsupported(_) => "Unsupported",
    }
  }
}

impl From<std::io::Error> for Error {
  fn from(e: std::io::Error) -> Self {
    Error::IoFailure(e.to_string())
  }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of a state-machine transition as reported over RPC and in logs:
/// the numeric code plus a human-readable description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationStatus {
  pub result: i32,
  pub description: String,
}

impl OperationStatus {
  pub fn ok() -> Self {
    OperationStatus {
      result: 0,
      description: String::new(),
    }
  }

  pub fn from_result(r: &Result<()>) -> Self {
    match r {
      Ok(()) => OperationStatus::ok(),
      Err(e) => OperationStatus {
        result: e.code(),
        description: e.to_string(),
      },
    }
  }

  pub fn is_ok(&self) -> bool {
    self.result == 0
  }
}

impl fmt::Display for OperationStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.is_ok() {
      write!(f, "ok")
    } else {
      write!(f, "{} ({})", self.description, self.result)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn codes_are_distinct() {
    let errors = [
      Error::InvalidState(String::new()),
      Error::InvalidArg(String::new()),
      Error::NotFound(String::new()),
      Error::AlreadyRegistered(String::new()),
      Error::Pointer(String::new()),
      Error::Unexpected(String::new()),
      Error::BadDevice(String::new()),
      Error::Cancelled(String::new()),
      Error::IoFailure(String::new()),
      Error::Timeout(String::new()),
      Error::Unsupported(String::new()),
    ];
    let mut codes: Vec<i32> = errors.iter().map(Error::code).collect();
    codes.sort_unstable();
    codes.dedup();
    assert_eq!(codes.len(), errors.len());
  }

  #[test]
  fn status_round_trip() {
    let ok = OperationStatus::from_result(&Ok(()));
    assert!(ok.is_ok());

    let err: Result<()> = Err(Error::InvalidState("nope".to_string()));
    let status = OperationStatus::from_result(&err);
    assert_eq!(status.result, -10);
    assert!(status.description.contains("nope"));
  }
}
