//! Errors raised while building or loading value-model records.

use thiserror::Error;

/// Errors raised by record builders.
#[derive(Debug, Error)]
pub enum BuilderError {
  #[error("{kind} key must not be empty")]
  EmptyKey { kind: &'static str },

  #[error("duplicate key '{key}' in {record}")]
  DuplicateKey { key: String, record: String },

  #[error("invalid function name '{0}': must be non-empty and alphanumeric")]
  InvalidFunctionName(String),

  #[error("{field} must not be zero")]
  ZeroVersion { field: &'static str },

  #[error("function '{0}' is not registered")]
  UnknownFunction(String),

  #[error("failed to serialize record: {0}")]
  Serialize(#[from] serde_json::Error),
}

/// Structural validation failures while loading a serialized record.
#[derive(Debug, Error)]
pub enum RecordError {
  #[error("malformed record: {0}")]
  Malformed(#[from] serde_json::Error),

  #[error("invalid function name '{0}'")]
  InvalidFunctionName(String),

  #[error("{field} must not be zero")]
  ZeroVersion { field: &'static str },

  #[error("record contains an empty key")]
  EmptyKey,

  #[error("record contains duplicate key '{0}'")]
  DuplicateKey(String),

  #[error("diagnostic has an empty message")]
  EmptyDiagnostic,
}

/// Errors raised while registering build functions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
  #[error("invalid function name '{0}': must be non-empty and alphanumeric")]
  InvalidFunctionName(String),

  #[error("function '{0}' has a nil version")]
  ZeroVersion(String),

  #[error("function '{0}' is already registered")]
  DuplicateFunction(String),
}

/// Errors raised by the awaiting session entry points.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
  #[error("build of '{0}' ended without reporting completion")]
  Abandoned(String),
}
