use thiserror::Error;

use crate::buffer::OpKind;

/// Errors surfaced by the runtime.
///
/// Backend failures travel unchanged from the memory backend or executor up to the
/// caller. Nothing is retried.
#[derive(Debug, Error)]
pub enum PimError {
  /// A backend allocation call failed (out of arena, backend refused).
  #[error("allocation failed: {0}")]
  AllocationFailure(String),

  /// A backend copy call failed, including a single failed granule copy during layout
  /// conversion.
  #[error("copy failed: {0}")]
  CopyFailure(String),

  /// `convert_layout` was asked for an operation kind with no bank layout.
  #[error("layout conversion is not implemented for {0}")]
  UnsupportedLayout(OpKind),

  #[error("invalid configuration: {0}")]
  InvalidConfiguration(String),

  #[error("runtime is not initialized")]
  NotInitialized,

  #[error("config error: {0}")]
  Config(String),

  #[error(transparent)]
  Io(#[from] std::io::Error),
}

impl PimError {
  pub(crate) fn invalid(msg: impl Into<String>) -> Self {
    PimError::InvalidConfiguration(msg.into())
  }
}

impl From<::config::ConfigError> for PimError {
  fn from(err: ::config::ConfigError) -> Self {
    PimError::Config(err.to_string())
  }
}

pub type PimResult<T> = Result<T, PimError>;
