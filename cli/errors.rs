// Copyright 2025 the modcdn authors. MIT license.

use thiserror::Error;

pub use anyhow::anyhow;
pub use anyhow::bail;
pub use anyhow::Context;
pub type AnyError = anyhow::Error;

/// Error kinds that surface to clients as non-success responses. Every
/// other failure in the transform pipeline degrades to pass-through and
/// never leaves the process as an error.
#[derive(Debug, Error)]
pub enum CdnError {
  #[error("invalid URL: {0}")]
  InvalidUrl(String),
  #[error("could not resolve a version for '{spec}': {reason}")]
  VersionUnresolvable { spec: String, reason: String },
  #[error("installing '{package}' failed: {reason}")]
  InstallFailed { package: String, reason: String },
  #[error("no such file in package: {0}")]
  FileNotFound(String),
}

impl CdnError {
  pub fn status_code(&self) -> u16 {
    match self {
      CdnError::InvalidUrl(_) => 400,
      CdnError::VersionUnresolvable { .. } => 404,
      CdnError::FileNotFound(_) => 404,
      CdnError::InstallFailed { .. } => 502,
    }
  }
}

/// HTTP status for an error bubbling out of the pipeline. Anything that
/// is not one of the typed kinds is an internal error.
pub fn http_status(err: &AnyError) -> u16 {
  err
    .downcast_ref::<CdnError>()
    .map(|e| e.status_code())
    .unwrap_or(500)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn status_codes_follow_the_error_policy() {
    assert_eq!(http_status(&CdnError::InvalidUrl("x".into()).into()), 400);
    assert_eq!(
      http_status(
        &CdnError::VersionUnresolvable {
          spec: "x".into(),
          reason: "y".into()
        }
        .into()
      ),
      404
    );
    assert_eq!(http_status(&CdnError::FileNotFound("x".into()).into()), 404);
    assert_eq!(
      http_status(
        &CdnError::InstallFailed {
          package: "x".into(),
          reason: "y".into()
        }
        .into()
      ),
      502
    );
    assert_eq!(http_status(&anyhow!("anything else")), 500);
  }
}
