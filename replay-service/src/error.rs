// Service Errors
// Run-level failures; per-cell failures are reported as outcomes instead

use crate::config::ConfigError;
use crate::execution::isolation::IsolationError;
use crate::execution::lock::LockError;

use thiserror::Error;

pub type ServiceResult<T> = Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Isolation(#[from] IsolationError),

    #[error(transparent)]
    Lock(#[from] LockError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_config_error_converts() {
        let err: ServiceError = ConfigError::NotAMapping(PathBuf::from(".travis.yml")).into();
        assert!(matches!(err, ServiceError::Config(_)));
        assert!(err.to_string().contains(".travis.yml"));
    }
}
