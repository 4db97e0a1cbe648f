//! Engine error types

use thiserror::Error;
use vpcflow_cloud::{CloudError, ResourceKind};
use vpcflow_core::CoreError;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("{kind} '{name}' already exists remotely as {remote_id}")]
    Conflict {
        kind: ResourceKind,
        name: String,
        remote_id: String,
    },

    #[error("{kind} '{name}' referenced as {role} does not exist")]
    MissingReference {
        kind: ResourceKind,
        name: String,
        role: String,
    },

    #[error("Account {0} is marked invalid")]
    AccountInvalid(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl EngineError {
    /// Errors that mean the request itself cannot be satisfied
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            EngineError::Validation(_)
                | EngineError::Conflict { .. }
                | EngineError::MissingReference { .. }
                | EngineError::Core(CoreError::Conflict { .. })
        )
    }

    pub fn is_auth(&self) -> bool {
        match self {
            EngineError::AccountInvalid(_) => true,
            EngineError::Cloud(e) => e.is_auth(),
            _ => false,
        }
    }

    /// The provider refused the operation outright
    pub fn is_execute(&self) -> bool {
        matches!(
            self,
            EngineError::Cloud(
                CloudError::Execute(_) | CloudError::InvalidRequest(_) | CloudError::NotFound(_)
            )
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(EngineError::Validation("x".into()).is_validation());
        assert!(EngineError::AccountInvalid("acct".into()).is_auth());
        assert!(EngineError::Cloud(CloudError::Auth("expired".into())).is_auth());
        assert!(EngineError::Cloud(CloudError::Execute("quota".into())).is_execute());
        assert!(!EngineError::Cloud(CloudError::Connect("timeout".into())).is_execute());
    }
}
