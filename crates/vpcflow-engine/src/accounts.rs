//! Invalid-account registry
//!
//! An authentication failure against an account marks it invalid. Every later
//! task touching that account fails fast until the account is revalidated.

use crate::error::{EngineError, Result};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tracing::{info, warn};
use vpcflow_cloud::{CloudError, CloudProvider, Scope};

#[derive(Default)]
pub struct AccountGuard {
    invalid: RwLock<HashMap<String, String>>,
}

impl AccountGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ensure_valid(&self, account: &str) -> Result<()> {
        let invalid = self.invalid.read().unwrap_or_else(PoisonError::into_inner);
        if invalid.contains_key(account) {
            return Err(EngineError::AccountInvalid(account.to_string()));
        }
        Ok(())
    }

    pub fn is_invalid(&self, account: &str) -> bool {
        self.ensure_valid(account).is_err()
    }

    pub fn invalidate(&self, account: &str, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(account = %account, reason = %reason, "Marking account invalid");
        self.invalid
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(account.to_string(), reason);
    }

    /// Invalidate the account when `error` is an authentication failure
    pub fn observe(&self, account: &str, error: &CloudError) {
        if error.is_auth() {
            self.invalidate(account, error.to_string());
        }
    }

    /// Re-check credentials and clear the mark when they work again
    pub async fn revalidate(&self, provider: &dyn CloudProvider, scope: &Scope) -> Result<bool> {
        let status = provider.check_auth(scope).await?;
        if status.authenticated {
            let cleared = self
                .invalid
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&scope.account)
                .is_some();
            if cleared {
                info!(account = %scope.account, "Account revalidated");
            }
        } else {
            self.invalidate(
                &scope.account,
                status.error.unwrap_or_else(|| "not authenticated".to_string()),
            );
        }
        Ok(status.authenticated)
    }
}
