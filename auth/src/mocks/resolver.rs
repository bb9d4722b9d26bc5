//! In-memory credential resolver.

use super::{Failures, Op};
use crate::error::{AuthError, Result};
use crate::providers::CredentialResolver;
use crate::state::{ResolvedAccount, TenantMembership};
use crate::utils::normalize_email;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Credential resolver over a fixed set of accounts.
#[derive(Debug, Clone, Default)]
pub struct MockCredentialResolver {
    accounts: Arc<Mutex<HashMap<String, ResolvedAccount>>>,
    failures: Arc<Failures>,
}

impl MockCredentialResolver {
    /// Create a resolver with no accounts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: add an account with a single default tenant.
    #[must_use]
    pub fn with_account(self, email: &str, subject_user_id: &str, tenant_id: &str) -> Self {
        self.add_account(
            email,
            ResolvedAccount {
                subject_user_id: subject_user_id.to_string(),
                memberships: vec![TenantMembership {
                    tenant_id: tenant_id.to_string(),
                    role: "member".to_string(),
                    is_default: true,
                }],
            },
        );
        self
    }

    /// Register `account` under `email`.
    pub fn add_account(&self, email: &str, account: ResolvedAccount) {
        if let Ok(mut accounts) = self.accounts.lock() {
            accounts.insert(normalize_email(email), account);
        }
    }

    /// Failure injection.
    #[must_use]
    pub fn failures(&self) -> &Failures {
        &self.failures
    }
}

impl CredentialResolver for MockCredentialResolver {
    async fn resolve(&self, email: &str) -> Result<ResolvedAccount> {
        self.failures
            .gate(Op::Read)
            .await
            .map_err(AuthError::DatabaseError)?;

        self.accounts
            .lock()
            .map_err(|_| AuthError::InternalError("Mutex lock failed".into()))?
            .get(&normalize_email(email))
            .cloned()
            .ok_or(AuthError::AccountNotFound)
    }
}
