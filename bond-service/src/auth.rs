//! Caller Resolution and Roles
//!
//! The service receives an opaque credential with every request and asks an
//! `IdentityResolver` who the caller is. Raw credentials never reach the
//! ledger operations.

use std::collections::HashMap;

use async_trait::async_trait;
use bond_core::{LedgerError, LedgerResult, UserId};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Caller role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Admin => write!(f, "admin"),
        }
    }
}

/// Resolved caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub subject_id: UserId,
    pub role: Role,
}

impl Caller {
    pub fn user(subject_id: UserId) -> Self {
        Self { subject_id, role: Role::User }
    }

    pub fn admin(subject_id: UserId) -> Self {
        Self { subject_id, role: Role::Admin }
    }

    /// `Forbidden` unless the caller holds `required`
    pub fn require(&self, required: Role, operation: &str) -> LedgerResult<()> {
        if self.role == required {
            Ok(())
        } else {
            Err(LedgerError::Forbidden {
                operation: operation.to_string(),
                required: required.to_string(),
            })
        }
    }
}

/// Maps an opaque credential to a caller
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// `Unauthenticated` when the credential is unknown or malformed
    async fn resolve(&self, credential: &str) -> LedgerResult<Caller>;
}

/// Fixed credential table, for tests and single-operator deployments
#[derive(Debug, Default)]
pub struct StaticIdentityResolver {
    callers: RwLock<HashMap<String, Caller>>,
}

impl StaticIdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, credential: impl Into<String>, caller: Caller) {
        self.callers.write().await.insert(credential.into(), caller);
    }

    pub async fn revoke(&self, credential: &str) -> bool {
        self.callers.write().await.remove(credential).is_some()
    }
}

#[async_trait]
impl IdentityResolver for StaticIdentityResolver {
    async fn resolve(&self, credential: &str) -> LedgerResult<Caller> {
        let credential = credential.trim();
        if credential.is_empty() {
            return Err(LedgerError::Unauthenticated);
        }
        self.callers
            .read()
            .await
            .get(credential)
            .copied()
            .ok_or(LedgerError::Unauthenticated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bond_core::ErrorKind;

    #[tokio::test]
    async fn test_resolve_known_and_unknown() {
        let resolver = StaticIdentityResolver::new();
        let alice = UserId::new();
        resolver.insert("alice-key", Caller::user(alice)).await;

        let caller = resolver.resolve("alice-key").await.unwrap();
        assert_eq!(caller.subject_id, alice);
        assert_eq!(caller.role, Role::User);

        assert_eq!(resolver.resolve("nope").await, Err(LedgerError::Unauthenticated));
        assert_eq!(resolver.resolve("  ").await, Err(LedgerError::Unauthenticated));

        assert!(resolver.revoke("alice-key").await);
        assert!(resolver.resolve("alice-key").await.is_err());
    }

    #[test]
    fn test_require_role() {
        let caller = Caller::user(UserId::new());
        assert!(caller.require(Role::User, "purchase").is_ok());
        let err = caller.require(Role::Admin, "issue_bonds").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
        assert_eq!(err.code(), "BL-AUTH-002");
    }
}
