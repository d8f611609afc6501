//! The authorization collaborator (spec §4.4.4): consulted per operation
//! and per documentId, not part of the synchronization core itself.

use async_trait::async_trait;
use docsync_base::{err_kind, ErrorKind, Result};
use docsync_wire::Permission;

/// Credentials as handed over in the `auth` client message: a bearer token,
/// possibly empty (anonymous).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Credentials {
    pub token: String,
}

impl Credentials {
    pub fn anonymous() -> Self {
        Credentials { token: String::new() }
    }

    pub fn is_anonymous(&self) -> bool {
        self.token.is_empty()
    }
}

impl From<String> for Credentials {
    fn from(token: String) -> Self {
        Credentials { token }
    }
}

/// A successful authorization decision.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Grant {
    pub permission: Permission,
    pub user_id: Option<String>,
}

#[async_trait]
pub trait AuthService: Send + Sync {
    /// Decide what `credentials` may do to `document_id`. `Ok(None)` means
    /// deny; `Err` means the check itself failed (e.g. a backing call).
    async fn authorize(&self, credentials: &Credentials, document_id: &str) -> Result<Option<Grant>>;
}

/// Grants `Write` to everyone, including anonymous callers. Useful for
/// local development and tests; never wire this up in front of anything
/// that matters.
pub struct AllowAll;

#[async_trait]
impl AuthService for AllowAll {
    async fn authorize(&self, _credentials: &Credentials, _document_id: &str) -> Result<Option<Grant>> {
        Ok(Some(Grant { permission: Permission::Write, user_id: None }))
    }
}

/// Looks tokens up in a fixed table of `token -> (user_id, permission)`.
/// Every document shares the same table; per-document grants aren't
/// modeled here since nothing in the table keys on documentId.
pub struct TokenMapAuth {
    table: std::collections::HashMap<String, (String, Permission)>,
}

impl TokenMapAuth {
    pub fn new() -> Self {
        TokenMapAuth { table: std::collections::HashMap::new() }
    }

    pub fn grant(mut self, token: impl Into<String>, user_id: impl Into<String>, permission: Permission) -> Self {
        self.table.insert(token.into(), (user_id.into(), permission));
        self
    }
}

impl Default for TokenMapAuth {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthService for TokenMapAuth {
    async fn authorize(&self, credentials: &Credentials, _document_id: &str) -> Result<Option<Grant>> {
        if credentials.is_anonymous() {
            return Ok(None);
        }
        Ok(self
            .table
            .get(&credentials.token)
            .map(|(user_id, permission)| Grant { permission: *permission, user_id: Some(user_id.clone()) }))
    }
}

/// Require at least `required` permission from a [`Grant`], mapping a
/// missing or insufficient grant to an `Authentication` error the way the
/// engine surfaces it to the client.
pub fn require(grant: Option<Grant>, required: Permission) -> Result<Grant> {
    match grant {
        Some(grant) if satisfies(grant.permission, required) => Ok(grant),
        Some(_) => Err(err_kind(ErrorKind::Authentication, "insufficient permission")),
        None => Err(err_kind(ErrorKind::Authentication, "not authorized")),
    }
}

fn satisfies(held: Permission, required: Permission) -> bool {
    match required {
        Permission::Read => matches!(held, Permission::Read | Permission::Write),
        Permission::Write => matches!(held, Permission::Write),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[tokio::test]
    async fn allow_all_grants_write_to_anonymous() {
        let auth = AllowAll;
        let grant = auth.authorize(&Credentials::anonymous(), "doc1").await.unwrap().unwrap();
        assert_eq!(grant.permission, Permission::Write);
    }

    #[tokio::test]
    async fn token_map_denies_anonymous_and_unknown_tokens() {
        let auth = TokenMapAuth::new().grant("abc", "alice", Permission::Write);
        assert!(auth.authorize(&Credentials::anonymous(), "doc1").await.unwrap().is_none());
        assert!(auth.authorize(&Credentials::from("nope".to_string()), "doc1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn token_map_grants_known_token() {
        let auth = TokenMapAuth::new().grant("abc", "alice", Permission::Read);
        let grant = auth.authorize(&Credentials::from("abc".to_string()), "doc1").await.unwrap().unwrap();
        assert_eq!(grant.user_id.as_deref(), Some("alice"));
        assert_eq!(grant.permission, Permission::Read);
    }

    #[test]
    fn require_accepts_write_grant_for_read_requirement() {
        let grant = Grant { permission: Permission::Write, user_id: None };
        assert!(require(Some(grant), Permission::Read).is_ok());
    }

    #[test]
    fn require_rejects_read_grant_for_write_requirement() {
        let grant = Grant { permission: Permission::Read, user_id: None };
        let err = require(Some(grant), Permission::Write).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
    }

    #[test]
    fn require_rejects_missing_grant() {
        let err = require(None, Permission::Read).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
    }
}
