//! Account authentication.
//!
//! Features only see the [`AuthProvider`] trait. [`LocalAuth`] keeps accounts
//! and bearer sessions in the same libsql database as the documents.

use crate::error::{AuthError, StoreError};
use crate::store::LocalStore;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

const MAX_FAILED_ATTEMPTS: i64 = 5;
const LOCKOUT_MINUTES: i64 = 5;
const MIN_PASSWORD_LEN: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub uid: String,
    pub email: Option<String>,
    pub token: String,
    pub anonymous: bool,
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn create_account(&self, email: &str, password: &str) -> Result<Session, AuthError>;

    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, AuthError>;

    async fn sign_in_anonymously(&self) -> Result<Session, AuthError>;

    async fn sign_out(&self, token: &str) -> Result<(), AuthError>;

    /// Resolves a bearer token; `SessionExpired` when unknown.
    async fn session(&self, token: &str) -> Result<Session, AuthError>;
}

pub fn validate_email(email: &str) -> Result<(), AuthError> {
    let Some((local, domain)) = email.split_once('@') else {
        return Err(AuthError::InvalidEmail);
    };
    let valid = !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !email.chars().any(char::is_whitespace);
    if valid { Ok(()) } else { Err(AuthError::InvalidEmail) }
}

/// Salted single-round SHA-256. This is a stand-in for the hosted identity
/// provider used in production and is not a password hash suitable for a
/// public deployment: it is fast to brute-force. Swap in a memory-hard KDF
/// such as argon2 before exposing this store beyond a local install.
fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

fn new_token() -> String {
    format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}

struct AccountRow {
    uid: String,
    password_salt: Option<String>,
    password_hash: Option<String>,
    disabled: bool,
    failed_attempts: i64,
    locked_until: Option<String>,
}

pub struct LocalAuth {
    store: Arc<LocalStore>,
}

impl LocalAuth {
    pub fn new(store: Arc<LocalStore>) -> Self {
        LocalAuth { store }
    }

    pub async fn disable_account(&self, uid: &str) -> Result<bool, AuthError> {
        let changed = self
            .store
            .connection()
            .execute(
                "UPDATE accounts SET disabled = 1 WHERE uid = ?",
                libsql::params![uid],
            )
            .await
            .map_err(StoreError::from)?;
        if changed > 0 {
            self.store
                .connection()
                .execute("DELETE FROM sessions WHERE uid = ?", libsql::params![uid])
                .await
                .map_err(StoreError::from)?;
        }
        Ok(changed > 0)
    }

    async fn find_account(&self, email: &str) -> Result<Option<AccountRow>, AuthError> {
        let query = r#"
            SELECT uid, password_salt, password_hash, disabled, failed_attempts, locked_until
            FROM accounts WHERE email = ?
        "#;
        let mut rows = self
            .store
            .connection()
            .query(query, libsql::params![email])
            .await
            .map_err(StoreError::from)?;

        match rows.next().await.map_err(StoreError::from)? {
            Some(row) => Ok(Some(AccountRow {
                uid: row.get(0).map_err(StoreError::from)?,
                password_salt: row.get(1).map_err(StoreError::from)?,
                password_hash: row.get(2).map_err(StoreError::from)?,
                disabled: row.get::<i64>(3).map_err(StoreError::from)? != 0,
                failed_attempts: row.get(4).map_err(StoreError::from)?,
                locked_until: row.get(5).map_err(StoreError::from)?,
            })),
            None => Ok(None),
        }
    }

    async fn open_session(&self, uid: &str, email: Option<&str>, anonymous: bool) -> Result<Session, AuthError> {
        let token = new_token();
        self.store
            .connection()
            .execute(
                "INSERT INTO sessions (token, uid) VALUES (?, ?)",
                libsql::params![token.as_str(), uid],
            )
            .await
            .map_err(StoreError::from)?;

        Ok(Session {
            uid: uid.to_string(),
            email: email.map(str::to_string),
            token,
            anonymous,
        })
    }

    async fn record_failure(&self, account: &AccountRow) -> Result<(), AuthError> {
        // an expired lockout starts a fresh count
        let lock_expired = account.locked_until.is_some() && !is_locked(&account.locked_until);
        let previous = if lock_expired { 0 } else { account.failed_attempts };
        let attempts = previous + 1;
        let locked_until = (attempts >= MAX_FAILED_ATTEMPTS)
            .then(|| (Utc::now() + Duration::minutes(LOCKOUT_MINUTES)).to_rfc3339());

        self.store
            .connection()
            .execute(
                "UPDATE accounts SET failed_attempts = ?, locked_until = ? WHERE uid = ?",
                libsql::params![attempts, locked_until, account.uid.as_str()],
            )
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }
}

fn is_locked(locked_until: &Option<String>) -> bool {
    locked_until
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .is_some_and(|until| until > Utc::now())
}

#[async_trait]
impl AuthProvider for LocalAuth {
    async fn create_account(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        let email = email.trim().to_lowercase();
        validate_email(&email)?;
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(AuthError::WeakPassword);
        }
        if self.find_account(&email).await?.is_some() {
            return Err(AuthError::EmailInUse);
        }

        let uid = uuid::Uuid::new_v4().simple().to_string();
        let salt = uuid::Uuid::new_v4().simple().to_string();
        let hash = hash_password(&salt, password);

        self.store
            .connection()
            .execute(
                "INSERT INTO accounts (uid, email, password_salt, password_hash) VALUES (?, ?, ?, ?)",
                libsql::params![uid.as_str(), email.as_str(), salt, hash],
            )
            .await
            .map_err(StoreError::from)?;

        tracing::info!(uid, "account created");
        self.open_session(&uid, Some(&email), false).await
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        let email = email.trim().to_lowercase();
        validate_email(&email)?;

        let account = self
            .find_account(&email)
            .await?
            .ok_or(AuthError::InvalidCredential)?;

        if account.disabled {
            return Err(AuthError::UserDisabled);
        }
        if is_locked(&account.locked_until) {
            return Err(AuthError::TooManyRequests);
        }

        let matches = match (&account.password_salt, &account.password_hash) {
            (Some(salt), Some(hash)) => &hash_password(salt, password) == hash,
            _ => false,
        };
        if !matches {
            self.record_failure(&account).await?;
            tracing::info!(uid = %account.uid, "sign-in rejected");
            return Err(AuthError::InvalidCredential);
        }

        if account.failed_attempts > 0 {
            self.store
                .connection()
                .execute(
                    "UPDATE accounts SET failed_attempts = 0, locked_until = NULL WHERE uid = ?",
                    libsql::params![account.uid.as_str()],
                )
                .await
                .map_err(StoreError::from)?;
        }

        self.open_session(&account.uid, Some(&email), false).await
    }

    async fn sign_in_anonymously(&self) -> Result<Session, AuthError> {
        let uid = uuid::Uuid::new_v4().simple().to_string();
        self.store
            .connection()
            .execute(
                "INSERT INTO accounts (uid, anonymous) VALUES (?, 1)",
                libsql::params![uid.as_str()],
            )
            .await
            .map_err(StoreError::from)?;
        self.open_session(&uid, None, true).await
    }

    async fn sign_out(&self, token: &str) -> Result<(), AuthError> {
        self.store
            .connection()
            .execute("DELETE FROM sessions WHERE token = ?", libsql::params![token])
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }

    async fn session(&self, token: &str) -> Result<Session, AuthError> {
        let query = r#"
            SELECT accounts.uid, accounts.email, accounts.anonymous, accounts.disabled
            FROM sessions
            JOIN accounts ON accounts.uid = sessions.uid
            WHERE sessions.token = ?
        "#;
        let mut rows = self
            .store
            .connection()
            .query(query, libsql::params![token])
            .await
            .map_err(StoreError::from)?;

        let row = rows
            .next()
            .await
            .map_err(StoreError::from)?
            .ok_or(AuthError::SessionExpired)?;

        if row.get::<i64>(3).map_err(StoreError::from)? != 0 {
            return Err(AuthError::UserDisabled);
        }

        Ok(Session {
            uid: row.get(0).map_err(StoreError::from)?,
            email: row.get(1).map_err(StoreError::from)?,
            token: token.to_string(),
            anonymous: row.get::<i64>(2).map_err(StoreError::from)? != 0,
        })
    }
}
