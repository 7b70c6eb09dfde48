//! Access/refresh token storage.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rusqlite::OptionalExtension;
use secrecy::{ExposeSecret, SecretString};

use crate::database::Database;
use crate::error::StoreError;

const DEFAULT_SLOT: &str = "default";

/// Stored credentials. Secrets are redacted in `Debug`.
#[derive(Clone)]
pub struct Credentials {
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    pub updated_at: DateTime<Utc>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

/// Where the transport keeps bearer credentials between requests.
pub trait CredentialStore: Send + Sync {
    fn load(&self) -> Result<Option<Credentials>, StoreError>;

    fn set_tokens(&self, access: &str, refresh: Option<&str>) -> Result<(), StoreError>;

    fn clear_tokens(&self) -> Result<(), StoreError>;

    fn has_refresh_token(&self) -> bool {
        matches!(self.load(), Ok(Some(c)) if c.refresh_token.is_some())
    }

    fn access_token(&self) -> Option<SecretString> {
        self.load().ok().flatten().map(|c| c.access_token)
    }
}

/// Process-lifetime store. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryCredentialStore {
    inner: RwLock<Option<Credentials>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<dyn CredentialStore> {
        Arc::new(Self::new())
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> Result<Option<Credentials>, StoreError> {
        Ok(self.inner.read().clone())
    }

    fn set_tokens(&self, access: &str, refresh: Option<&str>) -> Result<(), StoreError> {
        *self.inner.write() = Some(Credentials {
            access_token: SecretString::from(access.to_string()),
            refresh_token: refresh.map(|r| SecretString::from(r.to_string())),
            updated_at: Utc::now(),
        });
        Ok(())
    }

    fn clear_tokens(&self) -> Result<(), StoreError> {
        *self.inner.write() = None;
        Ok(())
    }
}

/// SQLite-backed store so a CLI session survives restarts.
#[derive(Clone)]
pub struct SqliteCredentialStore {
    db: Database,
}

impl SqliteCredentialStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl CredentialStore for SqliteCredentialStore {
    fn load(&self) -> Result<Option<Credentials>, StoreError> {
        self.db.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT access_token, refresh_token, updated_at FROM credentials WHERE slot = ?1",
                    [DEFAULT_SLOT],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, Option<String>>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    },
                )
                .optional()?;

            let Some((access, refresh, updated_at)) = row else {
                return Ok(None);
            };
            let updated_at = DateTime::parse_from_rfc3339(&updated_at)
                .map_err(|e| StoreError::Serialization(format!("updated_at: {e}")))?
                .with_timezone(&Utc);
            Ok(Some(Credentials {
                access_token: SecretString::from(access),
                refresh_token: refresh.map(SecretString::from),
                updated_at,
            }))
        })
    }

    fn set_tokens(&self, access: &str, refresh: Option<&str>) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO credentials (slot, access_token, refresh_token, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(slot) DO UPDATE SET
                     access_token = excluded.access_token,
                     refresh_token = excluded.refresh_token,
                     updated_at = excluded.updated_at",
                rusqlite::params![DEFAULT_SLOT, access, refresh, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    fn clear_tokens(&self) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM credentials WHERE slot = ?1", [DEFAULT_SLOT])?;
            Ok(())
        })
    }
}

/// Expose the access token for an `Authorization` header.
pub fn bearer_value(token: &SecretString) -> String {
    format!("Bearer {}", token.expose_secret())
}
