//! Credential Store Adapters
//!
//! - `SqliteCredentialStore`: single-row SQLite table via sqlx
//! - `MemoryCredentialStore`: process-local store for tests and ephemeral runs
//!
//! The credential is a single logical record. Every save overwrites it.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::application::ports::{CredentialStore, StoreError};
use crate::domain::credential::{Credential, unix_now};

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Query(err.to_string())
    }
}

// =============================================================================
// SQLite Store
// =============================================================================

const CREATE_TABLE: &str = r"
    CREATE TABLE IF NOT EXISTS upstox_credentials (
        id            INTEGER PRIMARY KEY CHECK (id = 1),
        access_token  TEXT    NOT NULL,
        refresh_token TEXT,
        expires_at    INTEGER NOT NULL,
        updated_at    INTEGER NOT NULL
    )
";

/// Credential store backed by a single-row SQLite table.
#[derive(Debug, Clone)]
pub struct SqliteCredentialStore {
    pool: SqlitePool,
}

impl SqliteCredentialStore {
    /// Open (or create) the database and ensure the table exists.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Unavailable` when the database cannot be opened
    /// or the schema cannot be created.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        sqlx::query(CREATE_TABLE)
            .execute(&pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        tracing::debug!("Credential store ready");
        Ok(Self { pool })
    }

    /// Close the underlying pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl CredentialStore for SqliteCredentialStore {
    async fn load(&self) -> Result<Option<Credential>, StoreError> {
        let row = sqlx::query(
            "SELECT access_token, refresh_token, expires_at FROM upstox_credentials WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let access_token: String = row
            .try_get("access_token")
            .map_err(|e| StoreError::Corrupt(format!("access_token: {e}")))?;
        let refresh_token: Option<String> = row
            .try_get("refresh_token")
            .map_err(|e| StoreError::Corrupt(format!("refresh_token: {e}")))?;
        let expires_at: i64 = row
            .try_get("expires_at")
            .map_err(|e| StoreError::Corrupt(format!("expires_at: {e}")))?;

        if access_token.is_empty() {
            return Err(StoreError::Corrupt("empty access_token".to_string()));
        }

        Ok(Some(Credential::new(access_token, refresh_token, expires_at)))
    }

    async fn save(&self, credential: &Credential) -> Result<(), StoreError> {
        sqlx::query(
            r"
            INSERT INTO upstox_credentials (id, access_token, refresh_token, expires_at, updated_at)
            VALUES (1, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at
            ",
        )
        .bind(credential.access_token())
        .bind(credential.refresh_token())
        .bind(credential.expires_at())
        .bind(unix_now())
        .execute(&self.pool)
        .await?;

        tracing::debug!(expires_at = credential.expires_at(), "Credential persisted");
        Ok(())
    }
}

// =============================================================================
// In-Memory Store
// =============================================================================

/// Credential store that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    slot: Mutex<Option<Credential>>,
}

impl MemoryCredentialStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with a credential.
    #[must_use]
    pub fn with_credential(credential: Credential) -> Self {
        Self {
            slot: Mutex::new(Some(credential)),
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self) -> Result<Option<Credential>, StoreError> {
        Ok(self.slot.lock().clone())
    }

    async fn save(&self, credential: &Credential) -> Result<(), StoreError> {
        *self.slot.lock() = Some(credential.clone());
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    async fn open_store(dir: &TempDir) -> SqliteCredentialStore {
        let path = dir.path().join("tokens.db");
        let url = format!("sqlite://{}?mode=rwc", path.display());
        SqliteCredentialStore::connect(&url).await.unwrap()
    }

    #[tokio::test]
    async fn empty_database_loads_nothing() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_overwrites_single_row() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;

        let first = Credential::new("a1", Some("r1".to_string()), 1_000);
        let second = Credential::new("a2", None, 2_000);
        store.save(&first).await.unwrap();
        store.save(&second).await.unwrap();

        assert_eq!(store.load().await.unwrap(), Some(second));

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM upstox_credentials")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn credential_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let credential = Credential::new("persisted", Some("refresh".to_string()), 42);
        {
            let store = open_store(&dir).await;
            store.save(&credential).await.unwrap();
            store.close().await;
        }

        let reopened = open_store(&dir).await;
        assert_eq!(reopened.load().await.unwrap(), Some(credential));
    }

    #[tokio::test]
    async fn unreachable_database_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let url = format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("missing").join("tokens.db").display()
        );
        let err = SqliteCredentialStore::connect(&url).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryCredentialStore::new();
        assert!(store.load().await.unwrap().is_none());

        let credential = Credential::new("m", None, 7);
        store.save(&credential).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(credential));
    }
}
