//! Platform credential store.
//!
//! Every application registered with the gateway owns one row in the
//! `info` table: a platform access/secret key pair that clients sign
//! requests with, plus the backend engine and the backend credentials
//! the gateway uses on its behalf.
//!
//! Uses `rusqlite` with the `bundled` feature.  The async trait methods
//! are thin wrappers around synchronous calls under a `Mutex`.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard};

use chrono::{SecondsFormat, Utc};
use rand::Rng;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use thiserror::Error;
use tracing::{debug, info};

use crate::gateway::Credentials;

/// Length of a generated platform access key.
pub const ACCESS_KEY_LEN: usize = 20;

/// Length of a generated platform secret key.
pub const SECRET_KEY_LEN: usize = 40;

const KEY_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential store: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("credential store: {0}")]
    Io(#[from] std::io::Error),

    #[error("access key {0:?} is already registered")]
    Duplicate(String),

    #[error("credential store lock poisoned")]
    Poisoned,
}

/// Everything needed to verify and serve one platform access key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCredential {
    /// Platform secret the request must be signed with.
    pub secret_key: String,
    /// Backend engine name.
    pub engine: String,
    /// Backend credentials.
    pub backend: Credentials,
    /// Backend region.
    pub region: String,
}

/// One row of the `info` table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Application {
    pub access_key: String,
    pub secret_key: String,
    pub engine: String,
    pub engine_access_key: String,
    pub engine_secret_key: String,
    pub engine_region: String,
    pub app_name: String,
    pub app_remark: String,
    pub created_at: String,
}

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, CredentialError>> + Send + 'a>>;

/// Maps platform access keys to backend credentials.
pub trait CredentialResolver: Send + Sync {
    /// `None` when the key is unknown or its backend material is
    /// incomplete.
    fn lookup(&self, access_key: &str) -> StoreFuture<'_, Option<ResolvedCredential>>;

    fn insert(&self, app: Application) -> StoreFuture<'_, ()>;

    /// Returns whether a row was removed.
    fn delete(&self, access_key: &str) -> StoreFuture<'_, bool>;

    /// Whether an application already uses these backend credentials.
    fn backend_registered(&self, engine: &str, backend: &Credentials) -> StoreFuture<'_, bool>;
}

/// Credential store backed by a single SQLite database file.
pub struct SqliteCredentialStore {
    conn: Mutex<Connection>,
}

impl SqliteCredentialStore {
    /// Open (or create) the database at `path` and initialize the schema.
    ///
    /// Passing `":memory:"` creates an in-memory database.
    pub fn new(path: &str) -> Result<Self, CredentialError> {
        if path != ":memory:" {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;
            ",
        )?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_db()?;
        info!("credential store opened at {}", path);
        Ok(store)
    }

    /// Create the `info` table if it does not exist.  Idempotent.
    fn init_db(&self) -> Result<(), CredentialError> {
        self.conn()?.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS info (
                os_access_key      TEXT PRIMARY KEY,
                os_secret_key      TEXT NOT NULL,
                engine_type        TEXT NOT NULL,
                engine_access_key  TEXT NOT NULL DEFAULT '',
                engine_secret_key  TEXT NOT NULL DEFAULT '',
                engine_region      TEXT NOT NULL DEFAULT '',
                app_name           TEXT NOT NULL DEFAULT '',
                app_remark         TEXT NOT NULL DEFAULT '',
                created_at         TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, CredentialError> {
        self.conn.lock().map_err(|_| CredentialError::Poisoned)
    }

    /// Fetch a full row.
    pub fn get(&self, access_key: &str) -> Result<Option<Application>, CredentialError> {
        let app = self
            .conn()?
            .query_row(
                "SELECT os_access_key, os_secret_key, engine_type, engine_access_key,
                        engine_secret_key, engine_region, app_name, app_remark, created_at
                 FROM info WHERE os_access_key = ?1",
                params![access_key],
                |row| {
                    Ok(Application {
                        access_key: row.get(0)?,
                        secret_key: row.get(1)?,
                        engine: row.get(2)?,
                        engine_access_key: row.get(3)?,
                        engine_secret_key: row.get(4)?,
                        engine_region: row.get(5)?,
                        app_name: row.get(6)?,
                        app_remark: row.get(7)?,
                        created_at: row.get(8)?,
                    })
                },
            )
            .optional()?;
        Ok(app)
    }
}

impl CredentialResolver for SqliteCredentialStore {
    fn lookup(&self, access_key: &str) -> StoreFuture<'_, Option<ResolvedCredential>> {
        let access_key = access_key.to_string();
        Box::pin(async move {
            let Some(app) = self.get(&access_key)? else {
                debug!("unknown platform access key {}", access_key);
                return Ok(None);
            };
            if app.engine.is_empty() || app.engine_secret_key.is_empty() {
                debug!("platform access key {} has no backend material", access_key);
                return Ok(None);
            }
            Ok(Some(ResolvedCredential {
                secret_key: app.secret_key,
                engine: app.engine,
                backend: Credentials::new(app.engine_access_key, app.engine_secret_key),
                region: app.engine_region,
            }))
        })
    }

    fn insert(&self, mut app: Application) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            if app.created_at.is_empty() {
                app.created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
            }
            let result = self.conn()?.execute(
                "INSERT INTO info (os_access_key, os_secret_key, engine_type, engine_access_key,
                                   engine_secret_key, engine_region, app_name, app_remark, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    app.access_key,
                    app.secret_key,
                    app.engine,
                    app.engine_access_key,
                    app.engine_secret_key,
                    app.engine_region,
                    app.app_name,
                    app.app_remark,
                    app.created_at,
                ],
            );
            match result {
                Ok(_) => {
                    info!("registered application {:?} on engine {}", app.app_name, app.engine);
                    Ok(())
                }
                Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                    Err(CredentialError::Duplicate(app.access_key))
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    fn delete(&self, access_key: &str) -> StoreFuture<'_, bool> {
        let access_key = access_key.to_string();
        Box::pin(async move {
            let removed = self
                .conn()?
                .execute("DELETE FROM info WHERE os_access_key = ?1", params![access_key])?;
            Ok(removed > 0)
        })
    }

    fn backend_registered(&self, engine: &str, backend: &Credentials) -> StoreFuture<'_, bool> {
        let engine = engine.to_string();
        let backend = backend.clone();
        Box::pin(async move {
            let count: i64 = self.conn()?.query_row(
                "SELECT COUNT(*) FROM info
                 WHERE engine_type = ?1 AND engine_access_key = ?2 AND engine_secret_key = ?3",
                params![engine, backend.access_key_id, backend.secret_access_key],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }
}

// ── Key generation ──────────────────────────────────────────────────

fn random_key(len: usize) -> String {
    let mut rng = rand::thread_rng();
    let mut key: String = (0..len)
        .map(|_| KEY_ALPHABET[rng.gen_range(0..KEY_ALPHABET.len())] as char)
        .collect();
    if key.starts_with('0') {
        key.replace_range(..1, "x");
    }
    key
}

/// New 20-character platform access key.
pub fn generate_access_key() -> String {
    random_key(ACCESS_KEY_LEN)
}

/// New 40-character platform secret key.
pub fn generate_secret_key() -> String {
    random_key(SECRET_KEY_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> SqliteCredentialStore {
        SqliteCredentialStore::new(":memory:").expect("failed to create in-memory store")
    }

    fn app(access_key: &str) -> Application {
        Application {
            access_key: access_key.to_string(),
            secret_key: "platform-secret".to_string(),
            engine: "s3".to_string(),
            engine_access_key: "backend-ak".to_string(),
            engine_secret_key: "backend-sk".to_string(),
            engine_region: "eu-west-1".to_string(),
            app_name: "demo".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_schema_idempotent() {
        let store = test_store();
        store.init_db().expect("second init_db failed");
    }

    #[tokio::test]
    async fn test_insert_and_lookup() {
        let store = test_store();
        store.insert(app("AK1")).await.unwrap();

        let resolved = store.lookup("AK1").await.unwrap().unwrap();
        assert_eq!(resolved.secret_key, "platform-secret");
        assert_eq!(resolved.engine, "s3");
        assert_eq!(resolved.backend, Credentials::new("backend-ak", "backend-sk"));
        assert_eq!(resolved.region, "eu-west-1");

        let row = store.get("AK1").unwrap().unwrap();
        assert!(!row.created_at.is_empty());
    }

    #[tokio::test]
    async fn test_lookup_unknown_key() {
        let store = test_store();
        assert_eq!(store.lookup("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lookup_incomplete_row_is_not_found() {
        let store = test_store();
        let mut no_secret = app("AK2");
        no_secret.engine_secret_key.clear();
        store.insert(no_secret).await.unwrap();
        assert_eq!(store.lookup("AK2").await.unwrap(), None);

        let mut no_engine = app("AK3");
        no_engine.engine.clear();
        store.insert(no_engine).await.unwrap();
        assert_eq!(store.lookup("AK3").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_duplicate_insert() {
        let store = test_store();
        store.insert(app("AK1")).await.unwrap();
        let err = store.insert(app("AK1")).await.unwrap_err();
        assert!(matches!(err, CredentialError::Duplicate(ref k) if k == "AK1"));
    }

    #[tokio::test]
    async fn test_delete() {
        let store = test_store();
        store.insert(app("AK1")).await.unwrap();
        assert!(store.delete("AK1").await.unwrap());
        assert!(!store.delete("AK1").await.unwrap());
        assert_eq!(store.lookup("AK1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_backend_registered() {
        let store = test_store();
        let creds = Credentials::new("backend-ak", "backend-sk");
        assert!(!store.backend_registered("s3", &creds).await.unwrap());
        store.insert(app("AK1")).await.unwrap();
        assert!(store.backend_registered("s3", &creds).await.unwrap());
        assert!(!store.backend_registered("cos", &creds).await.unwrap());
    }

    #[tokio::test]
    async fn test_file_backed_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("creds.db");
        let path = path.to_str().unwrap();

        SqliteCredentialStore::new(path).unwrap().insert(app("AK1")).await.unwrap();
        let reopened = SqliteCredentialStore::new(path).unwrap();
        assert!(reopened.lookup("AK1").await.unwrap().is_some());
    }

    #[test]
    fn test_generated_keys() {
        for _ in 0..200 {
            let ak = generate_access_key();
            let sk = generate_secret_key();
            assert_eq!(ak.len(), ACCESS_KEY_LEN);
            assert_eq!(sk.len(), SECRET_KEY_LEN);
            assert!(ak.chars().all(|c| c.is_ascii_alphanumeric()));
            assert!(!ak.starts_with('0'));
            assert!(!sk.starts_with('0'));
        }
        assert_ne!(generate_access_key(), generate_access_key());
    }
}
