use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::info;

use crate::error::StoreError;
use crate::schema;

/// Shared SQLite connection guarded by a parking_lot mutex.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl Database {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Io(format!("create dir: {e}")))?;
        }
        let conn = Connection::open(path)?;
        Self::prepare(&conn)?;
        info!(path = %path.display(), "credential database opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_owned(),
        })
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::prepare(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: PathBuf::from(":memory:"),
        })
    }

    /// Apply pragmas and bring a fresh file up to the current schema.
    /// Files written by a newer client are refused rather than guessed at.
    fn prepare(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(schema::PRAGMAS)
            .map_err(|e| StoreError::Database(format!("pragmas: {e}")))?;

        let found: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
        match found {
            0 => {
                conn.execute_batch(schema::CREATE_TABLES)
                    .map_err(|e| StoreError::Database(format!("schema: {e}")))?;
                conn.pragma_update(None, "user_version", schema::SCHEMA_VERSION)?;
            }
            v if v == schema::SCHEMA_VERSION => {}
            v => {
                return Err(StoreError::Database(format!(
                    "credential schema v{v} is newer than supported v{}",
                    schema::SCHEMA_VERSION
                )))
            }
        }
        Ok(())
    }

    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
