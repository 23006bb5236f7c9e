use super::{GalleryBackend, GalleryError, GalleryRecord};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS gallery (
    id     INTEGER PRIMARY KEY CHECK (id = 1),
    record TEXT NOT NULL
)";

/// SQLite backend holding the serialized record in a single row.
///
/// The schema is created on first use, so a corrupt database file surfaces
/// as a `load` error rather than failing `open`.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
    schema_ready: AtomicBool,
}

impl SqliteBackend {
    pub fn open(path: &Path) -> Result<Self, GalleryError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self::with_connection(Connection::open(path)?))
    }

    pub fn open_in_memory() -> Result<Self, GalleryError> {
        Ok(Self::with_connection(Connection::open_in_memory()?))
    }

    fn with_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            schema_ready: AtomicBool::new(false),
        }
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, GalleryError> {
        let conn = self.conn.lock().map_err(|_| GalleryError::Poisoned)?;
        if !self.schema_ready.load(Ordering::Acquire) {
            conn.execute_batch(SCHEMA)?;
            self.schema_ready.store(true, Ordering::Release);
        }
        Ok(conn)
    }
}

impl GalleryBackend for SqliteBackend {
    fn load(&self) -> Result<Option<GalleryRecord>, GalleryError> {
        let text: Option<String> = self
            .conn()?
            .query_row("SELECT record FROM gallery WHERE id = 1", [], |row| row.get(0))
            .optional()?;
        match text {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    fn save(&self, record: &GalleryRecord) -> Result<(), GalleryError> {
        let text = serde_json::to_string(record)?;
        self.conn()?.execute(
            "INSERT OR REPLACE INTO gallery (id, record) VALUES (1, ?1)",
            params![text],
        )?;
        Ok(())
    }
}
