//! Gallery of enrolled identities with write-through persistence.
//!
//! The store keeps an immutable snapshot of the entries behind a lock.
//! Mutations build the next snapshot, persist it through the backend, and
//! only then publish it, so a failed write leaves the in-memory gallery as
//! it was and a reload never sees a state the caller was told had failed.

mod backend;
mod sqlite;

pub use backend::{open_backend, GalleryBackend, GalleryRecord, JsonFileBackend};
pub use sqlite::SqliteBackend;

use crate::types::Embedding;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("gallery io: {0}")]
    Io(#[from] std::io::Error),
    #[error("gallery record encoding: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("gallery record is corrupt: {0}")]
    Corrupt(String),
    #[error("gallery lock poisoned")]
    Poisoned,
}

/// One enrollment. Several entries may share a name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub name: String,
    pub embedding: Embedding,
    pub wanted: bool,
}

/// One row per distinct name; `wanted` if any entry for the name is wanted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NameSummary {
    pub name: String,
    pub wanted: bool,
}

pub struct GalleryStore {
    backend: Box<dyn GalleryBackend>,
    entries: RwLock<Arc<Vec<GalleryEntry>>>,
}

impl GalleryStore {
    /// Create a store over `backend` and load whatever it holds.
    pub fn open(backend: Box<dyn GalleryBackend>) -> Self {
        let store = Self {
            backend,
            entries: RwLock::new(Arc::new(Vec::new())),
        };
        store.load();
        store
    }

    /// Replace the in-memory gallery with the persisted one.
    ///
    /// Missing or unreadable storage yields an empty gallery; this never fails.
    /// Returns the number of entries loaded.
    pub fn load(&self) -> usize {
        let entries = match self.backend.load() {
            Ok(Some(record)) => match record.into_entries() {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(error = %e, "gallery record rejected; starting with an empty gallery");
                    Vec::new()
                }
            },
            Ok(None) => {
                tracing::info!("no persisted gallery; starting empty");
                Vec::new()
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to load gallery; starting with an empty gallery");
                Vec::new()
            }
        };

        let count = entries.len();
        *self.entries.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(entries);
        tracing::info!(entries = count, "gallery loaded");
        count
    }

    /// Append an enrollment. Returns `Ok(false)` without touching the gallery
    /// when the embedding is missing, empty or not finite.
    pub fn add_entry(
        &self,
        name: &str,
        embedding: Option<Embedding>,
        wanted: bool,
    ) -> Result<bool, GalleryError> {
        let Some(embedding) = embedding.filter(|e| !e.is_empty()) else {
            tracing::debug!(name, "rejecting enrollment without an embedding");
            return Ok(false);
        };
        if !embedding.is_finite() {
            tracing::warn!(name, "rejecting enrollment with a non-finite embedding");
            return Ok(false);
        }

        self.mutate(|entries| {
            entries.push(GalleryEntry {
                name: name.to_string(),
                embedding,
                wanted,
            });
            true
        })?;
        tracing::info!(name, wanted, "gallery entry added");
        Ok(true)
    }

    /// Set `wanted` on every entry named exactly `name`.
    ///
    /// Returns whether any entry matched; persists only in that case.
    pub fn set_wanted(&self, name: &str, wanted: bool) -> Result<bool, GalleryError> {
        let updated = self.mutate(|entries| {
            let mut updated = false;
            for entry in entries.iter_mut().filter(|e| e.name == name) {
                entry.wanted = wanted;
                updated = true;
            }
            updated
        })?;
        if updated {
            tracing::info!(name, wanted, "wanted flag updated");
        }
        Ok(updated)
    }

    /// Remove every entry and persist the empty gallery.
    pub fn clear(&self) -> Result<(), GalleryError> {
        self.mutate(|entries| {
            entries.clear();
            true
        })?;
        tracing::info!("gallery cleared");
        Ok(())
    }

    /// Distinct names in first-seen order, wanted OR-ed across duplicates.
    pub fn list_names(&self) -> Vec<NameSummary> {
        let entries = self.snapshot();
        let mut names: Vec<NameSummary> = Vec::new();
        for entry in entries.iter() {
            match names.iter_mut().find(|s| s.name == entry.name) {
                Some(summary) => summary.wanted |= entry.wanted,
                None => names.push(NameSummary {
                    name: entry.name.clone(),
                    wanted: entry.wanted,
                }),
            }
        }
        names
    }

    /// Consistent read-only view of every entry.
    pub fn snapshot(&self) -> Arc<Vec<GalleryEntry>> {
        Arc::clone(&self.entries.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Apply `change` to a copy of the entries; when it reports a change,
    /// persist the copy and publish it. The write lock is held throughout,
    /// serializing mutations against each other and against persistence.
    fn mutate<F>(&self, change: F) -> Result<bool, GalleryError>
    where
        F: FnOnce(&mut Vec<GalleryEntry>) -> bool,
    {
        let mut guard = self.entries.write().map_err(|_| GalleryError::Poisoned)?;
        let mut next = Vec::clone(&guard);
        if !change(&mut next) {
            return Ok(false);
        }

        self.backend.save(&GalleryRecord::from_entries(&next))?;
        tracing::debug!(entries = next.len(), "gallery persisted");
        *guard = Arc::new(next);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    fn emb(values: &[f64]) -> Option<Embedding> {
        Some(Embedding::new(values.to_vec()))
    }

    fn json_store(dir: &tempfile::TempDir) -> GalleryStore {
        let backend = JsonFileBackend::new(dir.path().join("gallery.json"));
        GalleryStore::open(Box::new(backend))
    }

    /// In-memory backend whose writes can be made to fail.
    #[derive(Default)]
    struct FlakyBackend {
        record: Mutex<Option<GalleryRecord>>,
        fail_writes: AtomicBool,
    }

    impl GalleryBackend for Arc<FlakyBackend> {
        fn load(&self) -> Result<Option<GalleryRecord>, GalleryError> {
            Ok(self.record.lock().unwrap().clone())
        }

        fn save(&self, record: &GalleryRecord) -> Result<(), GalleryError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(GalleryError::Io(std::io::Error::other("disk full")));
            }
            *self.record.lock().unwrap() = Some(record.clone());
            Ok(())
        }
    }

    #[test]
    fn test_add_entry_appends_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = json_store(&dir);
        assert!(store.is_empty());

        assert!(store.add_entry("Alice", emb(&[0.1, 0.2]), false).unwrap());
        assert!(store.add_entry("Alice", emb(&[0.3, 0.4]), false).unwrap());
        assert_eq!(store.len(), 2);
        assert!(dir.path().join("gallery.json").exists());
    }

    #[test]
    fn test_add_entry_rejects_missing_embedding() {
        let dir = tempfile::tempdir().unwrap();
        let store = json_store(&dir);
        store.add_entry("Alice", emb(&[1.0]), false).unwrap();

        assert!(!store.add_entry("Bob", None, true).unwrap());
        assert!(!store.add_entry("Bob", emb(&[]), true).unwrap());
        assert_eq!(store.len(), 1);
        assert_eq!(store.list_names().len(), 1);
    }

    #[test]
    fn test_add_entry_rejects_non_finite_embedding() {
        let dir = tempfile::tempdir().unwrap();
        let store = json_store(&dir);
        assert!(store.add_entry("Alice", emb(&[1.0, 0.0]), false).unwrap());

        assert!(!store.add_entry("Bad", emb(&[f64::NAN, 0.0]), false).unwrap());
        assert!(!store.add_entry("Bad", emb(&[0.0, f64::INFINITY]), true).unwrap());
        assert_eq!(store.len(), 1);

        let reopened = json_store(&dir);
        assert_eq!(*reopened.snapshot(), *store.snapshot());
    }

    #[test]
    fn test_null_embedding_value_drops_only_that_entry() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("gallery.json"),
            r#"{"names":["Alice","Bad","Bob"],"embeddings":[[1.0,0.0],[null,0.0],[0.0,1.0]],"wanted":[false,true,true]}"#,
        )
        .unwrap();

        let store = json_store(&dir);
        assert_eq!(
            store.list_names(),
            vec![
                NameSummary { name: "Alice".into(), wanted: false },
                NameSummary { name: "Bob".into(), wanted: true },
            ]
        );
    }

    #[test]
    fn test_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = json_store(&dir);
        store.add_entry("Alice", emb(&[0.1, 0.2, 0.30000000000000004]), false).unwrap();
        store.add_entry("Bob", emb(&[-1e-300, 7.25, 1.0 / 3.0]), true).unwrap();
        store.add_entry("Alice", emb(&[0.5, 0.5, 0.5]), false).unwrap();

        let reopened = json_store(&dir);
        assert_eq!(*reopened.snapshot(), *store.snapshot());

        assert_eq!(store.load(), 3);
        assert_eq!(*reopened.snapshot(), *store.snapshot());
    }

    #[test]
    fn test_set_wanted_updates_every_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let store = json_store(&dir);
        store.add_entry("Alice", emb(&[1.0, 0.0]), false).unwrap();
        store.add_entry("Bob", emb(&[0.0, 1.0]), false).unwrap();
        store.add_entry("Alice", emb(&[0.9, 0.1]), false).unwrap();

        assert!(store.set_wanted("Alice", true).unwrap());
        let snapshot = store.snapshot();
        assert!(snapshot.iter().filter(|e| e.name == "Alice").all(|e| e.wanted));
        assert!(!snapshot.iter().find(|e| e.name == "Bob").unwrap().wanted);

        let reopened = json_store(&dir);
        assert_eq!(*reopened.snapshot(), *snapshot);
    }

    #[test]
    fn test_set_wanted_unknown_name_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = json_store(&dir);
        assert!(!store.set_wanted("Nobody", true).unwrap());
        // Nothing was written.
        assert!(!dir.path().join("gallery.json").exists());

        store.add_entry("Alice", emb(&[1.0]), false).unwrap();
        assert!(!store.set_wanted("alice", true).unwrap());
        assert!(!store.snapshot()[0].wanted);
    }

    #[test]
    fn test_list_names_ors_wanted_in_first_seen_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = json_store(&dir);
        store.add_entry("Carol", emb(&[1.0]), false).unwrap();
        store.add_entry("Alice", emb(&[1.0]), false).unwrap();
        store.add_entry("Carol", emb(&[2.0]), true).unwrap();
        store.add_entry("Bob", emb(&[3.0]), false).unwrap();

        let names = store.list_names();
        assert_eq!(
            names,
            vec![
                NameSummary { name: "Carol".into(), wanted: true },
                NameSummary { name: "Alice".into(), wanted: false },
                NameSummary { name: "Bob".into(), wanted: false },
            ]
        );
    }

    #[test]
    fn test_clear_persists_empty_gallery() {
        let dir = tempfile::tempdir().unwrap();
        let store = json_store(&dir);
        store.add_entry("Alice", emb(&[1.0]), true).unwrap();
        store.clear().unwrap();
        assert!(store.is_empty());
        assert!(store.list_names().is_empty());
        assert!(json_store(&dir).is_empty());
    }

    #[test]
    fn test_corrupt_storage_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("gallery.json"), b"{ not json").unwrap();
        let store = json_store(&dir);
        assert!(store.is_empty());

        // The store stays usable and overwrites the corrupt file.
        assert!(store.add_entry("Alice", emb(&[1.0]), false).unwrap());
        assert_eq!(json_store(&dir).len(), 1);
    }

    #[test]
    fn test_failed_write_leaves_gallery_unchanged() {
        let backend = Arc::new(FlakyBackend::default());
        let store = GalleryStore::open(Box::new(Arc::clone(&backend)));
        store.add_entry("Alice", emb(&[1.0, 0.0]), false).unwrap();

        backend.fail_writes.store(true, Ordering::SeqCst);
        assert!(matches!(
            store.add_entry("Bob", emb(&[0.0, 1.0]), false),
            Err(GalleryError::Io(_))
        ));
        assert!(store.set_wanted("Alice", true).is_err());
        assert!(store.clear().is_err());

        assert_eq!(store.len(), 1);
        assert!(!store.snapshot()[0].wanted);

        backend.fail_writes.store(false, Ordering::SeqCst);
        store.load();
        assert_eq!(store.list_names(), vec![NameSummary { name: "Alice".into(), wanted: false }]);
    }

    #[test]
    fn test_concurrent_enrollment_keeps_every_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(json_store(&dir));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..5 {
                        let name = format!("person-{t}");
                        store.add_entry(&name, emb(&[t as f64, i as f64, 1.0]), i % 2 == 0).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.len(), 40);
        let reopened = json_store(&dir);
        assert_eq!(*reopened.snapshot(), *store.snapshot());
        assert_eq!(reopened.list_names().len(), 8);
    }
}
