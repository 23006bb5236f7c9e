use super::{GalleryEntry, GalleryError, SqliteBackend};
use crate::types::Embedding;
use serde::{Deserialize, Deserializer, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Durable storage for the serialized gallery record.
///
/// `save` must replace the previous record atomically: a concurrent `load`
/// sees either the old record or the new one, never a partial write.
pub trait GalleryBackend: Send + Sync {
    /// Returns `Ok(None)` when nothing has been persisted yet.
    fn load(&self) -> Result<Option<GalleryRecord>, GalleryError>;
    fn save(&self, record: &GalleryRecord) -> Result<(), GalleryError>;
}

/// Persisted form of the gallery: three parallel sequences of equal length.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GalleryRecord {
    pub names: Vec<String>,
    #[serde(deserialize_with = "embeddings_with_nulls")]
    pub embeddings: Vec<Vec<f64>>,
    #[serde(default)]
    pub wanted: Vec<bool>,
}

impl GalleryRecord {
    pub fn from_entries(entries: &[GalleryEntry]) -> Self {
        Self {
            names: entries.iter().map(|e| e.name.clone()).collect(),
            embeddings: entries.iter().map(|e| e.embedding.values.clone()).collect(),
            wanted: entries.iter().map(|e| e.wanted).collect(),
        }
    }

    /// Rebuild entries. `names` and `embeddings` must align; a short `wanted`
    /// list (records written before the flag existed) defaults to `false`.
    /// Entries with an empty or non-finite embedding are dropped one by one.
    pub fn into_entries(self) -> Result<Vec<GalleryEntry>, GalleryError> {
        if self.names.len() != self.embeddings.len() {
            return Err(GalleryError::Corrupt(format!(
                "{} names but {} embeddings",
                self.names.len(),
                self.embeddings.len()
            )));
        }
        if self.wanted.len() > self.names.len() {
            return Err(GalleryError::Corrupt(format!(
                "{} wanted flags for {} names",
                self.wanted.len(),
                self.names.len()
            )));
        }

        let mut wanted = self.wanted.into_iter();
        let mut entries = Vec::with_capacity(self.names.len());
        for (name, values) in self.names.into_iter().zip(self.embeddings) {
            let wanted = wanted.next().unwrap_or(false);
            if values.is_empty() {
                tracing::warn!(name = %name, "dropping persisted entry with an empty embedding");
                continue;
            }
            let embedding = Embedding::new(values);
            if !embedding.is_finite() {
                tracing::warn!(name = %name, "dropping persisted entry with a non-finite embedding");
                continue;
            }
            entries.push(GalleryEntry {
                name,
                embedding,
                wanted,
            });
        }
        Ok(entries)
    }
}

/// JSON has no NaN or infinity; serde_json writes them as `null`. Read those
/// back as NaN so `into_entries` can drop the entry instead of the whole record.
fn embeddings_with_nulls<'de, D>(deserializer: D) -> Result<Vec<Vec<f64>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Vec::<Vec<Option<f64>>>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|values| values.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect())
        .collect())
}

/// Open the backend matching the file extension: `.db`, `.sqlite` and
/// `.sqlite3` select SQLite, anything else a JSON file.
pub fn open_backend(path: &Path) -> Result<Box<dyn GalleryBackend>, GalleryError> {
    let is_sqlite = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("db" | "sqlite" | "sqlite3")
    );
    if is_sqlite {
        Ok(Box::new(SqliteBackend::open(path)?))
    } else {
        Ok(Box::new(JsonFileBackend::new(path)))
    }
}

/// JSON file backend. Writes go to a sibling temp file that is then renamed
/// over the target.
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        PathBuf::from(tmp)
    }
}

impl GalleryBackend for JsonFileBackend {
    fn load(&self) -> Result<Option<GalleryRecord>, GalleryError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    fn save(&self, record: &GalleryRecord) -> Result<(), GalleryError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let tmp = self.temp_path();
        let mut writer = BufWriter::new(File::create(&tmp)?);
        serde_json::to_writer(&mut writer, record)?;
        writer.flush()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
