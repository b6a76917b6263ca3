//! Durable storage for unsent records.
//!
//! On shutdown each pool's busy records are written as one JSON blob per
//! record kind; on startup the blob is loaded back into the pool and removed.
//! A blob that no longer decodes is discarded with a warning.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::PersistenceError;
use crate::model::RecordKind;
use crate::pool::{PoolRecord, RecordPool};

/// Byte-blob storage keyed by record kind.
pub trait DurablePersistence: Send + Sync {
    fn save(&self, kind: RecordKind, blob: &[u8]) -> Result<(), PersistenceError>;

    /// Load and remove the blob for `kind`.
    fn load(&self, kind: RecordKind) -> Result<Option<Vec<u8>>, PersistenceError>;
}

/// One JSON file per record kind inside a cache directory.
#[derive(Debug, Clone)]
pub struct FilePersistence {
    dir: PathBuf,
}

impl FilePersistence {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, kind: RecordKind) -> PathBuf {
        self.dir.join(format!("{}.json", kind))
    }
}

impl DurablePersistence for FilePersistence {
    fn save(&self, kind: RecordKind, blob: &[u8]) -> Result<(), PersistenceError> {
        fs::create_dir_all(&self.dir)?;
        let target = self.path_for(kind);
        let tmp = target.with_extension("json.tmp");
        fs::write(&tmp, blob)?;
        fs::rename(&tmp, &target)?;
        Ok(())
    }

    fn load(&self, kind: RecordKind) -> Result<Option<Vec<u8>>, PersistenceError> {
        let path = self.path_for(kind);
        let blob = match fs::read(&path) {
            Ok(blob) => blob,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        fs::remove_file(&path)?;
        Ok(Some(blob))
    }
}

/// Process-local persistence, handy for tests and hosts without a disk.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    blobs: Mutex<HashMap<RecordKind, Vec<u8>>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, kind: RecordKind) -> bool {
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&kind)
    }
}

impl DurablePersistence for MemoryPersistence {
    fn save(&self, kind: RecordKind, blob: &[u8]) -> Result<(), PersistenceError> {
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, blob.to_vec());
        Ok(())
    }

    fn load(&self, kind: RecordKind) -> Result<Option<Vec<u8>>, PersistenceError> {
        Ok(self
            .blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&kind))
    }
}

/// Write the busy records of `pool`, oldest first. Empty pools are skipped.
///
/// Returns the number of records written.
pub fn save_pool<T>(
    persistence: &dyn DurablePersistence,
    pool: &RecordPool<T>,
) -> Result<usize, PersistenceError>
where
    T: PoolRecord + Serialize + Clone,
{
    if pool.is_empty() {
        return Ok(0);
    }

    let records: Vec<T> = pool.snapshot_view().cloned().collect();
    let blob = serde_json::to_vec(&records).map_err(|e| PersistenceError::Corrupt {
        what: format!("{} cache", pool.kind()),
        reason: e.to_string(),
    })?;
    persistence.save(pool.kind(), &blob)?;

    info!(kind = %pool.kind(), records = records.len(), "Saved unsent records");
    Ok(records.len())
}

/// Append previously saved records to `pool`.
///
/// Returns how many records were restored; a corrupt blob counts as zero.
pub fn restore_pool<T>(
    persistence: &dyn DurablePersistence,
    pool: &mut RecordPool<T>,
) -> Result<usize, PersistenceError>
where
    T: PoolRecord + DeserializeOwned,
{
    let kind = pool.kind();
    let Some(blob) = persistence.load(kind)? else {
        return Ok(0);
    };

    let records: Vec<T> = match serde_json::from_slice(&blob) {
        Ok(records) => records,
        Err(e) => {
            warn!(kind = %kind, error = %e, "Discarding unreadable record cache");
            return Ok(0);
        }
    };

    let count = records.len();
    pool.extend_from(records);
    info!(kind = %kind, records = count, "Restored unsent records");
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Event, Property, Timestamped, ValueRef};
    use chrono::Utc;

    fn events(names: &[&str]) -> RecordPool<Event> {
        let mut pool = RecordPool::<Event>::with_capacity(RecordKind::Event, 4, 64);
        for name in names {
            let event = pool.allocate();
            event.set_name(name);
            event.set_timestamp(Utc::now());
            event.push_param("n", ValueRef::Int(name.len() as i64));
        }
        pool
    }

    #[test]
    fn test_memory_load_is_destructive() {
        let persistence = MemoryPersistence::new();
        persistence.save(RecordKind::Session, b"[]").unwrap();
        assert!(persistence.contains(RecordKind::Session));

        assert_eq!(
            persistence.load(RecordKind::Session).unwrap().as_deref(),
            Some(&b"[]"[..])
        );
        assert!(persistence.load(RecordKind::Session).unwrap().is_none());
    }

    #[test]
    fn test_file_persistence_round_trip_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = FilePersistence::new(dir.path().join("nested"));

        persistence.save(RecordKind::Property, b"[1,2]").unwrap();
        assert!(persistence.path_for(RecordKind::Property).exists());
        assert!(persistence
            .path_for(RecordKind::Property)
            .ends_with("properties.json"));

        let blob = persistence.load(RecordKind::Property).unwrap();
        assert_eq!(blob.as_deref(), Some(&b"[1,2]"[..]));
        assert!(!persistence.path_for(RecordKind::Property).exists());
        assert!(persistence.load(RecordKind::Property).unwrap().is_none());
    }

    #[test]
    fn test_pool_survives_save_and_restore_in_order() {
        let persistence = MemoryPersistence::new();
        let mut pool = events(&["a", "bb", "ccc"]);
        pool.compact(1);

        assert_eq!(save_pool(&persistence, &pool).unwrap(), 2);

        let mut restored = RecordPool::<Event>::with_capacity(RecordKind::Event, 4, 64);
        assert_eq!(restore_pool(&persistence, &mut restored).unwrap(), 2);

        let names: Vec<&str> = restored.snapshot_view().map(Event::name).collect();
        assert_eq!(names, ["bb", "ccc"]);
        assert_eq!(restored.get(1).unwrap().parameters().len(), 1);
        assert!(!persistence.contains(RecordKind::Event));
    }

    #[test]
    fn test_validated_flag_is_persisted() {
        let persistence = MemoryPersistence::new();
        let mut pool = RecordPool::<Property>::with_capacity(RecordKind::Property, 2, 8);
        let property = pool.allocate();
        property.set("users", "level", ValueRef::Int(3), Utc::now());
        property.mark_validated();

        save_pool(&persistence, &pool).unwrap();
        let mut restored = RecordPool::<Property>::with_capacity(RecordKind::Property, 2, 8);
        restore_pool(&persistence, &mut restored).unwrap();

        let property = restored.get(0).unwrap();
        assert!(property.is_validated());
        assert!(property.matches("users", "level"));
    }

    #[test]
    fn test_empty_pool_writes_nothing() {
        let persistence = MemoryPersistence::new();
        let pool = events(&[]);
        assert_eq!(save_pool(&persistence, &pool).unwrap(), 0);
        assert!(!persistence.contains(RecordKind::Event));
    }

    #[test]
    fn test_corrupt_blob_is_discarded() {
        let persistence = MemoryPersistence::new();
        persistence.save(RecordKind::Event, b"{truncated").unwrap();

        let mut pool = events(&["kept"]);
        assert_eq!(restore_pool(&persistence, &mut pool).unwrap(), 0);
        assert_eq!(pool.busy_count(), 1);
        assert!(!persistence.contains(RecordKind::Event));
    }
}
