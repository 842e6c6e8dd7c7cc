use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use serde::Deserialize;
use sluice_common::internal;
use tokio::fs;

use crate::{
    Entry, EntryId, SerializationError, StoreError, ValidationError, r#trait::BackingStore,
};

/// File-based backing store implementation
///
/// Each entry is stored as a single bincode record named `{id}.bin` inside
/// the store directory. The record holds the whole entry (metadata and
/// payload), so it can be rebuilt exactly after a restart.
///
/// # Security
/// - Uses atomic writes (write to temp file, then rename) to prevent corruption
/// - Only reads files whose names parse as an [`EntryId`]
/// - Validates the directory path at construction and deserialization time
///
/// # Atomicity
/// A put writes `.tmp_{id}.bin` and renames it into place, so a crash never
/// leaves a half-written record under a valid name. A delete first renames
/// the record to `{id}.bin.deleted` and then removes it; leftovers of either
/// kind are cleaned up by [`FileBackingStore::init`].
#[derive(Debug, Clone)]
pub struct FileBackingStore {
    path: PathBuf,
}

impl Default for FileBackingStore {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/sluice/store"),
        }
    }
}

// Custom Deserialize implementation with path validation
impl<'de> Deserialize<'de> for FileBackingStore {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct FileBackingStoreHelper {
            path: PathBuf,
        }

        let helper = FileBackingStoreHelper::deserialize(deserializer)?;
        Self::validate_path(&helper.path).map_err(serde::de::Error::custom)?;

        Ok(Self { path: helper.path })
    }
}

impl FileBackingStore {
    /// Validate a store path
    ///
    /// # Security Checks
    /// - Rejects paths containing `..` (directory traversal)
    /// - Rejects paths to sensitive system directories
    /// - Ensures the path is absolute
    ///
    /// # Errors
    /// Returns an error if the path is invalid or potentially dangerous
    fn validate_path(path: &Path) -> Result<(), ValidationError> {
        if path
            .components()
            .any(|component| component == std::path::Component::ParentDir)
        {
            return Err(ValidationError::ParentComponent(path.display().to_string()));
        }

        if !path.is_absolute() {
            return Err(ValidationError::NotAbsolute(path.display().to_string()));
        }

        let sensitive_prefixes = [
            "/etc",
            "/bin",
            "/sbin",
            "/usr/bin",
            "/usr/sbin",
            "/boot",
            "/sys",
            "/proc",
            "/dev",
        ];

        if let Some(prefix) = sensitive_prefixes
            .iter()
            .find(|prefix| path.starts_with(prefix))
        {
            return Err(ValidationError::SystemDirectory {
                prefix: (*prefix).to_string(),
                path: path.display().to_string(),
            });
        }

        Ok(())
    }

    /// Create a new `FileBackingStore` builder
    #[must_use]
    pub fn builder() -> FileBackingStoreBuilder {
        FileBackingStoreBuilder::default()
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Initialize the store directory
    ///
    /// Creates the directory if it doesn't exist and validates that the
    /// path is actually a directory. Also removes temporary and `.deleted`
    /// files left behind by a crash.
    ///
    /// # Errors
    /// - If the directory cannot be created or scanned
    /// - If the path exists but is not a directory
    pub fn init(&self) -> crate::Result<()> {
        internal!("Initialising file store at {} ...", self.path.display());

        if !self.path.try_exists()? {
            internal!("{:#?} does not exist, creating...", self.path);
            std::fs::create_dir_all(&self.path)?;
        } else if !self.path.is_dir() {
            return Err(ValidationError::NotDirectory(self.path.display().to_string()).into());
        }

        self.cleanup_orphans()
    }

    fn cleanup_orphans(&self) -> crate::Result<()> {
        let mut cleaned = 0;

        for entry in std::fs::read_dir(&self.path)? {
            let entry = entry?;
            let filename = entry.file_name();
            let filename = filename.to_string_lossy();

            if filename.ends_with(".deleted") || filename.starts_with(".tmp_") {
                std::fs::remove_file(entry.path())?;
                cleaned += 1;
            }
        }

        if cleaned > 0 {
            internal!(
                level = INFO,
                "Cleaned up {cleaned} orphaned files from {}",
                self.path.display()
            );
        }

        Ok(())
    }

    fn record_path(&self, id: EntryId) -> PathBuf {
        self.path.join(format!("{id}.bin"))
    }
}

#[async_trait]
impl BackingStore for FileBackingStore {
    #[tracing::instrument(level = "debug", skip(self, entry), fields(id = %entry.id()))]
    async fn put(&self, entry: &Entry) -> crate::Result<()> {
        let path = self.record_path(entry.id());
        let temp_path = self.path.join(format!(".tmp_{}.bin", entry.id()));

        let record = bincode::serde::encode_to_vec(entry, bincode::config::standard())
            .map_err(SerializationError::from)?;

        fs::write(&temp_path, &record).await?;
        fs::rename(&temp_path, &path).await?;

        internal!(level = DEBUG, "Stored entry {} at {}", entry.id(), path.display());

        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get(&self, id: EntryId) -> crate::Result<Entry> {
        let record = match fs::read(self.record_path(id)).await {
            Ok(record) => record,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(StoreError::NotFound(id)),
            Err(e) => return Err(e.into()),
        };

        let (entry, _): (Entry, usize) =
            bincode::serde::decode_from_slice(&record, bincode::config::standard())
                .map_err(SerializationError::from)?;

        if entry.id() != id {
            return Err(SerializationError::Corrupted(format!(
                "record {id} holds entry {}",
                entry.id()
            ))
            .into());
        }

        Ok(entry)
    }

    /// Two-phase delete: rename to `.deleted`, then remove. A crash between
    /// the phases leaves a file that [`FileBackingStore::init`] cleans up.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn delete(&self, id: EntryId) -> crate::Result<()> {
        let path = self.record_path(id);
        let deleted_path = self.path.join(format!("{id}.bin.deleted"));

        match fs::rename(&path, &deleted_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        fs::remove_file(&deleted_path).await?;

        internal!(level = DEBUG, "Deleted entry {id} from {}", self.path.display());

        Ok(())
    }

    async fn exists(&self, id: EntryId) -> crate::Result<bool> {
        Ok(fs::try_exists(self.record_path(id)).await?)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list(&self) -> crate::Result<Vec<EntryId>> {
        let mut entries = fs::read_dir(&self.path).await?;
        let mut ids = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let filename = entry.file_name();
            if let Some(id) = EntryId::from_filename(&filename.to_string_lossy()) {
                ids.push(id);
            }
        }

        ids.sort_unstable();

        internal!(level = DEBUG, "Found {} records in {}", ids.len(), self.path.display());

        Ok(ids)
    }
}

/// Builder for `FileBackingStore`
#[derive(Debug, Default)]
pub struct FileBackingStoreBuilder {
    path: PathBuf,
}

impl FileBackingStoreBuilder {
    /// Set the store directory path
    #[must_use]
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    /// Build the final `FileBackingStore`
    ///
    /// # Errors
    /// Returns an error if the path is invalid or potentially dangerous
    pub fn build(self) -> crate::Result<FileBackingStore> {
        FileBackingStore::validate_path(&self.path)?;
        Ok(FileBackingStore { path: self.path })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Priority, StorageId};

    fn open(dir: &tempfile::TempDir) -> FileBackingStore {
        let store = FileBackingStore::builder()
            .path(dir.path())
            .build()
            .expect("valid path");
        store.init().expect("init");
        store
    }

    fn entry(persistent: bool, data: &[u8]) -> Entry {
        Entry::new(
            StorageId::new("orders").expect("valid"),
            Priority::new(7).expect("valid"),
            persistent,
            data,
        )
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open(&dir);
        let entry = entry(true, b"hello world");

        store.put(&entry).await.expect("put");
        assert!(store.exists(entry.id()).await.expect("exists"));
        assert_eq!(store.count().await.expect("count"), 1);

        let read = store.get(entry.id()).await.expect("get");
        assert_eq!(read.payload(), b"hello world");
        assert_eq!(read.size_in_bytes(), entry.size_in_bytes());
        assert_eq!(read.priority(), entry.priority());
        assert!(read.is_persistent());

        store.delete(entry.id()).await.expect("delete");
        assert!(!store.exists(entry.id()).await.expect("exists"));
        assert!(
            store
                .get(entry.id())
                .await
                .expect_err("deleted")
                .is_not_found()
        );

        // Deleting again is a no-op
        store.delete(entry.id()).await.expect("idempotent delete");
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let entry = entry(true, b"durable");

        open(&dir).put(&entry).await.expect("put");

        let reopened = open(&dir);
        assert_eq!(reopened.list().await.expect("list"), vec![entry.id()]);
        assert_eq!(
            reopened.get(entry.id()).await.expect("get").payload(),
            b"durable"
        );
    }

    #[tokio::test]
    async fn test_init_removes_orphans_and_list_ignores_strays() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("12.bin.deleted"), b"x").expect("write");
        std::fs::write(dir.path().join(".tmp_13.bin"), b"x").expect("write");
        std::fs::write(dir.path().join("notes.txt"), b"x").expect("write");

        let store = open(&dir);

        assert!(!dir.path().join("12.bin.deleted").exists());
        assert!(!dir.path().join(".tmp_13.bin").exists());
        assert!(store.list().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn test_corrupted_record_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = open(&dir);
        std::fs::write(dir.path().join("42.bin"), b"\xff\xff\xff").expect("write");

        let err = store
            .get(EntryId::new(42))
            .await
            .expect_err("garbage record");
        assert!(matches!(err, StoreError::Serialization(_)));
    }

    #[test]
    fn test_init_rejects_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("plain");
        std::fs::write(&file, b"x").expect("write");

        let store = FileBackingStore::builder()
            .path(file)
            .build()
            .expect("valid path");
        assert!(matches!(
            store.init(),
            Err(StoreError::Validation(ValidationError::NotDirectory(_)))
        ));
    }
}
