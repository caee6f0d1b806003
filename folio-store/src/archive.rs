//! Durable object storage for archived revision content.
//!
//! The archival pass copies superseded revision content here and records the
//! returned pointer on the revision row. Pointers are opaque to callers; the
//! filesystem backend uses `fs:<doc_id>/<number>-<revision_id>.lz4`.

use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use uuid::Uuid;

use crate::error::ArchiveError;
use crate::model::Revision;

const FS_SCHEME: &str = "fs:";

/// Durable blob storage addressed by opaque pointers.
pub trait ArchiveStore: Send + Sync {
    /// Store `bytes` under `key` and return a pointer that reads them back.
    fn put(&self, key: &str, bytes: &[u8]) -> Result<String, ArchiveError>;

    fn get(&self, pointer: &str) -> Result<Vec<u8>, ArchiveError>;
}

/// Object key for a revision's content.
pub fn archive_key(rev: &Revision) -> String {
    revision_object_key(rev.doc_id, rev.number, rev.id)
}

pub fn revision_object_key(doc_id: Uuid, number: u64, revision_id: Uuid) -> String {
    format!("{doc_id}/{number}-{revision_id}.lz4")
}

/// Archive backed by a local directory. Objects are LZ4-compressed.
#[derive(Debug, Clone)]
pub struct FsArchive {
    root: PathBuf,
}

impl FsArchive {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, ArchiveError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, ArchiveError> {
        let relative = Path::new(key);
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if key.is_empty() || !safe {
            return Err(ArchiveError::InvalidPointer(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

impl ArchiveStore for FsArchive {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<String, ArchiveError> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write-then-rename so a reader never sees a partial object
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&lz4_flex::compress_prepend_size(bytes))?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        log::debug!("Archived {} bytes to {}", bytes.len(), path.display());
        Ok(format!("{FS_SCHEME}{key}"))
    }

    fn get(&self, pointer: &str) -> Result<Vec<u8>, ArchiveError> {
        let key = pointer
            .strip_prefix(FS_SCHEME)
            .ok_or_else(|| ArchiveError::InvalidPointer(pointer.to_string()))?;
        let raw = fs::read(self.object_path(key)?)?;
        lz4_flex::decompress_size_prepended(&raw).map_err(|e| ArchiveError::Corrupt(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_put_get() {
        let dir = TempDir::new().unwrap();
        let archive = FsArchive::open(dir.path()).unwrap();
        let key = revision_object_key(Uuid::new_v4(), 3, Uuid::new_v4());

        let pointer = archive.put(&key, b"archived text").unwrap();
        assert!(pointer.starts_with("fs:"));
        assert_eq!(archive.get(&pointer).unwrap(), b"archived text");
    }

    #[test]
    fn test_rejects_escaping_keys() {
        let dir = TempDir::new().unwrap();
        let archive = FsArchive::open(dir.path()).unwrap();

        assert!(matches!(
            archive.put("../outside", b"x"),
            Err(ArchiveError::InvalidPointer(_))
        ));
        assert!(matches!(
            archive.get("s3:bucket/key"),
            Err(ArchiveError::InvalidPointer(_))
        ));
    }

    #[test]
    fn test_corrupt_object() {
        let dir = TempDir::new().unwrap();
        let archive = FsArchive::open(dir.path()).unwrap();
        fs::write(dir.path().join("broken"), [10, 0, 0, 0, 0xff]).unwrap();
        assert!(matches!(
            archive.get("fs:broken"),
            Err(ArchiveError::Corrupt(_))
        ));
    }

    #[test]
    fn test_missing_object_is_io() {
        let dir = TempDir::new().unwrap();
        let archive = FsArchive::open(dir.path()).unwrap();
        assert!(matches!(archive.get("fs:nope"), Err(ArchiveError::Io(_))));
    }
}
