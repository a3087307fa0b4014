//! Snapshot persistence.
//!
//! Chunk sets and templates are stored as opaque JSON documents. `FileStore`
//! lays them out under one directory:
//!
//! ```text
//! <dir>/snapshots/<id>.json
//! <dir>/chunks/<id>.json
//! <dir>/templates/<target>.json
//! <dir>/.lock
//! ```
//!
//! Writes are staged in a `.tmp` file and renamed into place while holding
//! an exclusive `fd-lock` on `.lock`.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use moka::sync::Cache;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::core::model::{AnchorTemplate, ChunkSet, Snapshot};

#[derive(Debug, thiserror::Error)]
pub enum StoreError
{
    #[error("invalid document id `{0}`")]
    InvalidId(String),

    #[error("store path is not UTF-8: {0}")]
    NonUtf8Path(String),

    #[error("I/O error at {path}: {source}")]
    Io
    {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt document at {path}: {source}")]
    Corrupt
    {
        path: Utf8PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("write rejected: {0}")]
    WriteRejected(String),
}

/// Read/write access to snapshots, their chunk sets and per-target templates
pub trait SnapshotStore: Send + Sync
{
    fn load_snapshot(
        &self,
        id: &str,
    ) -> Result<Option<Snapshot>, StoreError>;

    fn save_snapshot(
        &self,
        snapshot: &Snapshot,
    ) -> Result<(), StoreError>;

    fn load_chunks(
        &self,
        snapshot_id: &str,
    ) -> Result<Option<ChunkSet>, StoreError>;

    fn save_chunks(
        &self,
        snapshot_id: &str,
        set: &ChunkSet,
    ) -> Result<(), StoreError>;

    fn load_template(
        &self,
        target_id: &str,
    ) -> Result<Option<AnchorTemplate>, StoreError>;

    fn save_template(
        &self,
        target_id: &str,
        template: &AnchorTemplate,
    ) -> Result<(), StoreError>;
}

/// Ids become file names: `[A-Za-z0-9._-]`, not starting with '.'
pub fn validate_id(id: &str) -> Result<(), StoreError>
{
    let ok = !id.is_empty()
        && !id.starts_with('.')
        && id.len() <= 200
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));

    if ok { Ok(()) } else { Err(StoreError::InvalidId(id.to_string())) }
}

/// In-process store backed by moka caches
pub struct MemoryStore
{
    snapshots: Cache<String, Snapshot>,
    chunks: Cache<String, ChunkSet>,
    templates: Cache<String, AnchorTemplate>,
    reject_writes: bool,
    chunk_writes: AtomicUsize,
}

impl Default for MemoryStore
{
    fn default() -> Self
    {
        Self::new()
    }
}

impl MemoryStore
{
    pub fn new() -> Self
    {
        Self {
            snapshots: Cache::new(10_000),
            chunks: Cache::new(10_000),
            templates: Cache::new(1_000),
            reject_writes: false,
            chunk_writes: AtomicUsize::new(0),
        }
    }

    /// Store whose writes always fail; reads still work
    pub fn failing_writes() -> Self
    {
        Self { reject_writes: true, ..Self::new() }
    }

    /// Successful chunk set writes so far
    pub fn chunk_writes(&self) -> usize
    {
        self.chunk_writes
            .load(Ordering::Relaxed)
    }

    fn check_write(
        &self,
        what: &str,
    ) -> Result<(), StoreError>
    {
        if self.reject_writes
        {
            return Err(StoreError::WriteRejected(format!("memory store is read-only ({what})")));
        }
        Ok(())
    }
}

impl SnapshotStore for MemoryStore
{
    fn load_snapshot(
        &self,
        id: &str,
    ) -> Result<Option<Snapshot>, StoreError>
    {
        Ok(self
            .snapshots
            .get(id))
    }

    fn save_snapshot(
        &self,
        snapshot: &Snapshot,
    ) -> Result<(), StoreError>
    {
        self.check_write("snapshot")?;
        self.snapshots
            .insert(snapshot.id.clone(), snapshot.clone());
        Ok(())
    }

    fn load_chunks(
        &self,
        snapshot_id: &str,
    ) -> Result<Option<ChunkSet>, StoreError>
    {
        Ok(self
            .chunks
            .get(snapshot_id))
    }

    fn save_chunks(
        &self,
        snapshot_id: &str,
        set: &ChunkSet,
    ) -> Result<(), StoreError>
    {
        self.check_write("chunks")?;
        self.chunks
            .insert(snapshot_id.to_string(), set.clone());
        self.chunk_writes
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn load_template(
        &self,
        target_id: &str,
    ) -> Result<Option<AnchorTemplate>, StoreError>
    {
        Ok(self
            .templates
            .get(target_id))
    }

    fn save_template(
        &self,
        target_id: &str,
        template: &AnchorTemplate,
    ) -> Result<(), StoreError>
    {
        self.check_write("template")?;
        self.templates
            .insert(target_id.to_string(), template.clone());
        Ok(())
    }
}

/// JSON documents on disk
#[derive(Debug, Clone)]
pub struct FileStore
{
    root: Utf8PathBuf,
}

impl FileStore
{
    /// Open (and create) a store rooted at `dir`
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError>
    {
        let root = Utf8PathBuf::from_path_buf(dir.into())
            .map_err(|p| StoreError::NonUtf8Path(p.display().to_string()))?;

        for sub in ["snapshots", "chunks", "templates"]
        {
            let path = root.join(sub);
            fs::create_dir_all(&path).map_err(|source| StoreError::Io { path, source })?;
        }

        Ok(Self { root })
    }

    pub fn root(&self) -> &Utf8Path
    {
        &self.root
    }

    fn doc_path(
        &self,
        kind: &str,
        id: &str,
    ) -> Result<Utf8PathBuf, StoreError>
    {
        validate_id(id)?;
        Ok(self
            .root
            .join(kind)
            .join(format!("{id}.json")))
    }

    fn read_doc<T: DeserializeOwned>(
        &self,
        kind: &str,
        id: &str,
    ) -> Result<Option<T>, StoreError>
    {
        let path = self.doc_path(kind, id)?;

        let raw = match fs::read_to_string(&path)
        {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| StoreError::Corrupt { path, source })
    }

    fn write_doc<T: Serialize>(
        &self,
        kind: &str,
        id: &str,
        doc: &T,
    ) -> Result<(), StoreError>
    {
        let path = self.doc_path(kind, id)?;
        let body = serde_json::to_string_pretty(doc).map_err(|source| StoreError::Corrupt {
            path: path.clone(),
            source,
        })?;

        // Serialise writers across processes
        let lock_path = self
            .root
            .join(".lock");
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|source| StoreError::Io { path: lock_path.clone(), source })?;
        let mut lock = fd_lock::RwLock::new(lock_file);
        let _guard = lock
            .write()
            .map_err(|source| StoreError::Io { path: lock_path.clone(), source })?;

        // Stage then rename into place
        let tmp = path.with_extension("json.tmp");
        let io_err = |source| StoreError::Io { path: tmp.clone(), source };

        let mut f = File::create(&tmp).map_err(io_err)?;
        f.write_all(body.as_bytes())
            .map_err(io_err)?;
        f.sync_all()
            .map_err(io_err)?;
        drop(f);

        fs::rename(&tmp, &path).map_err(|source| StoreError::Io { path: path.clone(), source })?;

        debug!(path = %path, bytes = body.len(), "store_write");
        Ok(())
    }
}

impl SnapshotStore for FileStore
{
    fn load_snapshot(
        &self,
        id: &str,
    ) -> Result<Option<Snapshot>, StoreError>
    {
        self.read_doc("snapshots", id)
    }

    fn save_snapshot(
        &self,
        snapshot: &Snapshot,
    ) -> Result<(), StoreError>
    {
        self.write_doc("snapshots", &snapshot.id, snapshot)
    }

    fn load_chunks(
        &self,
        snapshot_id: &str,
    ) -> Result<Option<ChunkSet>, StoreError>
    {
        self.read_doc("chunks", snapshot_id)
    }

    fn save_chunks(
        &self,
        snapshot_id: &str,
        set: &ChunkSet,
    ) -> Result<(), StoreError>
    {
        self.write_doc("chunks", snapshot_id, set)
    }

    fn load_template(
        &self,
        target_id: &str,
    ) -> Result<Option<AnchorTemplate>, StoreError>
    {
        self.read_doc("templates", target_id)
    }

    fn save_template(
        &self,
        target_id: &str,
        template: &AnchorTemplate,
    ) -> Result<(), StoreError>
    {
        self.write_doc("templates", target_id, template)
    }
}

#[cfg(test)]
mod tests
{
    use assert_fs::TempDir;

    use super::*;
    use crate::core::model::{Chunk, ChunkMethod, SourceKind, TemplateChunk};

    fn sample_set() -> ChunkSet
    {
        let chunk = Chunk::new(SourceKind::Extracted, 0, "Lines 1-2", "Price: 100 PLN");
        ChunkSet::new(ChunkMethod::Deterministic { window_lines: 2, overlap: 0 }, None, "abc", vec![chunk])
    }

    #[test]
    fn ids_are_restricted_to_safe_names()
    {
        assert!(validate_id("snap-001_a.b").is_ok());
        assert!(validate_id("../etc/passwd").is_err());
        assert!(validate_id(".hidden").is_err());
        assert!(validate_id("").is_err());
    }

    #[test]
    fn file_store_roundtrips_documents()
    {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::open(tmp.path()).unwrap();
        let set = sample_set();

        assert!(store.load_chunks("s1").unwrap().is_none());
        store.save_chunks("s1", &set).unwrap();
        assert_eq!(store.load_chunks("s1").unwrap(), Some(set));

        let tpl = AnchorTemplate {
            chunks: vec![TemplateChunk {
                key: "price".into(),
                title: "Price".into(),
                anchor_candidates: vec!["Price of the product".into()],
            }],
        };
        store.save_template("shop-1", &tpl).unwrap();
        assert_eq!(store.load_template("shop-1").unwrap(), Some(tpl));
        assert!(!store.root().join("chunks/s1.json.tmp").exists());
    }

    #[test]
    fn file_store_reports_corrupt_documents()
    {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::open(tmp.path()).unwrap();
        fs::write(store.root().join("chunks/bad.json"), "{not json").unwrap();

        assert!(matches!(store.load_chunks("bad"), Err(StoreError::Corrupt { .. })));
        assert!(matches!(store.load_chunks("../x"), Err(StoreError::InvalidId(_))));
    }

    #[test]
    fn memory_store_can_reject_writes()
    {
        let store = MemoryStore::failing_writes();

        assert!(matches!(store.save_chunks("s", &sample_set()), Err(StoreError::WriteRejected(_))));
        assert_eq!(store.chunk_writes(), 0);

        let ok = MemoryStore::new();
        ok.save_chunks("s", &sample_set()).unwrap();
        assert_eq!(ok.chunk_writes(), 1);
        assert!(ok.load_chunks("s").unwrap().is_some());
    }
}
