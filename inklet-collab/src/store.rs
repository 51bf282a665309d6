//! Keyed record store backing user and document metadata.
//!
//! The core treats this as an external CRUD collaborator: create with a
//! uniqueness constraint, read by id, read by a designated key. Records
//! live as JSON lines, one file per table, under the server's data
//! directory; document text lives beside them as one blob per
//! `{owner}-{filename}` key. Every call takes the table's lock, so access
//! is file-exclusive.

use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Store failures: filesystem errors and record corruption.
#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Corrupt(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "store I/O error: {e}"),
            Self::Corrupt(e) => write!(f, "corrupt store record: {e}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Corrupt(_) => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// A storable record with an id and a uniqueness key.
pub trait Record: Serialize + DeserializeOwned + Clone {
    fn id(&self) -> &str;
    /// The designated unique field(s); creation fails on a duplicate.
    fn key(&self) -> String;
}

/// A registered user. Usernames are unique; passwords are stored and
/// compared in clear form (hardening is out of scope here).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub username: String,
    pub password: String,
}

impl Record for UserRecord {
    fn id(&self) -> &str {
        &self.id
    }

    fn key(&self) -> String {
        self.username.clone()
    }
}

/// Document metadata: which user owns which filename.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocRecord {
    pub id: String,
    pub owner: String,
    pub filename: String,
}

impl DocRecord {
    /// Key of the text blob backing this document.
    pub fn blob_key(owner: &str, filename: &str) -> String {
        format!("{owner}-{filename}")
    }
}

impl Record for DocRecord {
    fn id(&self) -> &str {
        &self.id
    }

    fn key(&self) -> String {
        format!("{}/{}", self.owner, self.filename)
    }
}

/// One on-disk table of JSON-line records.
pub struct Table<R: Record> {
    path: PathBuf,
    lock: Mutex<()>,
    _marker: PhantomData<R>,
}

impl<R: Record> Table<R> {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
            _marker: PhantomData,
        }
    }

    fn load_all(&self) -> Result<Vec<R>, StoreError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(|e| StoreError::Corrupt(e.to_string())))
            .collect()
    }

    /// Insert a record, enforcing the uniqueness constraint.
    /// Returns the record id, or `None` when the key already exists.
    pub fn create(&self, record: R) -> Result<Option<String>, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let existing = self.load_all()?;
        if existing.iter().any(|r| r.key() == record.key()) {
            return Ok(None);
        }
        let line =
            serde_json::to_string(&record).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        Ok(Some(record.id().to_string()))
    }

    pub fn read(&self, id: &str) -> Result<Option<R>, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(self.load_all()?.into_iter().find(|r| r.id() == id))
    }

    pub fn read_by_key(&self, key: &str) -> Result<Option<R>, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(self.load_all()?.into_iter().find(|r| r.key() == key))
    }
}

/// Blob store for backing document text, one file per key.
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Create an empty blob. Returns `false` if one already exists.
    pub fn init(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.path_for(key);
        if path.exists() {
            return Ok(false);
        }
        fs::write(path, "")?;
        Ok(true)
    }

    pub fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn write(&self, key: &str, text: &str) -> Result<(), StoreError> {
        fs::write(self.path_for(key), text)?;
        Ok(())
    }
}

/// All persistent state of one server instance.
pub struct DataStore {
    pub users: Table<UserRecord>,
    pub docs: Table<DocRecord>,
    pub blobs: BlobStore,
}

impl DataStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref();
        fs::create_dir_all(root)?;
        Ok(Self {
            users: Table::open(root.join("users.jsonl")),
            docs: Table::open(root.join("docs.jsonl")),
            blobs: BlobStore::open(root.join("blobs"))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str, name: &str) -> UserRecord {
        UserRecord {
            id: id.into(),
            username: name.into(),
            password: "password".into(),
        }
    }

    #[test]
    fn create_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let table: Table<UserRecord> = Table::open(dir.path().join("users.jsonl"));

        let id = table.create(user("id-1", "alice")).unwrap();
        assert_eq!(id.as_deref(), Some("id-1"));

        let by_id = table.read("id-1").unwrap().unwrap();
        assert_eq!(by_id.username, "alice");
        let by_key = table.read_by_key("alice").unwrap().unwrap();
        assert_eq!(by_key.id, "id-1");
    }

    #[test]
    fn duplicate_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let table: Table<UserRecord> = Table::open(dir.path().join("users.jsonl"));

        assert!(table.create(user("id-1", "alice")).unwrap().is_some());
        assert!(table.create(user("id-2", "alice")).unwrap().is_none());
        // The original record survives.
        assert_eq!(table.read_by_key("alice").unwrap().unwrap().id, "id-1");
    }

    #[test]
    fn missing_reads_are_none() {
        let dir = tempfile::tempdir().unwrap();
        let table: Table<UserRecord> = Table::open(dir.path().join("users.jsonl"));
        assert!(table.read("nope").unwrap().is_none());
        assert!(table.read_by_key("nope").unwrap().is_none());
    }

    #[test]
    fn doc_uniqueness_is_per_owner() {
        let dir = tempfile::tempdir().unwrap();
        let table: Table<DocRecord> = Table::open(dir.path().join("docs.jsonl"));

        let doc = |id: &str, owner: &str| DocRecord {
            id: id.into(),
            owner: owner.into(),
            filename: "notes.txt".into(),
        };
        assert!(table.create(doc("d1", "user-a")).unwrap().is_some());
        assert!(table.create(doc("d2", "user-b")).unwrap().is_some());
        assert!(table.create(doc("d3", "user-a")).unwrap().is_none());
    }

    #[test]
    fn blob_init_fails_on_existing() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = BlobStore::open(dir.path().join("blobs")).unwrap();

        assert!(blobs.init("u-notes.txt").unwrap());
        assert!(!blobs.init("u-notes.txt").unwrap());
        assert_eq!(blobs.read("u-notes.txt").unwrap().as_deref(), Some(""));
    }

    #[test]
    fn blob_write_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = BlobStore::open(dir.path().join("blobs")).unwrap();

        blobs.write("k", "line one\nline two\n").unwrap();
        assert_eq!(
            blobs.read("k").unwrap().as_deref(),
            Some("line one\nline two\n")
        );
        assert!(blobs.read("absent").unwrap().is_none());
    }
}
