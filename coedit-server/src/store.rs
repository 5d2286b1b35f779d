//! Durable storage for documents, operation logs, and access control.
//!
//! The collaboration core consumes the narrow [`DocumentStore`] contract;
//! [`FileStore`] is the bundled filesystem backend. A relational backend can
//! be swapped in without touching the sessions.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::random;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::warn;

use crate::Identifier;
use crate::ot::EditKind;

/// Effective access level of a subject on a document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    /// No access; the connection is refused.
    None,
    /// May join and observe, but not edit.
    View,
    /// Full read/write access.
    Edit,
}

/// Error produced by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The document does not exist.
    #[error("document not found")]
    NotFound,
    /// The backend failed; the operation may succeed if retried.
    #[error("storage i/o: {0}")]
    Io(#[from] std::io::Error),
    /// A stored record could not be decoded; retrying will not help.
    #[error("corrupt record: {0}")]
    Corrupt(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether the operation may succeed if retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Io(_))
    }
}

/// A durable copy of a document at a specific version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Document content.
    pub content: String,
    /// Number of operations ever applied to reach `content`.
    pub version: u64,
    /// Language tag for syntax highlighting.
    pub language: String,
    /// Owning subject, set on the first authenticated join.
    pub owner_id: Option<String>,
    /// Whether the document is visible beyond its ACL.
    pub is_public: bool,
}

impl Snapshot {
    /// A fresh, empty, public document.
    pub fn empty() -> Self {
        Self {
            content: String::new(),
            version: 0,
            language: "plaintext".to_string(),
            owner_id: None,
            is_public: true,
        }
    }
}

/// One row of the persisted operation log. `(document, version)` is unique;
/// inserted text is stored only as its UTF-16 length plus a content hash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpRow {
    /// Document version after applying this operation.
    pub version: u64,
    /// Insert or delete.
    pub kind: EditKind,
    /// Offset in UTF-16 code units.
    pub position: u32,
    /// UTF-16 length of the inserted text, or the deleted span.
    pub length: u32,
    /// Subject that produced the operation.
    pub user_id: String,
    /// Server acceptance time.
    pub timestamp: DateTime<Utc>,
    /// 64-bit hash of the full operation content.
    pub op_hash: u64,
}

/// The persistence contract the collaboration core depends on.
///
/// Methods are called only from worker tasks spawned by sessions; the
/// session dispatchers themselves never await them (except during drain).
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Load the latest snapshot of a document.
    async fn load_snapshot(&self, doc: &Identifier) -> Result<Snapshot, StoreError>;

    /// Persist a snapshot, replacing any previous one.
    async fn save_snapshot(&self, doc: &Identifier, snapshot: &Snapshot) -> Result<(), StoreError>;

    /// Append operation rows. Idempotent by `(doc, version)`: rows at or
    /// below the highest stored version are skipped.
    async fn append_ops(&self, doc: &Identifier, rows: &[OpRow]) -> Result<(), StoreError>;

    /// All stored rows with `version > from_version`, in version order.
    async fn load_ops_since(&self, doc: &Identifier, from_version: u64) -> Result<Vec<OpRow>, StoreError>;

    /// Effective access of a subject (`None` for anonymous guests) on a
    /// document. Missing documents resolve to [`Access::Edit`]: they are
    /// created on first join.
    async fn resolve_access(&self, user_id: Option<&str>, doc: &Identifier) -> Result<Access, StoreError>;

    /// Number of documents currently persisted.
    async fn document_count(&self) -> Result<usize, StoreError>;
}

/// Sidecar metadata persisted next to each document's content.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct DocumentMeta {
    language: String,
    version: u64,
    owner_id: Option<String>,
    is_public: bool,
    #[serde(default)]
    shared: HashMap<String, Access>,
}

/// Filesystem-backed [`DocumentStore`].
///
/// Layout under the storage root: `docs/<id>` holds content, `docs/<id>.json`
/// the metadata sidecar, and `ops/<id>.jsonl` the append-only op log.
#[derive(Debug)]
pub struct FileStore {
    storage: PathBuf,
    /// Highest op version already appended, per document.
    appended: DashMap<Identifier, u64>,
}

impl FileStore {
    /// Open (or create) a store rooted at `storage`.
    pub async fn new(storage: PathBuf) -> Result<Self, StoreError> {
        let this = Self {
            storage,
            appended: DashMap::new(),
        };
        fs::create_dir_all(this.docs_dir()).await?;
        fs::create_dir_all(this.ops_dir()).await?;
        Ok(this)
    }

    /// Create a store in a fresh temporary directory, for tests.
    pub async fn temporary() -> Result<Self, StoreError> {
        let storage = std::env::temp_dir().join(format!("coedit_{:x}", random::<u64>()));
        Self::new(storage).await
    }

    fn docs_dir(&self) -> PathBuf {
        self.storage.join("docs")
    }

    fn ops_dir(&self) -> PathBuf {
        self.storage.join("ops")
    }

    fn content_path(&self, doc: &Identifier) -> PathBuf {
        self.docs_dir().join(doc.as_ref())
    }

    fn meta_path(&self, doc: &Identifier) -> PathBuf {
        self.content_path(doc).with_extension("json")
    }

    fn ops_path(&self, doc: &Identifier) -> PathBuf {
        self.ops_dir().join(doc.as_ref()).with_extension("jsonl")
    }

    async fn load_meta(&self, doc: &Identifier) -> Result<Option<DocumentMeta>, StoreError> {
        let path = self.meta_path(doc);
        match fs::read_to_string(path).await {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Highest version already present in a document's op log.
    async fn appended_high_water(&self, doc: &Identifier) -> Result<u64, StoreError> {
        if let Some(v) = self.appended.get(doc) {
            return Ok(*v);
        }
        let high = match fs::read_to_string(self.ops_path(doc)).await {
            Ok(raw) => raw
                .lines()
                .filter(|l| !l.trim().is_empty())
                .next_back()
                .map(serde_json::from_str::<OpRow>)
                .transpose()?
                .map(|row| row.version)
                .unwrap_or(0),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        self.appended.insert(doc.clone(), high);
        Ok(high)
    }

    /// Grant (or revoke, with [`Access::None`]) explicit access for a user.
    /// Creates the document metadata if it does not exist yet.
    pub async fn grant(&self, doc: &Identifier, user_id: &str, access: Access) -> Result<(), StoreError> {
        let mut meta = self.load_meta(doc).await?.unwrap_or_else(|| DocumentMeta {
            language: "plaintext".to_string(),
            version: 0,
            owner_id: None,
            is_public: true,
            shared: HashMap::new(),
        });
        meta.shared.insert(user_id.to_string(), access);
        fs::write(self.meta_path(doc), serde_json::to_string_pretty(&meta)?).await?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for FileStore {
    async fn load_snapshot(&self, doc: &Identifier) -> Result<Snapshot, StoreError> {
        let Some(meta) = self.load_meta(doc).await? else {
            return Err(StoreError::NotFound);
        };
        let content = match fs::read_to_string(self.content_path(doc)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Snapshot {
            content,
            version: meta.version,
            language: meta.language,
            owner_id: meta.owner_id,
            is_public: meta.is_public,
        })
    }

    async fn save_snapshot(&self, doc: &Identifier, snapshot: &Snapshot) -> Result<(), StoreError> {
        // keep any ACL entries written alongside earlier snapshots
        let shared = self
            .load_meta(doc)
            .await?
            .map(|m| m.shared)
            .unwrap_or_default();
        let meta = DocumentMeta {
            language: snapshot.language.clone(),
            version: snapshot.version,
            owner_id: snapshot.owner_id.clone(),
            is_public: snapshot.is_public,
            shared,
        };
        let content_path = self.content_path(doc);
        let meta_path = self.meta_path(doc);
        let content = snapshot.content.clone();
        let meta_raw = serde_json::to_string_pretty(&meta)?;
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            std::fs::write(content_path, content)?;
            std::fs::write(meta_path, meta_raw)?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))??;
        Ok(())
    }

    async fn append_ops(&self, doc: &Identifier, rows: &[OpRow]) -> Result<(), StoreError> {
        let high = self.appended_high_water(doc).await?;
        let fresh: Vec<&OpRow> = rows.iter().filter(|r| r.version > high).collect();
        let Some(last) = fresh.last() else {
            return Ok(());
        };
        let new_high = last.version;
        let mut buf = String::new();
        for row in &fresh {
            buf.push_str(&serde_json::to_string(row)?);
            buf.push('\n');
        }
        let path = self.ops_path(doc);
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
            file.write_all(buf.as_bytes())?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))??;
        self.appended.insert(doc.clone(), new_high);
        Ok(())
    }

    async fn load_ops_since(&self, doc: &Identifier, from_version: u64) -> Result<Vec<OpRow>, StoreError> {
        let raw = match fs::read_to_string(self.ops_path(doc)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut rows = Vec::new();
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            let row: OpRow = serde_json::from_str(line)?;
            if row.version > from_version {
                rows.push(row);
            }
        }
        rows.sort_by_key(|r| r.version);
        Ok(rows)
    }

    async fn resolve_access(&self, user_id: Option<&str>, doc: &Identifier) -> Result<Access, StoreError> {
        let Some(meta) = self.load_meta(doc).await? else {
            // created on first join
            return Ok(Access::Edit);
        };
        if let Some(user_id) = user_id {
            if meta.owner_id.as_deref() == Some(user_id) {
                return Ok(Access::Edit);
            }
            if let Some(level) = meta.shared.get(user_id) {
                return Ok(*level);
            }
        }
        if meta.is_public {
            Ok(Access::Edit)
        } else {
            Ok(Access::None)
        }
    }

    async fn document_count(&self) -> Result<usize, StoreError> {
        let mut entries = fs::read_dir(self.docs_dir()).await?;
        let mut count = 0;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file()
                && entry.path().extension().and_then(|s| s.to_str()) == Some("json")
            {
                count += 1;
            }
        }
        Ok(count)
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        // Clean up directories created by `temporary()` on drop.
        let ours = self.storage.parent() == Some(std::env::temp_dir().as_path())
            && self
                .storage
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("coedit_"));
        if ours && let Err(e) = std::fs::remove_dir_all(&self.storage) {
            warn!("failed to remove temporary storage: {e}");
        }
    }
}
