//! Resolved resources and the manifest that maps source identifiers to them.
//!
//! A single source may resolve to several resources. A directory source
//! resolves to the directory itself followed by one entry per contained
//! file, each carrying its own absolute target path, so nesting is encoded
//! in the target paths rather than by walking anything in the guest.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use crate::commands::{User, Workdir};

/// Permission bits kept from a resource mode; file type bits are dropped.
pub const PERMISSION_BITS: u32 = 0o7777;

/// Boxed content stream returned by [`ResourceContents::open`].
pub type ContentReader = Box<dyn AsyncRead + Send + Unpin>;

// =============================================================================
// Contents
// =============================================================================

/// Where the bytes of a file resource come from. Nothing is read until
/// [`ResourceContents::open`] is called.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ResourceContents {
    /// Bytes shipped inside the plan (base64 on the wire).
    Inline {
        #[serde(with = "base64_bytes")]
        data: Bytes,
    },
    /// A file already readable inside the guest, e.g. on a staging drive.
    Local { path: PathBuf },
}

impl ResourceContents {
    pub fn inline(data: impl Into<Bytes>) -> Self {
        ResourceContents::Inline { data: data.into() }
    }

    pub fn local(path: impl Into<PathBuf>) -> Self {
        ResourceContents::Local { path: path.into() }
    }

    /// Open a fresh stream over the contents.
    pub async fn open(&self) -> io::Result<ContentReader> {
        match self {
            ResourceContents::Inline { data } => Ok(Box::new(io::Cursor::new(data.clone()))),
            ResourceContents::Local { path } => {
                let file = tokio::fs::File::open(path).await?;
                Ok(Box::new(file))
            }
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Resources
// =============================================================================

/// A single file to write into the guest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileResource {
    pub contents: ResourceContents,

    /// File mode; only [`PERMISSION_BITS`] are applied.
    pub mode: u32,

    /// Source path relative to the build context.
    pub source_path: String,

    /// Target path inside the guest.
    pub target_path: PathBuf,

    #[serde(default)]
    pub workdir: Workdir,

    #[serde(default)]
    pub user: User,

    /// Host path the resource was resolved from, for diagnostics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
}

/// A directory to create in the guest. Its files are separate manifest
/// entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryResource {
    pub mode: u32,

    pub source_path: String,

    pub target_path: PathBuf,

    #[serde(default)]
    pub workdir: Workdir,

    #[serde(default)]
    pub user: User,

    /// Host path of the directory root, for diagnostics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
}

/// A resource whose source-side ambiguity has been resolved by the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResolvedResource {
    File(FileResource),
    Directory(DirectoryResource),
}

impl ResolvedResource {
    pub fn target_path(&self) -> &Path {
        match self {
            ResolvedResource::File(file) => &file.target_path,
            ResolvedResource::Directory(dir) => &dir.target_path,
        }
    }

    pub fn source_path(&self) -> &str {
        match self {
            ResolvedResource::File(file) => &file.source_path,
            ResolvedResource::Directory(dir) => &dir.source_path,
        }
    }

    pub fn user(&self) -> &User {
        match self {
            ResolvedResource::File(file) => &file.user,
            ResolvedResource::Directory(dir) => &dir.user,
        }
    }

    pub fn workdir(&self) -> &Workdir {
        match self {
            ResolvedResource::File(file) => &file.workdir,
            ResolvedResource::Directory(dir) => &dir.workdir,
        }
    }

    /// Permission bits to apply to the target.
    pub fn permissions(&self) -> u32 {
        let mode = match self {
            ResolvedResource::File(file) => file.mode,
            ResolvedResource::Directory(dir) => dir.mode,
        };
        mode & PERMISSION_BITS
    }
}

// =============================================================================
// Manifest
// =============================================================================

/// Mapping from original source identifier to its resolved resources, in
/// the order the host produced them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceManifest(BTreeMap<String, Vec<ResolvedResource>>);

impl ResourceManifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a resource under `source`, keeping earlier entries for the
    /// same key.
    pub fn insert(&mut self, source: impl Into<String>, resource: ResolvedResource) {
        self.0.entry(source.into()).or_default().push(resource);
    }

    /// All resources resolved from `source`; empty when the key is absent.
    pub fn get(&self, source: &str) -> &[ResolvedResource] {
        self.0.get(source).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether at least one resource is resolved from `source`.
    pub fn contains(&self, source: &str) -> bool {
        !self.get(source).is_empty()
    }

    /// Number of source keys.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
