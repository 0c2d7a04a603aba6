//! dbt manifest schema and loading
//!
//! Only the subset of `manifest.json` this system reads is modelled;
//! everything else in the document is ignored during decoding.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::ManifestError;

/// Resource types that can carry access annotations
pub const SUPPORTED_RESOURCE_TYPES: [&str; 3] = ["model", "seed", "snapshot"];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestDocument {
    #[serde(default)]
    pub metadata: ManifestMetadata,
    /// Resource nodes keyed by their unique id
    #[serde(default)]
    pub nodes: BTreeMap<String, ManifestResource>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestMetadata {
    #[serde(default)]
    pub project_name: String,
}

/// One modelled table, view or snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestResource {
    #[serde(default)]
    pub resource_type: String,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub schema: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub columns: BTreeMap<String, ManifestColumn>,
    #[serde(default)]
    pub meta: ResourceMeta,
}

impl ManifestResource {
    pub fn is_supported(&self) -> bool {
        SUPPORTED_RESOURCE_TYPES.contains(&self.resource_type.as_str())
    }

    /// `prefix + database.schema.name`; the prefix must already be normalized
    pub fn fullname(&self, prefix: &str) -> String {
        format!("{}{}.{}.{}", prefix, self.database, self.schema, self.name)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestColumn {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub meta: ColumnMeta,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceMeta {
    #[serde(default)]
    pub raito: ResourceAnnotations,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceAnnotations {
    #[serde(default)]
    pub grant: Vec<GrantDirective>,
    #[serde(default)]
    pub filter: Vec<FilterDirective>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ColumnMeta {
    #[serde(default)]
    pub raito: ColumnAnnotations,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ColumnAnnotations {
    #[serde(default)]
    pub mask: Option<MaskDirective>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GrantDirective {
    pub name: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub global_permissions: Vec<String>,
    #[serde(default)]
    pub owners: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterDirective {
    pub name: String,
    #[serde(default)]
    pub policy_rule: String,
    #[serde(default)]
    pub owners: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaskDirective {
    pub name: String,
    #[serde(default, rename = "type")]
    pub mask_type: Option<String>,
    #[serde(default)]
    pub owners: Vec<String>,
}

/// Loads manifest documents
pub trait ManifestSource: Send + Sync {
    fn load(&self, path: &Path) -> Result<Arc<ManifestDocument>, ManifestError>;
}

/// Reads and decodes the manifest from disk on every call
#[derive(Debug, Clone, Copy, Default)]
pub struct FileManifestSource;

impl FileManifestSource {
    pub fn new() -> Self {
        Self
    }
}

impl ManifestSource for FileManifestSource {
    fn load(&self, path: &Path) -> Result<Arc<ManifestDocument>, ManifestError> {
        let bytes = read_manifest(path)?;
        Ok(Arc::new(decode_manifest(path, &bytes)?))
    }
}

fn read_manifest(path: &Path) -> Result<Vec<u8>, ManifestError> {
    std::fs::read(path).map_err(|source| ManifestError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn decode_manifest(path: &Path, bytes: &[u8]) -> Result<ManifestDocument, ManifestError> {
    let document: ManifestDocument =
        serde_json::from_slice(bytes).map_err(|source| ManifestError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    tracing::debug!(
        "Decoded manifest {:?} for project '{}' with {} nodes",
        path,
        document.metadata.project_name,
        document.nodes.len()
    );

    Ok(document)
}

struct CachedManifest {
    digest: [u8; 32],
    document: Arc<ManifestDocument>,
}

/// Caches decoded manifests by absolute path.
///
/// The file is read on every load; the decoded document is reused only
/// while the SHA-256 of its contents is unchanged. The cache is owned by
/// whoever constructs it; two instances never share entries.
#[derive(Default)]
pub struct CachedManifestSource {
    cache: RwLock<HashMap<PathBuf, CachedManifest>>,
}

impl CachedManifestSource {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ManifestSource for CachedManifestSource {
    fn load(&self, path: &Path) -> Result<Arc<ManifestDocument>, ManifestError> {
        let absolute = std::path::absolute(path).map_err(|source| ManifestError::InvalidPath {
            path: path.to_path_buf(),
            source,
        })?;

        let bytes = read_manifest(&absolute)?;
        let digest: [u8; 32] = Sha256::digest(&bytes).into();

        if let Some(cached) = self.cache.read().get(&absolute) {
            if cached.digest == digest {
                return Ok(cached.document.clone());
            }
        }

        let document = Arc::new(decode_manifest(&absolute, &bytes)?);
        self.cache.write().insert(
            absolute,
            CachedManifest {
                digest,
                document: document.clone(),
            },
        );
        Ok(document)
    }
}
