// ABOUTME: Persisted desired mappings
//
// The desired mapping set survives restarts as a small JSON document of
// {local_port, remote_port} records. On startup each record is checked against
// a fresh port scan before it is requested again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors reading or writing the mapping store
#[derive(Debug, Error)]
pub enum PersistError {
    /// File could not be read or written
    #[error("Mapping store I/O error at {path}: {source}")]
    Io {
        /// Store location
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// File contents were not valid JSON
    #[error("Mapping store is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// One persisted mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMapping {
    /// Port on this host
    pub local_port: u16,
    /// Port on the tunnel server
    pub remote_port: u16,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreDocument {
    version: u32,
    saved_at: DateTime<Utc>,
    mappings: Vec<StoredMapping>,
}

/// JSON-backed store of desired mappings
#[derive(Debug, Clone)]
pub struct MappingStore {
    path: PathBuf,
}

impl MappingStore {
    const VERSION: u32 = 1;

    /// Store at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store location
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted mappings. A missing file is an empty set.
    pub fn load(&self) -> Result<BTreeMap<u16, u16>, PersistError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No persisted mappings");
                return Ok(BTreeMap::new());
            }
            Err(source) => {
                return Err(PersistError::Io {
                    path: self.path.display().to_string(),
                    source,
                })
            }
        };

        let document: StoreDocument = serde_json::from_str(&content)?;
        if document.version != Self::VERSION {
            warn!(
                found = document.version,
                expected = Self::VERSION,
                "Mapping store version mismatch, loading anyway"
            );
        }

        let mappings: BTreeMap<u16, u16> = document
            .mappings
            .into_iter()
            .map(|m| (m.local_port, m.remote_port))
            .collect();
        info!(count = mappings.len(), "Loaded persisted mappings");
        Ok(mappings)
    }

    /// Replace the persisted set atomically
    pub fn save(&self, mappings: &BTreeMap<u16, u16>) -> Result<(), PersistError> {
        let document = StoreDocument {
            version: Self::VERSION,
            saved_at: Utc::now(),
            mappings: mappings
                .iter()
                .map(|(&local_port, &remote_port)| StoredMapping {
                    local_port,
                    remote_port,
                })
                .collect(),
        };

        let json = serde_json::to_vec_pretty(&document)?;
        crate::fsutil::write_atomic(&self.path, &json).map_err(|source| PersistError::Io {
            path: self.path.display().to_string(),
            source,
        })?;

        debug!(count = mappings.len(), "Saved mappings");
        Ok(())
    }
}
