//! Catalog of launchable targets.
//!
//! A target is something a client can ask to start on its machine. The
//! catalog only maps a target id to the path it is served under; building the
//! reachable endpoint is a matter of joining that path onto the machine's
//! address.
//!
//! ```toml
//! [[targets]]
//! id = 7
//! name = "Snake"
//! path = "snake"
//! ```

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read catalog {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid catalog: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("duplicate target id {0}")]
    DuplicateId(u32),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Target {
    pub id: u32,
    pub name: String,
    /// Path under the machine's web root, without leading or trailing slash.
    pub path: String,
}

impl Target {
    /// Endpoint for this target on a machine reachable at `address`.
    pub fn endpoint(&self, address: &str) -> String {
        format!("http://{}/{}/index.html", address, self.path.trim_matches('/'))
    }
}

#[derive(Debug, Default, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    targets: Vec<Target>,
}

/// Static, read-only target catalog.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    targets: Vec<Target>,
}

impl Catalog {
    pub fn new(targets: Vec<Target>) -> Result<Self, CatalogError> {
        let mut ids = std::collections::HashSet::new();
        for target in &targets {
            if !ids.insert(target.id) {
                return Err(CatalogError::DuplicateId(target.id));
            }
        }
        Ok(Self { targets })
    }

    /// An empty catalog; every lookup misses.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_toml_str(s: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = toml::from_str(s)?;
        Self::new(file.targets)
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let content = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn get(&self, id: u32) -> Option<&Target> {
        self.targets.iter().find(|target| target.id == id)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}
