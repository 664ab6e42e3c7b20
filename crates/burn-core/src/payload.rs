use serde::{Deserialize, Serialize};

/// How a payload or container reaches the machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Packaging {
    /// Inside a container.
    #[default]
    Embedded,
    /// A loose file next to the bundle.
    External,
    /// Fetched from `download_url`.
    Download,
}

/// What a payload must satisfy before it is committed to the cache. Checked
/// in field order: certificate, then catalog, then hash.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Verification {
    /// Hex SHA-1 of the public key of some certificate in the signing chain.
    pub certificate_public_key_id: Option<String>,
    /// Hex SHA-1 of that certificate, checked only alongside the key id.
    pub certificate_thumbprint: Option<String>,
    /// Index into [`crate::Bundle::catalogs`].
    pub catalog: Option<usize>,
    /// Hex SHA-1, SHA-256 or SHA-512, chosen by length.
    pub hash: Option<String>,
}

impl Verification {
    pub fn is_empty(&self) -> bool {
        self.certificate_public_key_id.is_none() && self.catalog.is_none() && self.hash.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub key: String,
    /// Relative path of the file inside the package cache directory, and of
    /// the entry inside its container.
    pub file_path: String,
    pub size: u64,
    pub verification: Verification,
    pub packaging: Packaging,
    pub container: Option<usize>,
    /// Relative to the bundle's source directory, for external payloads.
    pub source_path: Option<String>,
    pub download_url: Option<String>,
    pub cached: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub id: String,
    pub file_path: String,
    /// Shipped next to the bundle executable, so no acquisition is needed.
    pub primary: bool,
    pub size: u64,
    pub download_url: Option<String>,
    pub hash: Option<String>,
}

/// A signed catalog that vouches for the payloads referencing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    pub id: String,
    pub payload: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackBoundary {
    pub id: String,
    pub vital: bool,
}
