use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use burn_core::Verification;
use tracing::debug;

use crate::certificate::chain_matches;
use crate::error::VerificationError;
use crate::hash::verify_hash_file;
use crate::trust::TrustProvider;

/// Checks payloads against their declared verification before they are
/// committed to the cache.
#[derive(Clone)]
pub struct PayloadVerifier {
    trust: Arc<dyn TrustProvider>,
    catalogs: Arc<RwLock<Vec<Option<PathBuf>>>>,
}

impl PayloadVerifier {
    pub fn new(trust: Arc<dyn TrustProvider>) -> Self {
        Self {
            trust,
            catalogs: Arc::default(),
        }
    }

    /// Records where the catalog at `index` was acquired. Clones of the
    /// verifier share the table.
    pub fn set_catalog_path(&self, index: usize, path: impl Into<PathBuf>) {
        let mut catalogs = self
            .catalogs
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if catalogs.len() <= index {
            catalogs.resize(index + 1, None);
        }
        catalogs[index] = Some(path.into());
    }

    fn catalog_path(&self, index: usize) -> Option<PathBuf> {
        self.catalogs
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(index)
            .cloned()
            .flatten()
    }

    pub fn trust(&self) -> &dyn TrustProvider {
        self.trust.as_ref()
    }

    /// The first declared mechanism decides: certificate, then catalog, then
    /// hash. A failing certificate check never falls back to the hash.
    pub fn verify(&self, path: &Path, verification: &Verification) -> Result<(), VerificationError> {
        if let Some(public_key_id) = &verification.certificate_public_key_id {
            debug!(path = %path.display(), "verifying payload certificate chain");
            let chain = self.trust.authenticode_chain(path)?;
            if !chain_matches(
                &chain,
                public_key_id,
                verification.certificate_thumbprint.as_deref(),
            )? {
                return Err(VerificationError::CertificateMismatch {
                    path: path.to_path_buf(),
                });
            }
            return Ok(());
        }

        if let Some(catalog) = verification.catalog {
            debug!(path = %path.display(), catalog, "verifying payload against catalog");
            let catalog_path = self
                .catalog_path(catalog)
                .ok_or(VerificationError::MissingCatalog(catalog))?;
            return self.trust.verify_catalog_member(&catalog_path, path);
        }

        if let Some(hash) = &verification.hash {
            debug!(path = %path.display(), "verifying payload hash");
            return verify_hash_file(path, hash);
        }

        Err(VerificationError::Unverifiable {
            path: path.to_path_buf(),
        })
    }
}

impl std::fmt::Debug for PayloadVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadVerifier")
            .field("catalogs", &self.catalogs)
            .finish_non_exhaustive()
    }
}
