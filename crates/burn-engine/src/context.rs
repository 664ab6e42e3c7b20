use std::sync::Arc;

use anyhow::Result;
use burn_cache::{Downloader, HttpDownloader, PackageCache};
use burn_security::{PayloadVerifier, PowerShellTrustProvider, TrustProvider};

use crate::config::EngineConfig;
use crate::dependency::DependencyStore;
use crate::products::{InstalledProducts, WindowsInstallerProducts};
use crate::registration::RegistrationStore;

/// Host services shared by detect, apply and the elevated child.
pub struct EngineContext {
    pub config: EngineConfig,
    pub cache: PackageCache,
    pub products: Arc<dyn InstalledProducts>,
    pub downloader: Arc<dyn Downloader>,
}

impl EngineContext {
    pub fn new(
        config: EngineConfig,
        trust: Arc<dyn TrustProvider>,
        products: Arc<dyn InstalledProducts>,
        downloader: Arc<dyn Downloader>,
    ) -> Self {
        let cache = PackageCache::new(config.cache_layout(), PayloadVerifier::new(trust))
            .with_retry(config.retry);
        Self {
            config,
            cache,
            products,
            downloader,
        }
    }

    /// Production services for the current host.
    pub fn for_host(config: EngineConfig) -> Result<Self> {
        Ok(Self::new(
            config,
            Arc::new(PowerShellTrustProvider::default()),
            Arc::new(WindowsInstallerProducts::default()),
            Arc::new(HttpDownloader::new()?),
        ))
    }

    pub fn registrations(&self, per_machine: bool) -> RegistrationStore {
        RegistrationStore::new(self.config.registration_root(per_machine))
    }

    pub fn dependencies(&self, per_machine: bool) -> DependencyStore {
        DependencyStore::new(self.config.dependency_root(per_machine))
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}
