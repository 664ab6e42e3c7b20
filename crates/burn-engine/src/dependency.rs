use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn_core::{DependencyAction, DependencyProvider};
use tracing::debug;

/// A dependency provider and the bundles that depend on it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProviderRecord {
    pub key: String,
    pub version: Option<String>,
    pub display_name: Option<String>,
    pub dependents: Vec<String>,
}

impl ProviderRecord {
    fn to_receipt(&self) -> String {
        let mut payload = String::new();
        payload.push_str(&format!("key={}\n", self.key));
        if let Some(version) = &self.version {
            payload.push_str(&format!("version={version}\n"));
        }
        if let Some(display_name) = &self.display_name {
            payload.push_str(&format!("display_name={display_name}\n"));
        }
        for dependent in &self.dependents {
            payload.push_str(&format!("dependent={dependent}\n"));
        }
        payload
    }

    fn parse(raw: &str) -> Result<Self> {
        let mut record = Self::default();
        let mut key = None;
        for line in raw.lines().map(str::trim).filter(|line| !line.is_empty()) {
            let Some((name, value)) = line.split_once('=') else {
                continue;
            };
            match name {
                "key" => key = Some(value.to_string()),
                "version" => record.version = Some(value.to_string()),
                "display_name" => record.display_name = Some(value.to_string()),
                "dependent" => record.dependents.push(value.to_string()),
                _ => {}
            }
        }
        record.key = key.context("missing key")?;
        Ok(record)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyStore {
    root: PathBuf,
}

impl DependencyStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn provider_path(&self, key: &str) -> PathBuf {
        let stem = key
            .chars()
            .map(|ch| if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | '{' | '}') { ch } else { '_' })
            .collect::<String>();
        self.root.join(format!("{stem}.provider"))
    }

    pub fn read(&self, key: &str) -> Result<Option<ProviderRecord>> {
        let path = self.provider_path(key);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("failed to read {}", path.display())),
        };
        ProviderRecord::parse(&raw)
            .map(Some)
            .with_context(|| format!("failed to parse provider record: {}", path.display()))
    }

    fn write(&self, record: &ProviderRecord) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("failed to create {}", self.root.display()))?;
        let path = self.provider_path(&record.key);
        fs::write(&path, record.to_receipt())
            .with_context(|| format!("failed to write provider record: {}", path.display()))
    }

    pub fn dependents(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .read(key)?
            .map(|record| record.dependents)
            .unwrap_or_default())
    }

    /// Whether anything other than `dependent` still depends on the provider.
    pub fn has_other_dependents(&self, key: &str, dependent: &str) -> Result<bool> {
        Ok(self
            .dependents(key)?
            .iter()
            .any(|other| !other.eq_ignore_ascii_case(dependent)))
    }

    pub fn register_provider(&self, provider: &DependencyProvider) -> Result<()> {
        let mut record = self.read(&provider.key)?.unwrap_or_else(|| ProviderRecord {
            key: provider.key.clone(),
            ..ProviderRecord::default()
        });
        record.version = provider.version.clone();
        record.display_name = provider.display_name.clone();
        self.write(&record)
    }

    /// Removes the provider once nothing depends on it. Returns whether it
    /// was removed.
    pub fn unregister_provider(&self, key: &str) -> Result<bool> {
        let Some(record) = self.read(key)? else {
            return Ok(false);
        };
        if !record.dependents.is_empty() {
            debug!(provider = key, dependents = record.dependents.len(), "provider still has dependents");
            return Ok(false);
        }
        let path = self.provider_path(key);
        fs::remove_file(&path).with_context(|| format!("failed to remove {}", path.display()))?;
        Ok(true)
    }

    pub fn register_dependent(&self, key: &str, dependent: &str) -> Result<()> {
        let mut record = self.read(key)?.unwrap_or_else(|| ProviderRecord {
            key: key.to_string(),
            ..ProviderRecord::default()
        });
        if !record
            .dependents
            .iter()
            .any(|existing| existing.eq_ignore_ascii_case(dependent))
        {
            record.dependents.push(dependent.to_string());
        }
        self.write(&record)
    }

    pub fn unregister_dependent(&self, key: &str, dependent: &str) -> Result<()> {
        let Some(mut record) = self.read(key)? else {
            return Ok(());
        };
        record
            .dependents
            .retain(|existing| !existing.eq_ignore_ascii_case(dependent));
        self.write(&record)
    }

    /// Applies a planned dependency action for one package's providers on
    /// behalf of the bundle identified by `dependent`.
    pub fn apply(
        &self,
        action: DependencyAction,
        providers: &[DependencyProvider],
        dependent: &str,
    ) -> Result<()> {
        for provider in providers {
            match action {
                DependencyAction::None => {}
                DependencyAction::Register => {
                    if !provider.imported {
                        self.register_provider(provider)?;
                    }
                    self.register_dependent(&provider.key, dependent)?;
                }
                DependencyAction::Unregister => {
                    self.unregister_dependent(&provider.key, dependent)?;
                    if !provider.imported {
                        self.unregister_provider(&provider.key)?;
                    }
                }
            }
            debug!(
                provider = %provider.key,
                dependent,
                action = ?action,
                "applied dependency action"
            );
        }
        Ok(())
    }
}
