use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use burn_core::Payload;
use burn_security::PayloadVerifier;
use tracing::{debug, info, warn};

use crate::acl::{reset_inherited_acl, secure_cache_root};
use crate::acquire::ensure_parent;
use crate::layout::{relative_payload_path, CacheLayout};
use crate::retry::RetryPolicy;

/// Verifies payloads and commits them into the package cache.
///
/// The per-machine root is secured lazily on the first per-machine write.
/// [`PackageCache::reset_root_secured`] forgets that, for hosts that outlive a
/// single install session.
#[derive(Debug)]
pub struct PackageCache {
    layout: CacheLayout,
    verifier: PayloadVerifier,
    retry: RetryPolicy,
    machine_root_secured: AtomicBool,
}

impl PackageCache {
    pub fn new(layout: CacheLayout, verifier: PayloadVerifier) -> Self {
        Self {
            layout,
            verifier,
            retry: RetryPolicy::default(),
            machine_root_secured: AtomicBool::new(false),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    pub fn verifier(&self) -> &PayloadVerifier {
        &self.verifier
    }

    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }

    pub fn reset_root_secured(&self) {
        self.machine_root_secured.store(false, Ordering::SeqCst);
    }

    pub fn ensure_cache_root(&self, per_machine: bool) -> Result<PathBuf> {
        let root = self.layout.cache_root(per_machine);
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create package cache {}", root.display()))?;
        if per_machine && !self.machine_root_secured.swap(true, Ordering::SeqCst) {
            if let Err(err) = secure_cache_root(&root) {
                self.machine_root_secured.store(false, Ordering::SeqCst);
                return Err(err);
            }
            info!(root = %root.display(), "secured per-machine package cache");
        }
        Ok(root)
    }

    pub fn verify_payload(&self, path: &Path, payload: &Payload) -> Result<()> {
        self.verifier
            .verify(path, &payload.verification)
            .with_context(|| format!("payload '{}' failed verification", payload.key))
    }

    /// Whether the payload is already in the cache and still verifies.
    pub fn is_payload_cached(&self, per_machine: bool, cache_id: &str, payload: &Payload) -> bool {
        let Ok(path) = self
            .layout
            .completed_payload_path(per_machine, cache_id, &payload.file_path)
        else {
            return false;
        };
        path.is_file() && self.verify_payload(&path, payload).is_ok()
    }

    /// Verifies the unverified copy, then moves or copies it to its completed
    /// path. Nothing is committed when verification fails.
    pub fn complete_payload(
        &self,
        per_machine: bool,
        cache_id: &str,
        payload: &Payload,
        unverified: &Path,
        move_file: bool,
    ) -> Result<PathBuf> {
        self.ensure_cache_root(per_machine)?;
        let destination =
            self.layout
                .completed_payload_path(per_machine, cache_id, &payload.file_path)?;

        self.verify_payload(unverified, payload)?;
        self.retry.run("cache payload", || {
            transfer_file(unverified, &destination, move_file)
        })?;
        reset_inherited_acl(&destination)?;
        debug!(
            payload = payload.key.as_str(),
            destination = %destination.display(),
            move_file,
            "payload cached"
        );
        Ok(destination)
    }

    /// Verifies a payload and places it under a layout directory.
    pub fn layout_payload(
        &self,
        layout_directory: &Path,
        payload: &Payload,
        unverified: &Path,
        move_file: bool,
    ) -> Result<PathBuf> {
        let destination = layout_directory.join(relative_payload_path(&payload.file_path)?);
        self.verify_payload(unverified, payload)?;
        self.retry.run("lay out payload", || {
            transfer_file(unverified, &destination, move_file)
        })?;
        Ok(destination)
    }

    pub fn layout_bundle(
        &self,
        layout_directory: &Path,
        executable: &Path,
        executable_name: &str,
    ) -> Result<PathBuf> {
        let destination = layout_directory.join(relative_payload_path(executable_name)?);
        self.retry.run("lay out bundle", || {
            transfer_file(executable, &destination, false)
        })?;
        Ok(destination)
    }

    /// Copies the running bundle executable into its own cache directory so
    /// it can be launched later for repair and uninstall.
    pub fn cache_bundle(
        &self,
        per_machine: bool,
        bundle_id: &str,
        executable: &Path,
        executable_name: &str,
    ) -> Result<PathBuf> {
        self.ensure_cache_root(per_machine)?;
        let destination = self
            .layout
            .completed_payload_path(per_machine, bundle_id, executable_name)?;
        if destination.as_path() == executable {
            return Ok(destination);
        }
        self.retry.run("cache bundle", || {
            transfer_file(executable, &destination, false)
        })?;
        reset_inherited_acl(&destination)?;
        info!(destination = %destination.display(), "cached bundle executable");
        Ok(destination)
    }

    pub fn remove_package(&self, per_machine: bool, cache_id: &str) -> Result<()> {
        let path = self.layout.completed_path(per_machine, cache_id);
        self.remove_cache_dir(per_machine, &path)
    }

    pub fn remove_bundle(&self, per_machine: bool, bundle_id: &str) -> Result<()> {
        let path = self.layout.completed_path(per_machine, bundle_id);
        self.remove_cache_dir(per_machine, &path)
    }

    /// Deletes directories an earlier run could not remove. Returns how many
    /// are still pending.
    pub fn process_pending_removals(&self, per_machine: bool) -> Result<usize> {
        let list = self.layout.pending_removals_path(per_machine);
        let pending = match fs::read_to_string(&list) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", list.display()))
            }
        };

        let mut remaining = Vec::new();
        for line in pending.lines().map(str::trim).filter(|line| !line.is_empty()) {
            let path = PathBuf::from(line);
            match fs::remove_dir_all(&path) {
                Ok(()) => debug!(path = line, "removed pending cache directory"),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    debug!(path = line, "cache directory still in use: {err}");
                    remaining.push(line.to_string());
                }
            }
        }

        if remaining.is_empty() {
            fs::remove_file(&list)
                .with_context(|| format!("failed to remove {}", list.display()))?;
        } else {
            fs::write(&list, remaining.join("\n") + "\n")
                .with_context(|| format!("failed to write {}", list.display()))?;
        }
        Ok(remaining.len())
    }

    fn remove_cache_dir(&self, per_machine: bool, path: &Path) -> Result<()> {
        match fs::remove_dir_all(path) {
            Ok(()) => info!(path = %path.display(), "removed cache directory"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(
                    path = %path.display(),
                    "cache directory in use, removal deferred: {err}"
                );
                self.schedule_removal(per_machine, path)?;
            }
        }
        let _ = fs::remove_dir(self.layout.cache_root(per_machine));
        Ok(())
    }

    fn schedule_removal(&self, per_machine: bool, path: &Path) -> Result<()> {
        let list = self.layout.pending_removals_path(per_machine);
        ensure_parent(&list)?;
        let mut existing = fs::read_to_string(&list).unwrap_or_default();
        let entry = path.display().to_string();
        if existing.lines().any(|line| line.trim() == entry) {
            return Ok(());
        }
        existing.push_str(&entry);
        existing.push('\n');
        fs::write(&list, existing).with_context(|| format!("failed to write {}", list.display()))
    }
}

/// Moves or copies a file over whatever is at `destination`. A move that
/// cannot rename (for example across volumes) falls back to copy and delete.
pub fn transfer_file(source: &Path, destination: &Path, move_file: bool) -> Result<()> {
    ensure_parent(destination)?;
    if destination.exists() {
        fs::remove_file(destination)
            .with_context(|| format!("failed to replace {}", destination.display()))?;
    }

    if move_file && fs::rename(source, destination).is_ok() {
        return Ok(());
    }

    fs::copy(source, destination).with_context(|| {
        format!(
            "failed to copy {} to {}",
            source.display(),
            destination.display()
        )
    })?;
    if move_file {
        fs::remove_file(source)
            .with_context(|| format!("failed to remove {}", source.display()))?;
    }
    Ok(())
}
