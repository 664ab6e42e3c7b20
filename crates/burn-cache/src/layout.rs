use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, Result};

const PACKAGE_CACHE_DIR: &str = "Package Cache";
const PENDING_REMOVALS_FILE: &str = ".pending-removals";

/// Where cached and in-flight payloads live. Every path is a pure function of
/// the roots and the arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLayout {
    machine_root: PathBuf,
    user_root: PathBuf,
    working_root: PathBuf,
}

impl CacheLayout {
    pub fn new(
        machine_root: impl Into<PathBuf>,
        user_root: impl Into<PathBuf>,
        working_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            machine_root: machine_root.into(),
            user_root: user_root.into(),
            working_root: working_root.into(),
        }
    }

    pub fn cache_root(&self, per_machine: bool) -> PathBuf {
        let base = if per_machine {
            &self.machine_root
        } else {
            &self.user_root
        };
        base.join(PACKAGE_CACHE_DIR)
    }

    pub fn completed_path(&self, per_machine: bool, cache_id: &str) -> PathBuf {
        self.cache_root(per_machine).join(cache_id)
    }

    pub fn completed_payload_path(
        &self,
        per_machine: bool,
        cache_id: &str,
        file_path: &str,
    ) -> Result<PathBuf> {
        Ok(self
            .completed_path(per_machine, cache_id)
            .join(relative_payload_path(file_path)?))
    }

    pub fn working_root(&self) -> &Path {
        &self.working_root
    }

    /// Unverified location of a payload, keyed by its hash when it declares
    /// one so identical content shares a slot.
    pub fn unverified_payload_path(&self, key: &str, hash: Option<&str>) -> PathBuf {
        self.working_root
            .join("payloads")
            .join(working_name(hash.unwrap_or(key)))
    }

    pub fn unverified_container_path(&self, id: &str, hash: Option<&str>) -> PathBuf {
        self.working_root
            .join("containers")
            .join(working_name(hash.unwrap_or(id)))
    }

    pub fn pending_removals_path(&self, per_machine: bool) -> PathBuf {
        self.cache_root(per_machine).join(PENDING_REMOVALS_FILE)
    }
}

/// Validates a manifest-supplied relative path so it cannot escape the
/// directory it is joined onto.
pub fn relative_payload_path(file_path: &str) -> Result<PathBuf> {
    let normalized = file_path.replace('\\', "/");
    let path = Path::new(&normalized);
    if normalized.is_empty() {
        return Err(anyhow!("payload path is empty"));
    }
    let mut relative = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            _ => {
                return Err(anyhow!(
                    "payload path '{file_path}' must be relative and stay inside its directory"
                ))
            }
        }
    }
    if relative.as_os_str().is_empty() {
        return Err(anyhow!("payload path '{file_path}' names no file"));
    }
    Ok(relative)
}

fn working_name(value: &str) -> String {
    value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> CacheLayout {
        CacheLayout::new("/machine", "/user", "/tmp/work")
    }

    #[test]
    fn completed_path_is_deterministic_per_scope() {
        let layout = layout();
        assert_eq!(
            layout.completed_path(true, "{ABC}v1"),
            layout.completed_path(true, "{ABC}v1")
        );
        assert_ne!(
            layout.completed_path(true, "{ABC}v1"),
            layout.completed_path(false, "{ABC}v1")
        );
        assert_eq!(
            layout.completed_path(false, "pkg"),
            PathBuf::from("/user").join("Package Cache").join("pkg")
        );
    }

    #[test]
    fn payload_paths_reject_escapes() {
        assert!(relative_payload_path("../evil.msi").is_err());
        assert!(relative_payload_path("/abs/evil.msi").is_err());
        assert!(relative_payload_path("").is_err());
        assert_eq!(
            relative_payload_path("sub\\setup.msi").expect("nested path is valid"),
            PathBuf::from("sub").join("setup.msi")
        );
    }

    #[test]
    fn working_paths_prefer_hash_and_sanitize() {
        let layout = layout();
        assert_eq!(
            layout.unverified_payload_path("key", Some("abcd")),
            PathBuf::from("/tmp/work").join("payloads").join("abcd")
        );
        assert_eq!(
            layout.unverified_payload_path("a/b:c", None),
            PathBuf::from("/tmp/work").join("payloads").join("a_b_c")
        );
    }
}
