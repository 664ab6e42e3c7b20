use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use burn_core::{
    format_version, parse_version_string, ExePackage, ExeProtocol, Package, PackageKind,
    PackageState, Registration, RelatedBundle, RelationType, ResumeMode,
};
use tracing::{debug, warn};

/// The persisted form of a bundle's registration, one file per bundle.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RegistrationRecord {
    pub bundle_id: String,
    pub provider_key: String,
    pub version: u64,
    pub display_name: String,
    pub publisher: Option<String>,
    pub per_machine: bool,
    pub cached_executable: Option<PathBuf>,
    pub resume_command_line: Option<String>,
    pub upgrade_codes: Vec<String>,
    pub addon_codes: Vec<String>,
    pub patch_codes: Vec<String>,
    pub detect_codes: Vec<String>,
    pub resume: ResumeMode,
    pub installed: bool,
    /// Boot identity recorded with a pending restart.
    pub boot_id: Option<String>,
}

impl RegistrationRecord {
    pub fn from_registration(registration: &Registration, cached_executable: Option<PathBuf>) -> Self {
        Self {
            bundle_id: registration.bundle_id.clone(),
            provider_key: registration.provider_key.clone(),
            version: registration.version,
            display_name: registration.display_name.clone(),
            publisher: registration.publisher.clone(),
            per_machine: registration.per_machine,
            cached_executable,
            resume_command_line: registration.resume_command_line.clone(),
            upgrade_codes: registration.upgrade_codes.clone(),
            addon_codes: registration.addon_codes.clone(),
            patch_codes: registration.patch_codes.clone(),
            detect_codes: registration.detect_codes.clone(),
            resume: ResumeMode::None,
            installed: false,
            boot_id: None,
        }
    }

    pub fn to_receipt(&self) -> String {
        let mut payload = String::new();
        payload.push_str(&format!("bundle_id={}\n", self.bundle_id));
        payload.push_str(&format!("provider_key={}\n", self.provider_key));
        payload.push_str(&format!("version={}\n", format_version(self.version)));
        payload.push_str(&format!("display_name={}\n", self.display_name));
        if let Some(publisher) = &self.publisher {
            payload.push_str(&format!("publisher={publisher}\n"));
        }
        payload.push_str(&format!("per_machine={}\n", self.per_machine));
        if let Some(path) = &self.cached_executable {
            payload.push_str(&format!("cached_executable={}\n", path.display()));
        }
        if let Some(command_line) = &self.resume_command_line {
            payload.push_str(&format!("resume_command_line={command_line}\n"));
        }
        for code in &self.upgrade_codes {
            payload.push_str(&format!("upgrade_code={code}\n"));
        }
        for code in &self.addon_codes {
            payload.push_str(&format!("addon_code={code}\n"));
        }
        for code in &self.patch_codes {
            payload.push_str(&format!("patch_code={code}\n"));
        }
        for code in &self.detect_codes {
            payload.push_str(&format!("detect_code={code}\n"));
        }
        payload.push_str(&format!("resume={}\n", self.resume.as_str()));
        payload.push_str(&format!("installed={}\n", self.installed));
        if let Some(boot_id) = &self.boot_id {
            payload.push_str(&format!("boot_id={boot_id}\n"));
        }
        payload
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let mut record = Self::default();
        let mut bundle_id = None;
        let mut version = None;

        for line in raw.lines().map(str::trim).filter(|line| !line.is_empty()) {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key {
                "bundle_id" => bundle_id = Some(value.to_string()),
                "provider_key" => record.provider_key = value.to_string(),
                "version" => {
                    version = Some(
                        parse_version_string(value)
                            .with_context(|| format!("invalid version '{value}'"))?,
                    )
                }
                "display_name" => record.display_name = value.to_string(),
                "publisher" => record.publisher = Some(value.to_string()),
                "per_machine" => record.per_machine = value == "true",
                "cached_executable" => record.cached_executable = Some(PathBuf::from(value)),
                "resume_command_line" => record.resume_command_line = Some(value.to_string()),
                "upgrade_code" => record.upgrade_codes.push(value.to_string()),
                "addon_code" => record.addon_codes.push(value.to_string()),
                "patch_code" => record.patch_codes.push(value.to_string()),
                "detect_code" => record.detect_codes.push(value.to_string()),
                "resume" => {
                    record.resume = ResumeMode::parse(value)
                        .with_context(|| format!("unknown resume mode '{value}'"))?
                }
                "installed" => record.installed = value == "true",
                "boot_id" => record.boot_id = Some(value.to_string()),
                _ => {}
            }
        }

        record.bundle_id = bundle_id.context("missing bundle_id")?;
        record.version = version.context("missing version")?;
        Ok(record)
    }
}

/// Registration records for one scope (per-machine or per-user).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationStore {
    root: PathBuf,
}

impl RegistrationStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn record_path(&self, bundle_id: &str) -> PathBuf {
        self.root.join(format!("{}.registration", file_stem(bundle_id)))
    }

    pub fn state_path(&self, bundle_id: &str) -> PathBuf {
        self.root.join(format!("{}.state", file_stem(bundle_id)))
    }

    pub fn write(&self, record: &RegistrationRecord) -> Result<PathBuf> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("failed to create {}", self.root.display()))?;
        let path = self.record_path(&record.bundle_id);
        fs::write(&path, record.to_receipt())
            .with_context(|| format!("failed to write registration: {}", path.display()))?;
        Ok(path)
    }

    pub fn read(&self, bundle_id: &str) -> Result<Option<RegistrationRecord>> {
        let path = self.record_path(bundle_id);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read registration: {}", path.display()))
            }
        };
        RegistrationRecord::parse(&raw)
            .map(Some)
            .with_context(|| format!("failed to parse registration: {}", path.display()))
    }

    pub fn remove(&self, bundle_id: &str) -> Result<()> {
        for path in [self.record_path(bundle_id), self.state_path(bundle_id)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to remove {}", path.display()))
                }
            }
        }
        Ok(())
    }

    /// Every readable record in the store. Unparseable files are skipped with
    /// a warning so one corrupt registration cannot block detection.
    pub fn list(&self) -> Result<Vec<RegistrationRecord>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        for entry in fs::read_dir(&self.root)
            .with_context(|| format!("failed to read {}", self.root.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("registration") {
                continue;
            }
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("failed to read registration: {}", path.display()))?;
            match RegistrationRecord::parse(&raw) {
                Ok(record) => records.push(record),
                Err(err) => warn!(path = %path.display(), "skipping registration: {err:#}"),
            }
        }
        records.sort_by(|a, b| a.bundle_id.cmp(&b.bundle_id));
        Ok(records)
    }

    pub fn save_state(&self, bundle_id: &str, state: &[u8]) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("failed to create {}", self.root.display()))?;
        let path = self.state_path(bundle_id);
        fs::write(&path, state).with_context(|| format!("failed to write {}", path.display()))
    }

    pub fn load_state(&self, bundle_id: &str) -> Result<Option<Vec<u8>>> {
        let path = self.state_path(bundle_id);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    /// Registers the bundle as mid-apply so an interrupted session is
    /// recognized on the next launch.
    pub fn session_begin(&self, mut record: RegistrationRecord) -> Result<RegistrationRecord> {
        record.resume = ResumeMode::Active;
        record.boot_id = None;
        self.write(&record)?;
        debug!(bundle = %record.bundle_id, "session begun");
        Ok(record)
    }

    pub fn session_resume(&self, bundle_id: &str) -> Result<RegistrationRecord> {
        let mut record = self
            .read(bundle_id)?
            .with_context(|| format!("no registration to resume for bundle '{bundle_id}'"))?;
        record.resume = ResumeMode::Active;
        self.write(&record)?;
        Ok(record)
    }

    /// Finishes a session. A kept registration becomes ARP (or
    /// RebootPending when a restart is outstanding); otherwise it is removed.
    pub fn session_end(&self, bundle_id: &str, end: SessionEnd) -> Result<()> {
        if !end.keep_registration {
            self.remove(bundle_id)?;
            debug!(bundle = bundle_id, "registration removed");
            return Ok(());
        }

        let mut record = self
            .read(bundle_id)?
            .with_context(|| format!("no registration to finish for bundle '{bundle_id}'"))?;
        record.installed = true;
        match end.reboot_boot_id {
            Some(boot_id) => {
                record.resume = ResumeMode::RebootPending;
                record.boot_id = Some(boot_id);
            }
            None => {
                record.resume = ResumeMode::Arp;
                record.boot_id = None;
            }
        }
        self.write(&record)?;
        debug!(bundle = bundle_id, resume = record.resume.as_str(), "session ended");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionEnd {
    pub keep_registration: bool,
    /// Boot identity to record when a restart is pending.
    pub reboot_boot_id: Option<String>,
}

/// Why this launch follows an earlier one. A pending restart that has since
/// happened no longer counts.
pub fn resume_mode(record: Option<&RegistrationRecord>, current_boot_id: &str) -> ResumeMode {
    let Some(record) = record else {
        return ResumeMode::None;
    };
    match record.resume {
        ResumeMode::RebootPending
            if record.boot_id.as_deref() != Some(current_boot_id) =>
        {
            if record.installed {
                ResumeMode::Arp
            } else {
                ResumeMode::None
            }
        }
        mode => mode,
    }
}

/// Classifies another registered bundle against this one's codes: its
/// upgrade codes are looked up in our detect, upgrade, addon and patch code
/// lists, in that order.
pub fn relation_to(registration: &Registration, other: &RegistrationRecord) -> RelationType {
    let shares = |codes: &[String]| {
        other
            .upgrade_codes
            .iter()
            .any(|code| codes.iter().any(|ours| ours.eq_ignore_ascii_case(code)))
    };
    if shares(&registration.detect_codes) {
        RelationType::Detect
    } else if shares(&registration.upgrade_codes) {
        RelationType::Upgrade
    } else if shares(&registration.addon_codes) {
        RelationType::Addon
    } else if shares(&registration.patch_codes) {
        RelationType::Patch
    } else {
        RelationType::None
    }
}

/// Finds related bundles across the given stores. Each becomes a Burn
/// protocol EXE package that runs the other bundle's cached executable.
pub fn detect_related_bundles(
    registration: &Registration,
    stores: &[&RegistrationStore],
) -> Result<Vec<RelatedBundle>> {
    let mut related = Vec::new();
    for store in stores {
        for record in store.list()? {
            if record.bundle_id == registration.bundle_id {
                continue;
            }
            let relation = relation_to(registration, &record);
            if relation == RelationType::None {
                continue;
            }
            debug!(
                bundle = %record.bundle_id,
                relation = relation.as_str(),
                version = %format_version(record.version),
                "found related bundle"
            );
            related.push(related_bundle_from(record, relation));
        }
    }
    Ok(related)
}

fn related_bundle_from(record: RegistrationRecord, relation: RelationType) -> RelatedBundle {
    let mut package = Package::new(
        record.bundle_id.clone(),
        PackageKind::Exe(ExePackage {
            detect_condition: None,
            install_arguments: "-quiet".to_string(),
            repair_arguments: Some("-repair -quiet".to_string()),
            uninstall_arguments: Some("-uninstall -quiet".to_string()),
            repairable: true,
            protocol: ExeProtocol::Burn,
            exit_codes: Vec::new(),
        }),
    );
    package.per_machine = record.per_machine;
    package.current_state = PackageState::Present;
    package.cached = record.cached_executable.is_some();
    RelatedBundle {
        bundle_id: record.bundle_id,
        relation,
        version: record.version,
        executable: record.cached_executable,
        package,
    }
}

/// Identity of the current boot, compared against the one recorded with a
/// pending restart.
pub fn current_boot_id() -> String {
    if cfg!(target_os = "linux") {
        if let Ok(raw) = fs::read_to_string("/proc/sys/kernel/random/boot_id") {
            return raw.trim().to_string();
        }
    }
    if cfg!(windows) {
        let output = Command::new("powershell")
            .arg("-NoProfile")
            .arg("-Command")
            .arg("(Get-CimInstance Win32_OperatingSystem).LastBootUpTime.ToFileTimeUtc()")
            .output();
        if let Ok(output) = output {
            if output.status.success() {
                return String::from_utf8_lossy(&output.stdout).trim().to_string();
            }
        }
    }
    "unknown".to_string()
}

fn file_stem(bundle_id: &str) -> String {
    bundle_id
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | '{' | '}') {
                ch
            } else {
                '_'
            }
        })
        .collect()
}
