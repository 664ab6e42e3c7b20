use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PackageType {
    Exe,
    Msi,
    Msp,
    Msu,
}

impl PackageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exe => "exe",
            Self::Msi => "msi",
            Self::Msp => "msp",
            Self::Msu => "msu",
        }
    }
}

/// Installed state found by detect.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PackageState {
    #[default]
    Unknown,
    Obsolete,
    Absent,
    Cached,
    Present,
    Superseded,
}

impl PackageState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Obsolete => "obsolete",
            Self::Absent => "absent",
            Self::Cached => "cached",
            Self::Present => "present",
            Self::Superseded => "superseded",
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Unknown),
            1 => Some(Self::Obsolete),
            2 => Some(Self::Absent),
            3 => Some(Self::Cached),
            4 => Some(Self::Present),
            5 => Some(Self::Superseded),
            _ => None,
        }
    }

    pub fn code(self) -> u32 {
        self as u32
    }
}

/// What planning asks for a package.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RequestState {
    #[default]
    None,
    Absent,
    Cache,
    Present,
    Repair,
}

impl RequestState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Absent => "absent",
            Self::Cache => "cache",
            Self::Present => "present",
            Self::Repair => "repair",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ActionState {
    #[default]
    None,
    Uninstall,
    Install,
    Modify,
    Repair,
    Recache,
    MinorUpgrade,
    MajorUpgrade,
    Patch,
}

impl ActionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Uninstall => "uninstall",
            Self::Install => "install",
            Self::Modify => "modify",
            Self::Repair => "repair",
            Self::Recache => "recache",
            Self::MinorUpgrade => "minor-upgrade",
            Self::MajorUpgrade => "major-upgrade",
            Self::Patch => "patch",
        }
    }

    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::None),
            1 => Some(Self::Uninstall),
            2 => Some(Self::Install),
            3 => Some(Self::Modify),
            4 => Some(Self::Repair),
            5 => Some(Self::Recache),
            6 => Some(Self::MinorUpgrade),
            7 => Some(Self::MajorUpgrade),
            8 => Some(Self::Patch),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FeatureState {
    #[default]
    Unknown,
    Absent,
    Advertised,
    Local,
    Source,
}

impl FeatureState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Absent => "absent",
            Self::Advertised => "advertised",
            Self::Local => "local",
            Self::Source => "source",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum FeatureAction {
    #[default]
    None,
    AddLocal,
    AddSource,
    Reinstall,
    Advertise,
    Remove,
}

impl FeatureAction {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::None),
            1 => Some(Self::AddLocal),
            2 => Some(Self::AddSource),
            3 => Some(Self::Reinstall),
            4 => Some(Self::Advertise),
            5 => Some(Self::Remove),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    No,
    #[default]
    Yes,
    Always,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyProvider {
    pub key: String,
    pub version: Option<String>,
    pub display_name: Option<String>,
    /// Registered by the package itself (an MSI does this); the engine only
    /// adds and removes dependents for imported providers.
    #[serde(default)]
    pub imported: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ExitCodeKind {
    Success,
    Error,
    ScheduleReboot,
    ForceReboot,
}

/// Maps an EXE exit code to an outcome. `code = None` matches any code not
/// listed explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitCode {
    pub code: Option<u32>,
    pub behavior: ExitCodeKind,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExeProtocol {
    #[default]
    None,
    Burn,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExePackage {
    pub detect_condition: Option<String>,
    pub install_arguments: String,
    pub repair_arguments: Option<String>,
    pub uninstall_arguments: Option<String>,
    pub repairable: bool,
    pub protocol: ExeProtocol,
    pub exit_codes: Vec<ExitCode>,
}

impl ExePackage {
    pub fn classify_exit_code(&self, code: u32) -> ExitCodeKind {
        classify_exit_code(&self.exit_codes, code)
    }
}

/// Default exit code handling: 0 succeeds, 3010 schedules a reboot, 1641
/// forces one, everything else is an error. Explicit entries win, then the
/// defaults, then a wildcard entry.
pub fn classify_exit_code(exit_codes: &[ExitCode], code: u32) -> ExitCodeKind {
    if let Some(entry) = exit_codes.iter().find(|entry| entry.code == Some(code)) {
        return entry.behavior;
    }
    match code {
        0 => ExitCodeKind::Success,
        3010 => ExitCodeKind::ScheduleReboot,
        1641 => ExitCodeKind::ForceReboot,
        _ => exit_codes
            .iter()
            .find(|entry| entry.code.is_none())
            .map(|entry| entry.behavior)
            .unwrap_or(ExitCodeKind::Error),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsiProperty {
    pub id: String,
    pub value: String,
    pub rollback_value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MsiFeature {
    pub id: String,
    pub add_local_condition: Option<String>,
    pub add_source_condition: Option<String>,
    pub advertise_condition: Option<String>,
    pub current: FeatureState,
    pub expected: Option<FeatureState>,
    pub requested: FeatureState,
    pub execute: FeatureAction,
    pub rollback: FeatureAction,
}

impl MsiFeature {
    pub fn has_conditions(&self) -> bool {
        self.add_local_condition.is_some()
            || self.add_source_condition.is_some()
            || self.advertise_condition.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RelatedMsi {
    pub upgrade_code: String,
    pub min_version: Option<u64>,
    pub max_version: Option<u64>,
    pub min_inclusive: bool,
    pub max_inclusive: bool,
    pub only_detect: bool,
}

impl RelatedMsi {
    pub fn version_in_range(&self, version: u64) -> bool {
        if let Some(min) = self.min_version {
            if version < min || (!self.min_inclusive && version == min) {
                return false;
            }
        }
        if let Some(max) = self.max_version {
            if version > max || (!self.max_inclusive && version == max) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsiPackage {
    pub product_code: String,
    pub upgrade_code: Option<String>,
    pub version: u64,
    pub installed_version: Option<u64>,
    pub properties: Vec<MsiProperty>,
    pub features: Vec<MsiFeature>,
    pub related_msis: Vec<RelatedMsi>,
    /// Indexes of MSP packages applied with this MSI's install.
    pub slipstream_msps: Vec<usize>,
    /// Set by detect when an older product with a matching upgrade code is
    /// installed.
    pub major_upgrade_detected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MspTarget {
    pub product_code: String,
    pub per_machine: bool,
    pub state: PackageState,
    pub execute: ActionState,
    pub rollback: ActionState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MspPackage {
    pub patch_code: String,
    pub targets: Vec<MspTarget>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsuPackage {
    pub detect_condition: Option<String>,
    pub kb: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageKind {
    Exe(ExePackage),
    Msi(MsiPackage),
    Msp(MspPackage),
    Msu(MsuPackage),
}

impl PackageKind {
    pub fn package_type(&self) -> PackageType {
        match self {
            Self::Exe(_) => PackageType::Exe,
            Self::Msi(_) => PackageType::Msi,
            Self::Msp(_) => PackageType::Msp,
            Self::Msu(_) => PackageType::Msu,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub id: String,
    pub per_machine: bool,
    pub cache_id: String,
    pub cache_type: CacheType,
    pub permanent: bool,
    pub vital: bool,
    pub install_condition: Option<String>,
    pub rollback_boundary: Option<usize>,
    pub size: u64,
    pub payloads: Vec<usize>,
    pub providers: Vec<DependencyProvider>,
    pub kind: PackageKind,

    pub current_state: PackageState,
    pub expected_state: Option<PackageState>,
    pub cached: bool,
    pub bundle_is_dependent: bool,
    pub other_dependents: bool,
    pub default_requested: RequestState,
    pub requested: RequestState,
    pub execute: ActionState,
    pub rollback: ActionState,
    pub dependency_execute: DependencyAction,
    pub dependency_rollback: DependencyAction,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DependencyAction {
    #[default]
    None,
    Register,
    Unregister,
}

impl DependencyAction {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::None),
            1 => Some(Self::Register),
            2 => Some(Self::Unregister),
            _ => None,
        }
    }
}

impl Package {
    pub fn new(id: impl Into<String>, kind: PackageKind) -> Self {
        let id = id.into();
        Self {
            cache_id: id.clone(),
            id,
            per_machine: false,
            cache_type: CacheType::Yes,
            permanent: false,
            vital: true,
            install_condition: None,
            rollback_boundary: None,
            size: 0,
            payloads: Vec::new(),
            providers: Vec::new(),
            kind,
            current_state: PackageState::Unknown,
            expected_state: None,
            cached: false,
            bundle_is_dependent: false,
            other_dependents: false,
            default_requested: RequestState::None,
            requested: RequestState::None,
            execute: ActionState::None,
            rollback: ActionState::None,
            dependency_execute: DependencyAction::None,
            dependency_rollback: DependencyAction::None,
        }
    }

    pub fn package_type(&self) -> PackageType {
        self.kind.package_type()
    }

    pub fn uninstallable(&self) -> bool {
        !self.permanent
    }

    /// Rollback calculations start from the state the package is expected
    /// to reach, falling back to the state detect found.
    pub fn rollback_basis(&self) -> PackageState {
        self.expected_state.unwrap_or(self.current_state)
    }

    pub fn reset_plan(&mut self) {
        self.default_requested = RequestState::None;
        self.requested = RequestState::None;
        self.execute = ActionState::None;
        self.rollback = ActionState::None;
        self.dependency_execute = DependencyAction::None;
        self.dependency_rollback = DependencyAction::None;
        match &mut self.kind {
            PackageKind::Msi(msi) => {
                for feature in &mut msi.features {
                    feature.requested = FeatureState::Unknown;
                    feature.execute = FeatureAction::None;
                    feature.rollback = FeatureAction::None;
                }
            }
            PackageKind::Msp(msp) => {
                for target in &mut msp.targets {
                    target.execute = ActionState::None;
                    target.rollback = ActionState::None;
                }
            }
            PackageKind::Exe(_) | PackageKind::Msu(_) => {}
        }
    }

    /// Providers the engine registers itself, excluding those the package
    /// registers on its own.
    pub fn owned_providers(&self) -> impl Iterator<Item = &DependencyProvider> {
        self.providers.iter().filter(|provider| !provider.imported)
    }
}
