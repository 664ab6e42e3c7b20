use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::package::Package;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RelationType {
    #[default]
    None,
    Detect,
    Upgrade,
    Addon,
    Patch,
}

impl RelationType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Detect => "detect",
            Self::Upgrade => "upgrade",
            Self::Addon => "addon",
            Self::Patch => "patch",
        }
    }
}

/// Why a bundle is being launched again, read back from its registration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ResumeMode {
    #[default]
    None,
    /// A previous session was interrupted mid-apply.
    Active,
    /// A previous session was suspended on purpose.
    Suspend,
    /// Installed and registered in Add/Remove Programs.
    Arp,
    /// A previous session completed but requires a restart.
    RebootPending,
}

impl ResumeMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Active => "active",
            Self::Suspend => "suspend",
            Self::Arp => "arp",
            Self::RebootPending => "reboot-pending",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(Self::None),
            "active" => Some(Self::Active),
            "suspend" => Some(Self::Suspend),
            "arp" => Some(Self::Arp),
            "reboot-pending" => Some(Self::RebootPending),
            _ => None,
        }
    }
}

/// Another installed bundle found by detect. Its package is an EXE that runs
/// the other bundle's cached executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelatedBundle {
    pub bundle_id: String,
    pub relation: RelationType,
    pub version: u64,
    /// The other bundle's cached executable, run to repair or remove it.
    pub executable: Option<PathBuf>,
    pub package: Package,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Registration {
    pub bundle_id: String,
    pub provider_key: String,
    pub version: u64,
    pub display_name: String,
    pub publisher: Option<String>,
    pub per_machine: bool,
    /// File name the bundle executable is cached under.
    pub executable_name: String,
    pub upgrade_codes: Vec<String>,
    pub addon_codes: Vec<String>,
    pub patch_codes: Vec<String>,
    pub detect_codes: Vec<String>,
    pub resume_command_line: Option<String>,

    pub installed: bool,
    pub resume_mode: ResumeMode,
    pub related_bundles: Vec<RelatedBundle>,
}
