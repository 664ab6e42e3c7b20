//! Callbacks into the bootstrapper application.
//!
//! Every callback has a default so an application only overrides what it
//! cares about. Results use the Win32 dialog codes so they can cross the
//! engine pipes unchanged.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::package::{ActionState, FeatureState, PackageState, RequestState};
use crate::registration::RelationType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UiResult {
    /// Let the engine apply its default handling.
    #[default]
    NoAction,
    Ok,
    Cancel,
    Abort,
    Retry,
    Ignore,
    Yes,
    No,
}

impl UiResult {
    pub fn code(self) -> u32 {
        match self {
            Self::NoAction => 0,
            Self::Ok => 1,
            Self::Cancel => 2,
            Self::Abort => 3,
            Self::Retry => 4,
            Self::Ignore => 5,
            Self::Yes => 6,
            Self::No => 7,
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            1 => Self::Ok,
            2 => Self::Cancel,
            3 => Self::Abort,
            4 => Self::Retry,
            5 => Self::Ignore,
            6 => Self::Yes,
            7 => Self::No,
            _ => Self::NoAction,
        }
    }

    /// Cancel and Abort both stop the current operation.
    pub fn is_cancel(self) -> bool {
        matches!(self, Self::Cancel | Self::Abort)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BundleAction {
    Layout,
    Uninstall,
    #[default]
    Install,
    Modify,
    Repair,
}

impl BundleAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Layout => "layout",
            Self::Uninstall => "uninstall",
            Self::Install => "install",
            Self::Modify => "modify",
            Self::Repair => "repair",
        }
    }

    /// Value exposed through the `WixBundleAction` variable.
    pub fn code(self) -> i64 {
        match self {
            Self::Layout => 2,
            Self::Uninstall => 3,
            Self::Install => 4,
            Self::Modify => 5,
            Self::Repair => 6,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Restart {
    #[default]
    None,
    Required,
    Initiated,
}

impl Restart {
    pub fn code(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Required => 1,
            Self::Initiated => 2,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::None),
            1 => Some(Self::Required),
            2 => Some(Self::Initiated),
            _ => None,
        }
    }

    /// Keeps the strongest restart requirement.
    pub fn merge(self, other: Self) -> Self {
        self.max(other)
    }
}

impl PartialOrd for Restart {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Restart {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.code().cmp(&other.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelatedOperation {
    None,
    Downgrade,
    MinorUpdate,
    MajorUpgrade,
    Remove,
    Install,
    Repair,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Elevation,
    Windows,
    ExePackage,
    MsiPackage,
    Cache,
}

impl ErrorKind {
    pub fn code(self) -> u32 {
        match self {
            Self::Elevation => 0,
            Self::Windows => 1,
            Self::ExePackage => 2,
            Self::MsiPackage => 3,
            Self::Cache => 4,
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Elevation,
            2 => Self::ExePackage,
            3 => Self::MsiPackage,
            4 => Self::Cache,
            _ => Self::Windows,
        }
    }
}

/// The application answered a callback with Cancel or Abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cancelled by the bootstrapper application")]
pub struct Cancelled;

/// An error reported to the application, which may ask for a retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport<'a> {
    pub kind: ErrorKind,
    pub package_id: Option<&'a str>,
    pub code: u32,
    pub message: &'a str,
    /// Dialog buttons the engine would offer, as `MB_*` flags.
    pub ui_hint: u32,
}

pub trait UserExperience: Send + Sync {
    fn on_detect_begin(&self, _package_count: usize) -> UiResult {
        UiResult::NoAction
    }

    fn on_detect_related_bundle(
        &self,
        _bundle_id: &str,
        _relation: RelationType,
        _version: u64,
        _operation: RelatedOperation,
    ) -> UiResult {
        UiResult::NoAction
    }

    fn on_detect_related_msi_package(
        &self,
        _package_id: &str,
        _product_code: &str,
        _per_machine: bool,
        _version: u64,
        _operation: RelatedOperation,
    ) -> UiResult {
        UiResult::NoAction
    }

    fn on_detect_msi_feature(
        &self,
        _package_id: &str,
        _feature_id: &str,
        _state: FeatureState,
    ) -> UiResult {
        UiResult::NoAction
    }

    fn on_detect_package_complete(&self, _package_id: &str, _state: PackageState) {}

    fn on_detect_complete(&self, _succeeded: bool) {}

    fn on_plan_begin(&self, _package_count: usize) -> UiResult {
        UiResult::NoAction
    }

    fn on_plan_related_bundle(&self, _bundle_id: &str, _requested: &mut RequestState) -> UiResult {
        UiResult::NoAction
    }

    fn on_plan_package_begin(&self, _package_id: &str, _requested: &mut RequestState) -> UiResult {
        UiResult::NoAction
    }

    fn on_plan_msi_feature(
        &self,
        _package_id: &str,
        _feature_id: &str,
        _requested: &mut FeatureState,
    ) -> UiResult {
        UiResult::NoAction
    }

    fn on_plan_package_complete(
        &self,
        _package_id: &str,
        _requested: RequestState,
        _execute: ActionState,
        _rollback: ActionState,
    ) {
    }

    fn on_plan_complete(&self, _succeeded: bool) {}

    fn on_apply_begin(&self) -> UiResult {
        UiResult::NoAction
    }

    fn on_elevate(&self) -> UiResult {
        UiResult::NoAction
    }

    fn on_cache_package_begin(&self, _package_id: &str, _payload_count: usize) -> UiResult {
        UiResult::NoAction
    }

    fn on_cache_package_complete(&self, _package_id: &str, _succeeded: bool) {}

    fn on_cache_progress(&self, _completed_bytes: u64, _total_bytes: u64) -> UiResult {
        UiResult::NoAction
    }

    fn on_execute_package_begin(&self, _package_id: &str, _execute: bool) -> UiResult {
        UiResult::NoAction
    }

    fn on_execute_progress(&self, _package_id: &str, _progress: u32, _overall: u32) -> UiResult {
        UiResult::NoAction
    }

    fn on_execute_msi_message(
        &self,
        _package_id: &str,
        _message_type: u32,
        _ui_hint: u32,
        _message: &str,
    ) -> UiResult {
        UiResult::NoAction
    }

    fn on_execute_msi_files_in_use(&self, _package_id: &str, _files: &[String]) -> UiResult {
        UiResult::NoAction
    }

    fn on_execute_package_complete(
        &self,
        _package_id: &str,
        _status: u32,
        _restart: Restart,
    ) -> UiResult {
        UiResult::NoAction
    }

    fn on_error(&self, _report: &ErrorReport<'_>) -> UiResult {
        UiResult::NoAction
    }

    fn on_apply_complete(&self, _status: u32, _restart: Restart) -> UiResult {
        UiResult::NoAction
    }
}

/// An application that accepts every default.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultUserExperience;

impl UserExperience for DefaultUserExperience {}
