use std::path::PathBuf;

use burn_core::{
    ActionState, BundleAction, DependencyAction, FeatureAction, PackageRef, PackageState,
    PackageType, RequestState,
};
use serde::Serialize;

/// Well-known service started around MSU execution.
pub const WINDOWS_UPDATE_SERVICE: &str = "wuauserv";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum CacheAction {
    Checkpoint {
        id: u32,
    },
    PackageStart {
        package: usize,
        payload_count: usize,
        size: u64,
    },
    PackageStop {
        package: usize,
    },
    AcquireCatalog {
        catalog: usize,
    },
    AcquireContainer {
        container: usize,
    },
    ExtractContainer {
        container: usize,
        payloads: Vec<usize>,
    },
    AcquirePayload {
        payload: usize,
    },
    CachePayload {
        package: usize,
        payload: usize,
        #[serde(rename = "move")]
        move_: bool,
    },
    LayoutBundle {
        executable_name: String,
    },
    LayoutPayload {
        package: usize,
        payload: usize,
        #[serde(rename = "move")]
        move_: bool,
    },
    SignalSyncpoint {
        syncpoint: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ExecuteAction {
    Checkpoint {
        id: u32,
    },
    WaitSyncpoint {
        syncpoint: u32,
    },
    UncachePackage {
        package: usize,
    },
    ExePackage {
        package: PackageRef,
        action: ActionState,
    },
    MsiPackage {
        package: usize,
        action: ActionState,
        features: Vec<FeatureAction>,
        slipstream_patches: Vec<usize>,
    },
    MspTarget {
        package: usize,
        product_code: String,
        per_machine: bool,
        action: ActionState,
    },
    MsuPackage {
        package: usize,
        action: ActionState,
    },
    Dependency {
        package: usize,
        action: DependencyAction,
    },
    RollbackBoundary {
        boundary: usize,
    },
    ServiceStart {
        service: String,
    },
    ServiceStop {
        service: String,
    },
}

impl ExecuteAction {
    /// The package an action runs, for actions that run one.
    pub fn package(&self) -> Option<PackageRef> {
        match self {
            Self::ExePackage { package, .. } => Some(*package),
            Self::MsiPackage { package, .. }
            | Self::MspTarget { package, .. }
            | Self::MsuPackage { package, .. }
            | Self::Dependency { package, .. }
            | Self::UncachePackage { package } => Some(PackageRef::Chain(*package)),
            Self::Checkpoint { .. }
            | Self::WaitSyncpoint { .. }
            | Self::RollbackBoundary { .. }
            | Self::ServiceStart { .. }
            | Self::ServiceStop { .. } => None,
        }
    }

    pub fn is_checkpoint(&self) -> bool {
        matches!(self, Self::Checkpoint { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CleanAction {
    pub package: usize,
}

/// What planning decided for one package, kept for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedPackage {
    pub id: String,
    pub package_type: PackageType,
    pub current: PackageState,
    pub requested: RequestState,
    pub execute: ActionState,
    pub rollback: ActionState,
    pub dependency: DependencyAction,
    pub cache: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Plan {
    pub action: BundleAction,
    /// Some action needs the elevated process.
    pub per_machine: bool,
    /// The bundle stays registered once apply completes.
    pub keep_registration: bool,
    pub layout_directory: Option<PathBuf>,
    pub cache_actions: Vec<CacheAction>,
    pub execute_actions: Vec<ExecuteAction>,
    pub rollback_actions: Vec<ExecuteAction>,
    pub clean_actions: Vec<CleanAction>,
    pub syncpoint_count: u32,
    pub cache_size: u64,
    pub execute_package_count: usize,
    pub packages: Vec<PlannedPackage>,
}

impl Plan {
    /// Index in the rollback plan where rollback starts after the execute
    /// action at `failed` fails: the rollback checkpoint paired with the next
    /// execute checkpoint, or the end of the rollback plan.
    pub fn rollback_start(&self, failed: usize) -> usize {
        let next_checkpoint = self
            .execute_actions
            .iter()
            .skip(failed + 1)
            .find_map(|action| match action {
                ExecuteAction::Checkpoint { id } => Some(*id),
                _ => None,
            });
        next_checkpoint
            .and_then(|id| {
                self.rollback_actions.iter().position(
                    |action| matches!(action, ExecuteAction::Checkpoint { id: other } if *other == id),
                )
            })
            .unwrap_or(self.rollback_actions.len())
    }

    /// The boundary enclosing the execute action at `index`, if any.
    pub fn boundary_at(&self, index: usize) -> Option<usize> {
        self.execute_actions
            .iter()
            .take(index + 1)
            .rev()
            .find_map(|action| match action {
                ExecuteAction::RollbackBoundary { boundary } => Some(*boundary),
                _ => None,
            })
    }

    /// Execute plan index of the boundary marker following `index`.
    pub fn next_boundary_after(&self, index: usize) -> Option<usize> {
        self.execute_actions
            .iter()
            .enumerate()
            .skip(index + 1)
            .find(|(_, action)| matches!(action, ExecuteAction::RollbackBoundary { .. }))
            .map(|(position, _)| position)
    }
}
