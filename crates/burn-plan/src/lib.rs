mod actions;
mod builder;
mod calculate;
mod related;

pub use actions::{
    CacheAction, CleanAction, ExecuteAction, Plan, PlannedPackage, WINDOWS_UPDATE_SERVICE,
};
pub use builder::{build_plan, PlanBuilder, PlanOptions};
pub use calculate::{
    apply_install_condition, default_requested, dependency_actions, evaluate_optional,
    exe_actions, feature_action, fold_msp_targets, msi_actions, msp_actions, msu_actions,
    plan_package, requested_feature_state, PackageStates,
};
pub use related::{default_related_request, plan_related_bundle, runs_before_chain};
