mod buffer;
mod bundle;
mod condition;
mod manifest;
mod package;
mod payload;
mod registration;
mod ux;
mod variables;
mod variant;

pub use buffer::{BufferError, BufferReader, BufferWriter};
pub use bundle::{Bundle, PackageRef};
pub use condition::{compare_values, evaluate as evaluate_condition, Comparison, ConditionError};
pub use manifest::{
    BundleManifest, BundleSection, CatalogManifest, ContainerManifest, FeatureManifest,
    PackageManifest, PayloadManifest, RelatedMsiManifest, RollbackBoundaryManifest,
    VariableManifest, VariableType,
};
pub use package::{
    classify_exit_code, ActionState, CacheType, DependencyAction, DependencyProvider, ExePackage, ExeProtocol,
    ExitCode, ExitCodeKind, FeatureAction, FeatureState, MsiFeature, MsiPackage, MsiProperty,
    MspPackage, MspTarget, MsuPackage, Package, PackageKind, PackageState, PackageType,
    RelatedMsi, RequestState,
};
pub use payload::{Catalog, Container, Packaging, Payload, RollbackBoundary, Verification};
pub use registration::{RelatedBundle, RelationType, Registration, ResumeMode};
pub use ux::{
    BundleAction, Cancelled, DefaultUserExperience, ErrorKind, ErrorReport, RelatedOperation,
    Restart, UiResult, UserExperience,
};
pub use variables::{
    VariableError, VariableLookup, Variables, VARIABLE_BUNDLE_ACTION, VARIABLE_BUNDLE_ELEVATED,
    VARIABLE_BUNDLE_INSTALLED, VARIABLE_BUNDLE_NAME, VARIABLE_BUNDLE_PROVIDER_KEY,
    VARIABLE_BUNDLE_VERSION, VARIABLE_REBOOT_PENDING,
};
pub use variant::{format_version, pack_version, parse_version_string, version_parts, Variant};

#[cfg(test)]
mod tests;
