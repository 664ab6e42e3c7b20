//! Command ids used on the elevation, cache and embedded channels.
//!
//! Ids are scoped per channel direction; none collide with the reserved
//! LOG/COMPLETE/TERMINATE values.

// Parent to elevated child.
pub const ELEVATION_SESSION_BEGIN: u32 = 1;
pub const ELEVATION_SESSION_RESUME: u32 = 2;
pub const ELEVATION_SESSION_END: u32 = 3;
pub const ELEVATION_SAVE_STATE: u32 = 4;
pub const ELEVATION_DETECT_RELATED_BUNDLES: u32 = 5;
pub const ELEVATION_EXECUTE_EXE_PACKAGE: u32 = 6;
pub const ELEVATION_EXECUTE_MSI_PACKAGE: u32 = 7;
pub const ELEVATION_EXECUTE_MSP_PACKAGE: u32 = 8;
pub const ELEVATION_EXECUTE_MSU_PACKAGE: u32 = 9;
pub const ELEVATION_EXECUTE_DEPENDENCY: u32 = 10;
pub const ELEVATION_CLEAN_PACKAGE: u32 = 11;
pub const ELEVATION_SERVICE_START: u32 = 12;
pub const ELEVATION_SERVICE_STOP: u32 = 13;

// Parent to elevated child, cache channel.
pub const ELEVATION_CACHE_PAYLOAD: u32 = 20;
pub const ELEVATION_CACHE_CLEANUP: u32 = 21;

// Elevated child to parent while a package runs.
pub const EXECUTE_PROGRESS: u32 = 100;
pub const EXECUTE_ERROR: u32 = 101;
pub const EXECUTE_MSI_MESSAGE: u32 = 102;
pub const EXECUTE_FILES_IN_USE: u32 = 103;

// Embedded child bundle to parent.
pub const EMBEDDED_ERROR: u32 = 200;
pub const EMBEDDED_PROGRESS: u32 = 201;

pub fn name(id: u32) -> &'static str {
    match id {
        ELEVATION_SESSION_BEGIN => "session-begin",
        ELEVATION_SESSION_RESUME => "session-resume",
        ELEVATION_SESSION_END => "session-end",
        ELEVATION_SAVE_STATE => "save-state",
        ELEVATION_DETECT_RELATED_BUNDLES => "detect-related-bundles",
        ELEVATION_EXECUTE_EXE_PACKAGE => "execute-exe-package",
        ELEVATION_EXECUTE_MSI_PACKAGE => "execute-msi-package",
        ELEVATION_EXECUTE_MSP_PACKAGE => "execute-msp-package",
        ELEVATION_EXECUTE_MSU_PACKAGE => "execute-msu-package",
        ELEVATION_EXECUTE_DEPENDENCY => "execute-dependency",
        ELEVATION_CLEAN_PACKAGE => "clean-package",
        ELEVATION_SERVICE_START => "service-start",
        ELEVATION_SERVICE_STOP => "service-stop",
        ELEVATION_CACHE_PAYLOAD => "cache-payload",
        ELEVATION_CACHE_CLEANUP => "cache-cleanup",
        EXECUTE_PROGRESS => "execute-progress",
        EXECUTE_ERROR => "execute-error",
        EXECUTE_MSI_MESSAGE => "execute-msi-message",
        EXECUTE_FILES_IN_USE => "execute-files-in-use",
        EMBEDDED_ERROR => "embedded-error",
        EMBEDDED_PROGRESS => "embedded-progress",
        crate::MESSAGE_LOG => "log",
        crate::MESSAGE_COMPLETE => "complete",
        crate::MESSAGE_TERMINATE => "terminate",
        _ => "unknown",
    }
}
