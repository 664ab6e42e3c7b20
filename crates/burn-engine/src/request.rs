//! Flat-buffer schemas for everything the engine sends across a pipe.
//!
//! Every request is self-contained: the receiving process needs no bundle
//! manifest to act on it. Field order is the wire order.

use std::path::PathBuf;

use burn_core::{
    ActionState, BufferReader, BufferWriter, DependencyAction, DependencyProvider, ExitCode,
    ExitCodeKind, FeatureAction, Payload, Verification,
};
use burn_pipe::ids;

use crate::error::RequestError;

const NO_INDEX: u32 = u32::MAX;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExeRequest {
    pub package_id: String,
    pub executable: PathBuf,
    /// Fully formatted command line arguments.
    pub arguments: String,
    /// The same arguments with hidden variables masked.
    pub log_arguments: String,
    /// Launch as an embedded bundle and relay its messages.
    pub burn_protocol: bool,
    pub exit_codes: Vec<ExitCode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsiRequest {
    pub package_id: String,
    pub package_path: Option<PathBuf>,
    pub product_code: String,
    pub action: ActionState,
    pub properties: Vec<(String, String)>,
    pub features: Vec<(String, FeatureAction)>,
    pub patches: Vec<PathBuf>,
    pub log_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MspRequest {
    pub package_id: String,
    pub patch_path: Option<PathBuf>,
    pub patch_code: String,
    pub product_code: String,
    pub action: ActionState,
    pub log_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsuRequest {
    pub package_id: String,
    pub msu_path: Option<PathBuf>,
    pub kb: Option<String>,
    pub action: ActionState,
    pub log_path: Option<PathBuf>,
}

/// One package execution, local or elevated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecuteRequest {
    Exe(ExeRequest),
    Msi(MsiRequest),
    Msp(MspRequest),
    Msu(MsuRequest),
}

impl ExecuteRequest {
    pub fn package_id(&self) -> &str {
        match self {
            Self::Exe(request) => &request.package_id,
            Self::Msi(request) => &request.package_id,
            Self::Msp(request) => &request.package_id,
            Self::Msu(request) => &request.package_id,
        }
    }

    pub fn message_id(&self) -> u32 {
        match self {
            Self::Exe(_) => ids::ELEVATION_EXECUTE_EXE_PACKAGE,
            Self::Msi(_) => ids::ELEVATION_EXECUTE_MSI_PACKAGE,
            Self::Msp(_) => ids::ELEVATION_EXECUTE_MSP_PACKAGE,
            Self::Msu(_) => ids::ELEVATION_EXECUTE_MSU_PACKAGE,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = BufferWriter::new();
        match self {
            Self::Exe(request) => {
                buffer
                    .write_string(&request.package_id)
                    .write_string(&path_text(&request.executable))
                    .write_string(&request.arguments)
                    .write_string(&request.log_arguments)
                    .write_bool(request.burn_protocol)
                    .write_u32(request.exit_codes.len() as u32);
                for exit_code in &request.exit_codes {
                    buffer
                        .write_u32(exit_code.code.unwrap_or(NO_INDEX))
                        .write_bool(exit_code.code.is_some())
                        .write_u32(exit_kind_code(exit_code.behavior));
                }
            }
            Self::Msi(request) => {
                buffer
                    .write_string(&request.package_id)
                    .write_optional_string(request.package_path.as_deref().map(path_text).as_deref())
                    .write_string(&request.product_code)
                    .write_u32(request.action.code())
                    .write_u32(request.properties.len() as u32);
                for (name, value) in &request.properties {
                    buffer.write_string(name).write_string(value);
                }
                buffer.write_u32(request.features.len() as u32);
                for (feature, action) in &request.features {
                    buffer.write_string(feature).write_u32(action.code());
                }
                let patches = request.patches.iter().map(|path| path_text(path)).collect::<Vec<_>>();
                buffer
                    .write_strings(&patches)
                    .write_optional_string(request.log_path.as_deref().map(path_text).as_deref());
            }
            Self::Msp(request) => {
                buffer
                    .write_string(&request.package_id)
                    .write_optional_string(request.patch_path.as_deref().map(path_text).as_deref())
                    .write_string(&request.patch_code)
                    .write_string(&request.product_code)
                    .write_u32(request.action.code())
                    .write_optional_string(request.log_path.as_deref().map(path_text).as_deref());
            }
            Self::Msu(request) => {
                buffer
                    .write_string(&request.package_id)
                    .write_optional_string(request.msu_path.as_deref().map(path_text).as_deref())
                    .write_optional_string(request.kb.as_deref())
                    .write_u32(request.action.code())
                    .write_optional_string(request.log_path.as_deref().map(path_text).as_deref());
            }
        }
        buffer.into_bytes()
    }

    pub fn decode(message_id: u32, data: &[u8]) -> Result<Self, RequestError> {
        let mut reader = BufferReader::new(data);
        let request = match message_id {
            ids::ELEVATION_EXECUTE_EXE_PACKAGE => {
                let package_id = reader.read_string()?;
                let executable = PathBuf::from(reader.read_string()?);
                let arguments = reader.read_string()?;
                let log_arguments = reader.read_string()?;
                let burn_protocol = reader.read_bool()?;
                let count = reader.read_u32()?;
                let mut exit_codes = Vec::new();
                for _ in 0..count {
                    let code = reader.read_u32()?;
                    let has_code = reader.read_bool()?;
                    let behavior = exit_kind_from_code(reader.read_u32()?)?;
                    exit_codes.push(ExitCode {
                        code: has_code.then_some(code),
                        behavior,
                    });
                }
                Self::Exe(ExeRequest {
                    package_id,
                    executable,
                    arguments,
                    log_arguments,
                    burn_protocol,
                    exit_codes,
                })
            }
            ids::ELEVATION_EXECUTE_MSI_PACKAGE => {
                let package_id = reader.read_string()?;
                let package_path = read_optional_path(&mut reader)?;
                let product_code = reader.read_string()?;
                let action = read_action(&mut reader)?;
                let count = reader.read_u32()?;
                let mut properties = Vec::new();
                for _ in 0..count {
                    properties.push((reader.read_string()?, reader.read_string()?));
                }
                let count = reader.read_u32()?;
                let mut features = Vec::new();
                for _ in 0..count {
                    let feature = reader.read_string()?;
                    let value = reader.read_u32()?;
                    let action = FeatureAction::from_code(value).ok_or(RequestError::InvalidValue {
                        field: "feature action",
                        value,
                    })?;
                    features.push((feature, action));
                }
                let patches = reader.read_strings()?.into_iter().map(PathBuf::from).collect();
                let log_path = read_optional_path(&mut reader)?;
                Self::Msi(MsiRequest {
                    package_id,
                    package_path,
                    product_code,
                    action,
                    properties,
                    features,
                    patches,
                    log_path,
                })
            }
            ids::ELEVATION_EXECUTE_MSP_PACKAGE => Self::Msp(MspRequest {
                package_id: reader.read_string()?,
                patch_path: read_optional_path(&mut reader)?,
                patch_code: reader.read_string()?,
                product_code: reader.read_string()?,
                action: read_action(&mut reader)?,
                log_path: read_optional_path(&mut reader)?,
            }),
            ids::ELEVATION_EXECUTE_MSU_PACKAGE => Self::Msu(MsuRequest {
                package_id: reader.read_string()?,
                msu_path: read_optional_path(&mut reader)?,
                kb: reader.read_optional_string()?,
                action: read_action(&mut reader)?,
                log_path: read_optional_path(&mut reader)?,
            }),
            other => return Err(RequestError::UnknownMessage(other)),
        };
        Ok(request)
    }
}

/// Verify a payload and commit it to the cache, or to a layout directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePayloadRequest {
    pub package_id: String,
    pub per_machine: bool,
    pub cache_id: String,
    pub payload_key: String,
    pub file_path: String,
    pub size: u64,
    pub verification: Verification,
    /// Where the catalog named by `verification.catalog` was acquired.
    pub catalog_path: Option<PathBuf>,
    pub unverified: PathBuf,
    pub move_file: bool,
    pub layout_directory: Option<PathBuf>,
}

impl CachePayloadRequest {
    /// The payload as the cache engine sees it.
    pub fn payload(&self) -> Payload {
        Payload {
            key: self.payload_key.clone(),
            file_path: self.file_path.clone(),
            size: self.size,
            verification: self.verification.clone(),
            packaging: Default::default(),
            container: None,
            source_path: None,
            download_url: None,
            cached: false,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = BufferWriter::new();
        buffer
            .write_string(&self.package_id)
            .write_bool(self.per_machine)
            .write_string(&self.cache_id)
            .write_string(&self.payload_key)
            .write_string(&self.file_path)
            .write_u64(self.size)
            .write_optional_string(self.verification.certificate_public_key_id.as_deref())
            .write_optional_string(self.verification.certificate_thumbprint.as_deref())
            .write_u32(
                self.verification
                    .catalog
                    .map_or(NO_INDEX, |catalog| catalog as u32),
            )
            .write_optional_string(self.verification.hash.as_deref())
            .write_optional_string(self.catalog_path.as_deref().map(path_text).as_deref())
            .write_string(&path_text(&self.unverified))
            .write_bool(self.move_file)
            .write_optional_string(self.layout_directory.as_deref().map(path_text).as_deref());
        buffer.into_bytes()
    }

    pub fn decode(data: &[u8]) -> Result<Self, RequestError> {
        let mut reader = BufferReader::new(data);
        let package_id = reader.read_string()?;
        let per_machine = reader.read_bool()?;
        let cache_id = reader.read_string()?;
        let payload_key = reader.read_string()?;
        let file_path = reader.read_string()?;
        let size = reader.read_u64()?;
        let certificate_public_key_id = reader.read_optional_string()?;
        let certificate_thumbprint = reader.read_optional_string()?;
        let catalog = reader.read_u32()?;
        let hash = reader.read_optional_string()?;
        Ok(Self {
            package_id,
            per_machine,
            cache_id,
            payload_key,
            file_path,
            size,
            verification: Verification {
                certificate_public_key_id,
                certificate_thumbprint,
                catalog: (catalog != NO_INDEX).then_some(catalog as usize),
                hash,
            },
            catalog_path: read_optional_path(&mut reader)?,
            unverified: PathBuf::from(reader.read_string()?),
            move_file: reader.read_bool()?,
            layout_directory: read_optional_path(&mut reader)?,
        })
    }
}

/// Registers the bundle and caches its executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionBeginRequest {
    /// Registration record in receipt form.
    pub receipt: String,
    pub executable: Option<PathBuf>,
    pub executable_name: String,
}

impl SessionBeginRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = BufferWriter::new();
        buffer
            .write_string(&self.receipt)
            .write_optional_string(self.executable.as_deref().map(path_text).as_deref())
            .write_string(&self.executable_name);
        buffer.into_bytes()
    }

    pub fn decode(data: &[u8]) -> Result<Self, RequestError> {
        let mut reader = BufferReader::new(data);
        Ok(Self {
            receipt: reader.read_string()?,
            executable: read_optional_path(&mut reader)?,
            executable_name: reader.read_string()?,
        })
    }
}

/// Names a registration in one scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    pub bundle_id: String,
    pub per_machine: bool,
}

impl SessionRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = BufferWriter::new();
        buffer
            .write_string(&self.bundle_id)
            .write_bool(self.per_machine);
        buffer.into_bytes()
    }

    pub fn decode(data: &[u8]) -> Result<Self, RequestError> {
        let mut reader = BufferReader::new(data);
        Ok(Self {
            bundle_id: reader.read_string()?,
            per_machine: reader.read_bool()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEndRequest {
    pub bundle_id: String,
    pub per_machine: bool,
    pub keep_registration: bool,
    pub reboot_pending: bool,
}

impl SessionEndRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = BufferWriter::new();
        buffer
            .write_string(&self.bundle_id)
            .write_bool(self.per_machine)
            .write_bool(self.keep_registration)
            .write_bool(self.reboot_pending);
        buffer.into_bytes()
    }

    pub fn decode(data: &[u8]) -> Result<Self, RequestError> {
        let mut reader = BufferReader::new(data);
        Ok(Self {
            bundle_id: reader.read_string()?,
            per_machine: reader.read_bool()?,
            keep_registration: reader.read_bool()?,
            reboot_pending: reader.read_bool()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveStateRequest {
    pub bundle_id: String,
    pub per_machine: bool,
    pub state: Vec<u8>,
}

impl SaveStateRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = BufferWriter::new();
        buffer
            .write_string(&self.bundle_id)
            .write_bool(self.per_machine)
            .write_bytes(&self.state);
        buffer.into_bytes()
    }

    pub fn decode(data: &[u8]) -> Result<Self, RequestError> {
        let mut reader = BufferReader::new(data);
        Ok(Self {
            bundle_id: reader.read_string()?,
            per_machine: reader.read_bool()?,
            state: reader.read_bytes()?,
        })
    }
}

/// The codes another bundle's registration is matched against.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RelatedBundlesQuery {
    pub bundle_id: String,
    pub upgrade_codes: Vec<String>,
    pub addon_codes: Vec<String>,
    pub patch_codes: Vec<String>,
    pub detect_codes: Vec<String>,
}

impl RelatedBundlesQuery {
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = BufferWriter::new();
        buffer
            .write_string(&self.bundle_id)
            .write_strings(&self.upgrade_codes)
            .write_strings(&self.addon_codes)
            .write_strings(&self.patch_codes)
            .write_strings(&self.detect_codes);
        buffer.into_bytes()
    }

    pub fn decode(data: &[u8]) -> Result<Self, RequestError> {
        let mut reader = BufferReader::new(data);
        Ok(Self {
            bundle_id: reader.read_string()?,
            upgrade_codes: reader.read_strings()?,
            addon_codes: reader.read_strings()?,
            patch_codes: reader.read_strings()?,
            detect_codes: reader.read_strings()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyRequest {
    pub package_id: String,
    pub per_machine: bool,
    pub action: DependencyAction,
    pub dependent: String,
    pub providers: Vec<DependencyProvider>,
}

impl DependencyRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = BufferWriter::new();
        buffer
            .write_string(&self.package_id)
            .write_bool(self.per_machine)
            .write_u32(self.action.code())
            .write_string(&self.dependent)
            .write_u32(self.providers.len() as u32);
        for provider in &self.providers {
            buffer
                .write_string(&provider.key)
                .write_optional_string(provider.version.as_deref())
                .write_optional_string(provider.display_name.as_deref())
                .write_bool(provider.imported);
        }
        buffer.into_bytes()
    }

    pub fn decode(data: &[u8]) -> Result<Self, RequestError> {
        let mut reader = BufferReader::new(data);
        let package_id = reader.read_string()?;
        let per_machine = reader.read_bool()?;
        let value = reader.read_u32()?;
        let action = DependencyAction::from_code(value).ok_or(RequestError::InvalidValue {
            field: "dependency action",
            value,
        })?;
        let dependent = reader.read_string()?;
        let count = reader.read_u32()?;
        let mut providers = Vec::new();
        for _ in 0..count {
            providers.push(DependencyProvider {
                key: reader.read_string()?,
                version: reader.read_optional_string()?,
                display_name: reader.read_optional_string()?,
                imported: reader.read_bool()?,
            });
        }
        Ok(Self {
            package_id,
            per_machine,
            action,
            dependent,
            providers,
        })
    }
}

/// Removes a package's cache directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanRequest {
    pub package_id: String,
    pub per_machine: bool,
    pub cache_id: String,
}

impl CleanRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = BufferWriter::new();
        buffer
            .write_string(&self.package_id)
            .write_bool(self.per_machine)
            .write_string(&self.cache_id);
        buffer.into_bytes()
    }

    pub fn decode(data: &[u8]) -> Result<Self, RequestError> {
        let mut reader = BufferReader::new(data);
        Ok(Self {
            package_id: reader.read_string()?,
            per_machine: reader.read_bool()?,
            cache_id: reader.read_string()?,
        })
    }
}

/// Progress relayed from a running package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressMessage {
    pub progress: u32,
    pub overall: u32,
}

impl ProgressMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = BufferWriter::new();
        buffer.write_u32(self.progress).write_u32(self.overall);
        buffer.into_bytes()
    }

    pub fn decode(data: &[u8]) -> Result<Self, RequestError> {
        let mut reader = BufferReader::new(data);
        Ok(Self {
            progress: reader.read_u32()?,
            overall: reader.read_u32()?,
        })
    }
}

/// An error or installer message relayed from a running package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextMessage {
    /// Error code, or the installer message type.
    pub code: u32,
    pub ui_hint: u32,
    pub text: String,
}

impl TextMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = BufferWriter::new();
        buffer
            .write_u32(self.code)
            .write_u32(self.ui_hint)
            .write_string(&self.text);
        buffer.into_bytes()
    }

    pub fn decode(data: &[u8]) -> Result<Self, RequestError> {
        let mut reader = BufferReader::new(data);
        Ok(Self {
            code: reader.read_u32()?,
            ui_hint: reader.read_u32()?,
            text: reader.read_string()?,
        })
    }
}

pub fn encode_strings(values: &[String]) -> Vec<u8> {
    let mut buffer = BufferWriter::new();
    buffer.write_strings(values);
    buffer.into_bytes()
}

pub fn decode_strings(data: &[u8]) -> Result<Vec<String>, RequestError> {
    Ok(BufferReader::new(data).read_strings()?)
}

pub fn encode_string(value: &str) -> Vec<u8> {
    let mut buffer = BufferWriter::new();
    buffer.write_string(value);
    buffer.into_bytes()
}

pub fn decode_string(data: &[u8]) -> Result<String, RequestError> {
    Ok(BufferReader::new(data).read_string()?)
}

fn path_text(path: &std::path::Path) -> String {
    path.to_string_lossy().into_owned()
}

fn read_optional_path(reader: &mut BufferReader<'_>) -> Result<Option<PathBuf>, RequestError> {
    Ok(reader.read_optional_string()?.map(PathBuf::from))
}

fn read_action(reader: &mut BufferReader<'_>) -> Result<ActionState, RequestError> {
    let value = reader.read_u32()?;
    ActionState::from_code(value).ok_or(RequestError::InvalidValue {
        field: "action",
        value,
    })
}

fn exit_kind_code(kind: ExitCodeKind) -> u32 {
    match kind {
        ExitCodeKind::Success => 0,
        ExitCodeKind::Error => 1,
        ExitCodeKind::ScheduleReboot => 2,
        ExitCodeKind::ForceReboot => 3,
    }
}

fn exit_kind_from_code(value: u32) -> Result<ExitCodeKind, RequestError> {
    match value {
        0 => Ok(ExitCodeKind::Success),
        1 => Ok(ExitCodeKind::Error),
        2 => Ok(ExitCodeKind::ScheduleReboot),
        3 => Ok(ExitCodeKind::ForceReboot),
        _ => Err(RequestError::InvalidValue {
            field: "exit code behavior",
            value,
        }),
    }
}
