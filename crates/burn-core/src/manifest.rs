use std::collections::HashSet;

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};

use crate::bundle::Bundle;
use crate::package::{
    CacheType, DependencyProvider, ExePackage, ExeProtocol, ExitCode, MsiFeature, MsiPackage,
    MsiProperty, MspPackage, MspTarget, MsuPackage, Package, PackageKind, PackageState,
    PackageType, RelatedMsi,
};
use crate::payload::{Catalog, Container, Packaging, Payload, RollbackBoundary, Verification};
use crate::registration::Registration;
use crate::variables::{
    Variables, VARIABLE_BUNDLE_NAME, VARIABLE_BUNDLE_PROVIDER_KEY, VARIABLE_BUNDLE_VERSION,
};
use crate::variant::{parse_version_string, Variant};

/// Authored description of a bundle, loaded from TOML.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BundleManifest {
    pub bundle: BundleSection,
    #[serde(default)]
    pub variables: Vec<VariableManifest>,
    #[serde(default)]
    pub containers: Vec<ContainerManifest>,
    #[serde(default)]
    pub payloads: Vec<PayloadManifest>,
    #[serde(default)]
    pub catalogs: Vec<CatalogManifest>,
    #[serde(default)]
    pub rollback_boundaries: Vec<RollbackBoundaryManifest>,
    #[serde(default)]
    pub packages: Vec<PackageManifest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BundleSection {
    pub id: String,
    pub provider_key: String,
    pub name: String,
    pub version: String,
    pub publisher: Option<String>,
    #[serde(default)]
    pub per_machine: bool,
    pub executable: Option<String>,
    #[serde(default)]
    pub upgrade_codes: Vec<String>,
    #[serde(default)]
    pub addon_codes: Vec<String>,
    #[serde(default)]
    pub patch_codes: Vec<String>,
    #[serde(default)]
    pub detect_codes: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    #[default]
    String,
    Numeric,
    Version,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VariableManifest {
    pub name: String,
    pub value: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: VariableType,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub persisted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerManifest {
    pub id: String,
    pub file: String,
    #[serde(default)]
    pub attached: bool,
    #[serde(default)]
    pub size: u64,
    pub download_url: Option<String>,
    pub hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PayloadManifest {
    pub key: String,
    pub file: String,
    #[serde(default)]
    pub size: u64,
    pub container: Option<String>,
    pub source: Option<String>,
    pub download_url: Option<String>,
    pub hash: Option<String>,
    pub certificate_public_key_id: Option<String>,
    pub certificate_thumbprint: Option<String>,
    pub catalog: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CatalogManifest {
    pub id: String,
    pub payload: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RollbackBoundaryManifest {
    pub id: String,
    #[serde(default = "default_true")]
    pub vital: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeatureManifest {
    pub id: String,
    pub add_local: Option<String>,
    pub add_source: Option<String>,
    pub advertise: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelatedMsiManifest {
    pub upgrade_code: String,
    pub min_version: Option<String>,
    pub max_version: Option<String>,
    #[serde(default = "default_true")]
    pub min_inclusive: bool,
    #[serde(default)]
    pub max_inclusive: bool,
    #[serde(default)]
    pub only_detect: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageManifest {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: PackageType,
    pub cache_id: Option<String>,
    #[serde(default)]
    pub per_machine: bool,
    #[serde(default)]
    pub cache: CacheType,
    #[serde(default)]
    pub permanent: bool,
    #[serde(default = "default_true")]
    pub vital: bool,
    pub install_condition: Option<String>,
    pub rollback_boundary: Option<String>,
    #[serde(default)]
    pub payloads: Vec<String>,
    #[serde(default)]
    pub providers: Vec<DependencyProvider>,

    // exe
    pub detect_condition: Option<String>,
    pub install_arguments: Option<String>,
    pub repair_arguments: Option<String>,
    pub uninstall_arguments: Option<String>,
    #[serde(default)]
    pub repairable: bool,
    #[serde(default)]
    pub protocol: ExeProtocol,
    #[serde(default)]
    pub exit_codes: Vec<ExitCode>,

    // msi
    pub product_code: Option<String>,
    pub upgrade_code: Option<String>,
    pub version: Option<String>,
    #[serde(default)]
    pub properties: Vec<MsiProperty>,
    #[serde(default)]
    pub features: Vec<FeatureManifest>,
    #[serde(default)]
    pub related_msis: Vec<RelatedMsiManifest>,
    #[serde(default)]
    pub slipstream_msps: Vec<String>,

    // msp
    pub patch_code: Option<String>,
    #[serde(default)]
    pub target_product_codes: Vec<String>,

    // msu
    pub kb: Option<String>,
}

fn default_true() -> bool {
    true
}

impl BundleManifest {
    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        let manifest: Self = toml::from_str(input).context("failed to parse bundle manifest")?;
        if manifest.bundle.id.trim().is_empty() {
            return Err(anyhow!("bundle id must not be empty"));
        }
        if manifest.bundle.provider_key.trim().is_empty() {
            return Err(anyhow!(
                "bundle '{}' provider key must not be empty",
                manifest.bundle.id
            ));
        }
        ensure_unique("package", manifest.packages.iter().map(|p| p.id.as_str()))?;
        ensure_unique("payload", manifest.payloads.iter().map(|p| p.key.as_str()))?;
        ensure_unique("container", manifest.containers.iter().map(|c| c.id.as_str()))?;
        ensure_unique("catalog", manifest.catalogs.iter().map(|c| c.id.as_str()))?;
        ensure_unique(
            "rollback boundary",
            manifest.rollback_boundaries.iter().map(|b| b.id.as_str()),
        )?;
        Ok(manifest)
    }

    /// Resolves cross references by key and builds the runtime model.
    pub fn into_bundle(self) -> anyhow::Result<Bundle> {
        let bundle_version = parse_manifest_version(&self.bundle.version)
            .with_context(|| format!("invalid version for bundle '{}'", self.bundle.id))?;

        let containers = self
            .containers
            .iter()
            .map(|container| Container {
                id: container.id.clone(),
                file_path: container.file.clone(),
                primary: container.attached,
                size: container.size,
                download_url: container.download_url.clone(),
                hash: container.hash.clone(),
            })
            .collect::<Vec<_>>();

        let mut payloads = Vec::with_capacity(self.payloads.len());
        for payload in &self.payloads {
            let container = match &payload.container {
                Some(id) => Some(
                    containers
                        .iter()
                        .position(|container| &container.id == id)
                        .ok_or_else(|| {
                            anyhow!(
                                "payload '{}' references unknown container '{id}'",
                                payload.key
                            )
                        })?,
                ),
                None => None,
            };
            let packaging = if container.is_some() {
                Packaging::Embedded
            } else if payload.download_url.is_some() {
                Packaging::Download
            } else {
                Packaging::External
            };
            payloads.push(Payload {
                key: payload.key.clone(),
                file_path: payload.file.clone(),
                size: payload.size,
                verification: Verification {
                    certificate_public_key_id: payload.certificate_public_key_id.clone(),
                    certificate_thumbprint: payload.certificate_thumbprint.clone(),
                    catalog: None,
                    hash: payload.hash.clone(),
                },
                packaging,
                container,
                source_path: payload.source.clone(),
                download_url: payload.download_url.clone(),
                cached: false,
            });
        }

        let mut catalogs = Vec::with_capacity(self.catalogs.len());
        for catalog in &self.catalogs {
            let payload = find_key(&payloads, &catalog.payload).ok_or_else(|| {
                anyhow!(
                    "catalog '{}' references unknown payload '{}'",
                    catalog.id,
                    catalog.payload
                )
            })?;
            catalogs.push(Catalog {
                id: catalog.id.clone(),
                payload,
            });
        }
        for (manifest, payload) in self.payloads.iter().zip(payloads.iter_mut()) {
            if let Some(id) = &manifest.catalog {
                payload.verification.catalog = Some(
                    catalogs
                        .iter()
                        .position(|catalog| &catalog.id == id)
                        .ok_or_else(|| {
                            anyhow!("payload '{}' references unknown catalog '{id}'", manifest.key)
                        })?,
                );
            }
            if payload.verification.is_empty() {
                return Err(anyhow!(
                    "payload '{}' must declare a hash, certificate or catalog",
                    payload.key
                ));
            }
        }

        let rollback_boundaries = self
            .rollback_boundaries
            .iter()
            .map(|boundary| RollbackBoundary {
                id: boundary.id.clone(),
                vital: boundary.vital,
            })
            .collect::<Vec<_>>();

        let mut packages = Vec::with_capacity(self.packages.len());
        for manifest in &self.packages {
            let package = build_package(manifest, &payloads, &rollback_boundaries)
                .with_context(|| format!("invalid package '{}'", manifest.id))?;
            packages.push(package);
        }
        for (index, manifest) in self.packages.iter().enumerate() {
            let mut slipstream = Vec::new();
            for id in &manifest.slipstream_msps {
                let target = self
                    .packages
                    .iter()
                    .position(|package| &package.id == id && package.kind == PackageType::Msp)
                    .ok_or_else(|| {
                        anyhow!(
                            "package '{}' slipstreams unknown MSP package '{id}'",
                            manifest.id
                        )
                    })?;
                slipstream.push(target);
            }
            if let PackageKind::Msi(msi) = &mut packages[index].kind {
                msi.slipstream_msps = slipstream;
            }
        }

        let mut variables = Variables::new();
        for variable in &self.variables {
            let value = match (&variable.value, variable.kind) {
                (None, _) => Variant::None,
                (Some(raw), VariableType::String) => Variant::String(raw.clone()),
                (Some(raw), VariableType::Numeric) => Variant::Numeric(
                    raw.trim()
                        .parse::<i64>()
                        .with_context(|| format!("variable '{}' is not numeric", variable.name))?,
                ),
                (Some(raw), VariableType::Version) => Variant::Version(
                    parse_manifest_version(raw)
                        .with_context(|| format!("variable '{}' is not a version", variable.name))?,
                ),
            };
            if variable.persisted {
                variables.set_persisted(&variable.name, value)?;
            } else {
                variables.set(&variable.name, value)?;
            }
            variables.set_hidden(&variable.name, variable.hidden);
        }
        variables.set_built_in(VARIABLE_BUNDLE_NAME, self.bundle.name.as_str());
        variables.set_built_in(VARIABLE_BUNDLE_PROVIDER_KEY, self.bundle.provider_key.as_str());
        variables.set_built_in(VARIABLE_BUNDLE_VERSION, Variant::Version(bundle_version));

        let registration = Registration {
            bundle_id: self.bundle.id.clone(),
            provider_key: self.bundle.provider_key.clone(),
            version: bundle_version,
            display_name: self.bundle.name.clone(),
            publisher: self.bundle.publisher.clone(),
            per_machine: self.bundle.per_machine,
            executable_name: self
                .bundle
                .executable
                .clone()
                .unwrap_or_else(|| format!("{}.exe", self.bundle.name)),
            upgrade_codes: self.bundle.upgrade_codes.clone(),
            addon_codes: self.bundle.addon_codes.clone(),
            patch_codes: self.bundle.patch_codes.clone(),
            detect_codes: self.bundle.detect_codes.clone(),
            ..Registration::default()
        };

        Ok(Bundle {
            registration,
            packages,
            payloads,
            containers,
            catalogs,
            rollback_boundaries,
            variables,
        })
    }
}

fn build_package(
    manifest: &PackageManifest,
    payloads: &[Payload],
    boundaries: &[RollbackBoundary],
) -> anyhow::Result<Package> {
    let kind = match manifest.kind {
        PackageType::Exe => PackageKind::Exe(ExePackage {
            detect_condition: manifest.detect_condition.clone(),
            install_arguments: manifest.install_arguments.clone().unwrap_or_default(),
            repair_arguments: manifest.repair_arguments.clone(),
            uninstall_arguments: manifest.uninstall_arguments.clone(),
            repairable: manifest.repairable,
            protocol: manifest.protocol,
            exit_codes: manifest.exit_codes.clone(),
        }),
        PackageType::Msi => {
            let product_code = manifest
                .product_code
                .clone()
                .context("msi package requires product_code")?;
            let version = manifest
                .version
                .as_deref()
                .context("msi package requires version")
                .and_then(parse_manifest_version)?;
            let mut related_msis = Vec::with_capacity(manifest.related_msis.len());
            for related in &manifest.related_msis {
                related_msis.push(RelatedMsi {
                    upgrade_code: related.upgrade_code.clone(),
                    min_version: related
                        .min_version
                        .as_deref()
                        .map(parse_manifest_version)
                        .transpose()?,
                    max_version: related
                        .max_version
                        .as_deref()
                        .map(parse_manifest_version)
                        .transpose()?,
                    min_inclusive: related.min_inclusive,
                    max_inclusive: related.max_inclusive,
                    only_detect: related.only_detect,
                });
            }
            PackageKind::Msi(MsiPackage {
                product_code,
                upgrade_code: manifest.upgrade_code.clone(),
                version,
                installed_version: None,
                properties: manifest.properties.clone(),
                features: manifest
                    .features
                    .iter()
                    .map(|feature| MsiFeature {
                        id: feature.id.clone(),
                        add_local_condition: feature.add_local.clone(),
                        add_source_condition: feature.add_source.clone(),
                        advertise_condition: feature.advertise.clone(),
                        ..MsiFeature::default()
                    })
                    .collect(),
                related_msis,
                slipstream_msps: Vec::new(),
                major_upgrade_detected: false,
            })
        }
        PackageType::Msp => PackageKind::Msp(MspPackage {
            patch_code: manifest
                .patch_code
                .clone()
                .context("msp package requires patch_code")?,
            targets: manifest
                .target_product_codes
                .iter()
                .map(|product_code| MspTarget {
                    product_code: product_code.clone(),
                    per_machine: manifest.per_machine,
                    state: PackageState::Unknown,
                    execute: Default::default(),
                    rollback: Default::default(),
                })
                .collect(),
        }),
        PackageType::Msu => PackageKind::Msu(MsuPackage {
            detect_condition: manifest.detect_condition.clone(),
            kb: manifest.kb.clone(),
        }),
    };

    let mut package = Package::new(manifest.id.clone(), kind);
    if let Some(cache_id) = &manifest.cache_id {
        package.cache_id = cache_id.clone();
    }
    package.per_machine = manifest.per_machine || manifest.kind == PackageType::Msu;
    package.cache_type = manifest.cache;
    package.permanent = manifest.permanent;
    package.vital = manifest.vital;
    package.install_condition = manifest.install_condition.clone();
    package.providers = manifest.providers.clone();
    if let Some(id) = &manifest.rollback_boundary {
        package.rollback_boundary = Some(
            boundaries
                .iter()
                .position(|boundary| &boundary.id == id)
                .ok_or_else(|| anyhow!("unknown rollback boundary '{id}'"))?,
        );
    }
    for key in &manifest.payloads {
        let index = find_key(payloads, key).ok_or_else(|| anyhow!("unknown payload '{key}'"))?;
        package.size += payloads[index].size;
        package.payloads.push(index);
    }
    if package.payloads.is_empty() {
        return Err(anyhow!("package must reference at least one payload"));
    }
    Ok(package)
}

fn find_key(payloads: &[Payload], key: &str) -> Option<usize> {
    payloads.iter().position(|payload| payload.key == key)
}

fn parse_manifest_version(raw: &str) -> anyhow::Result<u64> {
    parse_version_string(raw).ok_or_else(|| anyhow!("invalid version '{raw}'"))
}

fn ensure_unique<'a>(what: &str, ids: impl Iterator<Item = &'a str>) -> anyhow::Result<()> {
    let mut seen = HashSet::new();
    for id in ids {
        if id.trim().is_empty() {
            return Err(anyhow!("{what} id must not be empty"));
        }
        if !seen.insert(id) {
            return Err(anyhow!("duplicate {what} declaration '{id}'"));
        }
    }
    Ok(())
}
