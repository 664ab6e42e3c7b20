use serde::{Deserialize, Serialize};

use crate::package::Package;
use crate::payload::{Catalog, Container, Payload, RollbackBoundary};
use crate::registration::Registration;
use crate::variables::Variables;

/// Points at a package in the chain or at the package wrapping a related
/// bundle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase", tag = "kind", content = "index")]
pub enum PackageRef {
    Chain(usize),
    Related(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Bundle {
    pub registration: Registration,
    pub packages: Vec<Package>,
    pub payloads: Vec<Payload>,
    pub containers: Vec<Container>,
    pub catalogs: Vec<Catalog>,
    pub rollback_boundaries: Vec<RollbackBoundary>,
    pub variables: Variables,
}

impl Bundle {
    pub fn package(&self, reference: PackageRef) -> Option<&Package> {
        match reference {
            PackageRef::Chain(index) => self.packages.get(index),
            PackageRef::Related(index) => self
                .registration
                .related_bundles
                .get(index)
                .map(|related| &related.package),
        }
    }

    pub fn package_mut(&mut self, reference: PackageRef) -> Option<&mut Package> {
        match reference {
            PackageRef::Chain(index) => self.packages.get_mut(index),
            PackageRef::Related(index) => self
                .registration
                .related_bundles
                .get_mut(index)
                .map(|related| &mut related.package),
        }
    }

    pub fn find_package(&self, id: &str) -> Option<usize> {
        self.packages.iter().position(|package| package.id == id)
    }

    pub fn find_related_bundle(&self, bundle_id: &str) -> Option<usize> {
        self.registration
            .related_bundles
            .iter()
            .position(|related| related.bundle_id == bundle_id)
    }

    pub fn find_payload(&self, key: &str) -> Option<usize> {
        self.payloads.iter().position(|payload| payload.key == key)
    }

    pub fn find_container(&self, id: &str) -> Option<usize> {
        self.containers.iter().position(|container| container.id == id)
    }

    pub fn find_catalog(&self, id: &str) -> Option<usize> {
        self.catalogs.iter().position(|catalog| catalog.id == id)
    }

    /// Resolves a package or related bundle by the id used on the wire.
    pub fn resolve_package_id(&self, id: &str) -> Option<PackageRef> {
        self.find_package(id)
            .map(PackageRef::Chain)
            .or_else(|| self.find_related_bundle(id).map(PackageRef::Related))
    }

    pub fn package_id(&self, reference: PackageRef) -> &str {
        match reference {
            PackageRef::Chain(index) => self
                .packages
                .get(index)
                .map(|package| package.id.as_str())
                .unwrap_or_default(),
            PackageRef::Related(index) => self
                .registration
                .related_bundles
                .get(index)
                .map(|related| related.bundle_id.as_str())
                .unwrap_or_default(),
        }
    }
}
