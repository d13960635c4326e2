//! Pure functions that compute the desired child objects of an application. None of them do any
//! io, so they can be tested without a cluster. Every builder takes the *defaulted* spec.
//!
//! The set of child kinds is closed, and `ChildKind::ORDERED` is the order in which they're applied.
pub mod network_policy;
pub mod pvc;
pub mod service;
pub mod workload;

use crate::application::quantity::{self, QuantityError};
use crate::application::{Application, ApplicationSpec};
use crate::config::OperatorConfig;
use crate::k8s_types::{self, K8sType};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use serde_json::Value;

use std::collections::BTreeMap;
use std::fmt::{self, Display};

pub const APP_LABEL: &str = "app";
/// Present on every child, with the name of the owning application as the value
pub const APPLICATION_LABEL: &str = "siab.io/application";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// The parts of the operator configuration that affect the generated objects
#[derive(Debug, Clone, PartialEq)]
pub struct BuildSettings {
    pub operator_name: String,
    pub mesh_namespace: String,
    pub default_storage_class: String,
}

impl BuildSettings {
    pub fn from_config(config: &OperatorConfig) -> BuildSettings {
        BuildSettings {
            operator_name: config.operator_name.clone(),
            mesh_namespace: config.mesh_namespace.clone(),
            default_storage_class: config.default_storage_class.clone(),
        }
    }
}

impl Default for BuildSettings {
    fn default() -> BuildSettings {
        BuildSettings::from_config(&OperatorConfig::default())
    }
}

#[derive(Debug)]
pub enum BuildError {
    MalformedSpec(String),
    EmptyImage,
    NegativeReplicas(i32),
    InvalidPort(i32),
    InvalidQuantity(QuantityError),
    RequestExceedsLimit {
        resource: &'static str,
        request: String,
        limit: String,
    },
    InvalidSeccompProfile(String),
    InvalidAccessMode(String),
    MissingStorageSize,
    MissingIngressHostname,
    Serialization(serde_json::Error),
}

impl Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BuildError::MalformedSpec(msg) => write!(f, "malformed spec: {}", msg),
            BuildError::EmptyImage => f.write_str("spec.image must not be empty"),
            BuildError::NegativeReplicas(n) => {
                write!(f, "spec.replicas must not be negative, got {}", n)
            }
            BuildError::InvalidPort(port) => {
                write!(f, "port must be between 1 and 65535, got {}", port)
            }
            BuildError::InvalidQuantity(err) => Display::fmt(err, f),
            BuildError::RequestExceedsLimit {
                resource,
                request,
                limit,
            } => write!(
                f,
                "{} request '{}' is greater than the limit '{}'",
                resource, request, limit
            ),
            BuildError::InvalidSeccompProfile(profile) => write!(
                f,
                "invalid seccompProfile '{}', expected RuntimeDefault, Unconfined or localhost/<path>",
                profile
            ),
            BuildError::InvalidAccessMode(mode) => write!(
                f,
                "invalid storage.accessMode '{}', expected ReadWriteOnce, ReadWriteMany or ReadOnlyMany",
                mode
            ),
            BuildError::MissingStorageSize => {
                f.write_str("storage.size is required when storage is enabled")
            }
            BuildError::MissingIngressHostname => {
                f.write_str("ingress.hostname is required when ingress is enabled")
            }
            BuildError::Serialization(err) => write!(f, "failed to serialize object: {}", err),
        }
    }
}

impl std::error::Error for BuildError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BuildError::InvalidQuantity(err) => Some(err),
            BuildError::Serialization(err) => Some(err),
            _ => None,
        }
    }
}

impl From<QuantityError> for BuildError {
    fn from(err: QuantityError) -> BuildError {
        BuildError::InvalidQuantity(err)
    }
}

impl From<serde_json::Error> for BuildError {
    fn from(err: serde_json::Error) -> BuildError {
        BuildError::Serialization(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChildKind {
    Workload,
    NetworkEndpoint,
    NetworkPolicy,
    PersistentVolumeClaim,
}

impl ChildKind {
    /// The order in which children are built and applied
    pub const ORDERED: [ChildKind; 4] = [
        ChildKind::Workload,
        ChildKind::NetworkEndpoint,
        ChildKind::NetworkPolicy,
        ChildKind::PersistentVolumeClaim,
    ];

    pub fn k8s_type(self) -> &'static K8sType {
        match self {
            ChildKind::Workload => k8s_types::apps::v1::Deployment,
            ChildKind::NetworkEndpoint => k8s_types::core::v1::Service,
            ChildKind::NetworkPolicy => k8s_types::networking_k8s_io::v1::NetworkPolicy,
            ChildKind::PersistentVolumeClaim => k8s_types::core::v1::PersistentVolumeClaim,
        }
    }

    pub fn child_name(self, app_name: &str) -> String {
        match self {
            ChildKind::Workload | ChildKind::NetworkEndpoint => app_name.to_owned(),
            ChildKind::NetworkPolicy => network_policy::policy_name(app_name),
            ChildKind::PersistentVolumeClaim => pvc::claim_name(app_name),
        }
    }

    /// Whether the application wants a child of this kind at all
    pub fn is_desired(self, spec: &ApplicationSpec) -> bool {
        match self {
            ChildKind::PersistentVolumeClaim => spec.storage_enabled(),
            _ => true,
        }
    }

    /// Builds the desired object as json, ready to be sent to the api server
    pub fn build(
        self,
        app: &Application,
        spec: &ApplicationSpec,
        settings: &BuildSettings,
    ) -> Result<Value, BuildError> {
        let value = match self {
            ChildKind::Workload => serde_json::to_value(workload::build(app, spec, settings)?)?,
            ChildKind::NetworkEndpoint => {
                serde_json::to_value(service::build(app, spec, settings)?)?
            }
            ChildKind::NetworkPolicy => {
                serde_json::to_value(network_policy::build(app, spec, settings)?)?
            }
            ChildKind::PersistentVolumeClaim => {
                serde_json::to_value(pvc::build(app, spec, settings)?)?
            }
        };
        Ok(value)
    }

    /// Copies fields that the api server assigns, and won't allow to be changed, from the `existing`
    /// object to the `desired` one so that a replace doesn't try to clear them.
    pub fn carry_over_server_fields(self, existing: &Value, desired: &mut Value) {
        let pointers: &[&str] = match self {
            ChildKind::NetworkEndpoint => &["/spec/clusterIP", "/spec/clusterIPs"],
            ChildKind::PersistentVolumeClaim => &["/spec/volumeName"],
            _ => &[],
        };
        for pointer in pointers {
            if desired.pointer(pointer).is_some() {
                continue;
            }
            if let Some(value) = existing.pointer(pointer) {
                let (parent, key) = split_pointer(pointer);
                if let Some(obj) = desired.pointer_mut(parent).and_then(Value::as_object_mut) {
                    obj.insert(key.to_owned(), value.clone());
                }
            }
        }
    }
}

impl Display for ChildKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.k8s_type().kind)
    }
}

fn split_pointer(pointer: &str) -> (&str, &str) {
    match pointer.rfind('/') {
        Some(idx) => (&pointer[..idx], &pointer[(idx + 1)..]),
        None => ("", pointer),
    }
}

/// The labels that identify the workload's pods. Used as the selector of the workload and service.
pub fn selector_labels(app_name: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(APP_LABEL.to_owned(), app_name.to_owned());
    labels.insert(APPLICATION_LABEL.to_owned(), app_name.to_owned());
    labels
}

/// The labels that go on every child object
pub fn labels(app_name: &str, settings: &BuildSettings) -> BTreeMap<String, String> {
    let mut labels = selector_labels(app_name);
    labels.insert(
        MANAGED_BY_LABEL.to_owned(),
        settings.operator_name.clone(),
    );
    labels
}

/// metadata for a child object with the given name, in the same namespace as the application
pub(crate) fn child_metadata(app: &Application, name: String, settings: &BuildSettings) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: Some(app.namespace().to_owned()),
        labels: Some(labels(app.name(), settings)),
        ..Default::default()
    }
}

/// The owner reference that every child carries, which lets the garbage collector delete
/// the children along with the application
pub fn owner_reference(app: &Application) -> OwnerReference {
    OwnerReference {
        api_version: app.api_version().to_owned(),
        kind: app.kind().to_owned(),
        name: app.name().to_owned(),
        uid: app.uid.clone(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

pub(crate) fn validate_port(port: i32) -> Result<i32, BuildError> {
    if (1..=65535).contains(&port) {
        Ok(port)
    } else {
        Err(BuildError::InvalidPort(port))
    }
}

pub(crate) fn validate_quantity(value: &str) -> Result<(), BuildError> {
    quantity::parse(value)?;
    Ok(())
}
