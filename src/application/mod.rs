//! The typed shape of a `SIABApplication`. Every optional field of the spec is an `Option` so that
//! defaulting can tell the difference between "unset" and "explicitly set to the default value".
//! The accessor methods on `ApplicationSpec` return the effective value of a field, falling back to
//! the default when it's unset.
pub mod defaults;
pub mod quantity;

use crate::k8s_types::siab_io::v1alpha1::SIABApplication;
use crate::resource::{str_value, ObjectId, ObjectIdRef};

use k8s_openapi::api::core::v1::EnvVar;
use serde_json::Value;

use std::fmt::{self, Display};

use self::defaults::*;

/// A `SIABApplication` as read from the api server
#[derive(Debug, Clone, PartialEq)]
pub struct Application {
    pub id: ObjectId,
    pub uid: String,
    pub generation: Option<i64>,
    pub spec: ApplicationSpec,
    pub status: ApplicationStatus,
}

impl Application {
    /// Parses an application from the json returned by the api server. Fails if the spec is
    /// missing or malformed. The status is parsed leniently, since it's overwritten anyway.
    pub fn from_value(value: &Value) -> Result<Application, serde_json::Error> {
        let spec = value.get("spec").cloned().unwrap_or(Value::Null);
        let spec: ApplicationSpec = serde_json::from_value(spec)?;
        let status = value
            .get("status")
            .map(ApplicationStatus::from_value)
            .unwrap_or_default();
        let id = ObjectId::new(
            str_value(value, "/metadata/namespace").unwrap_or(""),
            str_value(value, "/metadata/name").unwrap_or(""),
        );
        Ok(Application {
            id,
            uid: str_value(value, "/metadata/uid").unwrap_or("").to_owned(),
            generation: value.pointer("/metadata/generation").and_then(Value::as_i64),
            spec,
            status,
        })
    }

    pub fn name(&self) -> &str {
        self.id.name()
    }

    pub fn namespace(&self) -> &str {
        self.id.namespace.as_str()
    }

    pub fn id_ref(&self) -> ObjectIdRef {
        self.id.as_id_ref()
    }

    pub fn api_version(&self) -> &'static str {
        SIABApplication.api_version
    }

    pub fn kind(&self) -> &'static str {
        SIABApplication.kind
    }
}

/// The desired state, as authored by the user. The controller never writes it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSpec {
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourcesSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<SecuritySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub networking: Option<NetworkingSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<IngressSpec>,
}

impl ApplicationSpec {
    pub fn new(image: impl Into<String>) -> ApplicationSpec {
        ApplicationSpec {
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn replicas(&self) -> i32 {
        self.replicas.unwrap_or(DEFAULT_REPLICAS)
    }

    pub fn port(&self) -> i32 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    pub fn storage_enabled(&self) -> bool {
        self.storage
            .as_ref()
            .and_then(|s| s.enabled)
            .unwrap_or(false)
    }

    pub fn ingress_enabled(&self) -> bool {
        self.ingress
            .as_ref()
            .and_then(|i| i.enabled)
            .unwrap_or(false)
    }

    pub fn health_check_enabled(&self) -> bool {
        self.health_check
            .as_ref()
            .and_then(|h| h.enabled)
            .unwrap_or(true)
    }

    /// The namespaces allowed to reach the workload in addition to the mesh namespace
    pub fn allowed_ingress_namespaces(&self) -> &[String] {
        self.networking
            .as_ref()
            .map(|n| n.allow_ingress_from.as_slice())
            .unwrap_or(&[])
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ResourcesSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceList>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceList>,
}

/// cpu and memory quantities, as strings in the usual Kubernetes format (`100m`, `128Mi`, ...)
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ResourceList {
    #[serde(
        default,
        deserialize_with = "quantity::deserialize_optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub cpu: Option<String>,
    #[serde(
        default,
        deserialize_with = "quantity::deserialize_optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub memory: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SecuritySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_on_deploy: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_critical_vulns: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_non_root: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only_root_filesystem: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_privilege_escalation: Option<bool>,
    /// `RuntimeDefault`, `Unconfined` or `localhost/<profile path>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seccomp_profile: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_delay_seconds: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_seconds: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<i32>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(
        default,
        deserialize_with = "quantity::deserialize_optional",
        skip_serializing_if = "Option::is_none"
    )]
    pub size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
    /// `ReadWriteOnce`, `ReadWriteMany` or `ReadOnlyMany`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_mode: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NetworkingSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow_ingress_from: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_egress_ports: Vec<i32>,
    #[serde(
        default,
        rename = "allowedEgressCIDRs",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub allowed_egress_cidrs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_internet_egress: Option<bool>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct IngressSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<bool>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Deploying,
    Running,
    Failed,
}

impl Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Phase::Deploying => "Deploying",
            Phase::Running => "Running",
            Phase::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// The observed state, written by the controller on every reconcile
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<Endpoints>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_replicas: Option<i32>,
}

impl ApplicationStatus {
    /// Parses a status, falling back to an empty one if it was written by something else
    pub fn from_value(value: &Value) -> ApplicationStatus {
        serde_json::from_value(value.clone()).unwrap_or_else(|err| {
            log::debug!("Ignoring unrecognized application status: {}", err);
            ApplicationStatus::default()
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Endpoints {
    /// `<name>.<namespace>:<port>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal: Option<String>,
    /// `https://<hostname>`, only when ingress is enabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<String>,
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_application_and_ignores_unknown_fields() {
        let value = json!({
            "apiVersion": "siab.io/v1alpha1",
            "kind": "SIABApplication",
            "metadata": {"namespace": "apps", "name": "web", "uid": "u-1", "generation": 2},
            "spec": {
                "image": "nginx:1.25",
                "replicas": 3,
                "env": [{"name": "MODE", "value": "prod"}],
                "resources": {"limits": {"cpu": 1, "memory": "1Gi"}},
                "networking": {"allowedEgressCIDRs": ["10.1.0.0/16"]},
                "auth": {"enabled": true},
                "scaling": {"enabled": true, "maxReplicas": 5},
            },
            "status": {"phase": "Running"},
        });
        let app = Application::from_value(&value).expect("failed to parse");

        assert_eq!(ObjectId::new("apps", "web"), app.id);
        assert_eq!("u-1", app.uid);
        assert_eq!(Some(2), app.generation);
        assert_eq!(3, app.spec.replicas());
        assert_eq!(8080, app.spec.port());
        assert_eq!("MODE", app.spec.env[0].name);
        let limits = app.spec.resources.as_ref().and_then(|r| r.limits.as_ref());
        assert_eq!(Some("1"), limits.and_then(|l| l.cpu.as_deref()));
        assert_eq!(
            vec!["10.1.0.0/16".to_owned()],
            app.spec.networking.as_ref().map(|n| n.allowed_egress_cidrs.clone()).unwrap_or_default()
        );
        assert_eq!(Some(Phase::Running), app.status.phase);
    }

    #[test]
    fn missing_image_is_an_error() {
        let value = json!({
            "metadata": {"namespace": "apps", "name": "web"},
            "spec": {"replicas": 1},
        });
        assert!(Application::from_value(&value).is_err());

        let no_spec = json!({"metadata": {"namespace": "apps", "name": "web"}});
        assert!(Application::from_value(&no_spec).is_err());
    }

    #[test]
    fn unknown_status_is_replaced_with_default() {
        let status = ApplicationStatus::from_value(&json!({"phase": "Pending"}));
        assert_eq!(ApplicationStatus::default(), status);
    }

    #[test]
    fn status_serializes_in_camel_case() {
        let status = ApplicationStatus {
            phase: Some(Phase::Running),
            endpoints: Some(Endpoints {
                internal: Some("web.apps:80".to_owned()),
                external: None,
            }),
            observed_generation: Some(4),
            available_replicas: None,
        };
        let expected = json!({
            "phase": "Running",
            "endpoints": {"internal": "web.apps:80"},
            "observedGeneration": 4,
        });
        assert_eq!(expected, serde_json::to_value(&status).expect("serialize"));
    }
}
