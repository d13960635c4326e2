use super::{
    child_metadata, labels, pvc, selector_labels, validate_port, validate_quantity, BuildError,
    BuildSettings,
};
use crate::application::quantity;
use crate::application::{Application, ApplicationSpec, ResourceList};

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, ContainerPort, HTTPGetAction, PersistentVolumeClaimVolumeSource,
    PodSecurityContext, PodSpec, PodTemplateSpec, Probe, ResourceRequirements, SeccompProfile,
    SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use std::collections::BTreeMap;

pub const CONTAINER_PORT_NAME: &str = "http";
pub const DATA_VOLUME_NAME: &str = "data";
pub const NON_ROOT_USER_ID: i64 = 1000;

pub const MESH_INJECT_ANNOTATION: &str = "sidecar.istio.io/inject";
pub const SCAN_ON_DEPLOY_ANNOTATION: &str = "siab.io/scan-on-deploy";
pub const BLOCK_CRITICAL_VULNS_ANNOTATION: &str = "siab.io/block-critical-vulns";

const LOCALHOST_PROFILE_PREFIX: &str = "localhost/";
const MAX_READINESS_INITIAL_DELAY: i32 = 5;

/// Builds the Deployment that runs the application's container
pub fn build(
    app: &Application,
    spec: &ApplicationSpec,
    settings: &BuildSettings,
) -> Result<Deployment, BuildError> {
    if spec.image.trim().is_empty() {
        return Err(BuildError::EmptyImage);
    }
    let replicas = spec.replicas();
    if replicas < 0 {
        return Err(BuildError::NegativeReplicas(replicas));
    }
    let port = validate_port(spec.port())?;

    let security = spec.security.clone().unwrap_or_default();
    let run_as_non_root = security.run_as_non_root.unwrap_or(true);
    let seccomp_profile = seccomp_profile(security.seccomp_profile.as_deref())?;

    let mut volumes = Vec::new();
    let mut volume_mounts = Vec::new();
    if spec.storage_enabled() {
        volumes.push(Volume {
            name: DATA_VOLUME_NAME.to_owned(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: pvc::claim_name(app.name()),
                read_only: None,
            }),
            ..Default::default()
        });
        let mount_path = spec
            .storage
            .as_ref()
            .and_then(|s| s.mount_path.clone())
            .unwrap_or_else(|| crate::application::defaults::DEFAULT_MOUNT_PATH.to_owned());
        volume_mounts.push(VolumeMount {
            name: DATA_VOLUME_NAME.to_owned(),
            mount_path,
            ..Default::default()
        });
    }

    let (liveness_probe, readiness_probe) = probes(spec, port)?;

    let container = Container {
        name: app.name().to_owned(),
        image: Some(spec.image.clone()),
        ports: Some(vec![ContainerPort {
            name: Some(CONTAINER_PORT_NAME.to_owned()),
            container_port: port,
            protocol: Some("TCP".to_owned()),
            ..Default::default()
        }]),
        env: if spec.env.is_empty() {
            None
        } else {
            Some(spec.env.clone())
        },
        resources: Some(resource_requirements(spec)?),
        security_context: Some(SecurityContext {
            run_as_non_root: Some(run_as_non_root),
            read_only_root_filesystem: Some(security.read_only_root_filesystem.unwrap_or(true)),
            allow_privilege_escalation: Some(
                security.allow_privilege_escalation.unwrap_or(false),
            ),
            capabilities: Some(Capabilities {
                drop: Some(vec!["ALL".to_owned()]),
                add: None,
            }),
            ..Default::default()
        }),
        liveness_probe,
        readiness_probe,
        volume_mounts: none_if_empty(volume_mounts),
        ..Default::default()
    };

    let pod_security_context = PodSecurityContext {
        run_as_non_root: Some(run_as_non_root),
        run_as_user: if run_as_non_root {
            Some(NON_ROOT_USER_ID)
        } else {
            None
        },
        seccomp_profile: Some(seccomp_profile),
        ..Default::default()
    };

    let mut annotations = BTreeMap::new();
    annotations.insert(MESH_INJECT_ANNOTATION.to_owned(), "true".to_owned());
    annotations.insert(
        SCAN_ON_DEPLOY_ANNOTATION.to_owned(),
        security.scan_on_deploy.unwrap_or(true).to_string(),
    );
    annotations.insert(
        BLOCK_CRITICAL_VULNS_ANNOTATION.to_owned(),
        security.block_critical_vulns.unwrap_or(true).to_string(),
    );

    Ok(Deployment {
        metadata: child_metadata(app, app.name().to_owned(), settings),
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(selector_labels(app.name())),
                match_expressions: None,
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels(app.name(), settings)),
                    annotations: Some(annotations),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    security_context: Some(pod_security_context),
                    volumes: none_if_empty(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    })
}

fn none_if_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

fn seccomp_profile(profile: Option<&str>) -> Result<SeccompProfile, BuildError> {
    let profile = profile.unwrap_or(crate::application::defaults::DEFAULT_SECCOMP_PROFILE);
    match profile {
        "RuntimeDefault" | "Unconfined" => Ok(SeccompProfile {
            type_: profile.to_owned(),
            localhost_profile: None,
        }),
        other if other.starts_with(LOCALHOST_PROFILE_PREFIX)
            && other.len() > LOCALHOST_PROFILE_PREFIX.len() =>
        {
            Ok(SeccompProfile {
                type_: "Localhost".to_owned(),
                localhost_profile: Some(other[LOCALHOST_PROFILE_PREFIX.len()..].to_owned()),
            })
        }
        other => Err(BuildError::InvalidSeccompProfile(other.to_owned())),
    }
}

fn resource_requirements(spec: &ApplicationSpec) -> Result<ResourceRequirements, BuildError> {
    let resources = spec.resources.clone().unwrap_or_default();
    let requests = resources.requests.unwrap_or_default();
    let limits = resources.limits.unwrap_or_default();

    check_request_within_limit("cpu", requests.cpu.as_deref(), limits.cpu.as_deref())?;
    check_request_within_limit("memory", requests.memory.as_deref(), limits.memory.as_deref())?;

    Ok(ResourceRequirements {
        requests: quantities(&requests)?,
        limits: quantities(&limits)?,
    })
}

fn check_request_within_limit(
    resource: &'static str,
    request: Option<&str>,
    limit: Option<&str>,
) -> Result<(), BuildError> {
    if let (Some(request), Some(limit)) = (request, limit) {
        if quantity::parse(request)? > quantity::parse(limit)? {
            return Err(BuildError::RequestExceedsLimit {
                resource,
                request: request.to_owned(),
                limit: limit.to_owned(),
            });
        }
    }
    Ok(())
}

fn quantities(list: &ResourceList) -> Result<Option<BTreeMap<String, Quantity>>, BuildError> {
    let mut map = BTreeMap::new();
    for (name, value) in [("cpu", &list.cpu), ("memory", &list.memory)].iter() {
        if let Some(value) = value {
            validate_quantity(value)?;
            map.insert((*name).to_owned(), Quantity(value.clone()));
        }
    }
    if map.is_empty() {
        Ok(None)
    } else {
        Ok(Some(map))
    }
}

fn probes(spec: &ApplicationSpec, app_port: i32) -> Result<(Option<Probe>, Option<Probe>), BuildError> {
    use crate::application::defaults::*;

    if !spec.health_check_enabled() {
        return Ok((None, None));
    }
    let health = spec.health_check.clone().unwrap_or_default();
    let port = validate_port(health.port.unwrap_or(app_port))?;
    let path = health
        .path
        .clone()
        .unwrap_or_else(|| DEFAULT_HEALTH_CHECK_PATH.to_owned());
    let initial_delay = health
        .initial_delay_seconds
        .unwrap_or(DEFAULT_INITIAL_DELAY_SECONDS);

    let probe = |initial_delay_seconds: i32| Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.clone()),
            port: IntOrString::Int(port),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay_seconds),
        period_seconds: Some(health.period_seconds.unwrap_or(DEFAULT_PERIOD_SECONDS)),
        timeout_seconds: Some(health.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECONDS)),
        failure_threshold: Some(health.failure_threshold.unwrap_or(DEFAULT_FAILURE_THRESHOLD)),
        ..Default::default()
    };

    let liveness = probe(initial_delay);
    let readiness = probe(initial_delay.min(MAX_READINESS_INITIAL_DELAY));
    Ok((Some(liveness), Some(readiness)))
}
