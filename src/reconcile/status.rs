//! Computing and persisting `SIABApplication.status`
use super::ClusterApi;
use crate::application::{Application, ApplicationSpec, ApplicationStatus, Endpoints, Phase};
use crate::builders::BuildError;
use crate::k8s_types::siab_io::v1alpha1::SIABApplication;
use crate::resource::ObjectIdRef;

use serde_json::Value;

pub fn deploying(previous: &ApplicationStatus, generation: Option<i64>) -> ApplicationStatus {
    ApplicationStatus {
        phase: Some(Phase::Deploying),
        endpoints: previous.endpoints.clone(),
        observed_generation: generation,
        available_replicas: previous.available_replicas,
    }
}

pub fn failed(previous: &ApplicationStatus, generation: Option<i64>) -> ApplicationStatus {
    ApplicationStatus {
        phase: Some(Phase::Failed),
        ..deploying(previous, generation)
    }
}

pub fn running(
    endpoints: Endpoints,
    generation: Option<i64>,
    available_replicas: Option<i32>,
) -> ApplicationStatus {
    ApplicationStatus {
        phase: Some(Phase::Running),
        endpoints: Some(endpoints),
        observed_generation: generation,
        available_replicas,
    }
}

/// `internal` is `<name>.<namespace>:<port>`, and `external` is only set when ingress is enabled
pub fn endpoints(app: &Application, spec: &ApplicationSpec) -> Result<Endpoints, BuildError> {
    let internal = format!("{}.{}:{}", app.name(), app.namespace(), spec.port());
    let external = if spec.ingress_enabled() {
        let hostname = spec
            .ingress
            .as_ref()
            .and_then(|i| i.hostname.as_deref())
            .filter(|h| !h.trim().is_empty())
            .ok_or(BuildError::MissingIngressHostname)?;
        Some(format!("https://{}", hostname))
    } else {
        None
    };
    Ok(Endpoints {
        internal: Some(internal),
        external,
    })
}

/// Persists `status` through the status subresource, unless the stored status is already equivalent.
/// `parent` is the latest known version of the application, and is replaced with the api server's
/// response when the write succeeds. Failures are only logged.
pub async fn write_status<C: ClusterApi>(
    api: &C,
    parent: &mut Value,
    id: &ObjectIdRef<'_>,
    status: &ApplicationStatus,
) {
    let desired = match serde_json::to_value(status) {
        Ok(value) => value,
        Err(err) => {
            log::warn!("Failed to serialize status for {}: {}", id, err);
            return;
        }
    };
    let existing = parent.get("status").cloned().unwrap_or(Value::Null);
    if existing == desired {
        log::debug!("Status of {} is unchanged", id);
        return;
    }

    let mut updated = parent.clone();
    match updated.as_object_mut() {
        Some(obj) => {
            obj.insert("status".to_owned(), desired);
        }
        None => {
            log::warn!("Not writing status of {} since it is not an object", id);
            return;
        }
    }
    match api.replace_status(SIABApplication, id, &updated).await {
        Ok(persisted) => {
            log::info!(
                "Updated status of {} to phase: {}",
                id,
                status
                    .phase
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "<none>".to_owned())
            );
            *parent = persisted;
        }
        Err(err) => {
            log::warn!("Failed to update status of {}: {}", id, err);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::application::IngressSpec;
    use crate::resource::ObjectId;
    use crate::testkit::{FakeCluster, Verb};
    use serde_json::json;

    fn app(spec: ApplicationSpec) -> Application {
        Application {
            id: ObjectId::new("apps", "web"),
            uid: "uid".to_owned(),
            generation: Some(3),
            spec,
            status: Default::default(),
        }
    }

    #[test]
    fn internal_endpoint_uses_name_namespace_and_port() {
        let mut spec = ApplicationSpec::new("nginx");
        spec.port = Some(80);
        let endpoints = endpoints(&app(spec.clone()), &spec).expect("endpoints");
        assert_eq!(Some("web.apps:80"), endpoints.internal.as_deref());
        assert_eq!(None, endpoints.external);
    }

    #[test]
    fn external_endpoint_requires_hostname() {
        let mut spec = ApplicationSpec::new("nginx");
        spec.ingress = Some(IngressSpec {
            enabled: Some(true),
            hostname: Some("app.example.com".to_owned()),
            tls: Some(true),
        });
        let endpoints = endpoints(&app(spec.clone()), &spec).expect("endpoints");
        assert_eq!(Some("https://app.example.com"), endpoints.external.as_deref());

        spec.ingress = Some(IngressSpec {
            enabled: Some(true),
            ..Default::default()
        });
        assert!(matches!(
            super::endpoints(&app(spec.clone()), &spec),
            Err(BuildError::MissingIngressHostname)
        ));
    }

    #[test]
    fn failed_and_deploying_keep_previous_endpoints() {
        let previous = running(
            Endpoints {
                internal: Some("web.apps:80".to_owned()),
                external: None,
            },
            Some(1),
            Some(2),
        );
        let failed = failed(&previous, Some(2));
        assert_eq!(Some(Phase::Failed), failed.phase);
        assert_eq!(previous.endpoints, failed.endpoints);
        assert_eq!(Some(2), failed.observed_generation);
        assert_eq!(Some(Phase::Deploying), deploying(&previous, Some(2)).phase);
    }

    #[test]
    fn status_is_only_written_when_it_changes() {
        let cluster = FakeCluster::new();
        let mut parent = cluster.create_application("apps", "web", json!({"image": "nginx"}));
        let id = ObjectIdRef::new("apps", "web");
        let status = deploying(&ApplicationStatus::default(), Some(1));

        tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime")
            .block_on(async {
                write_status(&cluster, &mut parent, &id, &status).await;
                write_status(&cluster, &mut parent, &id, &status).await;
            });

        assert_eq!(Some("Deploying"), parent["status"]["phase"].as_str());
        let status_writes = cluster
            .operations()
            .iter()
            .filter(|op| op.verb == Verb::ReplaceStatus)
            .count();
        assert_eq!(1, status_writes);
    }

    #[test]
    fn failed_status_write_leaves_parent_unchanged() {
        let cluster = FakeCluster::new();
        let mut parent = cluster.create_application("apps", "web", json!({"image": "nginx"}));
        cluster.reject_status_writes(Some(http::StatusCode::CONFLICT));
        let before = parent.clone();
        let id = ObjectIdRef::new("apps", "web");

        tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime")
            .block_on(write_status(
                &cluster,
                &mut parent,
                &id,
                &failed(&ApplicationStatus::default(), Some(1)),
            ));
        assert_eq!(before, parent);
    }
}
