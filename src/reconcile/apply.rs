use super::ClusterApi;
use crate::builders::ChildKind;
use crate::resource::{str_value, ObjectIdRef};
use crate::runner::client::Error;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use serde_json::Value;

/// Makes the cluster match `desired`, creating the object if it doesn't exist and replacing it
/// otherwise. Returns the object as persisted by the api server.
///
/// An existing object is always replaced, even when it already looks like `desired`, so that fields
/// which are absent from `desired` get removed.
pub async fn create_or_update<C: ClusterApi>(
    api: &C,
    kind: ChildKind,
    id: &ObjectIdRef<'_>,
    mut desired: Value,
    owner: &OwnerReference,
) -> Result<Value, Error> {
    set_owner_reference(&mut desired, owner)?;
    let k8s_type = kind.k8s_type();

    match api.get(k8s_type, id).await? {
        None => {
            log::info!("Creating {} {}", kind, id);
            api.create(k8s_type, &desired).await
        }
        Some(existing) => {
            if let Some(version) = str_value(&existing, "/metadata/resourceVersion") {
                if let Some(metadata) = desired
                    .get_mut("metadata")
                    .and_then(Value::as_object_mut)
                {
                    metadata.insert("resourceVersion".to_owned(), Value::from(version));
                }
            }
            kind.carry_over_server_fields(&existing, &mut desired);
            log::info!("Updating {} {}", kind, id);
            api.replace(k8s_type, id, &desired).await
        }
    }
}

fn set_owner_reference(desired: &mut Value, owner: &OwnerReference) -> Result<(), Error> {
    let owner = serde_json::to_value(owner)?;
    match desired.get_mut("metadata").and_then(Value::as_object_mut) {
        Some(metadata) => {
            metadata.insert("ownerReferences".to_owned(), Value::Array(vec![owner]));
            Ok(())
        }
        None => Err(Error::Serde(serde::de::Error::custom(
            "desired object has no metadata",
        ))),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::k8s_types;
    use crate::testkit::{FakeCluster, Verb};
    use serde_json::json;

    fn owner() -> OwnerReference {
        OwnerReference {
            api_version: "siab.io/v1alpha1".to_owned(),
            kind: "SIABApplication".to_owned(),
            name: "web".to_owned(),
            uid: "uid-web".to_owned(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    fn service(port: i64) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"namespace": "apps", "name": "web"},
            "spec": {"type": "ClusterIP", "ports": [{"name": "http", "port": port}]},
        })
    }

    fn run<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build runtime")
            .block_on(future)
    }

    #[test]
    fn creates_missing_object_with_owner_reference() {
        let cluster = FakeCluster::new();
        let id = ObjectIdRef::new("apps", "web");

        let created = run(create_or_update(
            &cluster,
            ChildKind::NetworkEndpoint,
            &id,
            service(80),
            &owner(),
        ))
        .expect("create failed");

        assert_eq!(Some("uid-web"), created["metadata"]["ownerReferences"][0]["uid"].as_str());
        assert_eq!(Some(true), created["metadata"]["ownerReferences"][0]["controller"].as_bool());
        assert!(cluster.get_object(k8s_types::core::v1::Service, &id).is_some());
        assert_eq!(
            vec![Verb::Get, Verb::Create],
            cluster.operations().iter().map(|op| op.verb).collect::<Vec<_>>()
        );
    }

    #[test]
    fn replaces_existing_object_and_keeps_server_fields() {
        let cluster = FakeCluster::new();
        let id = ObjectIdRef::new("apps", "web");
        let mut existing = service(80);
        existing["spec"]["clusterIP"] = json!("10.96.0.17");
        cluster.insert(k8s_types::core::v1::Service, existing);
        cluster.clear_operations();

        let updated = run(create_or_update(
            &cluster,
            ChildKind::NetworkEndpoint,
            &id,
            service(8080),
            &owner(),
        ))
        .expect("update failed");

        assert_eq!(Some(8080), updated["spec"]["ports"][0]["port"].as_i64());
        assert_eq!(Some("10.96.0.17"), updated["spec"]["clusterIP"].as_str());
        assert_eq!(
            vec![Verb::Get, Verb::Replace],
            cluster.operations().iter().map(|op| op.verb).collect::<Vec<_>>()
        );
    }

    #[test]
    fn rejected_writes_are_returned_as_errors() {
        let cluster = FakeCluster::new();
        cluster.reject_writes(
            k8s_types::core::v1::Service,
            http::StatusCode::UNPROCESSABLE_ENTITY,
        );
        let id = ObjectIdRef::new("apps", "web");
        let err = run(create_or_update(
            &cluster,
            ChildKind::NetworkEndpoint,
            &id,
            service(80),
            &owner(),
        ))
        .expect_err("create should fail");
        assert!(err.is_http_status(422));
    }
}
