//! The reconcile of a single `SIABApplication`. Every call recomputes the complete desired state
//! from the current spec, so it doesn't matter which event triggered it, or how many events were
//! coalesced into it.
mod api;
pub mod apply;
pub mod status;

pub use self::api::ClusterApi;

use crate::application::defaults::defaults;
use crate::application::{Application, ApplicationStatus};
use crate::builders::{self, BuildError, BuildSettings, ChildKind};
use crate::config::OperatorConfig;
use crate::error::ReconcileError;
use crate::k8s_types::siab_io::v1alpha1::SIABApplication;
use crate::resource::ObjectIdRef;

use serde_json::Value;

use std::convert::TryFrom;
use std::sync::Arc;

/// The result of a reconcile that didn't fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The application no longer exists. Its children are removed by the garbage collector.
    Deleted,
    /// All children were applied and the status is `Running`
    Synced,
}

#[derive(Debug)]
pub struct Reconciler<C: ClusterApi> {
    api: Arc<C>,
    settings: BuildSettings,
}

impl<C: ClusterApi> Clone for Reconciler<C> {
    fn clone(&self) -> Self {
        Reconciler {
            api: self.api.clone(),
            settings: self.settings.clone(),
        }
    }
}

impl<C: ClusterApi> Reconciler<C> {
    pub fn new(api: Arc<C>, config: &OperatorConfig) -> Reconciler<C> {
        Reconciler::with_settings(api, BuildSettings::from_config(config))
    }

    pub fn with_settings(api: Arc<C>, settings: BuildSettings) -> Reconciler<C> {
        Reconciler { api, settings }
    }

    pub fn settings(&self) -> &BuildSettings {
        &self.settings
    }

    pub async fn reconcile(&self, id: &ObjectIdRef<'_>) -> Result<Outcome, ReconcileError> {
        let api = &*self.api;
        let mut parent = match api.get(SIABApplication, id).await? {
            Some(parent) => parent,
            None => {
                log::info!("SIABApplication {} no longer exists", id);
                return Ok(Outcome::Deleted);
            }
        };
        let generation = parent.pointer("/metadata/generation").and_then(Value::as_i64);

        let app = match Application::from_value(&parent) {
            Ok(app) => app,
            Err(err) => {
                log::warn!("SIABApplication {} has a malformed spec: {}", id, err);
                let previous = parent
                    .get("status")
                    .map(ApplicationStatus::from_value)
                    .unwrap_or_default();
                let failed = status::failed(&previous, generation);
                status::write_status(api, &mut parent, id, &failed).await;
                return Err(BuildError::MalformedSpec(err.to_string()).into());
            }
        };
        log::debug!("Starting reconcile of {} at generation {:?}", id, generation);

        let deploying = status::deploying(&app.status, generation);
        status::write_status(api, &mut parent, id, &deploying).await;

        match self.apply_children(&app).await {
            Ok((endpoints, available_replicas)) => {
                let running = status::running(endpoints, generation, available_replicas);
                status::write_status(api, &mut parent, id, &running).await;
                log::debug!("Finished reconcile of {}", id);
                Ok(Outcome::Synced)
            }
            Err(err) => {
                log::warn!("Reconcile of {} failed: {}", id, err);
                let failed = status::failed(&app.status, generation);
                status::write_status(api, &mut parent, id, &failed).await;
                Err(err)
            }
        }
    }

    /// Builds and applies every desired child in order, stopping at the first failure. Returns
    /// the endpoints and the number of available replicas of the workload.
    async fn apply_children(
        &self,
        app: &Application,
    ) -> Result<(crate::application::Endpoints, Option<i32>), ReconcileError> {
        let spec = defaults(&app.spec);
        let endpoints = status::endpoints(app, &spec)?;
        let owner = builders::owner_reference(app);
        let id = app.id_ref();
        let mut available_replicas = None;

        for kind in ChildKind::ORDERED.iter().copied() {
            let name = kind.child_name(app.name());
            let child_id = id.sibling(name.as_str());
            if !kind.is_desired(&spec) {
                if spec.storage.is_some() {
                    self.check_undesired_child(kind, &child_id).await?;
                }
                continue;
            }
            let desired = kind.build(app, &spec, &self.settings)?;
            let persisted =
                apply::create_or_update(&*self.api, kind, &child_id, desired, &owner).await?;
            if kind == ChildKind::Workload {
                available_replicas = persisted
                    .pointer("/status/availableReplicas")
                    .and_then(Value::as_i64)
                    .and_then(|n| i32::try_from(n).ok());
            }
        }
        Ok((endpoints, available_replicas))
    }

    /// Children that are no longer desired are left in place. The only such child is the claim,
    /// which still holds data and is removed along with the application. Only called when the
    /// spec still has a `storage` block, which is how storage gets turned off.
    async fn check_undesired_child(
        &self,
        kind: ChildKind,
        id: &ObjectIdRef<'_>,
    ) -> Result<(), ReconcileError> {
        if self.api.get(kind.k8s_type(), id).await?.is_some() {
            log::warn!(
                "Storage is disabled but {} {} still exists, retaining it. Delete it manually if the data is no longer needed",
                kind,
                id
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::application::Phase;
    use crate::k8s_types::{self, K8sType};
    use crate::testkit::{FakeCluster, Verb};
    use serde_json::json;

    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Service};
    use k8s_openapi::api::networking::v1::NetworkPolicy;

    const NS: &str = "apps";
    const NAME: &str = "web";

    fn setup() -> (Arc<FakeCluster>, Reconciler<FakeCluster>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let cluster = Arc::new(FakeCluster::new());
        let reconciler = Reconciler::new(cluster.clone(), &OperatorConfig::default());
        (cluster, reconciler)
    }

    fn run<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build runtime")
            .block_on(future)
    }

    fn reconcile(reconciler: &Reconciler<FakeCluster>) -> Result<Outcome, ReconcileError> {
        run(reconciler.reconcile(&ObjectIdRef::new(NS, NAME)))
    }

    fn get<T: serde::de::DeserializeOwned>(
        cluster: &FakeCluster,
        k8s_type: &K8sType,
        name: &str,
    ) -> Option<T> {
        cluster
            .get_object(k8s_type, &ObjectIdRef::new(NS, name))
            .map(|value| serde_json::from_value(value).expect("invalid object"))
    }

    fn app_status(cluster: &FakeCluster) -> Value {
        cluster
            .get_object(SIABApplication, &ObjectIdRef::new(NS, NAME))
            .and_then(|app| app.get("status").cloned())
            .unwrap_or(Value::Null)
    }

    fn scenario_a_spec() -> Value {
        json!({"image": "nginx:1.25", "replicas": 3, "port": 80})
    }

    #[test]
    fn scenario_a_minimal_application_is_deployed() {
        let (cluster, reconciler) = setup();
        let app = cluster.create_application(NS, NAME, scenario_a_spec());
        let app_uid = app["metadata"]["uid"].as_str().expect("uid").to_owned();

        assert_eq!(Outcome::Synced, reconcile(&reconciler).expect("reconcile failed"));

        let deployment: Deployment =
            get(&cluster, k8s_types::apps::v1::Deployment, NAME).expect("no deployment");
        let deployment_spec = deployment.spec.as_ref().expect("spec");
        assert_eq!(Some(3), deployment_spec.replicas);
        let container = &deployment_spec
            .template
            .spec
            .as_ref()
            .expect("pod spec")
            .containers[0];
        assert_eq!(80, container.ports.as_ref().expect("ports")[0].container_port);

        let service: Service =
            get(&cluster, k8s_types::core::v1::Service, NAME).expect("no service");
        let ports = service.spec.and_then(|s| s.ports).expect("ports");
        assert_eq!(1, ports.len());
        assert_eq!(80, ports[0].port);

        let policy: NetworkPolicy = get(
            &cluster,
            k8s_types::networking_k8s_io::v1::NetworkPolicy,
            "web-netpol",
        )
        .expect("no network policy");
        let policy_spec = policy.spec.expect("spec");
        assert_eq!(1, policy_spec.ingress.map(|i| i.len()).unwrap_or(0));
        // the DNS rule and the mesh rule
        assert_eq!(2, policy_spec.egress.map(|e| e.len()).unwrap_or(0));

        let pvc: Option<PersistentVolumeClaim> =
            get(&cluster, k8s_types::core::v1::PersistentVolumeClaim, "web-pvc");
        assert!(pvc.is_none());

        for (k8s_type, name) in &[
            (k8s_types::apps::v1::Deployment, NAME),
            (k8s_types::core::v1::Service, NAME),
            (k8s_types::networking_k8s_io::v1::NetworkPolicy, "web-netpol"),
        ] {
            let child = cluster
                .get_object(k8s_type, &ObjectIdRef::new(NS, name))
                .expect("missing child");
            let owners = child["metadata"]["ownerReferences"]
                .as_array()
                .expect("missing owner references");
            assert_eq!(1, owners.len());
            assert_eq!(Some(app_uid.as_str()), owners[0]["uid"].as_str());
            assert_eq!(Some("SIABApplication"), owners[0]["kind"].as_str());
            assert_eq!(Some(true), owners[0]["controller"].as_bool());
        }

        let status = app_status(&cluster);
        assert_eq!(Some("Running"), status["phase"].as_str());
        assert_eq!(Some("web.apps:80"), status["endpoints"]["internal"].as_str());
        assert!(status["endpoints"].get("external").is_none());
        assert_eq!(Some(1), status["observedGeneration"].as_i64());
    }

    #[test]
    fn scenario_b_ingress_sets_external_endpoint() {
        let (cluster, reconciler) = setup();
        let mut spec = scenario_a_spec();
        spec["ingress"] = json!({"enabled": true, "hostname": "app.example.com", "tls": true});
        cluster.create_application(NS, NAME, spec);

        assert_eq!(Outcome::Synced, reconcile(&reconciler).expect("reconcile failed"));
        let status = app_status(&cluster);
        assert_eq!(Some("Running"), status["phase"].as_str());
        assert_eq!(
            Some("https://app.example.com"),
            status["endpoints"]["external"].as_str()
        );
    }

    #[test]
    fn scenario_c_storage_creates_owned_claim() {
        let (cluster, reconciler) = setup();
        let app = cluster.create_application(
            NS,
            NAME,
            json!({
                "image": "postgres:15",
                "storage": {"enabled": true, "size": "10Gi", "accessMode": "ReadWriteOnce"},
            }),
        );

        assert_eq!(Outcome::Synced, reconcile(&reconciler).expect("reconcile failed"));
        let claim = cluster
            .get_object(
                k8s_types::core::v1::PersistentVolumeClaim,
                &ObjectIdRef::new(NS, "web-pvc"),
            )
            .expect("no claim");
        assert_eq!(
            Some("10Gi"),
            claim["spec"]["resources"]["requests"]["storage"].as_str()
        );
        assert_eq!(Some("ReadWriteOnce"), claim["spec"]["accessModes"][0].as_str());
        assert_eq!(
            app["metadata"]["uid"],
            claim["metadata"]["ownerReferences"][0]["uid"]
        );

        let deployment: Deployment =
            get(&cluster, k8s_types::apps::v1::Deployment, NAME).expect("no deployment");
        let volumes = deployment
            .spec
            .and_then(|s| s.template.spec)
            .and_then(|p| p.volumes)
            .expect("volumes");
        assert_eq!(
            Some("web-pvc"),
            volumes[0]
                .persistent_volume_claim
                .as_ref()
                .map(|c| c.claim_name.as_str())
        );
    }

    #[test]
    fn scenario_d_failed_apply_recovers_after_fix() {
        let (cluster, reconciler) = setup();
        cluster.create_application(NS, NAME, json!({"image": "bad image ref"}));
        cluster.reject_writes(
            k8s_types::apps::v1::Deployment,
            http::StatusCode::UNPROCESSABLE_ENTITY,
        );

        let err = reconcile(&reconciler).expect_err("reconcile should fail");
        assert!(!err.is_build_error());
        assert_eq!(Some("Failed"), app_status(&cluster)["phase"].as_str());
        // later children are not applied after a failure
        assert!(cluster
            .get_object(k8s_types::core::v1::Service, &ObjectIdRef::new(NS, NAME))
            .is_none());

        cluster.allow_writes(k8s_types::apps::v1::Deployment);
        cluster.update_application_spec(NS, NAME, json!({"image": "nginx:1.25"}));

        assert_eq!(Outcome::Synced, reconcile(&reconciler).expect("reconcile failed"));
        let status = app_status(&cluster);
        assert_eq!(Some("Running"), status["phase"].as_str());
        assert_eq!(Some(2), status["observedGeneration"].as_i64());
    }

    #[test]
    fn scenario_e_deleted_application_is_a_noop() {
        let (cluster, reconciler) = setup();
        cluster.create_application(NS, NAME, scenario_a_spec());
        reconcile(&reconciler).expect("reconcile failed");
        assert_eq!(3, cluster.object_count() - 1);

        cluster.delete(SIABApplication, &ObjectIdRef::new(NS, NAME));
        cluster.clear_operations();

        assert_eq!(Outcome::Deleted, reconcile(&reconciler).expect("reconcile failed"));
        assert_eq!(0, cluster.object_count());
        let verbs: Vec<_> = cluster.operations().iter().map(|op| op.verb).collect();
        assert_eq!(vec![Verb::Get], verbs);
    }

    #[test]
    fn second_reconcile_converges_without_changes() {
        let (cluster, reconciler) = setup();
        cluster.create_application(NS, NAME, scenario_a_spec());
        reconcile(&reconciler).expect("first reconcile failed");
        let children_before = cluster.children_snapshot();
        let status_before = app_status(&cluster);
        cluster.clear_operations();

        reconcile(&reconciler).expect("second reconcile failed");

        let children_after = cluster.children_snapshot();
        assert_eq!(children_before.len(), children_after.len());
        for (key, before) in children_before.iter() {
            let after = &children_after[key];
            assert_eq!(before["spec"], after["spec"], "spec of {:?} changed", key);
            assert_eq!(before["metadata"]["ownerReferences"], after["metadata"]["ownerReferences"]);
        }
        assert_eq!(status_before, app_status(&cluster));

        let ops = cluster.operations();
        assert_eq!(0, ops.iter().filter(|op| op.verb == Verb::Create).count());
        // Deploying and Running are both written, since the phase changes twice
        assert_eq!(2, ops.iter().filter(|op| op.verb == Verb::ReplaceStatus).count());
    }

    #[test]
    fn malformed_spec_sets_failed_status() {
        let (cluster, reconciler) = setup();
        cluster.create_application(NS, NAME, json!({"replicas": 2}));

        let err = reconcile(&reconciler).expect_err("reconcile should fail");
        assert!(err.is_build_error());
        assert_eq!(Some("Failed"), app_status(&cluster)["phase"].as_str());
        assert!(cluster
            .get_object(k8s_types::apps::v1::Deployment, &ObjectIdRef::new(NS, NAME))
            .is_none());
    }

    #[test]
    fn invalid_spec_value_fails_before_any_child_is_applied() {
        let (cluster, reconciler) = setup();
        cluster.create_application(
            NS,
            NAME,
            json!({"image": "nginx", "ingress": {"enabled": true}}),
        );
        let err = reconcile(&reconciler).expect_err("reconcile should fail");
        assert!(err.is_build_error());
        assert_eq!(1, cluster.object_count());
        assert_eq!(
            Some(Phase::Failed.to_string().as_str()),
            app_status(&cluster)["phase"].as_str()
        );
    }

    #[test]
    fn conflicts_are_returned_as_transient_errors() {
        let (cluster, reconciler) = setup();
        cluster.create_application(NS, NAME, scenario_a_spec());
        cluster.reject_writes(k8s_types::core::v1::Service, http::StatusCode::CONFLICT);

        let err = reconcile(&reconciler).expect_err("reconcile should fail");
        assert!(err.is_conflict());
        assert_eq!(Some("Failed"), app_status(&cluster)["phase"].as_str());
    }

    #[test]
    fn status_write_failures_do_not_fail_the_reconcile() {
        let (cluster, reconciler) = setup();
        cluster.create_application(NS, NAME, scenario_a_spec());
        cluster.reject_status_writes(Some(http::StatusCode::INTERNAL_SERVER_ERROR));

        assert_eq!(Outcome::Synced, reconcile(&reconciler).expect("reconcile failed"));
        assert_eq!(Value::Null, app_status(&cluster));
        assert!(cluster
            .get_object(k8s_types::apps::v1::Deployment, &ObjectIdRef::new(NS, NAME))
            .is_some());
    }

    #[test]
    fn disabling_storage_retains_the_claim() {
        let (cluster, reconciler) = setup();
        cluster.create_application(
            NS,
            NAME,
            json!({"image": "postgres:15", "storage": {"enabled": true, "size": "1Gi"}}),
        );
        reconcile(&reconciler).expect("reconcile failed");

        cluster.update_application_spec(
            NS,
            NAME,
            json!({"image": "postgres:15", "storage": {"enabled": false, "size": "1Gi"}}),
        );
        assert_eq!(Outcome::Synced, reconcile(&reconciler).expect("reconcile failed"));

        assert!(cluster
            .get_object(
                k8s_types::core::v1::PersistentVolumeClaim,
                &ObjectIdRef::new(NS, "web-pvc")
            )
            .is_some());
        let deployment: Deployment =
            get(&cluster, k8s_types::apps::v1::Deployment, NAME).expect("no deployment");
        assert!(deployment
            .spec
            .and_then(|s| s.template.spec)
            .and_then(|p| p.volumes)
            .is_none());
    }

    #[test]
    fn available_replicas_are_reported() {
        let (cluster, reconciler) = setup();
        cluster.create_application(NS, NAME, scenario_a_spec());
        reconcile(&reconciler).expect("reconcile failed");

        cluster.set_status(
            k8s_types::apps::v1::Deployment,
            &ObjectIdRef::new(NS, NAME),
            json!({"availableReplicas": 3}),
        );
        reconcile(&reconciler).expect("reconcile failed");
        assert_eq!(Some(3), app_status(&cluster)["availableReplicas"].as_i64());
    }

    #[test]
    fn claim_is_only_looked_up_when_storage_is_configured() {
        let (cluster, reconciler) = setup();
        cluster.create_application(NS, NAME, scenario_a_spec());
        reconcile(&reconciler).expect("reconcile failed");
        fn claim_reads(cluster: &FakeCluster) -> usize {
            cluster
                .operations()
                .iter()
                .filter(|op| op.kind == "PersistentVolumeClaim")
                .count()
        }
        assert_eq!(0, claim_reads(&cluster));

        cluster.update_application_spec(
            NS,
            NAME,
            json!({"image": "nginx:1.25", "storage": {"enabled": false}}),
        );
        reconcile(&reconciler).expect("reconcile failed");
        assert_eq!(1, claim_reads(&cluster));
    }

    #[test]
    fn out_of_range_available_replicas_are_not_reported() {
        let (cluster, reconciler) = setup();
        cluster.create_application(NS, NAME, scenario_a_spec());
        reconcile(&reconciler).expect("reconcile failed");

        cluster.set_status(
            k8s_types::apps::v1::Deployment,
            &ObjectIdRef::new(NS, NAME),
            json!({"availableReplicas": 4_294_967_296i64}),
        );
        reconcile(&reconciler).expect("reconcile failed");
        assert!(app_status(&cluster).get("availableReplicas").is_none());
    }

    #[test]
    fn request_above_default_limit_is_deployed() {
        let (cluster, reconciler) = setup();
        cluster.create_application(
            NS,
            NAME,
            json!({"image": "nginx:1.25", "resources": {"requests": {"cpu": "1", "memory": "1Gi"}}}),
        );

        assert_eq!(Outcome::Synced, reconcile(&reconciler).expect("reconcile failed"));
        assert_eq!(Some("Running"), app_status(&cluster)["phase"].as_str());
        let deployment = cluster
            .get_object(k8s_types::apps::v1::Deployment, &ObjectIdRef::new(NS, NAME))
            .expect("no deployment");
        let resources = &deployment["spec"]["template"]["spec"]["containers"][0]["resources"];
        assert_eq!(Some("1"), resources["limits"]["cpu"].as_str());
        assert_eq!(Some("1Gi"), resources["limits"]["memory"].as_str());
    }
}
