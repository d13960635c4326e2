//! `siab-operator` reconciles `SIABApplication` custom resources (`siab.io/v1alpha1`) into the
//! child resources that actually run them: a `Deployment`, a `Service`, a `NetworkPolicy` and,
//! when storage is requested, a `PersistentVolumeClaim`.
//!
//! The pieces are layered so that most of them can be used and tested without a cluster:
//!
//! - `application` holds the typed resource and the defaulting rules
//! - `builders` turns a defaulted application into child objects, without doing any io
//! - `reconcile` applies the children through the `ClusterApi` trait and writes the status
//! - `runner` wires a real api client, watches and a worker pool around the `Reconciler`
//!
//! Running the operator against a cluster:
//!
//! ```no_run
//! use siab_operator::prelude::*;
//!
//! let config = OperatorConfig::from_env().expect("invalid configuration");
//! let client_config = ClientConfig::load(config.operator_name.as_str()).expect("no cluster access");
//!
//! // blocks the current thread until the operator stops
//! let err = run_operator(config, client_config);
//! eprintln!("operator stopped: {}", err);
//! ```
//!
//! Or driving a single reconcile against anything that implements `ClusterApi`:
//!
//! ```no_run
//! # async fn example(client: siab_operator::runner::Client) {
//! use siab_operator::prelude::*;
//! use std::sync::Arc;
//!
//! let reconciler = Reconciler::new(Arc::new(client), &OperatorConfig::default());
//! let outcome = reconciler.reconcile(&ObjectIdRef::new("apps", "hello")).await;
//! # }
//! ```

#[macro_use]
extern crate serde_derive;

pub mod application;
pub mod builders;
pub mod config;
pub mod error;
pub mod k8s_types;
pub mod reconcile;
pub mod resource;
pub mod runner;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub use k8s_openapi;
pub use serde_json;

pub mod prelude {
    pub use crate::application::{Application, ApplicationSpec, ApplicationStatus, Phase};
    pub use crate::builders::{BuildSettings, ChildKind};
    pub use crate::config::{ClientConfig, OperatorConfig};
    pub use crate::error::ReconcileError;
    pub use crate::k8s_types::{self, K8sType};
    pub use crate::reconcile::{ClusterApi, Outcome, Reconciler};
    pub use crate::resource::{K8sResource, ObjectId, ObjectIdRef};
    pub use crate::runner::run_operator;
}
