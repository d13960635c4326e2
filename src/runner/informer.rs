//! Watches turn api server events into `ResourceMessage`s that name the application to reconcile.
//!
//! Each watched type has a `ParentLookup` that maps a changed object to its application. The
//! application watch only reacts to creations, deletions and changes of `metadata.generation`, so
//! that the operator's own status writes don't trigger another reconcile. Child watches react to
//! any change of a labeled child.
use crate::builders::APPLICATION_LABEL;
use crate::k8s_types::K8sType;
use crate::reconcile::Outcome;
use crate::resource::{InvalidResourceError, K8sResource, ObjectId};
use crate::runner::client::{ApiError, Client, Error as ClientError, ObjectList, WatchEvent};
use crate::runner::metrics::WatcherMetrics;

use serde_json::Value;
use tokio::sync::mpsc::{error::SendError, Sender};

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::time::Duration;

const ERROR_RETRY_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub enum EventType {
    Created,
    Updated,
    Deleted,
    ReconcileComplete { result: Result<Outcome, ()> },
    TriggerResync { resync_round: u32 },
}

#[derive(Debug)]
pub struct ResourceMessage {
    pub event_type: EventType,
    pub resource_type: &'static K8sType,
    pub resource_id: ObjectId,
    /// The application that should be reconciled because of this message
    pub parent_id: ObjectId,
}

pub trait ParentLookup: Send + 'static {
    /// Returns the application to reconcile, or `None` if the event can be ignored
    fn parent_of(&mut self, event_type: &EventType, resource: &K8sResource) -> Option<ObjectId>;

    /// Called before the watched objects are listed again
    fn clear(&mut self);
}

/// Remembers the last seen generation of every application
#[derive(Debug, Default)]
pub struct GenerationFilter(HashMap<ObjectId, i64>);

impl ParentLookup for GenerationFilter {
    fn parent_of(&mut self, event_type: &EventType, resource: &K8sResource) -> Option<ObjectId> {
        let id = resource.get_object_id().to_owned();
        match event_type {
            EventType::Deleted => {
                self.0.remove(&id);
                Some(id)
            }
            EventType::Updated => {
                let generation = resource.generation();
                if self.0.insert(id.clone(), generation) == Some(generation) {
                    log::trace!("Ignoring update of {} with unchanged generation", id);
                    None
                } else {
                    Some(id)
                }
            }
            _ => {
                self.0.insert(id.clone(), resource.generation());
                Some(id)
            }
        }
    }

    fn clear(&mut self) {
        self.0.clear();
    }
}

/// Finds the application from the `siab.io/application` label of a child
#[derive(Debug, Default)]
pub struct ApplicationLabel;

impl ParentLookup for ApplicationLabel {
    fn parent_of(&mut self, _: &EventType, resource: &K8sResource) -> Option<ObjectId> {
        let name = resource.get_label_value(APPLICATION_LABEL)?;
        Some(ObjectId::new(resource.namespace().unwrap_or(""), name))
    }

    fn clear(&mut self) {}
}

#[derive(Debug)]
enum WatcherErr {
    SendErr,
    ClientErr(ClientError),
    ResourceVersionExpired,
    InvalidResource(InvalidResourceError),
    Api(ApiError),
}

impl Display for WatcherErr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WatcherErr::SendErr => f.write_str("Sender channel closed"),
            WatcherErr::ClientErr(err) => write!(f, "Client Error: {}", err),
            WatcherErr::ResourceVersionExpired => {
                f.write_str("Resource Version has expired, watcher is out of sync")
            }
            WatcherErr::InvalidResource(e) => {
                write!(f, "Invalid resource returned from api server: {}", e)
            }
            WatcherErr::Api(e) => write!(f, "Watcher received api error: {}", e),
        }
    }
}

impl std::error::Error for WatcherErr {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WatcherErr::ClientErr(err) => Some(err),
            WatcherErr::InvalidResource(e) => Some(e),
            WatcherErr::Api(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ApiError> for WatcherErr {
    fn from(err: ApiError) -> WatcherErr {
        if err.code == 410 {
            WatcherErr::ResourceVersionExpired
        } else {
            WatcherErr::Api(err)
        }
    }
}

impl From<InvalidResourceError> for WatcherErr {
    fn from(err: InvalidResourceError) -> WatcherErr {
        WatcherErr::InvalidResource(err)
    }
}

impl From<ClientError> for WatcherErr {
    fn from(err: ClientError) -> WatcherErr {
        if err.is_http_410() {
            WatcherErr::ResourceVersionExpired
        } else {
            WatcherErr::ClientErr(err)
        }
    }
}

impl<T> From<SendError<T>> for WatcherErr {
    fn from(_: SendError<T>) -> WatcherErr {
        WatcherErr::SendErr
    }
}

/// Watches `SIABApplication`s
pub fn start_parent_monitor(
    namespace: Option<String>,
    k8s_type: &'static K8sType,
    client: Client,
    sender: Sender<ResourceMessage>,
    metrics: WatcherMetrics,
) {
    start_monitor(
        GenerationFilter::default(),
        k8s_type,
        namespace,
        None,
        client,
        sender,
        metrics,
    )
}

/// Watches children of the given type, which are selected by the presence of the application label
pub fn start_child_monitor(
    namespace: Option<String>,
    k8s_type: &'static K8sType,
    client: Client,
    sender: Sender<ResourceMessage>,
    metrics: WatcherMetrics,
) {
    start_monitor(
        ApplicationLabel,
        k8s_type,
        namespace,
        Some(APPLICATION_LABEL.to_owned()),
        client,
        sender,
        metrics,
    )
}

fn start_monitor<L: ParentLookup>(
    lookup: L,
    k8s_type: &'static K8sType,
    namespace: Option<String>,
    label_selector: Option<String>,
    client: Client,
    sender: Sender<ResourceMessage>,
    metrics: WatcherMetrics,
) {
    let backend = Watcher {
        lookup,
        metrics,
        client,
        k8s_type,
        sender,
        label_selector,
        namespace,
    };
    tokio::spawn(backend.run());
}

struct Watcher<L: ParentLookup> {
    lookup: L,
    metrics: WatcherMetrics,
    client: Client,
    k8s_type: &'static K8sType,
    sender: Sender<ResourceMessage>,
    label_selector: Option<String>,
    namespace: Option<String>,
}

impl<L: ParentLookup> Watcher<L> {
    async fn run(mut self) {
        log::debug!(
            "Starting watch of {} with selector: {:?}",
            self.k8s_type,
            self.label_selector
        );

        loop {
            let result = match self.list_all().await {
                Ok(resource_version) => self.watch_from(resource_version).await,
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                if !self.handle_error(err).await {
                    break;
                }
            }
        }
        log::info!("Ending watch of {}", self.k8s_type);
    }

    /// Returns false if the watcher should stop
    async fn handle_error(&mut self, error: WatcherErr) -> bool {
        match error {
            WatcherErr::SendErr => false,
            WatcherErr::ResourceVersionExpired => {
                log::info!("ResourceVersion is too old for {}, listing again", self.k8s_type);
                true
            }
            other => {
                log::error!("Error in watch of {}: {}", self.k8s_type, other);
                self.metrics.error();
                tokio::time::sleep(ERROR_RETRY_DELAY).await;
                true
            }
        }
    }

    async fn watch_from(&mut self, mut resource_version: String) -> Result<(), WatcherErr> {
        loop {
            self.metrics.request_started();
            if let Some(vers) = self.watch(&resource_version).await? {
                resource_version = vers;
            }
        }
    }

    /// Returns the last resource version that was seen, or `None` if the watch ended without events
    async fn watch(&mut self, resource_version: &str) -> Result<Option<String>, WatcherErr> {
        log::debug!(
            "Starting watch of {} at resourceVersion: {}",
            self.k8s_type,
            resource_version
        );
        let mut events = self
            .client
            .watch(
                self.k8s_type,
                self.namespace.as_deref(),
                Some(resource_version),
                self.label_selector.as_deref(),
            )
            .await?;

        let mut new_version = None;
        while let Some(result) = events.next().await {
            self.metrics.event_received();
            let version = self.handle_event(result?).await?;
            new_version = Some(version);
        }
        Ok(new_version)
    }

    async fn handle_event(&mut self, event: WatchEvent) -> Result<String, WatcherErr> {
        let (event_type, object) = match event {
            WatchEvent::Added(res) => (EventType::Created, res),
            WatchEvent::Modified(res) => (EventType::Updated, res),
            WatchEvent::Deleted(res) => (EventType::Deleted, res),
            WatchEvent::Error(err) => {
                log::warn!("Got api error in watch of {}: {}", self.k8s_type, err);
                return Err(err.into());
            }
        };
        let resource = K8sResource::from_value(object)?;
        let resource_version = resource.resource_version().to_owned();
        self.send(event_type, &resource).await?;
        Ok(resource_version)
    }

    async fn send(&mut self, event_type: EventType, resource: &K8sResource) -> Result<(), WatcherErr> {
        if let Some(parent_id) = self.lookup.parent_of(&event_type, resource) {
            let message = ResourceMessage {
                event_type,
                resource_type: self.k8s_type,
                resource_id: resource.get_object_id().to_owned(),
                parent_id,
            };
            self.sender.send(message).await?;
        }
        Ok(())
    }

    /// Sends an `Updated` message for every existing object, and returns the resource version of the list
    async fn list_all(&mut self) -> Result<String, WatcherErr> {
        log::info!(
            "Listing {} with selector: {:?}",
            self.k8s_type,
            self.label_selector
        );
        self.lookup.clear();
        self.metrics.request_started();
        let ObjectList { metadata, items } = self
            .client
            .list(
                self.k8s_type,
                self.namespace.as_deref(),
                self.label_selector.as_deref(),
            )
            .await?;
        let resource_version = metadata.resource_version.ok_or_else(|| {
            InvalidResourceError::new(
                "list result from api server is missing metadata.resourceVersion",
                Value::Null,
            )
        })?;

        for mut object in items {
            self.add_type_to_list_item(&mut object)?;
            let resource = K8sResource::from_value(object)?;
            self.send(EventType::Updated, &resource).await?;
        }
        Ok(resource_version)
    }

    /// Items in a list response don't have their own apiVersion and kind
    fn add_type_to_list_item(&self, item: &mut Value) -> Result<(), InvalidResourceError> {
        match item.as_object_mut() {
            Some(obj) => {
                obj.insert("apiVersion".to_owned(), self.k8s_type.api_version.into());
                obj.insert("kind".to_owned(), self.k8s_type.kind.into());
                Ok(())
            }
            None => Err(InvalidResourceError::new(
                "list item must be an object",
                item.clone(),
            )),
        }
    }
}
