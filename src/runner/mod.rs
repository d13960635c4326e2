//! The long running part of the operator. Watches feed `ResourceMessage`s into a single channel,
//! and the `OperatorState` loop turns them into reconciles that run on a bounded pool of tasks.
//! At most one reconcile per application is in flight. Events that arrive while one is running
//! are coalesced into a single follow-up reconcile.
pub mod client;
mod informer;
mod metrics;
mod server;

pub use self::client::Client;
pub use self::metrics::Metrics;

use crate::config::{ClientConfig, OperatorConfig};
use crate::k8s_types::siab_io::v1alpha1::SIABApplication;
use crate::k8s_types::{self, K8sType};
use crate::reconcile::{ClusterApi, Outcome, Reconciler};
use crate::resource::ObjectId;
use crate::runner::informer::{EventType, ResourceMessage};

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::sync::Semaphore;

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::sync::Arc;
use std::time::{Duration, Instant};

const CHANNEL_CAPACITY: usize = 1024;

/// The types of children that are watched, in addition to `SIABApplication`s
static CHILD_TYPES: &[&K8sType] = &[
    k8s_types::apps::v1::Deployment,
    k8s_types::core::v1::Service,
    k8s_types::networking_k8s_io::v1::NetworkPolicy,
    k8s_types::core::v1::PersistentVolumeClaim,
];

#[derive(Debug)]
pub struct UnexpectedShutdownError;
impl Display for UnexpectedShutdownError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Operator shutdown due to an unexpected error")
    }
}
impl std::error::Error for UnexpectedShutdownError {}

/// Starts the operator and blocks the current thread until the operator shuts down due to an error.
pub fn run_operator(config: OperatorConfig, client_config: ClientConfig) -> anyhow::Error {
    let metrics = match Metrics::new() {
        Ok(m) => Arc::new(m),
        Err(err) => return err.into(),
    };
    let client = match Client::new(client_config, metrics.client_metrics()) {
        Ok(c) => c,
        Err(err) => return err.into(),
    };
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(err) => return err.into(),
    };
    runtime.block_on(run_with_client(metrics, config, client));
    log::warn!("Operator stopped, shutting down runtime");
    // the operator never stops under normal circumstances
    anyhow::Error::new(UnexpectedShutdownError)
}

async fn run_with_client(metrics: Arc<Metrics>, config: OperatorConfig, client: Client) {
    log::debug!("Starting operator with configuration: {:?}", config);
    let (tx, rx) = tokio::sync::mpsc::channel::<ResourceMessage>(CHANNEL_CAPACITY);

    informer::start_parent_monitor(
        config.namespace.clone(),
        SIABApplication,
        client.clone(),
        tx.clone(),
        metrics.watcher_metrics(SIABApplication),
    );
    for child_type in CHILD_TYPES.iter().copied() {
        informer::start_child_monitor(
            config.namespace.clone(),
            child_type,
            client.clone(),
            tx.clone(),
            metrics.watcher_metrics(child_type),
        );
    }

    let server = server::start(
        config.server_port,
        metrics.clone(),
        config.expose_metrics,
        config.expose_health,
    );
    let reconciler = Reconciler::new(Arc::new(client), &config);
    let mut state = OperatorState::new(reconciler, metrics, &config, tx, rx);
    futures_util::future::join(server, state.run()).await;
}

struct ParentState {
    in_progress: Option<Instant>,
    /// Set when an event arrives while a reconcile is in progress
    needs_sync: bool,
    /// Incremented every time a reconcile starts, so that stale scheduled resyncs can be recognized
    sync_counter: u32,
    retry_timer: ExponentialBackoff,
}

impl ParentState {
    fn new(max_backoff: Duration) -> ParentState {
        let mut retry_timer = ExponentialBackoff {
            initial_interval: Duration::from_millis(100),
            max_interval: max_backoff,
            max_elapsed_time: None,
            ..Default::default()
        };
        retry_timer.reset();
        ParentState {
            in_progress: None,
            needs_sync: false,
            sync_counter: 0,
            retry_timer,
        }
    }

    fn is_update_in_progress(&self) -> bool {
        self.in_progress.is_some()
    }
}

struct OperatorState<C: ClusterApi> {
    reconciler: Reconciler<C>,
    metrics: Arc<Metrics>,
    workers: Arc<Semaphore>,
    resync_period: Option<Duration>,
    max_backoff: Duration,
    sender: Sender<ResourceMessage>,
    receiver: Receiver<ResourceMessage>,
    parent_states: HashMap<ObjectId, ParentState>,
}

impl<C: ClusterApi> OperatorState<C> {
    fn new(
        reconciler: Reconciler<C>,
        metrics: Arc<Metrics>,
        config: &OperatorConfig,
        sender: Sender<ResourceMessage>,
        receiver: Receiver<ResourceMessage>,
    ) -> OperatorState<C> {
        OperatorState {
            reconciler,
            metrics,
            workers: Arc::new(Semaphore::new(config.workers.max(1))),
            resync_period: config.resync_period,
            max_backoff: config.max_backoff,
            sender,
            receiver,
            parent_states: HashMap::new(),
        }
    }

    async fn run(&mut self) {
        while self.process_next().await {}
        log::warn!("All watches have stopped, stopping operator");
    }

    /// Handles a single message. Returns false once every sender is gone.
    async fn process_next(&mut self) -> bool {
        match self.receiver.recv().await {
            Some(message) => {
                log::trace!("Received: {:?}", message);
                self.handle_received_message(message);
                true
            }
            None => false,
        }
    }

    fn handle_received_message(&mut self, message: ResourceMessage) {
        let ResourceMessage {
            event_type,
            resource_type,
            resource_id,
            parent_id,
        } = message;

        match event_type {
            EventType::ReconcileComplete { result } => self.reconcile_finished(parent_id, result),
            EventType::TriggerResync { resync_round } => {
                let current = self.parent_states.get(&parent_id).map(|ps| ps.sync_counter);
                if current == Some(resync_round) {
                    log::debug!("Triggering scheduled reconcile of {}", parent_id);
                    self.request_reconcile(parent_id);
                } else {
                    log::debug!(
                        "Skipping scheduled reconcile of {} since another one happened in the meantime",
                        parent_id
                    );
                }
            }
            other => {
                self.metrics.event_received();
                log::debug!(
                    "Reconcile of {} requested by event: {:?} on {} {}",
                    parent_id,
                    other,
                    resource_type,
                    resource_id
                );
                self.request_reconcile(parent_id);
            }
        }
    }

    fn request_reconcile(&mut self, parent_id: ObjectId) {
        let max_backoff = self.max_backoff;
        let state = self
            .parent_states
            .entry(parent_id.clone())
            .or_insert_with(|| ParentState::new(max_backoff));
        if state.is_update_in_progress() {
            state.needs_sync = true;
        } else {
            self.start_reconcile(parent_id);
        }
    }

    fn start_reconcile(&mut self, parent_id: ObjectId) {
        let state = match self.parent_states.get_mut(&parent_id) {
            Some(state) => state,
            None => return,
        };
        state.in_progress = Some(Instant::now());
        state.needs_sync = false;
        state.sync_counter = state.sync_counter.wrapping_add(1);
        self.metrics.reconcile_started(&parent_id.as_id_ref());

        let reconciler = self.reconciler.clone();
        let workers = self.workers.clone();
        let sender = self.sender.clone();
        tokio::spawn(async move {
            let result = match workers.acquire_owned().await {
                Ok(_permit) => reconciler
                    .reconcile(&parent_id.as_id_ref())
                    .await
                    .map_err(|err| {
                        log::error!("Failed to reconcile {}: {}", parent_id, err);
                    }),
                Err(_) => Err(()),
            };
            let message = ResourceMessage {
                event_type: EventType::ReconcileComplete { result },
                resource_type: SIABApplication,
                resource_id: parent_id.clone(),
                parent_id,
            };
            if sender.send(message).await.is_err() {
                log::warn!("Unable to send reconcile result since the operator is stopping");
            }
        });
    }

    fn reconcile_finished(&mut self, parent_id: ObjectId, result: Result<Outcome, ()>) {
        let state = match self.parent_states.get_mut(&parent_id) {
            Some(state) => state,
            None => {
                log::error!("Got a reconcile result for {} which was not in progress", parent_id);
                return;
            }
        };
        let duration = state.in_progress.take().map(|start| start.elapsed());
        log::info!(
            "Finished reconcile of {} in {:?} with result: {:?}",
            parent_id,
            duration.unwrap_or_default(),
            result
        );

        if result.is_err() {
            self.metrics.reconcile_error(&parent_id.as_id_ref());
        }
        if state.needs_sync {
            self.start_reconcile(parent_id);
            return;
        }
        match result {
            Ok(Outcome::Deleted) => {
                self.parent_states.remove(&parent_id);
                self.metrics.application_deleted(&parent_id.as_id_ref());
            }
            Ok(Outcome::Synced) => {
                state.retry_timer.reset();
                if let Some(period) = self.resync_period {
                    let round = state.sync_counter;
                    self.schedule_resync(parent_id, round, period);
                }
            }
            Err(()) => {
                let delay = state
                    .retry_timer
                    .next_backoff()
                    .unwrap_or(self.max_backoff);
                let round = state.sync_counter;
                self.schedule_resync(parent_id, round, delay);
            }
        }
    }

    fn schedule_resync(&self, parent_id: ObjectId, resync_round: u32, delay: Duration) {
        log::debug!(
            "Scheduling reconcile of {} with sync_counter: {} in {:?}",
            parent_id,
            resync_round,
            delay
        );
        let sender = self.sender.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let message = ResourceMessage {
                event_type: EventType::TriggerResync { resync_round },
                resource_type: SIABApplication,
                resource_id: parent_id.clone(),
                parent_id,
            };
            if sender.send(message).await.is_err() {
                log::warn!("Unable to send resync message");
            }
        });
    }
}
