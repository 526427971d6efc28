//! Endpoint lifecycle management
//!
//! One manager per controller. Adding an endpoint spawns its discovery run
//! and its polling loop as reactor tasks; removing it aborts both and
//! invalidates everything the repository learned about it. Notifications
//! from the delivery channel are classified here and fed into the right
//! endpoint's queues.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use termlink_proto::{EndpointId, Notification, Tid, TID_UNASSIGNED};
use termlink_transport::{Correlator, TokenPool};
use tokio::task::JoinHandle;

use crate::classify::Classifier;
use crate::config::{EngineConfig, NameMap};
use crate::consumers::{ObjectFactory, Repository};
use crate::discovery::{DiscoveryOutcome, Terminus};
use crate::poller::EventPoller;
use crate::queues::EnqueueOutcome;

struct ManagedEndpoint {
    poller: Arc<EventPoller>,
    poll_task: JoinHandle<()>,
    discovery_task: JoinHandle<()>,
    discovery: Arc<OnceLock<(DiscoveryOutcome, Tid)>>,
}

/// Owns every managed endpoint's tasks and routes notifications to them.
pub struct EndpointManager {
    config: EngineConfig,
    correlator: Arc<dyn Correlator>,
    tokens: Arc<TokenPool>,
    repository: Arc<dyn Repository>,
    factory: Arc<dyn ObjectFactory>,
    names: NameMap,
    classifier: Classifier,
    endpoints: Mutex<HashMap<EndpointId, ManagedEndpoint>>,
}

impl EndpointManager {
    pub fn new(
        config: EngineConfig,
        correlator: Arc<dyn Correlator>,
        repository: Arc<dyn Repository>,
        factory: Arc<dyn ObjectFactory>,
    ) -> Self {
        Self {
            config,
            correlator,
            tokens: Arc::new(TokenPool::new()),
            repository,
            factory,
            names: NameMap::default(),
            classifier: Classifier::new(),
            endpoints: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_names(mut self, names: NameMap) -> Self {
        self.names = names;
        self
    }

    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Start managing `endpoint`: spawn its discovery chain and polling loop.
    /// Re-adding an endpoint restarts both from scratch.
    pub fn add_endpoint(&self, endpoint: EndpointId) {
        self.remove_endpoint(endpoint);

        let poller = Arc::new(EventPoller::new(
            endpoint,
            self.correlator.clone(),
            self.tokens.clone(),
            self.config.clone(),
        ));
        let poll_task = tokio::spawn(poller.clone().run());

        let discovery = Arc::new(OnceLock::new());
        let discovery_task = {
            let outcome_slot = discovery.clone();
            let repository = self.repository.clone();
            let factory = self.factory.clone();
            let mut terminus = Terminus::new(
                endpoint,
                self.correlator.clone(),
                self.tokens.clone(),
                self.config.clone(),
            )
            .with_decoration(self.names.get(endpoint).cloned());
            tokio::spawn(async move {
                let outcome = terminus.discover(repository.as_ref(), factory.as_ref()).await;
                tracing::info!(
                    endpoint,
                    responsive = outcome.responsive,
                    records = outcome.records_loaded,
                    complete = outcome.records_complete,
                    "discovery finished"
                );
                let _ = outcome_slot.set((outcome, terminus.profile().tid));
            })
        };

        let mut endpoints = self.lock_endpoints();
        endpoints.insert(
            endpoint,
            ManagedEndpoint {
                poller,
                poll_task,
                discovery_task,
                discovery,
            },
        );
        tracing::info!(endpoint, "endpoint added");
    }

    pub fn add_endpoints(&self, endpoints: &[EndpointId]) {
        for &endpoint in endpoints {
            self.add_endpoint(endpoint);
        }
    }

    pub fn remove_endpoints(&self, endpoints: &[EndpointId]) {
        for &endpoint in endpoints {
            self.remove_endpoint(endpoint);
        }
    }

    /// Stop managing `endpoint`: abort its tasks and drop its records.
    pub fn remove_endpoint(&self, endpoint: EndpointId) {
        let removed = {
            let mut endpoints = self.lock_endpoints();
            endpoints.remove(&endpoint)
        };
        if let Some(managed) = removed {
            managed.poll_task.abort();
            managed.discovery_task.abort();
            self.repository.invalidate(endpoint);
            tracing::info!(endpoint, "endpoint removed");
        }
    }

    /// Feed one pushed notification through the classifier into the right
    /// endpoint's queues. Returns what happened to it.
    pub fn notify(&self, endpoint: EndpointId, notification: &Notification) -> Option<EnqueueOutcome> {
        let (priority, event_id) = self.classifier.classify(notification)?;
        let poller = self.poller(endpoint);
        match poller {
            Some(poller) => Some(poller.enqueue(priority, event_id)),
            None => {
                tracing::warn!(endpoint, "notification for unmanaged endpoint dropped");
                None
            }
        }
    }

    /// Route a notification by the terminus id it names. When no managed
    /// endpoint has claimed that tid yet, every endpoint's queues get the
    /// classified id; the idempotent enqueue makes the fan-out harmless.
    pub fn dispatch_notification(&self, notification: &Notification) {
        let tid = match notification {
            Notification::MessagePoll { tid, .. } => *tid,
            Notification::NumericSensor { tid, .. } => *tid,
        };
        if let Some(endpoint) = self.endpoint_for_tid(tid) {
            self.notify(endpoint, notification);
            return;
        }
        let Some((priority, event_id)) = self.classifier.classify(notification) else {
            return;
        };
        tracing::debug!(tid, "tid not yet mapped, offering event to all endpoints");
        let pollers: Vec<_> = {
            let endpoints = self.lock_endpoints();
            endpoints.values().map(|m| m.poller.clone()).collect()
        };
        for poller in pollers {
            poller.enqueue(priority, event_id);
        }
    }

    pub fn poller(&self, endpoint: EndpointId) -> Option<Arc<EventPoller>> {
        self.lock_endpoints().get(&endpoint).map(|m| m.poller.clone())
    }

    /// Discovery outcome for `endpoint`, once its run has finished.
    pub fn discovery_outcome(&self, endpoint: EndpointId) -> Option<DiscoveryOutcome> {
        self.lock_endpoints()
            .get(&endpoint)
            .and_then(|m| m.discovery.get().map(|(outcome, _)| *outcome))
    }

    fn endpoint_for_tid(&self, tid: Tid) -> Option<EndpointId> {
        if tid == TID_UNASSIGNED {
            return None;
        }
        let endpoints = self.lock_endpoints();
        endpoints
            .iter()
            .find(|(_, m)| matches!(m.discovery.get(), Some((_, t)) if *t == tid))
            .map(|(endpoint, _)| *endpoint)
    }

    pub fn managed_endpoints(&self) -> Vec<EndpointId> {
        let mut ids: Vec<_> = self.lock_endpoints().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn lock_endpoints(&self) -> std::sync::MutexGuard<'_, HashMap<EndpointId, ManagedEndpoint>> {
        self.endpoints.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for EndpointManager {
    fn drop(&mut self) {
        let endpoints = self.lock_endpoints();
        for managed in endpoints.values() {
            managed.poll_task.abort();
            managed.discovery_task.abort();
        }
    }
}
