//! Event polling and fragment-reassembly engine
//!
//! Drains the per-endpoint priority queues by pulling each pending event's
//! payload fragment by fragment over a stop-and-wait exchange. Each poll
//! cycle runs Idle → Requesting → (Partial → Requesting)* and ends in
//! Complete, ChecksumInvalid, or TimedOut before returning to Idle. Payloads
//! spanning several fragments are CRC32-gated before dispatch; a corrupt
//! payload is still acknowledged so it cannot wedge the terminus's event
//! queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use termlink_proto::{
    event_class, EndpointId, EventId, PollEventResponse, Request, Response, Tid,
    TransferFlag, TransferOperation, COMPLETION_SUCCESS, EVENT_ID_INVALID, EVENT_ID_NONE,
    FORMAT_VERSION,
};
use termlink_transport::{Correlator, TokenPool};
use tokio::sync::watch;
use tokio::time::timeout;

use crate::config::EngineConfig;
use crate::queues::{EnqueueOutcome, EventQueues, Priority};
use crate::registry::HandlerRegistry;

/// Terminal state of one poll cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing pending, or the response carried a sentinel id
    Idle,
    /// Payload reassembled, verified, and dispatched
    Complete(EventId),
    /// Payload reassembled but failed the integrity check; acknowledged
    /// without dispatch
    ChecksumInvalid(EventId),
    /// No response within the deadline; the id stays queued for retry
    TimedOut(EventId),
    /// Retry ceiling exceeded; the id was dropped from its queue
    Dropped(EventId),
}

/// Per in-flight event reassembly state
struct Reassembly {
    operation: TransferOperation,
    transfer_handle: u32,
    tid: Tid,
    event_class: u8,
    buffer: BytesMut,
}

impl Reassembly {
    fn new() -> Self {
        Self {
            operation: TransferOperation::FirstPart,
            transfer_handle: 0,
            tid: 0,
            event_class: 0,
            buffer: BytesMut::new(),
        }
    }
}

struct PollState {
    queues: EventQueues,
    reassembly: HashMap<EventId, Reassembly>,
    attempts: HashMap<EventId, u32>,
}

/// What a processed response asks the cycle to do next
enum Action {
    /// More fragments expected, issue the next request immediately
    Continue,
    Stop(CycleOutcome),
    /// Terminal fragment: maybe dispatch, then acknowledge
    Finish {
        id: EventId,
        dispatch: Option<(Tid, u8, Bytes)>,
        outcome: CycleOutcome,
    },
}

/// How a transfer attempt failed, from the cycle's point of view
enum TransferFailure {
    /// Deadline expired or the terminus never answered
    Timeout,
    /// Codec rejected the exchange locally
    Local,
    /// Token space exhausted; skip this tick entirely
    NoToken,
}

/// The per-endpoint polling engine
pub struct EventPoller {
    endpoint: EndpointId,
    correlator: Arc<dyn Correlator>,
    tokens: Arc<TokenPool>,
    registry: HandlerRegistry,
    config: EngineConfig,
    state: Mutex<PollState>,
    drain: AtomicBool,
    drained_tx: watch::Sender<bool>,
}

impl EventPoller {
    pub fn new(
        endpoint: EndpointId,
        correlator: Arc<dyn Correlator>,
        tokens: Arc<TokenPool>,
        config: EngineConfig,
    ) -> Self {
        let (drained_tx, _) = watch::channel(true);
        Self {
            endpoint,
            correlator,
            tokens,
            registry: HandlerRegistry::new(),
            state: Mutex::new(PollState {
                queues: EventQueues::new(config.queue_capacity),
                reassembly: HashMap::new(),
                attempts: HashMap::new(),
            }),
            config,
            drain: AtomicBool::new(false),
            drained_tx,
        }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Queue an event id for polling. Idempotent; rejected beyond capacity.
    pub fn enqueue(&self, priority: Priority, id: EventId) -> EnqueueOutcome {
        let mut state = self.lock_state();
        let outcome = state.queues.enqueue(priority, id);
        match outcome {
            EnqueueOutcome::Queued => {
                tracing::debug!(
                    endpoint = self.endpoint,
                    event_id = format_args!("{id:#x}"),
                    ?priority,
                    "queued event for polling"
                );
                if matches!(priority, Priority::Alarm | Priority::Overflow) {
                    self.drained_tx.send_replace(false);
                }
            }
            EnqueueOutcome::Rejected => {
                tracing::warn!(
                    endpoint = self.endpoint,
                    event_id = format_args!("{id:#x}"),
                    ?priority,
                    "event queue full, notification rejected"
                );
            }
            EnqueueOutcome::AlreadyQueued => {}
        }
        outcome
    }

    /// "No alarm or overflow events pending" — gates disruptive operations
    /// such as a firmware-update handoff.
    pub fn alarm_queues_idle(&self) -> bool {
        self.lock_state().queues.alarm_tiers_empty()
    }

    /// Observe transitions of [`alarm_queues_idle`](Self::alarm_queues_idle).
    pub fn subscribe_drained(&self) -> watch::Receiver<bool> {
        self.drained_tx.subscribe()
    }

    /// Poll faster until the alarm tiers are flushed.
    pub fn set_drain(&self, drain: bool) {
        self.drain.store(drain, Ordering::Relaxed);
    }

    pub fn drain_active(&self) -> bool {
        self.drain.load(Ordering::Relaxed)
    }

    /// Tick loop; runs until the owning task is aborted.
    pub async fn run(self: Arc<Self>) {
        loop {
            let interval = if self.drain_active() {
                self.config.drain_interval()
            } else {
                self.config.poll_interval()
            };
            tokio::time::sleep(interval).await;
            self.poll_cycle().await;
        }
    }

    /// One full poll cycle: service the highest-priority pending id (or send
    /// a keepalive probe) and follow the transfer to a terminal state.
    pub async fn poll_cycle(&self) -> CycleOutcome {
        loop {
            let (event_id, operation, transfer_handle) = self.next_request();
            let request = Request::PollEvent {
                format_version: FORMAT_VERSION,
                operation,
                transfer_handle,
                event_id_to_ack: event_id,
            };

            let response = match self.transfer(request).await {
                Ok(Response::PollEvent(response)) => response,
                Ok(other) => {
                    tracing::warn!(
                        endpoint = self.endpoint,
                        response = ?other,
                        "correlator returned non-poll response to poll request"
                    );
                    return CycleOutcome::Idle;
                }
                Err(TransferFailure::NoToken) => return CycleOutcome::Idle,
                Err(TransferFailure::Timeout) | Err(TransferFailure::Local) => {
                    return self.attempt_failed(event_id);
                }
            };

            match self.handle_response(event_id, response) {
                Action::Continue => continue,
                Action::Stop(outcome) => return outcome,
                Action::Finish {
                    id,
                    dispatch,
                    outcome,
                } => {
                    if let Some((tid, class, payload)) = dispatch {
                        self.registry.dispatch(tid, class, id, payload);
                    }
                    self.acknowledge(id).await;
                    return outcome;
                }
            }
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PollState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Pick the next request to issue: resume an in-flight reassembly for
    /// the queue front, start its first fragment, or probe with the
    /// keepalive id when every tier is empty.
    fn next_request(&self) -> (EventId, TransferOperation, u32) {
        let state = self.lock_state();
        match state.queues.front() {
            Some((_, id)) => match state.reassembly.get(&id) {
                Some(entry) => (id, entry.operation, entry.transfer_handle),
                None => (id, TransferOperation::FirstPart, 0),
            },
            None => (EVENT_ID_NONE, TransferOperation::FirstPart, 0),
        }
    }

    /// Reserve a token, run the exchange under the retry-budget deadline,
    /// and free the token on every path.
    async fn transfer(&self, request: Request) -> Result<Response, TransferFailure> {
        let token = match self.tokens.next(self.endpoint) {
            Ok(token) => token,
            Err(error) => {
                tracing::warn!(endpoint = self.endpoint, %error, "skipping poll tick");
                return Err(TransferFailure::NoToken);
            }
        };

        let result = timeout(
            self.config.request_deadline(),
            self.correlator.transfer(self.endpoint, token, request),
        )
        .await;
        let _ = self.tokens.free(self.endpoint, token);

        match result {
            Err(_) => Err(TransferFailure::Timeout),
            Ok(Err(error)) if error.is_local() => {
                tracing::warn!(endpoint = self.endpoint, %error, "poll exchange failed locally");
                Err(TransferFailure::Local)
            }
            Ok(Err(error)) => {
                tracing::debug!(endpoint = self.endpoint, %error, "no response to poll");
                Err(TransferFailure::Timeout)
            }
            Ok(Ok(response)) => Ok(response),
        }
    }

    /// A poll attempt failed: discard the attempt's reassembly progress and
    /// either leave the id at the front for retry or drop it once the
    /// configured ceiling is exceeded.
    fn attempt_failed(&self, event_id: EventId) -> CycleOutcome {
        if event_id == EVENT_ID_NONE {
            // keepalive probe went unanswered; nothing to retry
            return CycleOutcome::Idle;
        }

        let mut state = self.lock_state();
        state.reassembly.remove(&event_id);
        let attempts = state.attempts.entry(event_id).or_insert(0);
        *attempts += 1;
        if *attempts > self.config.max_attempts {
            state.queues.remove(event_id);
            state.attempts.remove(&event_id);
            tracing::warn!(
                endpoint = self.endpoint,
                event_id = format_args!("{event_id:#x}"),
                max_attempts = self.config.max_attempts,
                "retry ceiling exceeded, dropping event without delivery"
            );
            if state.queues.alarm_tiers_empty() {
                self.drained_tx.send_replace(true);
            }
            CycleOutcome::Dropped(event_id)
        } else {
            tracing::debug!(
                endpoint = self.endpoint,
                event_id = format_args!("{event_id:#x}"),
                attempt = *attempts,
                "poll attempt timed out, will retry"
            );
            CycleOutcome::TimedOut(event_id)
        }
    }

    fn handle_response(&self, requested: EventId, response: PollEventResponse) -> Action {
        if response.completion != COMPLETION_SUCCESS {
            tracing::warn!(
                endpoint = self.endpoint,
                completion = response.completion,
                "terminus rejected poll request"
            );
            return Action::Stop(self.attempt_failed(requested));
        }

        let id = response.event_id;

        if id == EVENT_ID_NONE {
            let mut state = self.lock_state();
            if let Some(stale) = state.queues.pop_overflow_front() {
                state.reassembly.remove(&stale);
                state.attempts.remove(&stale);
                tracing::debug!(
                    endpoint = self.endpoint,
                    event_id = format_args!("{stale:#x}"),
                    "terminus reports nothing pending, clearing stale overflow entry"
                );
            }
            if state.queues.alarm_tiers_empty() {
                self.drained_tx.send_replace(true);
            }
            return Action::Stop(CycleOutcome::Idle);
        }
        if id == EVENT_ID_INVALID {
            return Action::Stop(CycleOutcome::Idle);
        }

        if id != requested {
            return self.handle_unsolicited(response);
        }

        let mut state = self.lock_state();
        state.attempts.remove(&id);

        let entry = state
            .reassembly
            .entry(id)
            .or_insert_with(Reassembly::new);
        entry.tid = response.tid;
        entry.event_class = response.event_class;

        match response.transfer_flag {
            TransferFlag::Start => {
                entry.buffer.clear();
                entry.buffer.extend_from_slice(&response.data);
                entry.operation = TransferOperation::NextPart;
                entry.transfer_handle = response.next_transfer_handle;
                Action::Continue
            }
            TransferFlag::Middle => {
                entry.buffer.extend_from_slice(&response.data);
                entry.operation = TransferOperation::NextPart;
                entry.transfer_handle = response.next_transfer_handle;
                Action::Continue
            }
            TransferFlag::End | TransferFlag::StartAndEnd => {
                entry.buffer.extend_from_slice(&response.data);
                let multi = response.transfer_flag == TransferFlag::End;
                let tid = entry.tid;
                let class = entry.event_class;
                let payload = std::mem::take(&mut entry.buffer).freeze();

                state.queues.remove(id);
                state.reassembly.remove(&id);
                if state.queues.alarm_tiers_empty() {
                    self.drained_tx.send_replace(true);
                }
                drop(state);

                // single-fragment transfers are accepted unconditionally
                let verified = !multi || crc32fast::hash(&payload) == response.checksum;
                if verified {
                    Action::Finish {
                        id,
                        dispatch: Some((tid, class, payload)),
                        outcome: CycleOutcome::Complete(id),
                    }
                } else {
                    tracing::warn!(
                        endpoint = self.endpoint,
                        event_id = format_args!("{id:#x}"),
                        expected = format_args!("{:#x}", response.checksum),
                        computed = format_args!("{:#x}", crc32fast::hash(&payload)),
                        "checksum mismatch, payload discarded but event acknowledged"
                    );
                    Action::Finish {
                        id,
                        dispatch: None,
                        outcome: CycleOutcome::ChecksumInvalid(id),
                    }
                }
            }
        }
    }

    /// The terminus answered with an id we did not ask for: either a payload
    /// it pushed on its own initiative (stash and queue it) or a stale
    /// response for something already tracked (drop it).
    fn handle_unsolicited(&self, response: PollEventResponse) -> Action {
        let id = response.event_id;
        let mut state = self.lock_state();

        if state.queues.contains(id) || state.reassembly.contains_key(&id) {
            tracing::warn!(
                endpoint = self.endpoint,
                event_id = format_args!("{id:#x}"),
                "response id does not match the id being serviced, dropped"
            );
            return Action::Stop(CycleOutcome::Idle);
        }

        match response.transfer_flag {
            TransferFlag::StartAndEnd => {
                // complete payload in one unsolicited fragment, deliver now
                drop(state);
                Action::Finish {
                    id,
                    dispatch: Some((response.tid, response.event_class, response.data)),
                    outcome: CycleOutcome::Complete(id),
                }
            }
            TransferFlag::End => {
                // final fragment of a transfer we never started; unusable,
                // but acknowledge so the terminus releases the event
                tracing::warn!(
                    endpoint = self.endpoint,
                    event_id = format_args!("{id:#x}"),
                    "orphan final fragment, acknowledging without dispatch"
                );
                drop(state);
                Action::Finish {
                    id,
                    dispatch: None,
                    outcome: CycleOutcome::Idle,
                }
            }
            TransferFlag::Start | TransferFlag::Middle => {
                let priority = if response.event_class == event_class::MESSAGE_POLL {
                    Priority::Alarm
                } else {
                    Priority::Default
                };
                if state.queues.enqueue(priority, id) == EnqueueOutcome::Rejected {
                    tracing::warn!(
                        endpoint = self.endpoint,
                        event_id = format_args!("{id:#x}"),
                        "queue full, unsolicited event dropped"
                    );
                    return Action::Stop(CycleOutcome::Idle);
                }
                if matches!(priority, Priority::Alarm) {
                    self.drained_tx.send_replace(false);
                }
                let mut entry = Reassembly::new();
                entry.tid = response.tid;
                entry.event_class = response.event_class;
                entry.buffer.extend_from_slice(&response.data);
                entry.operation = TransferOperation::NextPart;
                entry.transfer_handle = response.next_transfer_handle;
                state.reassembly.insert(id, entry);
                Action::Stop(CycleOutcome::Idle)
            }
        }
    }

    /// Acknowledge-only exchange so the terminus releases the event id.
    /// Failure is logged; the terminus will re-offer the event and the
    /// normal flow handles the duplicate.
    async fn acknowledge(&self, id: EventId) {
        let request = Request::PollEvent {
            format_version: FORMAT_VERSION,
            operation: TransferOperation::AcknowledgementOnly,
            transfer_handle: 0,
            event_id_to_ack: id,
        };
        if let Err(TransferFailure::Timeout | TransferFailure::Local) =
            self.transfer(request).await
        {
            tracing::warn!(
                endpoint = self.endpoint,
                event_id = format_args!("{id:#x}"),
                "failed to acknowledge event"
            );
        }
    }

    /// Pending-id count across all tiers (observability)
    pub fn pending(&self) -> usize {
        self.lock_state().queues.len()
    }
}
