//! The relay bridging client.
//!
//! Widgets embedded in the host platform cannot open outbound
//! connections of their own; everything they need from the outside
//! world funnels through batched POST exchanges with a relay. This
//! module owns the session lifecycle, the three call queues, and the
//! polling engine that keeps them moving.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use reqwest::StatusCode;
use serde_json::Value;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::error::{RelayError, RelayResult};
use crate::protocol::{self, BatchRequest, BatchResponse, InitRequest, OutgoingCall};
use crate::state::RelayState;
use crate::store::{FileKeyStore, KeyStore};
use crate::transport::{HttpRelayTransport, RelayTransport};

const LOG_TARGET: &str = "pontoon::client";
const SESSION_NOT_FOUND: &str = "session not found";
const RETRY_DELAY_CAP: Duration = Duration::from_millis(2000);

/// A host-API invocation to tunnel through the relay.
#[derive(Debug, Clone)]
pub struct HostCall {
    pub method: String,
    pub params: Value,
}

impl HostCall {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

type Completion = oneshot::Sender<RelayResult<Value>>;

struct PendingCall {
    method: String,
    params: Value,
    completion: Completion,
    queued_at: Instant,
}

struct ActiveCall {
    method: String,
    completion: Completion,
    queued_at: Instant,
}

// Everything a batch round drains out of the live queues before its
// network await. Restored wholesale if the round fails.
struct RoundSnapshot {
    pending: HashMap<String, PendingCall>,
    completed: HashSet<String>,
}

struct ClientState {
    key: Option<String>,
    broken: bool,
    last_error: Option<String>,
    poll_interval: Duration,
    processing: bool,
    // Bumped by every teardown; a round whose generation no longer
    // matches must not touch the queues it left behind.
    generation: u64,
    pending: HashMap<String, PendingCall>,
    active: HashMap<String, ActiveCall>,
    completed: HashSet<String>,
    timer: Option<JoinHandle<()>>,
}

impl ClientState {
    fn new(poll_interval: Duration) -> Self {
        Self {
            key: None,
            broken: false,
            last_error: None,
            poll_interval,
            processing: false,
            generation: 0,
            pending: HashMap::new(),
            active: HashMap::new(),
            completed: HashSet::new(),
            timer: None,
        }
    }

    fn snapshot(&self) -> RelayState {
        RelayState {
            connected: !self.broken && self.key.is_some() && self.last_error.is_none(),
            processing: self.processing,
            error: self.last_error.clone(),
            poll_interval_ms: self.poll_interval.as_millis() as u64,
            pending: self.pending.len(),
            active: self.active.len(),
            completed: self.completed.len(),
        }
    }
}

struct ClientInner {
    config: RelayConfig,
    transport: Arc<dyn RelayTransport>,
    store: Arc<dyn KeyStore>,
    state: Mutex<ClientState>,
    state_tx: watch::Sender<RelayState>,
}

impl ClientInner {
    fn publish(&self, state: &ClientState) {
        self.state_tx.send_replace(state.snapshot());
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(timer) = self.state.get_mut().timer.take() {
            timer.abort();
        }
    }
}

/// Stateful bridge between widget code and the relay endpoint. Cheap
/// to clone; clones share one session, queue set, and scheduler.
#[derive(Clone)]
pub struct RelayClient {
    inner: Arc<ClientInner>,
}

impl RelayClient {
    pub fn new(config: RelayConfig) -> RelayResult<Self> {
        let transport = Arc::new(HttpRelayTransport::new(config.endpoint().clone())?);
        let store = Arc::new(FileKeyStore::new(FileKeyStore::default_path()?));
        Ok(Self::with_parts(config, transport, store))
    }

    /// Client with an injected transport and key store.
    pub fn with_parts(
        config: RelayConfig,
        transport: Arc<dyn RelayTransport>,
        store: Arc<dyn KeyStore>,
    ) -> Self {
        let state = ClientState::new(config.initial_poll_interval());
        let (state_tx, _) = watch::channel(state.snapshot());
        Self {
            inner: Arc::new(ClientInner {
                config,
                transport,
                store,
                state: Mutex::new(state),
                state_tx,
            }),
        }
    }

    /// Adopts, replaces, or clears the session key. Every variant
    /// first resets the connection, rejecting outstanding calls with
    /// [`RelayError::Reset`]. With a key present the handshake then
    /// runs: a 404 forgets the key and reports [`RelayError::KeyNotFound`],
    /// any other failure keeps the key for retry.
    pub async fn set_key(&self, key: Option<&str>) -> RelayResult<()> {
        let key = key
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string);

        let (generation, timeout) = {
            let mut state = self.inner.state.lock();
            state.broken = false;
            state.last_error = None;
            teardown(&mut state);
            state.key = key.clone();
            state.poll_interval = self.inner.config.initial_poll_interval();
            match &key {
                Some(key) => {
                    if let Err(err) = self.inner.store.save(key) {
                        warn!(target: LOG_TARGET, error = %err, "failed to persist session key");
                    }
                }
                None => {
                    if let Err(err) = self.inner.store.clear() {
                        warn!(target: LOG_TARGET, error = %err, "failed to clear stored session key");
                    }
                }
            }
            self.inner.publish(&state);
            (state.generation, state.poll_interval * 2)
        };

        let Some(key) = key else {
            info!(target: LOG_TARGET, "session key cleared");
            return Ok(());
        };

        let request = serde_json::to_value(InitRequest::new(key.as_str()))
            .map_err(|err| RelayError::Protocol(err.to_string()))?;
        match self.inner.transport.exchange(&request, timeout).await {
            Ok(raw) => {
                let response = protocol::decode_init(raw)?;
                let mut state = self.inner.state.lock();
                if state.generation != generation {
                    return Err(RelayError::Reset);
                }
                if let Some(interval) = protocol::parse_poll_interval(response.interval_ms.as_ref())
                {
                    state.poll_interval = interval;
                }
                self.inner.publish(&state);
                info!(
                    target: LOG_TARGET,
                    poll_ms = state.poll_interval.as_millis() as u64,
                    "relay session established"
                );
                Ok(())
            }
            Err(err) if err.status() == Some(StatusCode::NOT_FOUND) => {
                let mut state = self.inner.state.lock();
                if state.generation != generation {
                    return Err(RelayError::Reset);
                }
                state.broken = true;
                state.key = None;
                state.last_error = Some(SESSION_NOT_FOUND.to_string());
                if let Err(store_err) = self.inner.store.clear() {
                    warn!(target: LOG_TARGET, error = %store_err, "failed to clear stored session key");
                }
                self.inner.publish(&state);
                drop(state);
                warn!(target: LOG_TARGET, "relay does not know this session key");
                Err(RelayError::KeyNotFound)
            }
            Err(err) => {
                warn!(target: LOG_TARGET, error = %err, "relay handshake failed");
                Err(err.into())
            }
        }
    }

    /// Re-establishes the session persisted by a previous run.
    /// `Ok(false)` means nothing was stored.
    pub async fn resume(&self) -> RelayResult<bool> {
        match self.inner.store.load()? {
            Some(key) => {
                debug!(target: LOG_TARGET, "resuming stored relay session");
                self.set_key(Some(key.as_str())).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Runs a host call through the relay, or through `fallback` when
    /// no usable session exists (no key, or the connection is broken).
    /// The fallback outcome is returned verbatim.
    pub async fn execute_or_fallback<F, Fut>(
        &self,
        call: HostCall,
        fallback: F,
    ) -> RelayResult<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RelayResult<Value>>,
    {
        let HostCall { method, params } = call;
        let (completion_tx, completion_rx) = oneshot::channel();

        let request_key = {
            let mut state = self.inner.state.lock();
            if state.broken || state.key.is_none() {
                None
            } else {
                let request_key = Uuid::new_v4().to_string();
                state.pending.insert(
                    request_key.clone(),
                    PendingCall {
                        method: method.clone(),
                        params,
                        completion: completion_tx,
                        queued_at: Instant::now(),
                    },
                );
                self.inner.publish(&state);
                Some(request_key)
            }
        };

        let Some(request_key) = request_key else {
            debug!(target: LOG_TARGET, method = %method, "no relay session, using local fallback");
            return fallback().await;
        };

        debug!(
            target: LOG_TARGET,
            request_key = %request_key,
            method = %method,
            "call queued for relay"
        );
        pump(&self.inner);

        match completion_rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(RelayError::Reset),
        }
    }

    pub fn state(&self) -> RelayState {
        self.inner.state_tx.borrow().clone()
    }

    /// Subscribes to state changes, starting at the current snapshot.
    pub fn watch_state(&self) -> watch::Receiver<RelayState> {
        self.inner.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    pub fn last_error(&self) -> Option<String> {
        self.state().error
    }
}

// Rejects every live call, clears all queues, cancels the timer, and
// invalidates any in-flight round.
fn teardown(state: &mut ClientState) {
    if let Some(timer) = state.timer.take() {
        timer.abort();
    }
    state.generation = state.generation.wrapping_add(1);
    for (_, call) in state.pending.drain() {
        let _ = call.completion.send(Err(RelayError::Reset));
    }
    for (_, call) in state.active.drain() {
        let _ = call.completion.send(Err(RelayError::Reset));
    }
    state.completed.clear();
    state.processing = false;
}

// One attempt to start a batch round. A no-op while a round is in
// flight, the connection is unusable, or there is nothing to send.
fn pump(inner: &Arc<ClientInner>) {
    let generation = {
        let mut state = inner.state.lock();
        if state.processing || state.broken || state.key.is_none() {
            return;
        }
        if state.pending.is_empty() && state.active.is_empty() && state.completed.is_empty() {
            return;
        }
        state.processing = true;
        inner.publish(&state);
        state.generation
    };
    let task = Arc::clone(inner);
    tokio::spawn(run_round(task, generation));
}

// Arms the round timer. Replacing an armed timer aborts it, so at most
// one tick is ever outstanding.
fn schedule(inner: &Arc<ClientInner>, state: &mut ClientState, delay: Duration) {
    let weak = Arc::downgrade(inner);
    let handle = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Some(inner) = Weak::upgrade(&weak) {
            pump(&inner);
        }
    });
    if let Some(previous) = state.timer.replace(handle) {
        previous.abort();
    }
}

async fn run_round(inner: Arc<ClientInner>, generation: u64) {
    // Drain the outgoing work under the lock, before the network await.
    // Calls arriving while the round is in flight queue separately and
    // are never resent with it.
    let (request, snapshot, timeout) = {
        let mut state = inner.state.lock();
        if state.generation != generation {
            return;
        }
        let Some(key) = state.key.clone() else {
            state.processing = false;
            inner.publish(&state);
            return;
        };
        let pending: HashMap<String, PendingCall> = state.pending.drain().collect();
        let completed: HashSet<String> = state.completed.drain().collect();
        let calls: Vec<OutgoingCall> = pending
            .iter()
            .map(|(request_key, call)| OutgoingCall {
                request_key: request_key.clone(),
                method: call.method.clone(),
                params: call.params.clone(),
            })
            .collect();
        let request = BatchRequest {
            key,
            completed_keys: completed.iter().cloned().collect(),
            status_request_keys: state.active.keys().cloned().collect(),
            calls,
        };
        inner.publish(&state);
        (
            request,
            RoundSnapshot { pending, completed },
            state.poll_interval * 2,
        )
    };

    debug!(
        target: LOG_TARGET,
        calls = request.calls.len(),
        status_checks = request.status_request_keys.len(),
        acks = request.completed_keys.len(),
        "batch round started"
    );

    let outcome = async {
        let body = serde_json::to_value(&request)
            .map_err(|err| RelayError::Protocol(err.to_string()))?;
        let raw = inner.transport.exchange(&body, timeout).await?;
        protocol::decode_batch(raw)
    }
    .await;

    match outcome {
        Ok(response) => finish_round(&inner, generation, snapshot, response),
        Err(err) => fail_round(&inner, generation, snapshot, err),
    }
}

fn finish_round(
    inner: &Arc<ClientInner>,
    generation: u64,
    mut snapshot: RoundSnapshot,
    response: BatchResponse,
) {
    let mut state = inner.state.lock();
    if state.generation != generation {
        drop(state);
        discard_snapshot(snapshot);
        return;
    }

    if let Some(interval) = protocol::parse_poll_interval(response.interval_ms.as_ref()) {
        state.poll_interval = interval;
    }

    for result in response.results {
        if !result.is_done() {
            continue;
        }
        match state.active.remove(&result.request_key) {
            Some(call) => {
                let outcome = if result.is_error {
                    Err(RelayError::Call(describe_error(result.result)))
                } else {
                    Ok(protocol::parse_result_value(
                        result.result.unwrap_or(Value::Null),
                    ))
                };
                debug!(
                    target: LOG_TARGET,
                    request_key = %result.request_key,
                    method = %call.method,
                    elapsed_ms = call.queued_at.elapsed().as_millis() as u64,
                    failed = result.is_error,
                    "relay call finished"
                );
                let _ = call.completion.send(outcome);
                state.completed.insert(result.request_key);
            }
            None => {
                warn!(
                    target: LOG_TARGET,
                    request_key = %result.request_key,
                    "result for unknown request key ignored"
                );
            }
        }
    }

    for created in response.created {
        match snapshot.pending.remove(&created.request_key) {
            Some(call) if created.accepted() => {
                state.active.insert(
                    created.request_key,
                    ActiveCall {
                        method: call.method,
                        completion: call.completion,
                        queued_at: call.queued_at,
                    },
                );
            }
            Some(call) => {
                let status = created.status.unwrap_or_else(|| "unknown".into());
                warn!(
                    target: LOG_TARGET,
                    request_key = %created.request_key,
                    status = %status,
                    "relay refused call"
                );
                let _ = call
                    .completion
                    .send(Err(RelayError::Rejected(format!("relay status {status}"))));
            }
            None => {
                warn!(
                    target: LOG_TARGET,
                    request_key = %created.request_key,
                    "created ack for unknown request key ignored"
                );
            }
        }
    }

    // Calls the relay never acknowledged cannot be resent without
    // risking a duplicate submission; fail them instead.
    for (request_key, call) in snapshot.pending.drain() {
        warn!(
            target: LOG_TARGET,
            request_key = %request_key,
            method = %call.method,
            "relay did not acknowledge call"
        );
        let _ = call.completion.send(Err(RelayError::Rejected(
            "relay did not acknowledge call".into(),
        )));
    }

    if let Some(count) = response.cleanup_count {
        debug!(target: LOG_TARGET, cleaned = count, "relay reported cleanup");
    }

    state.last_error = None;
    state.processing = false;
    if !state.pending.is_empty() || !state.active.is_empty() {
        let delay = state.poll_interval;
        schedule(inner, &mut state, delay);
    }
    inner.publish(&state);
}

fn fail_round(inner: &Arc<ClientInner>, generation: u64, snapshot: RoundSnapshot, err: RelayError) {
    let mut state = inner.state.lock();
    if state.generation != generation {
        drop(state);
        discard_snapshot(snapshot);
        return;
    }

    // Nothing sent with the round may be lost: put the drained work
    // back exactly as it was before classifying the failure.
    state.pending.extend(snapshot.pending);
    state.completed.extend(snapshot.completed);
    state.last_error = Some(err.to_string());

    match fatal_status(&err) {
        Some(StatusCode::NOT_FOUND) => {
            warn!(target: LOG_TARGET, "relay dropped the session key, tearing down");
            state.broken = true;
            state.key = None;
            state.last_error = Some(SESSION_NOT_FOUND.to_string());
            teardown(&mut state);
            if let Err(store_err) = inner.store.clear() {
                warn!(target: LOG_TARGET, error = %store_err, "failed to clear stored session key");
            }
            inner.publish(&state);
        }
        Some(status) => {
            warn!(target: LOG_TARGET, status = %status, error = %err, "relay failure, tearing down");
            state.broken = true;
            teardown(&mut state);
            inner.publish(&state);
        }
        None => {
            let delay = RETRY_DELAY_CAP.min(state.poll_interval);
            debug!(
                target: LOG_TARGET,
                error = %err,
                retry_ms = delay.as_millis() as u64,
                "batch round failed, will retry"
            );
            state.processing = false;
            schedule(inner, &mut state, delay);
            inner.publish(&state);
        }
    }
}

// A round that lost its race with a reset. Its drained calls live
// outside the queues the teardown rejected, so reject them here and
// drop the acknowledgement set.
fn discard_snapshot(snapshot: RoundSnapshot) {
    debug!(
        target: LOG_TARGET,
        calls = snapshot.pending.len(),
        acks = snapshot.completed.len(),
        "stale round discarded"
    );
    for (_, call) in snapshot.pending {
        let _ = call.completion.send(Err(RelayError::Reset));
    }
}

fn fatal_status(err: &RelayError) -> Option<StatusCode> {
    match err {
        RelayError::Transport(transport) => match transport.status() {
            Some(status)
                if status == StatusCode::NOT_FOUND
                    || status == StatusCode::INTERNAL_SERVER_ERROR =>
            {
                Some(status)
            }
            _ => None,
        },
        _ => None,
    }
}

fn describe_error(result: Option<Value>) -> String {
    match result {
        Some(Value::String(text)) => text,
        Some(other) => other.to_string(),
        None => "relay reported an error".into(),
    }
}
