//! Bridge orchestrator.
//!
//! [`Bridge`] wires the runtime state, session registry, resolver, admission
//! queue and editor link together, and owns the two policies that span them:
//! how long a tool call waits for the editor, and how the bridge shuts down.

use crate::cancel::{CancellationToken, CancelledError};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::link::connection::{ConnectionHandle, ConnectionTable};
use crate::link::dispatch::{run_dispatcher, DispatchTicket, OutboundRequest};
use crate::link::protocol::{encode_message, BridgeMessage};
use crate::queue::{admission_queue, AdmissionError, AdmissionSender};
use crate::runtime::{RuntimeSnapshot, RuntimeState};
use crate::semantics::{
    DispatchStage, ErrorCode, ErrorSemanticsResolver, ToolError, ToolErrorPayload,
};
use crate::session::{PromotionOutcome, SessionRegistry, SocketId};
use crate::state::{EditorState, ServerState, WaitingReason};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Once, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// How long, and with which error, a caller waits for the editor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WaitPolicy {
    #[serde(rename = "timeout_ms", serialize_with = "serialize_millis")]
    pub timeout: Duration,
    pub timeout_error_code: ErrorCode,
}

fn serialize_millis<S: serde::Serializer>(
    duration: &Duration,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

impl WaitPolicy {
    /// Depends on `waiting_reason` alone.
    pub fn for_reason(config: &BridgeConfig, reason: WaitingReason) -> Self {
        if reason.is_transient() {
            Self {
                timeout: config.compile_grace,
                timeout_error_code: ErrorCode::CompileTimeout,
            }
        } else {
            Self {
                timeout: config.reconnect_wait,
                timeout_error_code: ErrorCode::EditorNotReady,
            }
        }
    }
}

fn earliest(bound: Instant, deadline: Option<Instant>) -> Instant {
    match deadline {
        Some(deadline) if deadline < bound => deadline,
        _ => bound,
    }
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

/// The bridge between tool callers and the editor.
///
/// Must be created inside a tokio runtime: construction spawns the
/// dispatcher task.
#[derive(Debug)]
pub struct Bridge {
    config: BridgeConfig,
    runtime: Arc<RuntimeState>,
    registry: Arc<SessionRegistry>,
    connections: Arc<ConnectionTable>,
    resolver: Arc<ErrorSemanticsResolver>,
    queue: AdmissionSender<OutboundRequest>,
    shutdown: CancellationToken,
    shutdown_once: Once,
    /// Serializes transitions that touch both the registry and the runtime.
    lifecycle: Mutex<()>,
    next_request_id: AtomicU64,
}

impl Bridge {
    /// Validate `config` and start the bridge with the default error table.
    pub fn new(config: BridgeConfig) -> Result<Arc<Self>> {
        Self::with_resolver(config, ErrorSemanticsResolver::new())
    }

    /// Start the bridge with a custom error table.
    pub fn with_resolver(
        config: BridgeConfig,
        resolver: ErrorSemanticsResolver,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let (queue, receiver) = admission_queue(config.queue_capacity)?;
        let bridge = Arc::new(Self {
            config,
            runtime: Arc::new(RuntimeState::new()),
            registry: Arc::new(SessionRegistry::new()),
            connections: Arc::new(ConnectionTable::default()),
            resolver: Arc::new(resolver),
            queue,
            shutdown: CancellationToken::new(),
            shutdown_once: Once::new(),
            lifecycle: Mutex::new(()),
            next_request_id: AtomicU64::new(1),
        });

        tokio::spawn(run_dispatcher(
            receiver,
            bridge.registry.clone(),
            bridge.connections.clone(),
            bridge.resolver.clone(),
            bridge.shutdown.clone(),
        ));

        info!(
            "Bridge started (queue capacity {}, heartbeat {:?} x{})",
            bridge.config.queue_capacity,
            bridge.config.heartbeat_interval,
            bridge.config.heartbeat_miss_threshold
        );
        Ok(bridge)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn runtime(&self) -> &RuntimeState {
        &self.runtime
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn resolver(&self) -> &ErrorSemanticsResolver {
        &self.resolver
    }

    pub(crate) fn connections(&self) -> &ConnectionTable {
        &self.connections
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn snapshot(&self) -> RuntimeSnapshot {
        self.runtime.snapshot()
    }

    /// Requests waiting in the admission queue.
    pub fn queued_requests(&self) -> usize {
        self.queue.len()
    }

    /// Live promoted editor connections (normally 0 or 1, briefly 2 while a
    /// replaced socket tears down).
    pub fn live_connections(&self) -> usize {
        self.connections.len()
    }

    /// Classify `error` into its caller-facing payload.
    pub fn error_payload(&self, error: &ToolError) -> ToolErrorPayload {
        self.resolver.to_payload(error)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, ()> {
        self.lifecycle.lock().unwrap_or_else(|poisoned: PoisonError<_>| {
            warn!("Recovered from poisoned bridge lifecycle lock");
            poisoned.into_inner()
        })
    }

    /// Promote a handshaken socket and publish it.
    ///
    /// On success the connection is live in the table before the runtime
    /// reports it connected, and a replaced socket is signalled to close.
    /// `None` once shutdown has begun.
    pub(crate) fn promote(
        &self,
        handle: &Arc<ConnectionHandle>,
        editor_instance_id: &str,
        editor_state: EditorState,
    ) -> Option<PromotionOutcome> {
        let _guard = self.lock_lifecycle();
        if self.is_shutting_down() {
            return None;
        }

        let id = handle.id();
        let outcome = self.registry.try_promote(id, editor_instance_id);
        if outcome.is_active() {
            self.connections.insert(handle.clone());
            self.runtime
                .on_connected(editor_state, id.to_string(), editor_instance_id);
            if let Some(previous) = outcome.replaced {
                info!(
                    "Editor {} reconnected on {}, closing {}",
                    editor_instance_id, id, previous
                );
                self.connections.close(previous);
            }
        }
        Some(outcome)
    }

    /// Forget a closed socket. Disconnects the runtime only if it was the
    /// active one.
    pub(crate) fn release(&self, id: SocketId) {
        let _guard = self.lock_lifecycle();
        self.registry.remove(id);
        self.runtime.on_connection_lost(&id.to_string());
    }

    /// Policy for a caller that found the editor unreachable in `snapshot`.
    pub fn resolve_editor_ready_wait_policy(&self, snapshot: &RuntimeSnapshot) -> WaitPolicy {
        WaitPolicy::for_reason(&self.config, snapshot.waiting_reason)
    }

    /// Stop the bridge. Idempotent and safe to call concurrently.
    ///
    /// The first call moves the runtime to `waiting_editor` and disconnected,
    /// drains the registry, closes every editor socket and stops the
    /// dispatcher. Concurrent callers block until it has finished; later
    /// calls change nothing.
    pub fn begin_shutdown(&self) {
        self.shutdown_once.call_once(|| {
            info!("Bridge shutting down");
            let _guard = self.lock_lifecycle();
            self.shutdown.cancel();
            self.runtime.force_disconnected_for_shutdown();
            let drained = self.registry.drain_all();
            let closed = self.connections.close_all();
            info!(
                "Drained {} editor sockets, closed {} live connections",
                drained.len(),
                closed
            );
        });
    }

    /// Host's final step after [`begin_shutdown`](Self::begin_shutdown).
    pub fn mark_stopped(&self) {
        self.begin_shutdown();
        self.runtime.set_server_state(ServerState::Stopped);
    }

    fn stopping_error(&self) -> ToolError {
        ToolError::new(ErrorCode::ServerStopping, "Bridge is shutting down")
    }

    /// Wait until the editor is connected.
    ///
    /// Returns at once when it already is. Otherwise waits for the policy
    /// timeout derived from the current waiting reason, cut short by
    /// `deadline`, `cancel` or bridge shutdown.
    pub async fn wait_for_editor_ready(
        &self,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> std::result::Result<RuntimeSnapshot, ToolError> {
        if self.is_shutting_down() {
            return Err(self.stopping_error());
        }
        cancel.check()?;

        let mut watcher = self.runtime.subscribe();
        let snapshot = watcher.snapshot();
        if snapshot.connected {
            return Ok(snapshot);
        }

        let policy = self.resolve_editor_ready_wait_policy(&snapshot);
        let policy_deadline = Instant::now() + policy.timeout;
        let until = earliest(policy_deadline, deadline);
        let caller_deadline = until < policy_deadline;
        debug!(
            "Waiting up to {}ms for editor ({})",
            millis(until.saturating_duration_since(Instant::now())),
            snapshot.waiting_reason
        );

        tokio::select! {
            ready = watcher.wait_for(|s| s.connected) => Ok(ready),
            _ = sleep_until(until) => {
                let mut error = ToolError::new(
                    policy.timeout_error_code,
                    format!(
                        "Editor not ready after {}ms (waiting: {})",
                        millis(policy.timeout),
                        snapshot.waiting_reason
                    ),
                )
                .with_detail("waiting_reason", snapshot.waiting_reason.as_wire())
                .with_detail("timeout_ms", millis(policy.timeout));
                if caller_deadline {
                    error = error.with_detail("caller_deadline", true);
                }
                Err(error)
            }
            _ = cancel.cancelled() => Err(CancelledError.into()),
            _ = self.shutdown.cancelled() => Err(self.stopping_error()),
        }
    }

    /// Forward `command` to the editor and await its result.
    pub async fn dispatch(
        &self,
        command: impl Into<String>,
        params: Value,
        cancel: &CancellationToken,
    ) -> std::result::Result<Value, ToolError> {
        self.dispatch_with_deadline(command, params, cancel, None).await
    }

    /// [`dispatch`](Self::dispatch) with a caller deadline bounding both the
    /// readiness wait and the reply.
    pub async fn dispatch_with_deadline(
        &self,
        command: impl Into<String>,
        params: Value,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> std::result::Result<Value, ToolError> {
        let command = command.into();
        if command.trim().is_empty() {
            return Err(ToolError::invalid_params("command must not be empty"));
        }

        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let frame = encode_message(&BridgeMessage::Request {
            id,
            command: command.clone(),
            params,
        })
        .map_err(|e| {
            ToolError::from(e)
                .with_detail("command", command.as_str())
                .with_detail("dispatch_stage", DispatchStage::BeforeSend.as_str())
        })?;

        self.wait_for_editor_ready(cancel, deadline).await?;

        let (reply_tx, reply_rx) = oneshot::channel();
        let ticket = DispatchTicket::new();
        let request = OutboundRequest::new(id, command.clone(), frame, reply_tx, ticket.clone());

        if let Err(rejected) = self.queue.try_enqueue(request) {
            return Err(match rejected {
                AdmissionError::Full { capacity, .. } => {
                    ToolError::from(BridgeError::QueueFull { capacity })
                        .with_detail("command", command)
                }
                AdmissionError::Closed { .. } => self.stopping_error(),
            });
        }
        debug!("Queued request {} ({})", id, command);

        let started = Instant::now();
        let bound = started + self.config.request_timeout;
        let until = earliest(bound, deadline);

        tokio::select! {
            reply = reply_rx => match reply {
                Ok(outcome) => outcome,
                Err(_) => {
                    let stage = ticket.settle();
                    Err(self.resolver.normalize_dispatch_failure(
                        ToolError::unity_disconnected("Request dropped before the editor answered")
                            .with_detail("command", command),
                        stage,
                    ))
                }
            },
            _ = sleep_until(until) => {
                let stage = ticket.settle();
                let waited = millis(until - started);
                debug!("Request {} ({}) timed out {}", id, command, stage.as_str());
                let mut error = ToolError::new(
                    ErrorCode::RequestTimeout,
                    format!("Editor did not answer {} within {}ms", command, waited),
                )
                .with_detail("command", command)
                .with_detail("timeout_ms", waited)
                .with_detail("dispatch_stage", stage.as_str());
                if until < bound {
                    error = error.with_detail("caller_deadline", true);
                }
                Err(error)
            }
            _ = cancel.cancelled() => {
                let stage = ticket.settle();
                debug!("Request {} ({}) cancelled {}", id, command, stage.as_str());
                Err(ToolError::from(CancelledError)
                    .with_detail("command", command)
                    .with_detail("dispatch_stage", stage.as_str()))
            }
        }
    }
}
