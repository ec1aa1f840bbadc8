//! Lifetime of one promoted editor connection.
//!
//! After the handshake a connection runs three pieces: a reader task that
//! decodes frames, a writer task that owns the write half, and the serve loop
//! that applies inbound messages and drives the heartbeat. Whatever ends the
//! serve loop, teardown runs exactly once and fails every request still in
//! flight on this socket.

use super::dispatch::{DispatchTicket, OutboundRequest, ReplySender};
use super::protocol::{encode_message, read_message, write_frame, BridgeMessage, EditorMessage};
use crate::cancel::CancellationToken;
use crate::config::LinkConfig;
use crate::error::Result;
use crate::heartbeat::HeartbeatMonitor;
use crate::orchestrator::Bridge;
use crate::semantics::{ErrorSemanticsResolver, ToolError};
use crate::session::{SocketId, TransportState, TransportStatus};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

fn recover<'a, T>(
    result: std::sync::LockResult<MutexGuard<'a, T>>,
    what: &str,
) -> MutexGuard<'a, T> {
    result.unwrap_or_else(|poisoned: PoisonError<_>| {
        warn!("Recovered from poisoned {} lock", what);
        poisoned.into_inner()
    })
}

/// Frames buffered on the control lane (welcome, pings).
const CONTROL_BUFFER: usize = 8;

/// One encoded request frame queued for the writer task.
#[derive(Debug)]
pub(crate) struct OutboundFrame {
    payload: Vec<u8>,
    ticket: DispatchTicket,
}

/// Receiving ends drained by the writer task.
///
/// Control frames go out ahead of any queued request, so a backlog of
/// requests never delays a heartbeat ping.
#[derive(Debug)]
pub(crate) struct WriterQueues {
    control: mpsc::Receiver<Vec<u8>>,
    requests: mpsc::Receiver<OutboundFrame>,
}

/// Result of queueing a control frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ControlSend {
    Queued,
    /// Control lane is full; the frame was not queued.
    Full,
    /// Writer is gone.
    Closed,
}

/// A request written (or about to be written) on this socket.
#[derive(Debug)]
struct InFlight {
    command: String,
    reply: ReplySender,
    ticket: DispatchTicket,
}

impl InFlight {
    fn fail_disconnected(self, resolver: &ErrorSemanticsResolver, message: &str) {
        let stage = self.ticket.settle();
        let error = resolver.normalize_dispatch_failure(
            ToolError::unity_disconnected(message).with_detail("command", self.command),
            stage,
        );
        let _ = self.reply.send(Err(error));
    }
}

#[derive(Debug, Default)]
struct PendingInner {
    closed: bool,
    requests: HashMap<u64, InFlight>,
}

/// Requests awaiting a response on one socket.
#[derive(Debug, Default)]
struct PendingRequests {
    inner: Mutex<PendingInner>,
}

impl PendingRequests {
    fn lock(&self) -> MutexGuard<'_, PendingInner> {
        recover(self.inner.lock(), "pending requests")
    }

    /// Track `inflight`; hands it back once the socket is torn down.
    fn insert(&self, id: u64, inflight: InFlight) -> std::result::Result<(), InFlight> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(inflight);
        }
        inner.requests.insert(id, inflight);
        Ok(())
    }

    fn take(&self, id: u64) -> Option<InFlight> {
        self.lock().requests.remove(&id)
    }

    fn close_and_drain(&self) -> Vec<InFlight> {
        let mut inner = self.lock();
        inner.closed = true;
        inner.requests.drain().map(|(_, inflight)| inflight).collect()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().requests.len()
    }
}

/// Control surface of a live connection, shared with the dispatcher.
#[derive(Debug)]
pub(crate) struct ConnectionHandle {
    id: SocketId,
    outbound: mpsc::Sender<OutboundFrame>,
    control: mpsc::Sender<Vec<u8>>,
    pending: PendingRequests,
    close: CancellationToken,
    transport: TransportStatus,
}

impl ConnectionHandle {
    pub(crate) fn id(&self) -> SocketId {
        self.id
    }

    /// Ask the connection to shut down. Teardown runs on its own task.
    pub(crate) fn close(&self) {
        self.close.cancel();
    }

    /// Hand a request to the writer.
    pub(crate) async fn submit(
        &self,
        request: OutboundRequest,
        resolver: &ErrorSemanticsResolver,
    ) {
        let OutboundRequest {
            id,
            command,
            frame,
            reply,
            ticket,
        } = request;
        const CLOSED_BEFORE_SEND: &str = "Editor connection closed before the request was sent";

        let inflight = InFlight {
            command: command.clone(),
            reply,
            ticket: ticket.clone(),
        };
        if let Err(inflight) = self.pending.insert(id, inflight) {
            inflight.fail_disconnected(resolver, CLOSED_BEFORE_SEND);
            return;
        }

        trace!("Forwarding request {} ({}) on {}", id, command, self.id);
        let frame = OutboundFrame {
            payload: frame,
            ticket,
        };
        let queued = tokio::select! {
            sent = self.outbound.send(frame) => sent.is_ok(),
            _ = self.close.cancelled() => false,
        };
        if !queued {
            if let Some(inflight) = self.pending.take(id) {
                inflight.fail_disconnected(resolver, CLOSED_BEFORE_SEND);
            }
        }
    }

    /// First frame on an accepted socket.
    pub(crate) fn send_welcome(&self) {
        self.send_control(BridgeMessage::Welcome {
            connection_id: self.id.to_string(),
            protocol_version: LinkConfig::PROTOCOL_VERSION,
        });
    }

    /// Queue a control frame without waiting.
    fn send_control(&self, message: BridgeMessage) -> ControlSend {
        let payload = match encode_message(&message) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Could not encode control frame for {}: {}", self.id, e);
                return ControlSend::Full;
            }
        };
        match self.control.try_send(payload) {
            Ok(()) => ControlSend::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => ControlSend::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => ControlSend::Closed,
        }
    }
}

/// Live connections by socket id.
#[derive(Debug, Default)]
pub(crate) struct ConnectionTable {
    inner: Mutex<HashMap<SocketId, Arc<ConnectionHandle>>>,
}

impl ConnectionTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<SocketId, Arc<ConnectionHandle>>> {
        recover(self.inner.lock(), "connection table")
    }

    pub(crate) fn insert(&self, handle: Arc<ConnectionHandle>) {
        self.lock().insert(handle.id, handle);
    }

    pub(crate) fn get(&self, id: SocketId) -> Option<Arc<ConnectionHandle>> {
        self.lock().get(&id).cloned()
    }

    fn remove(&self, id: SocketId) -> Option<Arc<ConnectionHandle>> {
        self.lock().remove(&id)
    }

    /// Signal one connection to close. False if it is not live.
    pub(crate) fn close(&self, id: SocketId) -> bool {
        match self.get(id) {
            Some(handle) => {
                debug!("Closing editor connection {}", id);
                handle.close();
                true
            }
            None => false,
        }
    }

    pub(crate) fn close_all(&self) -> usize {
        let handles: Vec<_> = self.lock().values().cloned().collect();
        for handle in &handles {
            handle.close();
        }
        handles.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Why a connection's serve loop ended.
#[derive(Debug)]
pub(crate) enum CloseReason {
    PeerClosed,
    HeartbeatLost,
    Closed,
    WriterGone,
    Protocol(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "peer closed the socket"),
            CloseReason::HeartbeatLost => write!(f, "heartbeat lost"),
            CloseReason::Closed => write!(f, "closed by bridge"),
            CloseReason::WriterGone => write!(f, "write failed"),
            CloseReason::Protocol(message) => write!(f, "protocol error: {}", message),
        }
    }
}

/// Build the control handle for a socket that finished its handshake.
///
/// Frames queued on it are buffered until [`spawn_writer`] starts draining
/// the returned queues.
pub(crate) fn prepare(
    id: SocketId,
    transport: TransportStatus,
) -> (Arc<ConnectionHandle>, WriterQueues) {
    let (outbound_tx, requests) = mpsc::channel(LinkConfig::OUTBOUND_BUFFER);
    let (control_tx, control) = mpsc::channel(CONTROL_BUFFER);
    let handle = Arc::new(ConnectionHandle {
        id,
        outbound: outbound_tx,
        control: control_tx,
        pending: PendingRequests::default(),
        close: CancellationToken::new(),
        transport,
    });
    (handle, WriterQueues { control, requests })
}

pub(crate) fn spawn_writer(
    handle: &ConnectionHandle,
    writer: OwnedWriteHalf,
    queues: WriterQueues,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(write_loop(writer, queues, handle.close.clone(), handle.id))
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut queues: WriterQueues,
    close: CancellationToken,
    id: SocketId,
) {
    loop {
        let payload = tokio::select! {
            biased;
            _ = close.cancelled() => break,
            Some(payload) = queues.control.recv() => payload,
            next = queues.requests.recv() => match next {
                Some(frame) => {
                    if !frame.ticket.mark_sent() {
                        // Caller gave up while the frame was buffered
                        continue;
                    }
                    frame.payload
                }
                None => break,
            },
        };

        let written: Result<()> = tokio::select! {
            result = write_frame(&mut writer, &payload) => result,
            _ = close.cancelled() => break,
        };
        if let Err(e) = written {
            debug!("Write to {} failed: {}", id, e);
            close.cancel();
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(mut reader: OwnedReadHalf, inbound: mpsc::Sender<Result<EditorMessage>>) {
    loop {
        match read_message::<_, EditorMessage>(&mut reader).await {
            Ok(Some(message)) => {
                if inbound.send(Ok(message)).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                let _ = inbound.send(Err(e)).await;
                break;
            }
        }
    }
}

/// Serve a promoted connection until it ends, then tear it down.
pub(crate) async fn serve(
    bridge: &Bridge,
    handle: Arc<ConnectionHandle>,
    reader: OwnedReadHalf,
    writer_task: tokio::task::JoinHandle<()>,
) {
    let (inbound_tx, mut inbound_rx) = mpsc::channel(LinkConfig::OUTBOUND_BUFFER);
    let reader_task = tokio::spawn(read_loop(reader, inbound_tx));

    let config = bridge.config();
    let mut monitor = HeartbeatMonitor::new(config.heartbeat_miss_threshold);
    let period = config.heartbeat_interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut next_probe = 0u64;
    let mut awaiting: Option<u64> = None;

    let reason = loop {
        tokio::select! {
            _ = handle.close.cancelled() => break CloseReason::Closed,
            _ = ticker.tick() => {
                if awaiting.is_some() && monitor.register_probe_result(false) {
                    break CloseReason::HeartbeatLost;
                }
                let ping_id = next_probe + 1;
                match handle.send_control(BridgeMessage::Ping { probe: ping_id }) {
                    ControlSend::Queued => {
                        next_probe = ping_id;
                        awaiting = Some(ping_id);
                    }
                    // Nothing was sent, so the next tick must not count a miss for it
                    ControlSend::Full => {
                        debug!("Control lane full on {}, skipping ping", handle.id)
                    }
                    ControlSend::Closed => break CloseReason::WriterGone,
                }
            }
            inbound = inbound_rx.recv() => match inbound {
                Some(Ok(message)) => {
                    if let EditorMessage::Pong { probe } = message {
                        if awaiting == Some(probe) {
                            awaiting = None;
                            monitor.register_probe_result(true);
                        } else if probe < next_probe {
                            // Late answer to an earlier ping still proves liveness
                            monitor.register_probe_result(true);
                        } else {
                            trace!("Ignoring pong {} on {}", probe, handle.id);
                        }
                    } else {
                        apply_message(bridge, &handle, message);
                    }
                }
                Some(Err(e)) => break CloseReason::Protocol(e.to_string()),
                None => break CloseReason::PeerClosed,
            },
        }
    };

    match reason {
        CloseReason::HeartbeatLost | CloseReason::Protocol(_) => {
            warn!("Editor connection {} ended: {}", handle.id, reason)
        }
        _ => info!("Editor connection {} ended: {}", handle.id, reason),
    }

    reader_task.abort();
    teardown(bridge, &handle);
    let _ = writer_task.await;
    handle.transport.set(TransportState::Closed);
}

fn apply_message(bridge: &Bridge, handle: &ConnectionHandle, message: EditorMessage) {
    match message {
        EditorMessage::Status { editor_state, seq } => {
            if bridge.registry().is_active(handle.id) {
                bridge.runtime().on_editor_status(editor_state, seq);
            } else {
                debug!("Ignoring status from inactive socket {}", handle.id);
            }
        }
        EditorMessage::Response { id, result, error } => match handle.pending.take(id) {
            Some(inflight) => {
                let outcome = match error {
                    Some(body) => Err(body.into_tool_error(&inflight.command)),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
                let _ = inflight.reply.send(outcome);
            }
            None => debug!("Response for unknown request {} on {}", id, handle.id),
        },
        EditorMessage::Hello { .. } => {
            warn!("Unexpected hello on established connection {}", handle.id)
        }
        EditorMessage::Pong { .. } => {}
    }
}

/// Forget the connection everywhere and fail its in-flight requests.
fn teardown(bridge: &Bridge, handle: &ConnectionHandle) {
    handle.transport.set(TransportState::Closing);
    handle.close.cancel();
    bridge.connections().remove(handle.id);

    let failed = handle.pending.close_and_drain();
    if !failed.is_empty() {
        debug!(
            "Failing {} in-flight requests on {}",
            failed.len(),
            handle.id
        );
    }
    for inflight in failed {
        inflight.fail_disconnected(bridge.resolver(), "Editor connection lost");
    }

    bridge.release(handle.id);
}
