//! Request admission to the active editor connection.
//!
//! A single dispatcher task drains the admission queue in FIFO order and
//! hands each request to whichever connection is active at that moment.

use super::connection::ConnectionTable;
use crate::cancel::CancellationToken;
use crate::queue::AdmissionReceiver;
use crate::semantics::{DispatchStage, ErrorCode, ErrorSemanticsResolver, ToolError};
use crate::session::SessionRegistry;
use serde_json::Value;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, trace};

const QUEUED: u8 = 0;
const SENT: u8 = 1;
const ABANDONED: u8 = 2;

/// Tracks whether a request's frame has been handed to the socket.
///
/// Exactly one of the writer (`mark_sent`) and the waiting caller
/// (`settle`) wins the transition out of the queued state, so a request the
/// caller gave up on is never written afterwards.
#[derive(Debug, Clone, Default)]
pub struct DispatchTicket(Arc<AtomicU8>);

impl DispatchTicket {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the request for writing. False if the caller already gave up.
    pub fn mark_sent(&self) -> bool {
        self.0
            .compare_exchange(QUEUED, SENT, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Stop waiting for the request and report how far it got.
    ///
    /// Returns `BeforeSend` if the frame was never written and now never
    /// will be, `AfterSend` otherwise.
    pub fn settle(&self) -> DispatchStage {
        match self
            .0
            .compare_exchange(QUEUED, ABANDONED, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => DispatchStage::BeforeSend,
            Err(ABANDONED) => DispatchStage::BeforeSend,
            Err(_) => DispatchStage::AfterSend,
        }
    }

    pub fn is_abandoned(&self) -> bool {
        self.0.load(Ordering::SeqCst) == ABANDONED
    }

    pub fn is_sent(&self) -> bool {
        self.0.load(Ordering::SeqCst) == SENT
    }
}

pub(crate) type ReplySender = oneshot::Sender<Result<Value, ToolError>>;

/// A tool command waiting in the admission queue.
///
/// The `request` message is encoded and size-checked before admission, so
/// nothing past the queue can refuse it for its size.
#[derive(Debug)]
pub struct OutboundRequest {
    pub id: u64,
    pub command: String,
    pub(crate) frame: Vec<u8>,
    pub(crate) reply: ReplySender,
    pub(crate) ticket: DispatchTicket,
}

impl OutboundRequest {
    pub(crate) fn new(
        id: u64,
        command: String,
        frame: Vec<u8>,
        reply: ReplySender,
        ticket: DispatchTicket,
    ) -> Self {
        Self {
            id,
            command,
            frame,
            reply,
            ticket,
        }
    }

    /// Answer the caller without contacting the editor.
    pub(crate) fn fail(self, error: ToolError) {
        let _ = self.reply.send(Err(error));
    }
}

/// Drain the admission queue until shutdown.
///
/// Requests still queued at shutdown are answered with `SERVER_STOPPING`.
pub(crate) async fn run_dispatcher(
    mut queue: AdmissionReceiver<OutboundRequest>,
    registry: Arc<SessionRegistry>,
    connections: Arc<ConnectionTable>,
    resolver: Arc<ErrorSemanticsResolver>,
    shutdown: CancellationToken,
) {
    debug!("Dispatcher started");
    loop {
        let request = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = queue.dequeue() => match next {
                Some(request) => request,
                None => break,
            },
        };

        if request.ticket.is_abandoned() {
            trace!("Skipping abandoned request {}", request.id);
            continue;
        }
        // Caller dropped its future without settling
        if request.reply.is_closed() && request.ticket.settle() == DispatchStage::BeforeSend {
            trace!("Skipping request {} with no waiting caller", request.id);
            continue;
        }

        let target = registry
            .active_socket()
            .and_then(|id| connections.get(id));
        match target {
            Some(connection) => connection.submit(request, &resolver).await,
            None => {
                debug!(
                    "No active editor connection for request {} ({})",
                    request.id, request.command
                );
                request.ticket.settle();
                let error = resolver.normalize_dispatch_failure(
                    ToolError::unity_disconnected("No active editor connection"),
                    DispatchStage::BeforeSend,
                );
                request.fail(error);
            }
        }
    }

    queue.close();
    let mut drained = 0usize;
    while let Some(request) = queue.dequeue().await {
        request.ticket.settle();
        request.fail(
            ToolError::new(ErrorCode::ServerStopping, "Bridge is shutting down")
                .with_detail("dispatch_stage", DispatchStage::BeforeSend.as_str()),
        );
        drained += 1;
    }
    info!("Dispatcher stopped ({} queued requests failed)", drained);
}
