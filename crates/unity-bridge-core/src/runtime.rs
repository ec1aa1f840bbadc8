//! Shared runtime status of the bridge and its editor link.
//!
//! All state lives inside one `tokio::sync::watch` channel. Mutators run as
//! `send_if_modified` closures, which hold the channel's internal lock for the
//! whole update, so every reader sees either the state before or after a
//! transition and never a mix. The same channel wakes tasks waiting for the
//! editor to come back.

use crate::state::{EditorState, ServerState, WaitingReason};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info};

/// Immutable point-in-time view of the runtime state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeSnapshot {
    pub server_state: ServerState,
    pub editor_state: EditorState,
    pub connected: bool,
    pub waiting_reason: WaitingReason,
    pub active_connection_id: Option<String>,
    pub editor_instance_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RuntimeInner {
    server_state: ServerState,
    editor_state: EditorState,
    connected: bool,
    waiting_reason: WaitingReason,
    active_connection_id: Option<String>,
    editor_instance_id: Option<String>,
    /// Highest status `seq` applied on the current connection.
    last_status_seq: Option<u64>,
}

impl RuntimeInner {
    fn booting() -> Self {
        Self {
            server_state: ServerState::Booting,
            editor_state: EditorState::Unknown,
            connected: false,
            waiting_reason: WaitingReason::Reconnecting,
            active_connection_id: None,
            editor_instance_id: None,
            last_status_seq: None,
        }
    }

    fn snapshot(&self) -> RuntimeSnapshot {
        RuntimeSnapshot {
            server_state: self.server_state,
            editor_state: self.editor_state,
            connected: self.connected,
            waiting_reason: self.waiting_reason,
            active_connection_id: self.active_connection_id.clone(),
            editor_instance_id: self.editor_instance_id.clone(),
        }
    }

    fn disconnect(&mut self) {
        self.connected = false;
        self.waiting_reason = WaitingReason::for_disconnect(self.editor_state);
        self.active_connection_id = None;
        self.editor_instance_id = None;
        self.last_status_seq = None;
        if matches!(self.server_state, ServerState::Booting | ServerState::Ready) {
            self.server_state = ServerState::WaitingEditor;
        }
    }

    fn check_invariants(&self) {
        debug_assert_eq!(
            self.waiting_reason == WaitingReason::None,
            self.connected,
            "waiting_reason must be none exactly while connected"
        );
        debug_assert!(
            !self.connected || self.active_connection_id.is_some(),
            "connected without an active connection id"
        );
    }
}

/// Single synchronized owner of the runtime status.
#[derive(Debug)]
pub struct RuntimeState {
    tx: watch::Sender<RuntimeInner>,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeState {
    /// Start in `Booting`, disconnected.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(RuntimeInner::booting());
        Self { tx }
    }

    /// Record a promoted editor connection.
    pub fn on_connected(
        &self,
        editor_state: EditorState,
        connection_id: impl Into<String>,
        editor_instance_id: impl Into<String>,
    ) {
        let connection_id = connection_id.into();
        let editor_instance_id = editor_instance_id.into();
        info!(
            "Editor connected on {} (instance {}, state {})",
            connection_id, editor_instance_id, editor_state
        );

        self.tx.send_modify(|inner| {
            inner.connected = true;
            inner.waiting_reason = WaitingReason::None;
            inner.editor_state = editor_state;
            inner.active_connection_id = Some(connection_id);
            inner.editor_instance_id = Some(editor_instance_id);
            inner.last_status_seq = None;
            if !inner.server_state.is_stopping() {
                inner.server_state = ServerState::Ready;
            }
            inner.check_invariants();
        });
    }

    /// Apply a status push from the editor.
    ///
    /// Pushes whose `seq` is not newer than the last applied one are ignored.
    /// Returns whether the update was applied.
    pub fn on_editor_status(&self, editor_state: EditorState, seq: u64) -> bool {
        let mut applied = false;
        self.tx.send_if_modified(|inner| {
            if let Some(last) = inner.last_status_seq {
                if seq <= last {
                    debug!(
                        "Ignoring stale editor status {} (seq {} <= {})",
                        editor_state, seq, last
                    );
                    return false;
                }
            }
            inner.last_status_seq = Some(seq);
            applied = true;
            if inner.editor_state == editor_state {
                return false;
            }
            debug!("Editor state {} -> {}", inner.editor_state, editor_state);
            inner.editor_state = editor_state;
            true
        });
        applied
    }

    /// Record loss of the editor link.
    ///
    /// The waiting reason is derived from the editor state last observed
    /// before this call.
    pub fn on_disconnected(&self) {
        self.tx.send_modify(|inner| {
            inner.disconnect();
            inner.check_invariants();
            info!("Editor disconnected (waiting: {})", inner.waiting_reason);
        });
    }

    /// Apply [`on_disconnected`](Self::on_disconnected) only if
    /// `connection_id` is still the active connection.
    ///
    /// A replaced socket tearing down late must not mark its successor as
    /// gone. Returns whether the disconnect was applied.
    pub fn on_connection_lost(&self, connection_id: &str) -> bool {
        self.tx.send_if_modified(|inner| {
            if inner.active_connection_id.as_deref() != Some(connection_id) {
                debug!(
                    "Ignoring loss of {}: not the active connection",
                    connection_id
                );
                return false;
            }
            inner.disconnect();
            inner.check_invariants();
            info!(
                "Editor connection {} lost (waiting: {})",
                connection_id, inner.waiting_reason
            );
            true
        })
    }

    /// Explicit server-state override for boot/stop sequencing.
    pub fn set_server_state(&self, state: ServerState) {
        self.tx.send_if_modified(|inner| {
            if inner.server_state == state {
                return false;
            }
            info!("Server state {} -> {}", inner.server_state, state);
            inner.server_state = state;
            true
        });
    }

    /// Shutdown transition: `WaitingEditor` and disconnected.
    ///
    /// Unlike [`on_disconnected`](Self::on_disconnected) this ignores the
    /// stopping guard and applies unconditionally. Repeating it is a no-op.
    pub fn force_disconnected_for_shutdown(&self) {
        self.tx.send_if_modified(|inner| {
            let before = inner.clone();
            if inner.connected {
                inner.disconnect();
            }
            inner.server_state = ServerState::WaitingEditor;
            inner.check_invariants();
            *inner != before
        });
    }

    /// Consistent view of the current state.
    pub fn snapshot(&self) -> RuntimeSnapshot {
        self.tx.borrow().snapshot()
    }

    /// Receiver that observes every state change.
    pub fn subscribe(&self) -> RuntimeWatcher {
        RuntimeWatcher {
            rx: self.tx.subscribe(),
        }
    }
}

/// Change-notified view used by waiters.
#[derive(Debug, Clone)]
pub struct RuntimeWatcher {
    rx: watch::Receiver<RuntimeInner>,
}

impl RuntimeWatcher {
    /// Resolve with the first snapshot matching `predicate`, checking the
    /// current state first.
    pub async fn wait_for(
        &mut self,
        mut predicate: impl FnMut(&RuntimeSnapshot) -> bool,
    ) -> RuntimeSnapshot {
        let result = self
            .rx
            .wait_for(|inner| predicate(&inner.snapshot()))
            .await
            .map(|inner| inner.snapshot());
        match result {
            Ok(snapshot) => snapshot,
            // Sender dropped: the runtime is gone, report its final state.
            Err(_) => self.rx.borrow().snapshot(),
        }
    }

    pub fn snapshot(&self) -> RuntimeSnapshot {
        self.rx.borrow().snapshot()
    }
}
