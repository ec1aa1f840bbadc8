//! Arbitration of the single active editor socket.
//!
//! Any number of sockets may be connected and registered while they handshake,
//! but at most one is *active* (authorized to carry editor traffic). The
//! registry holds identities and a read-only view of each socket's transport
//! state; it never owns a socket. Closing sockets is the caller's job.
//!
//! All operations take the same mutex, so concurrent promotions serialize and
//! no caller can observe two active identities.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Opaque identity of an accepted editor socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u64);

impl SocketId {
    /// Allocate a process-unique id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        SocketId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn from_raw(raw: u64) -> Self {
        SocketId(raw)
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Transport state of a socket as seen by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Open,
    Closing,
    Closed,
}

impl TransportState {
    fn to_u8(self) -> u8 {
        match self {
            TransportState::Open => 0,
            TransportState::Closing => 1,
            TransportState::Closed => 2,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TransportState::Open,
            1 => TransportState::Closing,
            _ => TransportState::Closed,
        }
    }
}

/// Shared transport-state cell.
///
/// The connection task writes it; the registry only reads it. Clones refer to
/// the same cell.
#[derive(Debug, Clone)]
pub struct TransportStatus(Arc<AtomicU8>);

impl TransportStatus {
    /// A fresh cell in the `Open` state.
    pub fn open() -> Self {
        TransportStatus(Arc::new(AtomicU8::new(TransportState::Open.to_u8())))
    }

    pub fn get(&self) -> TransportState {
        TransportState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: TransportState) {
        self.0.store(state.to_u8(), Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        self.get() == TransportState::Open
    }
}

/// Result of a promotion attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromotionResult {
    /// The socket was never registered (or was already removed).
    UnknownSocket,
    /// The socket is now active; nobody live was displaced.
    Activated,
    /// The same editor reconnected; the previous socket must be closed.
    ReplacedActiveSameEditor,
    /// A different live editor already holds the active slot.
    RejectedActiveExists,
}

/// Outcome of [`SessionRegistry::try_promote`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromotionOutcome {
    pub result: PromotionResult,
    /// Previous active socket, set only for `ReplacedActiveSameEditor`.
    pub replaced: Option<SocketId>,
}

impl PromotionOutcome {
    fn new(result: PromotionResult) -> Self {
        Self {
            result,
            replaced: None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.result,
            PromotionResult::Activated | PromotionResult::ReplacedActiveSameEditor
        )
    }
}

#[derive(Debug)]
struct ActiveSession {
    id: SocketId,
    editor_instance_id: String,
}

#[derive(Debug, Default)]
struct RegistryInner {
    registered: HashMap<SocketId, TransportStatus>,
    active: Option<ActiveSession>,
}

impl RegistryInner {
    fn check_invariants(&self) {
        if let Some(active) = &self.active {
            debug_assert!(
                self.registered.contains_key(&active.id),
                "active socket {} is not registered",
                active.id
            );
        }
    }
}

/// Registry of candidate sockets and the one active socket.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|poisoned: PoisonError<_>| {
            warn!("Recovered from poisoned session registry lock");
            poisoned.into_inner()
        })
    }

    /// Add a candidate socket. Does not promote it.
    pub fn register(&self, id: SocketId, transport: TransportStatus) {
        let mut inner = self.lock();
        inner.registered.insert(id, transport);
        debug!("Registered editor socket {}", id);
    }

    /// Try to make `id` the active socket for `editor_instance_id`.
    pub fn try_promote(&self, id: SocketId, editor_instance_id: &str) -> PromotionOutcome {
        let mut inner = self.lock();

        if !inner.registered.contains_key(&id) {
            return PromotionOutcome::new(PromotionResult::UnknownSocket);
        }

        let outcome = match inner.active.take() {
            None => {
                inner.active = Some(ActiveSession {
                    id,
                    editor_instance_id: editor_instance_id.to_string(),
                });
                PromotionOutcome::new(PromotionResult::Activated)
            }
            Some(current) if current.id == id => {
                inner.active = Some(ActiveSession {
                    id,
                    editor_instance_id: editor_instance_id.to_string(),
                });
                PromotionOutcome::new(PromotionResult::Activated)
            }
            Some(current) => {
                let current_open = inner
                    .registered
                    .get(&current.id)
                    .map(TransportStatus::is_open)
                    .unwrap_or(false);

                if !current_open {
                    // Stale slot: the old socket died without a live handoff.
                    inner.registered.remove(&current.id);
                    debug!("Discarded stale active socket {}", current.id);
                    inner.active = Some(ActiveSession {
                        id,
                        editor_instance_id: editor_instance_id.to_string(),
                    });
                    PromotionOutcome::new(PromotionResult::Activated)
                } else if current.editor_instance_id == editor_instance_id {
                    let replaced = current.id;
                    inner.active = Some(ActiveSession {
                        id,
                        editor_instance_id: editor_instance_id.to_string(),
                    });
                    PromotionOutcome {
                        result: PromotionResult::ReplacedActiveSameEditor,
                        replaced: Some(replaced),
                    }
                } else {
                    inner.active = Some(current);
                    PromotionOutcome::new(PromotionResult::RejectedActiveExists)
                }
            }
        };

        inner.check_invariants();
        match outcome.result {
            PromotionResult::Activated => info!("Editor socket {} is now active", id),
            PromotionResult::ReplacedActiveSameEditor => info!(
                "Editor socket {} replaced {:?} for the same editor instance",
                id, outcome.replaced
            ),
            PromotionResult::RejectedActiveExists => warn!(
                "Rejected editor socket {}: another editor instance is active",
                id
            ),
            PromotionResult::UnknownSocket => {}
        }
        outcome
    }

    pub fn is_active(&self, id: SocketId) -> bool {
        self.lock()
            .active
            .as_ref()
            .map(|active| active.id == id)
            .unwrap_or(false)
    }

    /// The current active socket, if any.
    pub fn active_socket(&self) -> Option<SocketId> {
        self.lock().active.as_ref().map(|active| active.id)
    }

    /// Editor instance remembered for the active socket.
    pub fn active_editor_instance(&self) -> Option<String> {
        self.lock()
            .active
            .as_ref()
            .map(|active| active.editor_instance_id.clone())
    }

    /// Forget a socket whose transport closed. Returns whether it was active.
    pub fn remove(&self, id: SocketId) -> bool {
        let mut inner = self.lock();
        inner.registered.remove(&id);
        let was_active = inner
            .active
            .as_ref()
            .map(|active| active.id == id)
            .unwrap_or(false);
        if was_active {
            inner.active = None;
        }
        inner.check_invariants();
        was_active
    }

    /// Atomically clear every registered socket and the active slot.
    ///
    /// Returns all previously registered ids so the caller can close them.
    pub fn drain_all(&self) -> Vec<SocketId> {
        let mut inner = self.lock();
        inner.active = None;
        let mut drained: Vec<SocketId> = inner.registered.drain().map(|(id, _)| id).collect();
        drained.sort();
        if !drained.is_empty() {
            info!("Drained {} editor socket(s)", drained.len());
        }
        drained
    }

    /// Number of registered sockets.
    pub fn len(&self) -> usize {
        self.lock().registered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
