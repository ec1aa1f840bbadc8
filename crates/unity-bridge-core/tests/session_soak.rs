//! Randomized soak of the registry and runtime state under the same call
//! discipline the editor link uses.
//!
//! Every step is one lifecycle event (accept, handshake, status push,
//! heartbeat result, close, shutdown drain). After each step the runtime
//! snapshot must agree with the registry about who is active, and every
//! applied disconnect must report the waiting reason implied by the last
//! editor state the runtime accepted.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::{Duration, Instant};
use unity_bridge::{
    EditorState, HeartbeatMonitor, PromotionResult, RuntimeSnapshot, RuntimeState,
    SessionRegistry, SocketId, TransportState, TransportStatus, WaitingReason,
};

const INSTANCES: [&str; 3] = ["editor-a", "editor-a", "editor-b"];
const STATES: [EditorState; 4] = [
    EditorState::Unknown,
    EditorState::Ready,
    EditorState::Compiling,
    EditorState::Reloading,
];

struct Socket {
    id: SocketId,
    transport: TransportStatus,
    monitor: HeartbeatMonitor,
}

struct Harness {
    registry: SessionRegistry,
    runtime: RuntimeState,
    sockets: Vec<Socket>,
    seq: u64,
    last_state: EditorState,
    at_step: usize,
}

impl Harness {
    fn new() -> Self {
        Self {
            registry: SessionRegistry::new(),
            runtime: RuntimeState::new(),
            sockets: Vec::new(),
            seq: 0,
            last_state: EditorState::Unknown,
            at_step: 0,
        }
    }

    fn accept(&mut self) {
        let id = SocketId::next();
        let transport = TransportStatus::open();
        self.registry.register(id, transport.clone());
        self.sockets.push(Socket {
            id,
            transport,
            monitor: HeartbeatMonitor::new(3),
        });
    }

    fn handshake(&mut self, rng: &mut StdRng) {
        let Some(index) = self.pick(rng) else { return };
        let id = self.sockets[index].id;
        let instance = INSTANCES[rng.random_range(0..INSTANCES.len())];
        let outcome = self.registry.try_promote(id, instance);
        if outcome.is_active() {
            let state = STATES[rng.random_range(0..STATES.len())];
            self.runtime.on_connected(state, id.to_string(), instance);
            self.last_state = state;
            self.seq = 0;
        }
        if outcome.result == PromotionResult::ReplacedActiveSameEditor {
            let replaced = outcome.replaced.expect("replacement names the old socket");
            if let Some(old) = self.sockets.iter().find(|s| s.id == replaced) {
                old.transport.set(TransportState::Closing);
            }
        }
    }

    fn status(&mut self, rng: &mut StdRng) {
        let Some(index) = self.pick(rng) else { return };
        let id = self.sockets[index].id;
        if self.registry.is_active(id) {
            // Mostly increasing, occasionally stale
            self.seq = if rng.random_bool(0.9) {
                self.seq + 1
            } else {
                self.seq.saturating_sub(1)
            };
            let state = STATES[rng.random_range(0..STATES.len())];
            if self.runtime.on_editor_status(state, self.seq) {
                self.last_state = state;
            }
        }
    }

    fn heartbeat(&mut self, rng: &mut StdRng) {
        let Some(index) = self.pick(rng) else { return };
        let success = rng.random_bool(0.6);
        if self.sockets[index].monitor.register_probe_result(success) {
            self.close(index);
        }
    }

    fn begin_closing(&mut self, rng: &mut StdRng) {
        if let Some(index) = self.pick(rng) {
            self.sockets[index].transport.set(TransportState::Closing);
        }
    }

    fn close_random(&mut self, rng: &mut StdRng) {
        if let Some(index) = self.pick(rng) {
            self.close(index);
        }
    }

    fn close(&mut self, index: usize) {
        let socket = self.sockets.swap_remove(index);
        socket.transport.set(TransportState::Closing);
        self.registry.remove(socket.id);
        if self.runtime.on_connection_lost(&socket.id.to_string()) {
            self.check_disconnect_reason();
        }
        socket.transport.set(TransportState::Closed);
    }

    fn drain(&mut self) {
        let was_connected = self.runtime.snapshot().connected;
        self.runtime.force_disconnected_for_shutdown();
        if was_connected {
            self.check_disconnect_reason();
        }
        for id in self.registry.drain_all() {
            if let Some(index) = self.sockets.iter().position(|s| s.id == id) {
                self.sockets.swap_remove(index);
            }
        }
    }

    fn check_disconnect_reason(&self) {
        let snapshot = self.runtime.snapshot();
        assert_eq!(
            snapshot.waiting_reason,
            WaitingReason::for_disconnect(self.last_state),
            "step {}: disconnect after {} reported the wrong waiting reason",
            self.at_step,
            self.last_state
        );
    }

    fn pick(&self, rng: &mut StdRng) -> Option<usize> {
        if self.sockets.is_empty() {
            None
        } else {
            Some(rng.random_range(0..self.sockets.len()))
        }
    }

    fn step(&mut self, rng: &mut StdRng) {
        match rng.random_range(0..100) {
            0..=19 => self.accept(),
            20..=44 => self.handshake(rng),
            45..=64 => self.status(rng),
            65..=79 => self.heartbeat(rng),
            80..=86 => self.begin_closing(rng),
            87..=98 => self.close_random(rng),
            _ => self.drain(),
        }
    }

    fn check(&self, step: usize) {
        let snapshot = self.runtime.snapshot();
        check_snapshot(&snapshot, step);
        assert_eq!(
            snapshot.active_connection_id,
            self.registry.active_socket().map(|id| id.to_string()),
            "step {}: runtime and registry disagree on the active socket",
            step
        );
        assert_eq!(
            snapshot.editor_instance_id,
            self.registry.active_editor_instance(),
            "step {}: runtime and registry disagree on the editor instance",
            step
        );
    }
}

fn check_snapshot(snapshot: &RuntimeSnapshot, step: usize) {
    assert_eq!(
        snapshot.connected,
        snapshot.waiting_reason == WaitingReason::None,
        "step {}: connected and waiting_reason out of sync: {:?}",
        step,
        snapshot
    );
    assert_eq!(
        snapshot.connected,
        snapshot.active_connection_id.is_some(),
        "step {}: torn snapshot {:?}",
        step,
        snapshot
    );
    assert_eq!(
        snapshot.active_connection_id.is_some(),
        snapshot.editor_instance_id.is_some(),
        "step {}: torn snapshot {:?}",
        step,
        snapshot
    );
}

#[test]
fn test_seeded_lifecycle_soak() {
    for seed in [1u64, 7, 42] {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut harness = Harness::new();
        for step in 0..10_000 {
            harness.at_step = step;
            harness.step(&mut rng);
            harness.check(step);
        }
    }
}

#[test]
fn test_disconnect_while_compiling_waits_for_compile() {
    let mut harness = Harness::new();
    harness.accept();
    let id = harness.sockets[0].id;
    assert!(harness.registry.try_promote(id, "editor-a").is_active());
    harness.runtime.on_connected(EditorState::Ready, id.to_string(), "editor-a");
    harness.last_state = EditorState::Ready;

    assert!(harness.runtime.on_editor_status(EditorState::Compiling, 1));
    harness.last_state = EditorState::Compiling;
    // Stale push does not move the state back
    assert!(!harness.runtime.on_editor_status(EditorState::Ready, 1));

    harness.close(0);
    assert_eq!(
        harness.runtime.snapshot().waiting_reason,
        WaitingReason::Compiling
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "runs for one minute"]
async fn test_concurrent_lifecycle_soak_one_minute() {
    let registry = Arc::new(SessionRegistry::new());
    let until = Instant::now() + Duration::from_secs(60);

    let workers = (0..8u64).map(|worker| {
        let registry = registry.clone();
        tokio::spawn(async move {
            // Each worker owns its runtime so the reason it sees after a
            // disconnect depends only on its own status pushes
            let runtime = RuntimeState::new();
            let mut rng = StdRng::seed_from_u64(worker);
            let mut steps = 0usize;
            let mut derived = 0usize;
            while Instant::now() < until {
                let id = SocketId::next();
                let transport = TransportStatus::open();
                registry.register(id, transport.clone());
                let instance = INSTANCES[rng.random_range(0..INSTANCES.len())];
                let mut last = None;
                if registry.try_promote(id, instance).is_active() {
                    runtime.on_connected(EditorState::Ready, id.to_string(), instance);
                    let mut state = EditorState::Ready;
                    if rng.random_bool(0.5) {
                        let pushed = if rng.random_bool(0.5) {
                            EditorState::Compiling
                        } else {
                            STATES[rng.random_range(0..STATES.len())]
                        };
                        if runtime.on_editor_status(pushed, 1) {
                            state = pushed;
                        }
                    }
                    last = Some(state);
                }
                check_snapshot(&runtime.snapshot(), steps);
                tokio::task::yield_now().await;

                transport.set(TransportState::Closing);
                registry.remove(id);
                let lost = runtime.on_connection_lost(&id.to_string());
                transport.set(TransportState::Closed);
                let snapshot = runtime.snapshot();
                check_snapshot(&snapshot, steps);
                assert_eq!(lost, last.is_some(), "worker {} step {}", worker, steps);
                if let Some(state) = last {
                    assert_eq!(
                        snapshot.waiting_reason,
                        WaitingReason::for_disconnect(state),
                        "worker {} step {}: disconnect after {}",
                        worker,
                        steps,
                        state
                    );
                    derived += 1;
                }
                steps += 1;
            }
            (steps, derived)
        })
    });

    let results = futures::future::join_all(workers).await;
    let (total, derived) = results
        .into_iter()
        .map(|r| r.unwrap())
        .fold((0, 0), |(s, d), (steps, checked)| (s + steps, d + checked));
    assert!(total > 0);
    assert!(derived > 0, "no worker ever held the active slot");

    // Every socket closed: nothing may remain active
    assert!(registry.active_socket().is_none());
}
