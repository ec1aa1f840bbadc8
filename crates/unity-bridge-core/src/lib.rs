//! Unity Bridge Core - connection arbitration and retry semantics for a single
//! live Unity editor.
//!
//! The bridge sits between many concurrent tool callers and exactly one
//! authoritative editor connection. It decides which editor socket is active,
//! detects a dead link via heartbeats, tells callers how long to wait while the
//! editor compiles or reconnects, bounds outbound work with a fail-fast queue,
//! and classifies every failure so callers know whether a retry is safe.
//!
//! The core never parses configuration and never owns the RPC surface: hosts
//! build a [`BridgeConfig`], start a [`Bridge`] and an [`EditorLinkServer`],
//! and translate [`ToolError`]s through the [`ErrorSemanticsResolver`].
//!
//! # Example
//!
//! ```rust,no_run
//! use unity_bridge::{Bridge, BridgeConfig, CancellationToken, EditorLinkServer};
//!
//! #[tokio::main]
//! async fn main() -> unity_bridge::Result<()> {
//!     let bridge = Bridge::new(BridgeConfig::default())?;
//!     let addr = "127.0.0.1:6400".parse().unwrap();
//!     let _link = EditorLinkServer::start(bridge.clone(), addr).await?;
//!
//!     let cancel = CancellationToken::new();
//!     match bridge.dispatch("scene.list", serde_json::json!({}), &cancel).await {
//!         Ok(result) => println!("{}", result),
//!         Err(e) => println!("{}", serde_json::to_string(&bridge.error_payload(&e)).unwrap()),
//!     }
//!
//!     bridge.begin_shutdown();
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod link;
pub mod orchestrator;
pub mod queue;
pub mod runtime;
pub mod semantics;
pub mod session;
pub mod state;

// Re-export commonly used types
pub use cancel::{CancellationToken, CancelledError};
pub use config::{BridgeConfig, BridgeDefaults, LinkConfig};
pub use error::{BridgeError, Result};
pub use heartbeat::HeartbeatMonitor;
pub use link::{EditorLinkHandle, EditorLinkServer};
pub use orchestrator::{Bridge, WaitPolicy};
pub use queue::{admission_queue, AdmissionError, AdmissionReceiver, AdmissionSender};
pub use runtime::{RuntimeSnapshot, RuntimeState, RuntimeWatcher};
pub use semantics::{
    DispatchStage, ErrorCode, ErrorSemantics, ErrorSemanticsResolver, ExecutionGuarantee,
    RecoveryAction, ToolError, ToolErrorPayload,
};
pub use session::{
    PromotionOutcome, PromotionResult, SessionRegistry, SocketId, TransportState,
    TransportStatus,
};
pub use state::{EditorState, JobState, ServerState, UnknownToken, WaitingReason};
