//! TCP listener for editor plugin connections.
//!
//! Each accepted socket is registered as a candidate, must send `hello`
//! within the handshake timeout, and is then either promoted to the active
//! connection or rejected and closed.
//!
//! # Thread Safety
//!
//! The accept loop and every connection run as separate tokio tasks sharing
//! the [`Bridge`] via `Arc`. All shared state behind it is internally
//! synchronized.

use super::connection::{self, ConnectionHandle};
use super::protocol::{read_message, write_message, BridgeMessage, EditorMessage};
use crate::config::LinkConfig;
use crate::error::Result;
use crate::orchestrator::Bridge;
use crate::session::{PromotionResult, SocketId, TransportState, TransportStatus};
use crate::state::{EditorState, ServerState};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Handle to a running editor listener. Dropping stops accepting.
pub struct EditorLinkHandle {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl EditorLinkHandle {
    /// Get the address the listener is bound to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting new sockets. Live connections are closed by
    /// [`Bridge::begin_shutdown`].
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for EditorLinkHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Fields of a valid `hello`.
struct Hello {
    editor_instance_id: String,
    editor_state: EditorState,
    protocol_version: Option<u32>,
}

/// Listener for editor plugin sockets.
pub struct EditorLinkServer;

impl EditorLinkServer {
    /// Bind `addr` and start accepting editor sockets in the background.
    ///
    /// Moves the server from `booting` to `waiting_editor` once bound.
    pub async fn start(bridge: Arc<Bridge>, addr: SocketAddr) -> Result<EditorLinkHandle> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        info!("Editor link listening on {}", addr);

        if bridge.snapshot().server_state == ServerState::Booting {
            bridge.runtime().set_server_state(ServerState::WaitingEditor);
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let active_sockets = Arc::new(AtomicUsize::new(0));
        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            bridge,
            shutdown_rx,
            active_sockets,
        ));

        Ok(EditorLinkHandle {
            addr,
            shutdown_tx: Some(shutdown_tx),
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop(
        listener: TcpListener,
        bridge: Arc<Bridge>,
        mut shutdown_rx: oneshot::Receiver<()>,
        active_sockets: Arc<AtomicUsize>,
    ) {
        let stopping = bridge.shutdown_token().clone();
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Editor link listener shutting down");
                    break;
                }
                _ = stopping.cancelled() => {
                    info!("Editor link listener stopping with the bridge");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let current = active_sockets.load(Ordering::Relaxed);
                            if current >= LinkConfig::MAX_EDITOR_SOCKETS {
                                warn!(
                                    "Rejecting editor socket from {}: at max capacity ({})",
                                    peer_addr,
                                    LinkConfig::MAX_EDITOR_SOCKETS
                                );
                                continue;
                            }

                            active_sockets.fetch_add(1, Ordering::Relaxed);
                            let bridge = bridge.clone();
                            let sockets = active_sockets.clone();
                            tokio::spawn(async move {
                                debug!("Editor socket from {}", peer_addr);
                                Self::handle_socket(bridge, stream).await;
                                sockets.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("Editor link accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_socket(bridge: Arc<Bridge>, stream: TcpStream) {
        let _ = stream.set_nodelay(true);
        let id = SocketId::next();
        let transport = TransportStatus::open();
        bridge.registry().register(id, transport.clone());

        let (mut reader, mut writer) = stream.into_split();
        let (handle, queues) = connection::prepare(id, transport.clone());
        let verdict = match Self::read_hello(&bridge, &mut reader).await {
            Ok(hello) => {
                // Queued first so it precedes any request the promotion wakes up
                handle.send_welcome();
                Self::promote(&bridge, &handle, &hello)
            }
            Err(reason) => Err(reason),
        };

        if let Err(reason) = verdict {
            info!("Rejecting editor socket {}: {}", id, reason);
            transport.set(TransportState::Closing);
            bridge.registry().remove(id);
            let _ = write_message(&mut writer, &BridgeMessage::Rejected { reason }).await;
            let _ = writer.shutdown().await;
            transport.set(TransportState::Closed);
            return;
        }

        let writer_task = connection::spawn_writer(&handle, writer, queues);
        connection::serve(&bridge, handle, reader, writer_task).await;
    }

    /// Wait for a valid `hello`.
    ///
    /// An `Err` carries the rejection reason sent back to the editor.
    async fn read_hello(
        bridge: &Bridge,
        reader: &mut OwnedReadHalf,
    ) -> std::result::Result<Hello, String> {
        let timeout = bridge.config().handshake_timeout;
        let first = tokio::time::timeout(timeout, read_message::<_, EditorMessage>(reader)).await;

        let hello = match first {
            Err(_) => return Err(format!("no hello within {}ms", timeout.as_millis())),
            Ok(Err(e)) => return Err(e.to_string()),
            Ok(Ok(None)) => return Err("socket closed before hello".to_string()),
            Ok(Ok(Some(EditorMessage::Hello {
                editor_instance_id,
                editor_state,
                protocol_version,
            }))) => Hello {
                editor_instance_id,
                editor_state,
                protocol_version,
            },
            Ok(Ok(Some(_))) => return Err("expected hello as the first message".to_string()),
        };

        if let Some(version) = hello.protocol_version {
            if version != LinkConfig::PROTOCOL_VERSION {
                return Err(format!(
                    "unsupported protocol version {} (bridge speaks {})",
                    version,
                    LinkConfig::PROTOCOL_VERSION
                ));
            }
        }
        if hello.editor_instance_id.trim().is_empty() {
            return Err("editor_instance_id must not be empty".to_string());
        }
        Ok(hello)
    }

    /// Try to take the active slot for `hello`'s editor.
    fn promote(
        bridge: &Bridge,
        handle: &Arc<ConnectionHandle>,
        hello: &Hello,
    ) -> std::result::Result<(), String> {
        let Some(outcome) = bridge.promote(handle, &hello.editor_instance_id, hello.editor_state)
        else {
            return Err("bridge is shutting down".to_string());
        };
        match outcome.result {
            PromotionResult::Activated | PromotionResult::ReplacedActiveSameEditor => Ok(()),
            PromotionResult::RejectedActiveExists => Err(format!(
                "another editor is already connected ({})",
                bridge
                    .registry()
                    .active_editor_instance()
                    .unwrap_or_else(|| "unknown".to_string())
            )),
            PromotionResult::UnknownSocket => Err("socket is no longer registered".to_string()),
        }
    }
}
