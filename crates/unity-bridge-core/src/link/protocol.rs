//! Editor link wire format.
//!
//! Every message is one frame: a 4-byte big-endian length prefix followed by
//! a UTF-8 JSON object tagged by its `"type"` field.
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```

use crate::config::LinkConfig;
use crate::error::{BridgeError, Result};
use crate::semantics::{ErrorCode, ToolError};
use crate::state::EditorState;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Messages sent by the editor plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EditorMessage {
    /// First frame on every socket.
    Hello {
        editor_instance_id: String,
        #[serde(default)]
        editor_state: EditorState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        protocol_version: Option<u32>,
    },
    /// Editor state push. `seq` increases per connection.
    Status { editor_state: EditorState, seq: u64 },
    /// Answer to a heartbeat ping.
    Pong { probe: u64 },
    /// Completion of a forwarded request.
    Response {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<EditorErrorBody>,
    },
}

/// Error reported by the editor for a command it ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditorErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl EditorErrorBody {
    /// The editor executed the command and it failed.
    pub fn into_tool_error(self, command: &str) -> ToolError {
        let mut error = ToolError::new(ErrorCode::EditorCommandFailed, self.message)
            .with_detail("editor_code", self.code)
            .with_detail("command", command);
        if let Some(details) = self.details {
            error = error.with_detail("editor_details", details);
        }
        error
    }
}

/// Messages sent by the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeMessage {
    /// Handshake accepted; this socket is now active.
    Welcome {
        connection_id: String,
        protocol_version: u32,
    },
    /// Handshake refused; the bridge closes the socket next.
    Rejected { reason: String },
    /// Heartbeat ping.
    Ping { probe: u64 },
    /// Forwarded tool command.
    Request {
        id: u64,
        command: String,
        params: Value,
    },
}

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > LinkConfig::MAX_FRAME_SIZE {
        return Err(BridgeError::protocol(format!(
            "frame size {} exceeds maximum {}",
            len,
            LinkConfig::MAX_FRAME_SIZE
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > LinkConfig::MAX_FRAME_SIZE {
        return Err(BridgeError::protocol(format!(
            "refusing to send {} byte frame (maximum {})",
            payload.len(),
            LinkConfig::MAX_FRAME_SIZE
        )));
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read and decode one message. `None` on clean EOF.
pub async fn read_message<R, M>(reader: &mut R) -> Result<Option<M>>
where
    R: AsyncReadExt + Unpin,
    M: DeserializeOwned,
{
    match read_frame(reader).await? {
        Some(frame) => serde_json::from_slice(&frame)
            .map(Some)
            .map_err(|e| BridgeError::protocol(format!("malformed message: {}", e))),
        None => Ok(None),
    }
}

/// Encode one message into a frame payload, refusing anything over
/// [`LinkConfig::MAX_FRAME_SIZE`].
pub fn encode_message<M: Serialize>(message: &M) -> Result<Vec<u8>> {
    let bytes = serde_json::to_vec(message)?;
    if bytes.len() > LinkConfig::MAX_FRAME_SIZE {
        return Err(BridgeError::FrameTooLarge {
            size: bytes.len(),
            max: LinkConfig::MAX_FRAME_SIZE,
        });
    }
    Ok(bytes)
}

/// Encode and write one message.
pub async fn write_message<W, M>(writer: &mut W, message: &M) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
    M: Serialize,
{
    let bytes = encode_message(message)?;
    write_frame(writer, &bytes).await
}
