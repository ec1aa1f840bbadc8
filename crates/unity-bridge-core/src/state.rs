//! Closed-set state values and their canonical wire tokens.
//!
//! Every state encodes to exactly one lowercase token. Decoding is total where
//! the set has a sentinel (`EditorState::Unknown`), so a newer editor pushing a
//! token this bridge does not know yet degrades to "unknown" instead of
//! failing the frame.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when a token does not name any value of a closed set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unrecognized {kind} token: {token:?}")]
pub struct UnknownToken {
    pub kind: &'static str,
    pub token: String,
}

/// Lifecycle of the bridge itself (not the editor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Booting,
    WaitingEditor,
    Ready,
    Stopping,
    Stopped,
}

impl ServerState {
    pub const ALL: [ServerState; 5] = [
        ServerState::Booting,
        ServerState::WaitingEditor,
        ServerState::Ready,
        ServerState::Stopping,
        ServerState::Stopped,
    ];

    pub fn as_wire(self) -> &'static str {
        match self {
            ServerState::Booting => "booting",
            ServerState::WaitingEditor => "waiting_editor",
            ServerState::Ready => "ready",
            ServerState::Stopping => "stopping",
            ServerState::Stopped => "stopped",
        }
    }

    /// Whether the bridge is on its way out and must not be revived by a
    /// late connect.
    pub fn is_stopping(self) -> bool {
        matches!(self, ServerState::Stopping | ServerState::Stopped)
    }
}

impl FromStr for ServerState {
    type Err = UnknownToken;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_wire() == token)
            .ok_or_else(|| UnknownToken {
                kind: "server_state",
                token: token.to_string(),
            })
    }
}

/// Last status pushed by the editor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditorState {
    Ready,
    Compiling,
    Reloading,
    // Must stay last for `serde(other)`
    #[default]
    #[serde(other)]
    Unknown,
}

impl EditorState {
    pub const ALL: [EditorState; 4] = [
        EditorState::Unknown,
        EditorState::Ready,
        EditorState::Compiling,
        EditorState::Reloading,
    ];

    pub fn as_wire(self) -> &'static str {
        match self {
            EditorState::Unknown => "unknown",
            EditorState::Ready => "ready",
            EditorState::Compiling => "compiling",
            EditorState::Reloading => "reloading",
        }
    }

    /// Decode a token, mapping absent or unrecognized input to `Unknown`.
    pub fn from_wire(token: Option<&str>) -> Self {
        match token {
            Some("ready") => EditorState::Ready,
            Some("compiling") => EditorState::Compiling,
            Some("reloading") => EditorState::Reloading,
            _ => EditorState::Unknown,
        }
    }

    /// Compiling and reloading resolve on their own; the editor comes back.
    pub fn is_transient(self) -> bool {
        matches!(self, EditorState::Compiling | EditorState::Reloading)
    }
}

/// Why the editor link is currently unusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitingReason {
    #[default]
    None,
    Compiling,
    Reloading,
    Reconnecting,
}

impl WaitingReason {
    pub const ALL: [WaitingReason; 4] = [
        WaitingReason::None,
        WaitingReason::Compiling,
        WaitingReason::Reloading,
        WaitingReason::Reconnecting,
    ];

    pub fn as_wire(self) -> &'static str {
        match self {
            WaitingReason::None => "none",
            WaitingReason::Compiling => "compiling",
            WaitingReason::Reloading => "reloading",
            WaitingReason::Reconnecting => "reconnecting",
        }
    }

    /// Reason reported after the link drops, given the last editor status
    /// seen on it.
    pub fn for_disconnect(last: EditorState) -> Self {
        match last {
            EditorState::Compiling => WaitingReason::Compiling,
            EditorState::Reloading => WaitingReason::Reloading,
            EditorState::Unknown | EditorState::Ready => WaitingReason::Reconnecting,
        }
    }

    pub fn is_transient(self) -> bool {
        matches!(self, WaitingReason::Compiling | WaitingReason::Reloading)
    }
}

impl FromStr for WaitingReason {
    type Err = UnknownToken;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|reason| reason.as_wire() == token)
            .ok_or_else(|| UnknownToken {
                kind: "waiting_reason",
                token: token.to_string(),
            })
    }
}

/// State of a long-running editor job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Timeout,
    Cancelled,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Queued,
        JobState::Running,
        JobState::Succeeded,
        JobState::Failed,
        JobState::Timeout,
        JobState::Cancelled,
    ];

    pub fn as_wire(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Timeout => "timeout",
            JobState::Cancelled => "cancelled",
        }
    }

    /// Parse a token into `(state, recognized)`.
    ///
    /// Unrecognized input yields `(Failed, false)`. Callers must check the
    /// flag: reporting an unparseable job as a plain failure would hide the
    /// protocol mismatch.
    #[must_use]
    pub fn parse_wire(token: &str) -> (Self, bool) {
        match Self::ALL.into_iter().find(|state| state.as_wire() == token) {
            Some(state) => (state, true),
            None => (JobState::Failed, false),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Timeout | JobState::Cancelled
        )
    }
}

macro_rules! display_as_wire {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_wire())
            }
        })*
    };
}

display_as_wire!(ServerState, EditorState, WaitingReason, JobState);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_state_roundtrip() {
        for state in ServerState::ALL {
            assert_eq!(state.as_wire().parse::<ServerState>(), Ok(state));
        }
    }

    #[test]
    fn test_server_state_rejects_unknown_token() {
        let err = "hibernating".parse::<ServerState>().unwrap_err();
        assert_eq!(err.kind, "server_state");
        assert_eq!(err.token, "hibernating");
    }

    #[test]
    fn test_editor_state_roundtrip() {
        for state in EditorState::ALL {
            assert_eq!(EditorState::from_wire(Some(state.as_wire())), state);
        }
    }

    #[test]
    fn test_editor_state_unknown_sentinel() {
        assert_eq!(EditorState::from_wire(None), EditorState::Unknown);
        assert_eq!(EditorState::from_wire(Some("")), EditorState::Unknown);
        assert_eq!(EditorState::from_wire(Some("importing")), EditorState::Unknown);
        // Tokens are lowercase only
        assert_eq!(EditorState::from_wire(Some("Ready")), EditorState::Unknown);
    }

    #[test]
    fn test_editor_state_serde_forward_compatible() {
        let state: EditorState = serde_json::from_str("\"playing\"").unwrap();
        assert_eq!(state, EditorState::Unknown);

        let state: EditorState = serde_json::from_str("\"compiling\"").unwrap();
        assert_eq!(state, EditorState::Compiling);
    }

    #[test]
    fn test_serde_matches_wire_tokens() {
        for state in ServerState::ALL {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", state.as_wire()));
        }
        for reason in WaitingReason::ALL {
            let json = serde_json::to_string(&reason).unwrap();
            assert_eq!(json, format!("\"{}\"", reason.as_wire()));
        }
        for state in JobState::ALL {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", state.as_wire()));
        }
    }

    #[test]
    fn test_waiting_reason_for_disconnect() {
        assert_eq!(
            WaitingReason::for_disconnect(EditorState::Compiling),
            WaitingReason::Compiling
        );
        assert_eq!(
            WaitingReason::for_disconnect(EditorState::Reloading),
            WaitingReason::Reloading
        );
        assert_eq!(
            WaitingReason::for_disconnect(EditorState::Ready),
            WaitingReason::Reconnecting
        );
        assert_eq!(
            WaitingReason::for_disconnect(EditorState::Unknown),
            WaitingReason::Reconnecting
        );
    }

    #[test]
    fn test_job_state_parse_flag() {
        for state in JobState::ALL {
            assert_eq!(JobState::parse_wire(state.as_wire()), (state, true));
        }
        assert_eq!(JobState::parse_wire("exploded"), (JobState::Failed, false));
    }

    #[test]
    fn test_job_state_terminal_set() {
        let terminal: Vec<JobState> = JobState::ALL
            .into_iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(
            terminal,
            vec![
                JobState::Succeeded,
                JobState::Failed,
                JobState::Timeout,
                JobState::Cancelled
            ]
        );
    }

    #[test]
    fn test_display_uses_wire_token() {
        assert_eq!(ServerState::WaitingEditor.to_string(), "waiting_editor");
        assert_eq!(WaitingReason::Reconnecting.to_string(), "reconnecting");
    }
}
