use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ids::SessionId;

/// Lifecycle state of a streaming session.
///
/// `Idle → Active ⇄ Paused → Stopped | Complete`, with `Error` reachable
/// from `Active`/`Paused` on an unrecoverable source fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Active,
    Paused,
    Stopped,
    Complete,
    Error,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Complete | Self::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a session streams.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionMode {
    /// Pre-rendered frames relayed as `video_frame` messages.
    #[default]
    #[serde(rename = "video")]
    Video,
    /// Synthetic numbered payloads relayed as `frame` messages.
    #[serde(rename = "frame-test")]
    FrameTest,
    /// One synthetic payload per second relayed as `second` messages.
    #[serde(rename = "second-test")]
    SecondTest,
}

impl SessionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::FrameTest => "frame-test",
            Self::SecondTest => "second-test",
        }
    }
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "video" => Ok(Self::Video),
            "frame-test" | "frame_test" => Ok(Self::FrameTest),
            "second-test" | "second_test" => Ok(Self::SecondTest),
            other => Err(format!("unknown session mode: {other}")),
        }
    }
}

/// Point-in-time view of a session, published by its pacer after every change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub mode: SessionMode,
    pub state: SessionState,
    pub current_frame: u64,
    pub total_frames: u64,
    /// Achieved send rate (frames per second).
    pub fps: f64,
    pub started_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(SessionState::Stopped.is_terminal());
        assert!(SessionState::Complete.is_terminal());
        assert!(SessionState::Error.is_terminal());
        assert!(!SessionState::Idle.is_terminal());
        assert!(!SessionState::Active.is_terminal());
        assert!(!SessionState::Paused.is_terminal());
    }

    #[test]
    fn state_serializes_snake_case() {
        let json = serde_json::to_string(&SessionState::Paused).unwrap();
        assert_eq!(json, "\"paused\"");
    }

    #[test]
    fn mode_wire_names() {
        assert_eq!(serde_json::to_string(&SessionMode::FrameTest).unwrap(), "\"frame-test\"");
        assert_eq!(serde_json::to_string(&SessionMode::SecondTest).unwrap(), "\"second-test\"");
        let mode: SessionMode = serde_json::from_str("\"video\"").unwrap();
        assert_eq!(mode, SessionMode::Video);
    }

    #[test]
    fn mode_parses_both_separators() {
        assert_eq!("frame_test".parse::<SessionMode>().unwrap(), SessionMode::FrameTest);
        assert_eq!("second-test".parse::<SessionMode>().unwrap(), SessionMode::SecondTest);
        assert!("slideshow".parse::<SessionMode>().is_err());
    }
}
