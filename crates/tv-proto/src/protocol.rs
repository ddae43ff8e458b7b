//! Message shapes pushed to external subscribers (web UI, remote displays).
//!
//! Delivery is best-effort over a broadcast channel; dropped messages are
//! never an error.  The transport itself lives outside this crate.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One channel-table entry as shown to subscribers.  `channel` is 1-based
/// for display; the engine's internal indices are 0-based.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VideoInfo {
    pub path: PathBuf,
    pub channel: usize,
    pub name: String,
    pub rating: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlayerStateKind {
    #[default]
    Loading,
    NeedsFiles,
    Playing,
    Paused,
}

/// Read-only snapshot of the playback state, re-published after every
/// change.  Only the playback controller ever produces these.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PlayerStateSnapshot {
    pub state: PlayerStateKind,
    pub video: Option<VideoInfo>,
    pub position: f64,
    pub duration: f64,
}

/// Push messages to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Broadcast {
    /// Full channel table, emitted after every rebuild.
    Videos(Vec<VideoInfo>),
    /// Playback state, emitted after every state change.
    State(PlayerStateSnapshot),
    /// Current rating filter, emitted whenever it changes.
    CurrentRating(Option<String>),
    /// User-visible notification ("No channel found for rating R", ...).
    Notice(String),
}

/// Discrete named actions from the input/remote layer.  The ingress side
/// parses names with [`RemoteAction::parse`] and logs-and-drops anything
/// unknown; past that boundary the set is closed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RemoteAction {
    Up,
    Down,
    Left,
    Right,
    Random,
    Pause,
    Mute,
    VolumeUp,
    VolumeDown,
    Rewind,
    Osd,
    Ratings,
    Power,
}

impl RemoteAction {
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "up" => Self::Up,
            "down" => Self::Down,
            "left" => Self::Left,
            "right" => Self::Right,
            "random" => Self::Random,
            "pause" => Self::Pause,
            "mute" => Self::Mute,
            "volume-up" => Self::VolumeUp,
            "volume-down" => Self::VolumeDown,
            "rewind" => Self::Rewind,
            "osd" => Self::Osd,
            "ratings" => Self::Ratings,
            "power" => Self::Power,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Left => "left",
            Self::Right => "right",
            Self::Random => "random",
            Self::Pause => "pause",
            Self::Mute => "mute",
            Self::VolumeUp => "volume-up",
            Self::VolumeDown => "volume-down",
            Self::Rewind => "rewind",
            Self::Osd => "osd",
            Self::Ratings => "ratings",
            Self::Power => "power",
        }
    }
}
