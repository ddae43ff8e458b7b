//! The playback state machine.
//!
//! A single consumer drains the event queue: media engine callbacks and
//! user actions arrive interleaved, in order, and this loop is the only
//! writer of the playback state.  Producers never call in directly, they
//! only enqueue [`PlayerEvent`]s.  Outbound media control goes through
//! typed [`PlayerCommand`]s so tests can drive the loop without a real
//! player process.

use crate::engine::{ChannelEngine, Video};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use tv_proto::config::ConfigSnapshot;
use tv_proto::protocol::{Broadcast, PlayerStateKind, PlayerStateSnapshot, RemoteAction};

const SEEK_STEP_SECS: f64 = 15.0;
const VOLUME_STEP: i64 = 5;

/// Everything the playback loop consumes, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    FileLoaded,
    Position(f64),
    Duration(f64),
    PauseChanged(bool),
    EndFile { error: bool },
    Action(RemoteAction),
}

/// Outbound media engine control.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerCommand {
    Load { video: Arc<Video>, start: f64 },
    Stop,
    SeekRelative(f64),
    SeekAbsolute(f64),
    SetPause(bool),
    AdjustVolume(i64),
    ToggleMute,
}

/// Result of handling one event inside the playback loop.
enum LoopControl {
    Continue,
    BreakToSelection,
}

pub struct PlaybackController {
    engine: Arc<ChannelEngine>,
    config: Arc<ConfigSnapshot>,
    events: mpsc::Receiver<PlayerEvent>,
    media_tx: mpsc::Sender<PlayerCommand>,
    broadcast_tx: broadcast::Sender<Broadcast>,
    cancel: CancellationToken,
    has_videos: watch::Receiver<bool>,
    state: PlayerStateSnapshot,
    current_rating: Option<String>,
    /// Pre-selected target for the next loading cycle (set by channel
    /// up/down); `None` means a fresh random pick.
    next_video: Option<Arc<Video>>,
    current: Option<Arc<Video>>,
    places: HashMap<PathBuf, f64>,
}

impl PlaybackController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<ChannelEngine>,
        config: Arc<ConfigSnapshot>,
        events: mpsc::Receiver<PlayerEvent>,
        media_tx: mpsc::Sender<PlayerCommand>,
        broadcast_tx: broadcast::Sender<Broadcast>,
        cancel: CancellationToken,
    ) -> Self {
        let has_videos = engine.subscribe_has_videos();
        let current_rating = config.starting_rating.clone();
        Self {
            engine,
            config,
            events,
            media_tx,
            broadcast_tx,
            cancel,
            has_videos,
            state: PlayerStateSnapshot::default(),
            current_rating,
            next_video: None,
            current: None,
            places: HashMap::new(),
        }
    }

    pub fn current_rating(&self) -> Option<&str> {
        self.current_rating.as_deref()
    }

    /// The outer selection loop.  Returns `Ok(())` only on shutdown; every
    /// other exit is a fault the supervisor restarts.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        loop {
            self.state = PlayerStateSnapshot::default();
            self.publish_state();

            let Some(video) = self.select_video().await? else {
                return Ok(());
            };
            info!(path = ?video.path, channel = video.channel + 1, "playing video");

            let start = if self.config.save_place_while_browsing {
                self.places.get(&video.path).copied().unwrap_or(0.0)
            } else {
                0.0
            };
            self.current = Some(Arc::clone(&video));
            self.media_tx
                .send(PlayerCommand::Load { video, start })
                .await?;

            loop {
                let event = tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(()),
                    event = self.events.recv() => match event {
                        Some(event) => event,
                        None => anyhow::bail!("event queue closed"),
                    },
                };
                trace!(?event, "playback event");
                match self.handle_event(event).await? {
                    LoopControl::Continue => {}
                    LoopControl::BreakToSelection => break,
                }
            }
            self.current = None;
        }
    }

    /// Pick what to play next: a pre-selected channel-change target, a
    /// random video at the current rating, an unfiltered fallback, or
    /// block in NEEDS_FILES until the engine has something.  `None` means
    /// shutdown was requested while waiting.
    async fn select_video(&mut self) -> anyhow::Result<Option<Arc<Video>>> {
        if let Some(video) = self.next_video.take() {
            return Ok(Some(video));
        }
        loop {
            if let Some(video) = self.engine.get_random_video(self.current_rating.as_deref()) {
                return Ok(Some(video));
            }
            if let Some(video) = self.engine.get_random_video(None) {
                // Table is non-empty but nothing matches the filter.
                let rating = self.current_rating.as_deref().unwrap_or("?");
                self.notify(format!("No video found for rating {rating}!"));
                return Ok(Some(video));
            }

            debug!("no videos available, waiting");
            self.state = PlayerStateSnapshot {
                state: PlayerStateKind::NeedsFiles,
                ..Default::default()
            };
            self.publish_state();
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(None),
                res = self.has_videos.wait_for(|ready| *ready) => {
                    res.map_err(|_| anyhow::anyhow!("channel engine gone"))?;
                }
            }
            self.state.state = PlayerStateKind::Loading;
            self.publish_state();
        }
    }

    async fn handle_event(&mut self, event: PlayerEvent) -> anyhow::Result<LoopControl> {
        match event {
            PlayerEvent::FileLoaded => {
                self.state = PlayerStateSnapshot {
                    state: PlayerStateKind::Playing,
                    video: self.current.as_ref().map(|v| v.info()),
                    position: 0.0,
                    duration: 0.0,
                };
                self.publish_state();
            }
            PlayerEvent::Position(position) => {
                self.state.position = position;
                self.publish_state();
            }
            PlayerEvent::Duration(duration) => {
                self.state.duration = duration;
                self.publish_state();
            }
            PlayerEvent::PauseChanged(paused) => {
                // Redundant signals are ignored.
                if paused && self.state.state == PlayerStateKind::Playing {
                    self.state.state = PlayerStateKind::Paused;
                    self.publish_state();
                } else if !paused && self.state.state == PlayerStateKind::Paused {
                    self.state.state = PlayerStateKind::Playing;
                    self.publish_state();
                }
            }
            PlayerEvent::EndFile { error } => {
                if let Some(video) = self.current.as_ref() {
                    // A normal finish mid-playback clears the saved place;
                    // channel changes go through LOADING first and keep it.
                    if self.state.state == PlayerStateKind::Playing
                        && self.config.save_place_while_browsing
                    {
                        self.places.insert(video.path.clone(), 0.0);
                    }
                    if error {
                        warn!(path = ?video.path, "video failed, disabling it");
                        self.engine.mark_bad_video(&video.path);
                    }
                    info!(path = ?video.path, "ending playback");
                }
                return Ok(LoopControl::BreakToSelection);
            }
            PlayerEvent::Action(action) => return self.handle_action(action).await,
        }
        Ok(LoopControl::Continue)
    }

    async fn handle_action(&mut self, action: RemoteAction) -> anyhow::Result<LoopControl> {
        debug!(action = action.name(), "user action");
        match action {
            RemoteAction::Up | RemoteAction::Down => {
                let direction = if action == RemoteAction::Up { 1 } else { -1 };
                self.state.state = PlayerStateKind::Loading;
                self.state.video = None;
                self.publish_state();
                self.next_video = self.engine.get_video_for_channel_change(
                    self.current.as_ref().map(|v| v.path.as_path()),
                    self.current_rating.as_deref(),
                    direction,
                );
                if self.next_video.is_none() {
                    let rating = self.current_rating.as_deref().unwrap_or("?");
                    self.notify(format!("No channel found for rating {rating}!"));
                }
                self.media_tx.send(PlayerCommand::Stop).await?;
            }
            RemoteAction::Random => {
                self.state.state = PlayerStateKind::Loading;
                self.state.video = None;
                self.publish_state();
                self.next_video = None;
                self.media_tx.send(PlayerCommand::Stop).await?;
            }
            RemoteAction::Pause => match self.state.state {
                PlayerStateKind::Playing => {
                    self.media_tx.send(PlayerCommand::SetPause(true)).await?;
                }
                PlayerStateKind::Paused => {
                    self.media_tx.send(PlayerCommand::SetPause(false)).await?;
                }
                _ => {}
            },
            RemoteAction::Left => {
                self.media_tx
                    .send(PlayerCommand::SeekRelative(-SEEK_STEP_SECS))
                    .await?;
            }
            RemoteAction::Right => {
                self.media_tx
                    .send(PlayerCommand::SeekRelative(SEEK_STEP_SECS))
                    .await?;
            }
            RemoteAction::Rewind => {
                self.media_tx.send(PlayerCommand::SeekAbsolute(0.0)).await?;
            }
            RemoteAction::VolumeUp => {
                self.media_tx
                    .send(PlayerCommand::AdjustVolume(VOLUME_STEP))
                    .await?;
            }
            RemoteAction::VolumeDown => {
                self.media_tx
                    .send(PlayerCommand::AdjustVolume(-VOLUME_STEP))
                    .await?;
            }
            RemoteAction::Mute => {
                self.media_tx.send(PlayerCommand::ToggleMute).await?;
            }
            RemoteAction::Osd => {
                // Overlay rendering lives in the display layer.
                debug!("osd action not handled by the playback loop");
            }
            RemoteAction::Ratings => self.cycle_rating(),
            RemoteAction::Power => {
                info!("shutting down by request");
                self.cancel.cancel();
            }
        }
        Ok(LoopControl::Continue)
    }

    fn cycle_rating(&mut self) {
        if !self.config.ratings.is_enabled() {
            return;
        }
        let Some(current) = self.current_rating.as_deref() else {
            return;
        };
        let Some(next) = self.config.ratings.cycle(current) else {
            return;
        };
        let next = next.to_string();
        if let Some(rating) = self.config.ratings.get(&next) {
            info!(rating = %rating.rating, description = %rating.description, "rating changed");
        }
        self.current_rating = Some(next.clone());
        let _ = self
            .broadcast_tx
            .send(Broadcast::CurrentRating(Some(next)));
    }

    /// Publish the state snapshot, saving the browsing place as a side
    /// effect while something is actually on screen.
    fn publish_state(&mut self) {
        if self.config.save_place_while_browsing {
            if let Some(video) = &self.state.video {
                if matches!(
                    self.state.state,
                    PlayerStateKind::Playing | PlayerStateKind::Paused
                ) {
                    self.places.insert(video.path.clone(), self.state.position);
                }
            }
        }
        let _ = self.broadcast_tx.send(Broadcast::State(self.state.clone()));
    }

    fn notify(&self, message: String) {
        warn!(%message);
        let _ = self.broadcast_tx.send(Broadcast::Notice(message));
    }

    /// Restart hygiene for the supervisor's cleanup hook: best-effort stop
    /// of whatever is playing, then drop queued events so the fresh loop
    /// starts from a quiet state.
    pub fn cleanup_after_fault(&mut self) {
        let _ = self.media_tx.try_send(PlayerCommand::Stop);
        while let Ok(event) = self.events.try_recv() {
            trace!(?event, "purged event during cleanup");
        }
        self.next_video = None;
        self.current = None;
    }
}
