//! mpv IPC driver with separated reader/writer tasks.
//!
//! ```text
//!   MpvDriver::spawn_and_connect()
//!         │
//!         ├── writer_task   ← receives MpvRequest via mpsc, serialises → socket
//!         └── reader_task   ← reads JSON lines from socket
//!                                ├── response (has request_id) → matched oneshot::Sender
//!                                └── event / property-change   → normalized PlayerEvent
//! ```
//!
//! [`run_media_loop`] consumes [`PlayerCommand`]s from the playback loop and
//! drives a spawned mpv over its JSON IPC socket.  The loop runs under the
//! supervisor: losing the process or the socket surfaces as an error, and
//! the restarted attempt respawns mpv from scratch.

use crate::player::{PlayerCommand, PlayerEvent};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tv_proto::config::{ConfigSnapshot, SubtitleSpec};

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

/// Fixed observe_property IDs, matched in property-change events.
pub const OBS_PAUSE: u64 = 1;
pub const OBS_TIME_POS: u64 = 2;
pub const OBS_DURATION: u64 = 3;

const IPC_TIMEOUT: Duration = Duration::from_secs(5);
const PING_INTERVAL: Duration = Duration::from_secs(10);

struct PendingRequest {
    req_id: u64,
    payload: String, // serialised JSON line (already has '\n')
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

/// An mpv event / property-change that arrived unsolicited (no request_id).
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    /// Returns `Some((obs_id, data))` if this is a property-change event.
    pub fn as_property_change(&self) -> Option<(u64, &Value)> {
        if self.raw.get("event")?.as_str()? == "property-change" {
            let id = self.raw.get("id")?.as_u64()?;
            let data = self.raw.get("data").unwrap_or(&Value::Null);
            Some((id, data))
        } else {
            None
        }
    }

    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }
}

/// Map one raw mpv message onto the playback loop's event shape.  Messages
/// the state machine does not care about map to `None`.
pub fn normalize_event(event: &MpvEvent) -> Option<PlayerEvent> {
    if let Some((id, data)) = event.as_property_change() {
        return match id {
            OBS_PAUSE => data.as_bool().map(PlayerEvent::PauseChanged),
            OBS_TIME_POS => data.as_f64().map(PlayerEvent::Position),
            OBS_DURATION => data.as_f64().map(PlayerEvent::Duration),
            _ => None,
        };
    }
    match event.event_name()? {
        "file-loaded" => Some(PlayerEvent::FileLoaded),
        "end-file" => {
            let error = event.raw.get("reason").and_then(|r| r.as_str()) == Some("error");
            Some(PlayerEvent::EndFile { error })
        }
        _ => None,
    }
}

/// The `loadfile` command for a video: replace whatever is playing, seek to
/// `start`, and pick subtitles per the video's subtitle selection.  External
/// subtitle files need a follow-up `sub-add` after the load.
pub fn loadfile_command(path: &Path, start: f64, subtitles: &SubtitleSpec) -> Value {
    let mut options = Vec::new();
    if start > 0.0 {
        options.push(format!("start={start}"));
    }
    options.push(match subtitles {
        SubtitleSpec::Off | SubtitleSpec::File(_) => "sid=no".to_string(),
        SubtitleSpec::On => "sid=auto".to_string(),
        SubtitleSpec::Track(n) => format!("sid={n}"),
    });
    json!(["loadfile", path.to_string_lossy(), "replace", options.join(",")])
}

// ── public handle ─────────────────────────────────────────────────────────────

/// Cloneable handle to the mpv writer task.  Use `send()` to fire a command
/// and await the response.
#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl MpvHandle {
    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg)?;
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mpv writer task gone"))?;

        tokio::time::timeout(IPC_TIMEOUT, reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
    }

    /// Register observe_property for the playback properties.  Must be
    /// called after every fresh connection.
    pub async fn observe_playback_properties(&self) -> anyhow::Result<()> {
        let props = [
            (OBS_PAUSE, "pause"),
            (OBS_TIME_POS, "time-pos"),
            (OBS_DURATION, "duration"),
        ];
        for (id, name) in &props {
            self.send(json!(["observe_property", id, name])).await?;
            debug!("mpv: observe_property id={} name={}", id, name);
        }
        Ok(())
    }

    pub async fn load_video(
        &self,
        path: &Path,
        start: f64,
        subtitles: &SubtitleSpec,
    ) -> anyhow::Result<()> {
        self.send(loadfile_command(path, start, subtitles)).await?;
        if let SubtitleSpec::File(sub_path) = subtitles {
            if let Err(e) = self
                .send(json!(["sub-add", sub_path.to_string_lossy(), "select"]))
                .await
            {
                warn!("mpv: failed to add subtitle file {:?}: {}", sub_path, e);
            }
        }
        Ok(())
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        self.send(json!(["stop"])).await?;
        Ok(())
    }

    pub async fn set_pause(&self, paused: bool) -> anyhow::Result<()> {
        self.send(json!(["set_property", "pause", paused])).await?;
        Ok(())
    }

    pub async fn seek_relative(&self, secs: f64) -> anyhow::Result<()> {
        self.send(json!(["seek", secs, "relative"])).await?;
        Ok(())
    }

    pub async fn seek_to(&self, secs: f64) -> anyhow::Result<()> {
        self.send(json!(["set_property", "time-pos", secs])).await?;
        Ok(())
    }

    pub async fn adjust_volume(&self, delta: i64) -> anyhow::Result<()> {
        self.send(json!(["add", "volume", delta])).await?;
        Ok(())
    }

    pub async fn toggle_mute(&self) -> anyhow::Result<()> {
        self.send(json!(["cycle", "mute"])).await?;
        Ok(())
    }

    /// Health-check: returns Ok(()) if mpv is responsive.
    pub async fn ping(&self) -> anyhow::Result<()> {
        self.send(json!(["get_property", "volume"])).await?;
        Ok(())
    }
}

// ── driver ────────────────────────────────────────────────────────────────────

/// Owns the mpv child process and the IPC socket lifecycle.
pub struct MpvDriver {
    config: Arc<ConfigSnapshot>,
    socket_path: PathBuf,
    process: Option<tokio::process::Child>,
}

impl MpvDriver {
    pub fn new(config: Arc<ConfigSnapshot>) -> Self {
        let socket_path = std::env::temp_dir().join(format!("tv-daemon-mpv-{}.sock", std::process::id()));
        Self {
            config,
            socket_path,
            process: None,
        }
    }

    pub async fn kill(&mut self) {
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }
    }

    /// Spawn a fresh mpv and connect to its IPC socket.  Any previous
    /// process is killed first, so calling this again after a fault always
    /// yields a clean player.
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        self.kill().await;
        let _ = tokio::fs::remove_file(&self.socket_path).await;

        info!("mpv: spawning new process");
        let mut command = tokio::process::Command::new("mpv");
        command
            .arg("--idle=yes")
            .arg("--force-window=yes")
            .arg("--quiet")
            .arg(format!("--input-ipc-server={}", self.socket_path.display()))
            .arg(format!("--volume={}", self.config.starting_volume))
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());
        for (key, value) in &self.config.mpv_options {
            command.arg(format!("--{key}={value}"));
        }
        self.process = Some(command.spawn()?);

        // Wait for the socket to appear.
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if self.socket_path.exists() {
                break;
            }
        }
        if !self.socket_path.exists() {
            anyhow::bail!("mpv IPC socket did not appear");
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let stream = UnixStream::connect(&self.socket_path).await?;
        info!("mpv: connected to IPC socket");
        Ok(Self::start_io_tasks(stream, event_tx))
    }

    fn start_io_tasks(stream: UnixStream, event_tx: mpsc::Sender<MpvEvent>) -> MpvHandle {
        let (read_half, write_half) = stream.into_split();
        let reader = BufReader::new(read_half);

        // pending map: req_id → reply channel.  Shared between writer
        // (inserts) and reader (resolves).
        let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

        let pending_w = pending.clone();
        tokio::spawn(writer_task(write_half, cmd_rx, pending_w));
        tokio::spawn(reader_task(reader, pending, event_tx));

        MpvHandle { tx: cmd_tx }
    }
}

// ── supervised command loop ───────────────────────────────────────────────────

/// Drive mpv from the playback loop's command stream.  Both the driver and
/// the command receiver live outside the attempt so a supervised restart
/// reconnects without losing queued commands.
pub async fn run_media_loop(
    driver: Arc<Mutex<MpvDriver>>,
    commands: Arc<Mutex<mpsc::Receiver<PlayerCommand>>>,
    event_tx: mpsc::Sender<PlayerEvent>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut driver = driver.lock().await;
    let mut commands = commands.lock().await;

    let (raw_tx, mut raw_rx) = mpsc::channel::<MpvEvent>(64);
    let handle = driver.spawn_and_connect(raw_tx).await?;
    handle.observe_playback_properties().await?;

    // Forward normalized events onto the playback queue.  Exits when the
    // reader task drops its sender (connection gone).
    let forward_tx = event_tx.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(raw) = raw_rx.recv().await {
            if let Some(event) = normalize_event(&raw) {
                if forward_tx.send(event).await.is_err() {
                    break;
                }
            }
        }
    });

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            _ = ping.tick() => {
                if let Err(e) = handle.ping().await {
                    break Err(e.context("mpv stopped responding"));
                }
            }
            command = commands.recv() => {
                let Some(command) = command else { break Ok(()) };
                if let Err(e) = dispatch(&handle, command).await {
                    break Err(e);
                }
            }
        }
    };
    if result.is_err() || cancel.is_cancelled() {
        driver.kill().await;
    }
    forwarder.abort();
    result
}

/// Issue one command.  Load and stop failures are faults (the playback
/// loop depends on the resulting events); seek, volume, and pause tweaks
/// are best-effort.
async fn dispatch(handle: &MpvHandle, command: PlayerCommand) -> anyhow::Result<()> {
    match command {
        PlayerCommand::Load { video, start } => {
            handle.load_video(&video.path, start, &video.subtitles).await?;
        }
        PlayerCommand::Stop => handle.stop().await?,
        PlayerCommand::SetPause(paused) => {
            if let Err(e) = handle.set_pause(paused).await {
                warn!("mpv: set_pause failed: {}", e);
            }
        }
        PlayerCommand::SeekRelative(secs) => {
            if let Err(e) = handle.seek_relative(secs).await {
                debug!("mpv: seek failed: {}", e);
            }
        }
        PlayerCommand::SeekAbsolute(secs) => {
            if let Err(e) = handle.seek_to(secs).await {
                debug!("mpv: seek failed: {}", e);
            }
        }
        PlayerCommand::AdjustVolume(delta) => {
            if let Err(e) = handle.adjust_volume(delta).await {
                warn!("mpv: volume change failed: {}", e);
            }
        }
        PlayerCommand::ToggleMute => {
            if let Err(e) = handle.toggle_mute().await {
                warn!("mpv: mute toggle failed: {}", e);
            }
        }
    }
    Ok(())
}

// ── reader task ───────────────────────────────────────────────────────────────

async fn reader_task<R>(
    mut reader: BufReader<R>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>,
    event_tx: mpsc::Sender<MpvEvent>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                let mut map = pending.lock().await;
                for (_, tx) in map.drain() {
                    let _ = tx.send(Err(anyhow::anyhow!("mpv IPC connection closed")));
                }
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                if let Some(req_id) = val.get("request_id").and_then(|v| v.as_u64()) {
                    // A command response, routed to the pending request.
                    let mut map = pending.lock().await;
                    if let Some(tx) = map.remove(&req_id) {
                        let result = if val["error"].as_str() == Some("success") {
                            Ok(val)
                        } else {
                            let err = val["error"]
                                .as_str()
                                .unwrap_or("unknown error")
                                .to_string();
                            debug!("mpv reader: response req={} err={}", req_id, err);
                            Err(anyhow::anyhow!("mpv error: {}", err))
                        };
                        let _ = tx.send(result);
                    } else {
                        debug!("mpv reader: response for unknown req={}", req_id);
                    }
                } else {
                    let _ = event_tx.send(MpvEvent { raw: val }).await;
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                let mut map = pending.lock().await;
                for (_, tx) in map.drain() {
                    let _ = tx.send(Err(anyhow::anyhow!("mpv IPC read error: {}", e)));
                }
                break;
            }
        }
    }
}

// ── writer task ───────────────────────────────────────────────────────────────

async fn writer_task<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<PendingRequest>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>,
) where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Register the reply channel before writing so the reader can
        // match an immediate response.
        {
            let mut map = pending.lock().await;
            map.insert(req.req_id, req.reply);
        }
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            let mut map = pending.lock().await;
            if let Some(tx) = map.remove(&req.req_id) {
                let _ = tx.send(Err(anyhow::anyhow!("mpv write error: {}", e)));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(raw: Value) -> MpvEvent {
        MpvEvent { raw }
    }

    #[test]
    fn test_property_changes_normalize() {
        assert_eq!(
            normalize_event(&event(
                json!({"event": "property-change", "id": OBS_PAUSE, "data": true})
            )),
            Some(PlayerEvent::PauseChanged(true))
        );
        assert_eq!(
            normalize_event(&event(
                json!({"event": "property-change", "id": OBS_TIME_POS, "data": 12.5})
            )),
            Some(PlayerEvent::Position(12.5))
        );
        assert_eq!(
            normalize_event(&event(
                json!({"event": "property-change", "id": OBS_DURATION, "data": 90.0})
            )),
            Some(PlayerEvent::Duration(90.0))
        );
        // A null payload (property unavailable) is not an event.
        assert_eq!(
            normalize_event(&event(
                json!({"event": "property-change", "id": OBS_TIME_POS, "data": null})
            )),
            None
        );
    }

    #[test]
    fn test_end_file_error_reason() {
        assert_eq!(
            normalize_event(&event(json!({"event": "end-file", "reason": "eof"}))),
            Some(PlayerEvent::EndFile { error: false })
        );
        assert_eq!(
            normalize_event(&event(json!({"event": "end-file", "reason": "stop"}))),
            Some(PlayerEvent::EndFile { error: false })
        );
        assert_eq!(
            normalize_event(&event(json!({"event": "end-file", "reason": "error"}))),
            Some(PlayerEvent::EndFile { error: true })
        );
    }

    #[test]
    fn test_unrelated_events_are_dropped() {
        assert_eq!(normalize_event(&event(json!({"event": "start-file"}))), None);
        assert_eq!(normalize_event(&event(json!({"some": "garbage"}))), None);
    }

    #[test]
    fn test_loadfile_options() {
        let cmd = loadfile_command(Path::new("/videos/a.mp4"), 0.0, &SubtitleSpec::Off);
        assert_eq!(cmd, json!(["loadfile", "/videos/a.mp4", "replace", "sid=no"]));

        let cmd = loadfile_command(Path::new("/videos/a.mp4"), 42.5, &SubtitleSpec::Track(2));
        assert_eq!(
            cmd,
            json!(["loadfile", "/videos/a.mp4", "replace", "start=42.5,sid=2"])
        );

        let cmd = loadfile_command(
            Path::new("/videos/a.mp4"),
            0.0,
            &SubtitleSpec::File(PathBuf::from("a.srt")),
        );
        assert_eq!(cmd, json!(["loadfile", "/videos/a.mp4", "replace", "sid=no"]));
    }
}
