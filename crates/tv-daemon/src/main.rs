mod engine;
mod mpv;
mod player;
mod supervisor;
mod watcher;

use crate::engine::ChannelEngine;
use crate::mpv::{run_media_loop, MpvDriver};
use crate::player::{PlaybackController, PlayerCommand, PlayerEvent};
use crate::supervisor::spawn_supervised;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tv_proto::config::{Config, DEFAULT_CONFIG_PATHS};
use tv_proto::protocol::Broadcast;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| {
            DEFAULT_CONFIG_PATHS
                .iter()
                .map(PathBuf::from)
                .find(|p| p.is_file())
        })
        .ok_or_else(|| {
            anyhow::anyhow!("no config file given and none found at {DEFAULT_CONFIG_PATHS:?}")
        })?;
    let raw_config = Config::load(&config_path)?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&raw_config.log_level)),
        )
        .init();
    info!(path = ?config_path, "config loaded");

    // Override warnings fire during validation, after tracing is up.
    let config = Arc::new(raw_config.snapshot()?);

    let (broadcast_tx, _) = broadcast::channel::<Broadcast>(64);
    let (event_tx, event_rx) = mpsc::channel::<PlayerEvent>(256);
    let (media_tx, media_rx) = mpsc::channel::<PlayerCommand>(64);
    let cancel = CancellationToken::new();

    let engine = ChannelEngine::new(Arc::clone(&config), broadcast_tx.clone())?;
    {
        let engine = Arc::clone(&engine);
        tokio::task::spawn_blocking(move || engine.rebuild()).await?;
    }

    let rebuild_task = {
        let engine = Arc::clone(&engine);
        let cancel = cancel.clone();
        spawn_supervised(
            "engine-rebuild",
            cancel.clone(),
            move || Arc::clone(&engine).run_rebuild_loop(cancel.clone()),
            None,
        )
    };

    let _watchers = watcher::start_watchers(Arc::clone(&config), Arc::clone(&engine), &cancel)?;

    let _ = broadcast_tx.send(Broadcast::CurrentRating(config.starting_rating.clone()));

    let controller = Arc::new(Mutex::new(PlaybackController::new(
        Arc::clone(&engine),
        Arc::clone(&config),
        event_rx,
        media_tx,
        broadcast_tx.clone(),
        cancel.clone(),
    )));
    let player_task = {
        let run_controller = Arc::clone(&controller);
        let cleanup_controller = Arc::clone(&controller);
        spawn_supervised(
            "player",
            cancel.clone(),
            move || {
                let controller = Arc::clone(&run_controller);
                async move { controller.lock().await.run().await }
            },
            Some(Box::new(move || {
                // The faulted attempt has released the lock by now.
                if let Ok(mut controller) = cleanup_controller.try_lock() {
                    controller.cleanup_after_fault();
                }
            })),
        )
    };

    let media_task = {
        let driver = Arc::new(Mutex::new(MpvDriver::new(Arc::clone(&config))));
        let media_rx = Arc::new(Mutex::new(media_rx));
        let cancel_loop = cancel.clone();
        spawn_supervised(
            "mpv",
            cancel.clone(),
            move || {
                run_media_loop(
                    Arc::clone(&driver),
                    Arc::clone(&media_rx),
                    event_tx.clone(),
                    cancel_loop.clone(),
                )
            },
            None,
        )
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
        _ = cancel.cancelled() => info!("shutdown requested"),
    }
    cancel.cancel();
    for task in [rebuild_task, player_task, media_task] {
        let _ = task.await;
    }
    info!("goodbye");
    Ok(())
}
