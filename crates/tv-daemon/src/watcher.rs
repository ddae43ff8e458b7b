//! Filesystem watching for the configured search directories.
//!
//! One [`RecommendedWatcher`] covers the recursive roots and another covers
//! the flat ones.  Raw callbacks filter on the extension allowlist and push
//! into an unbounded channel; a supervised debounce loop coalesces each
//! burst into a single rebuild request.  The quarantine set is deliberately
//! not consulted here, rebuilds are cheap and the engine filters anyway.

use crate::engine::ChannelEngine;
use crate::supervisor::spawn_supervised;
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tv_proto::config::ConfigSnapshot;

pub const DEBOUNCE_WINDOW: Duration = Duration::from_secs(1);

/// Keeps the underlying watchers alive.  Dropping this stops event
/// delivery; the debounce loops then idle until shutdown.
pub struct WatcherHandle {
    _watchers: Vec<RecommendedWatcher>,
}

/// Start watchers over all existing, non-ignored search roots and spawn a
/// supervised debounce loop per watcher group.
pub fn start_watchers(
    config: Arc<ConfigSnapshot>,
    engine: Arc<ChannelEngine>,
    cancel: &CancellationToken,
) -> anyhow::Result<WatcherHandle> {
    let mut recursive = Vec::new();
    let mut flat = Vec::new();
    for dir in &config.search_dirs {
        if dir.ignore {
            continue;
        }
        if !dir.path.is_dir() {
            debug!(path = ?dir.path, "not watching missing search dir");
            continue;
        }
        if dir.recurse {
            recursive.push(dir.path.clone());
        } else {
            flat.push(dir.path.clone());
        }
    }

    let mut watchers = Vec::new();
    let groups = [
        ("watcher-recursive", RecursiveMode::Recursive, recursive),
        ("watcher-flat", RecursiveMode::NonRecursive, flat),
    ];
    for (name, mode, roots) in groups {
        if roots.is_empty() {
            continue;
        }
        watchers.push(start_group(name, mode, roots, &config, &engine, cancel)?);
    }
    Ok(WatcherHandle { _watchers: watchers })
}

fn start_group(
    name: &'static str,
    mode: RecursiveMode,
    roots: Vec<PathBuf>,
    config: &Arc<ConfigSnapshot>,
    engine: &Arc<ChannelEngine>,
    cancel: &CancellationToken,
) -> anyhow::Result<RecommendedWatcher> {
    let (tx, rx) = mpsc::unbounded_channel();
    let filter_config = Arc::clone(config);
    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| match res {
            Ok(event) => {
                if event.paths.iter().any(|p| filter_config.is_valid_extension(p)) {
                    let _ = tx.send(());
                }
            }
            Err(err) => warn!(error = %err, "filesystem watcher error"),
        },
        NotifyConfig::default(),
    )?;
    for root in &roots {
        watcher.watch(root, mode)?;
    }
    debug!(worker = name, roots = roots.len(), "watching search dirs");

    // The receiver outlives individual supervised attempts so a restarted
    // loop picks up where the faulted one left off.
    let rx = Arc::new(Mutex::new(rx));
    let engine = Arc::clone(engine);
    let loop_cancel = cancel.clone();
    let _ = spawn_supervised(
        name,
        cancel.clone(),
        move || {
            let rx = Arc::clone(&rx);
            let engine = Arc::clone(&engine);
            let cancel = loop_cancel.clone();
            async move {
                let mut rx = rx.lock().await;
                debounce_loop(&mut rx, &cancel, DEBOUNCE_WINDOW, || {
                    engine.request_rebuild()
                })
                .await
            }
        },
        None,
    );
    Ok(watcher)
}

/// Coalesce bursts of change notifications: after the first event, keep
/// draining until `window` passes with the deadline fixed at the first
/// event, then fire `trigger` exactly once.
async fn debounce_loop(
    rx: &mut mpsc::UnboundedReceiver<()>,
    cancel: &CancellationToken,
    window: Duration,
    trigger: impl Fn(),
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            first = rx.recv() => {
                if first.is_none() {
                    return Ok(());
                }
            }
        }
        let deadline = Instant::now() + window;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep_until(deadline) => break,
                more = rx.recv() => {
                    if more.is_none() {
                        break;
                    }
                }
            }
        }
        debug!("search dirs changed, requesting rebuild");
        trigger();
    }
}
