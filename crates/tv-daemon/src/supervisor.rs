//! Self-healing worker loops.
//!
//! Every long-running loop in the daemon (channel rebuilds, directory
//! watchers, the playback loop, the mpv driver) runs under
//! [`spawn_supervised`].  Each attempt is an inner `tokio::spawn`, so both
//! `Err` returns and panics are contained to the attempt: the supervisor
//! logs the fault, runs an optional cleanup hook, backs off briefly, and
//! starts the loop again from scratch.  A clean `Ok(())` return means the
//! loop is intentionally done and is never restarted; cancellation of the
//! shared token ends the loop permanently.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const RESTART_BACKOFF: Duration = Duration::from_millis(250);

/// Optional hook run after a fault, before the restart backoff.
pub type CleanupHook = Box<dyn FnMut() + Send>;

enum Outcome {
    Done,
    Fault,
    Cancelled,
}

/// Run `factory()` in a loop until it returns `Ok(())` or `cancel` fires.
pub fn spawn_supervised<F, Fut>(
    name: &'static str,
    cancel: CancellationToken,
    mut factory: F,
    mut cleanup: Option<CleanupHook>,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        debug!(worker = name, "worker spawned");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let mut attempt = tokio::spawn(factory());
            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    attempt.abort();
                    let _ = (&mut attempt).await;
                    Outcome::Cancelled
                }
                res = &mut attempt => match res {
                    Ok(Ok(())) => Outcome::Done,
                    Ok(Err(e)) => {
                        error!(worker = name, error = %e, "worker failed, restarting soon");
                        Outcome::Fault
                    }
                    Err(e) if e.is_panic() => {
                        error!(worker = name, "worker panicked, restarting soon");
                        Outcome::Fault
                    }
                    Err(_) => Outcome::Cancelled,
                }
            };
            match outcome {
                Outcome::Done => {
                    info!(worker = name, "worker returned cleanly, not restarting");
                    break;
                }
                Outcome::Cancelled => {
                    debug!(worker = name, "worker stopped by shutdown");
                    break;
                }
                Outcome::Fault => {
                    if let Some(hook) = cleanup.as_mut() {
                        debug!(worker = name, "running fault cleanup");
                        hook();
                    }
                    tokio::time::sleep(RESTART_BACKOFF).await;
                }
            }
        }
    })
}
