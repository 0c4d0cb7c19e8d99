//! Wait for a file to appear.

use notify::{Event, RecursiveMode, Watcher};
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Wait until `dir/name` exists. Returns `false` once `timeout` elapses.
///
/// Uses a filesystem watcher on `dir` when one can be created and falls back
/// to polling otherwise. Never blocks past `timeout`.
pub async fn wait_for_file(dir: &Path, name: &str, timeout: Duration) -> bool {
    let target = dir.join(name);
    if target.exists() {
        return true;
    }
    let deadline = Instant::now() + timeout;

    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res {
            let _ = tx.send(event);
        }
    });
    let mut watcher = match watcher {
        Ok(watcher) => watcher,
        Err(e) => {
            debug!(error = %e, "File watcher unavailable, polling");
            return poll_until(&target, deadline).await;
        }
    };
    if let Err(e) = watcher.watch(dir, RecursiveMode::NonRecursive) {
        debug!(dir = %dir.display(), error = %e, "Cannot watch directory, polling");
        return poll_until(&target, deadline).await;
    }

    // The file may have appeared before the watch was armed.
    if target.exists() {
        return true;
    }

    let expired = tokio::time::sleep_until(deadline);
    tokio::pin!(expired);
    loop {
        tokio::select! {
            _ = &mut expired => return target.exists(),
            event = rx.recv() => match event {
                Some(event) => {
                    if event.paths.iter().any(|p| p.ends_with(name)) && target.exists() {
                        return true;
                    }
                }
                None => return poll_until(&target, deadline).await,
            },
            // Events can be coalesced or dropped; check directly too.
            _ = tokio::time::sleep(POLL_INTERVAL * 4) => {
                if target.exists() {
                    return true;
                }
            }
        }
    }
}

async fn poll_until(target: &Path, deadline: Instant) -> bool {
    loop {
        if target.exists() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
    }
}
