//! Response correlation watcher
//!
//! The agent has no callback channel; it is instructed to write its final
//! answer to `<response_dir>/response-<id>.md`. This watcher observes that
//! directory through `notify`, keeps a pending map of correlation id →
//! oneshot waiter, and resolves each waiter with the first non-empty
//! artifact that shows up for its id. Timed-out and disposed waits drop
//! their pending entry, so late artifacts are ignored.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{BridgeError, BridgeResult};

static RESPONSE_FILE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^response-(.+)\.md$").expect("valid response filename pattern"));

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<String>>>>;

pub struct ResponseWatcher {
    response_dir: PathBuf,
    response_dir_name: String,
    pending: PendingMap,
    // Dropping the notify handle cancels the subscription.
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl ResponseWatcher {
    /// Create the response directory, subscribe to change notifications for
    /// it, and spawn the dispatcher task that resolves pending waiters.
    pub async fn start(workspace_root: &Path, response_dir_name: &str) -> Result<Arc<Self>> {
        let response_dir = workspace_root.join(response_dir_name);
        tokio::fs::create_dir_all(&response_dir)
            .await
            .with_context(|| format!("creating response dir {}", response_dir.display()))?;

        let (event_tx, event_rx) = mpsc::channel::<PathBuf>(100);

        // The notify callback runs on its own thread; blocking_send is fine
        // there and keeps the dispatch path on the tokio side.
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                        for path in event.paths {
                            let _ = event_tx.blocking_send(path);
                        }
                    }
                }
                Err(e) => {
                    warn!("response watcher error: {}", e);
                }
            },
            notify::Config::default().with_poll_interval(Duration::from_secs(2)),
        )
        .context("creating response file watcher")?;

        watcher
            .watch(&response_dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("watching {}", response_dir.display()))?;

        info!("Watching response files in '{}'", response_dir.display());

        let this = Arc::new(Self {
            response_dir,
            response_dir_name: response_dir_name.to_string(),
            pending: Arc::new(Mutex::new(HashMap::new())),
            watcher: Mutex::new(Some(watcher)),
        });

        this.clone().spawn_dispatcher(event_rx);
        Ok(this)
    }

    /// Mint a fresh correlation id.
    pub fn mint_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Workspace-relative path the agent is told to write its answer to.
    pub fn relative_response_path(&self, id: &str) -> String {
        format!("{}/response-{}.md", self.response_dir_name, id)
    }

    /// Register a pending waiter for `id`. Artifacts observed from this
    /// point on are captured even if the await starts later, so callers can
    /// register before triggering the work that produces the artifact.
    pub fn register(&self, id: &str) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(id.to_string(), tx);
        rx
    }

    /// Drop the pending entry for `id`, abandoning the wait.
    pub fn cancel(&self, id: &str) {
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .remove(id);
    }

    /// Suspend until a non-empty artifact for `id` appears or the deadline
    /// elapses. A late artifact after timeout finds no pending entry and is
    /// ignored.
    pub async fn wait_for_response(&self, id: &str, timeout_secs: u64) -> BridgeResult<String> {
        let rx = self.register(id);
        self.await_registered(id, rx, timeout_secs).await
    }

    /// Await a receiver obtained from `register`.
    pub async fn await_registered(
        &self,
        id: &str,
        rx: oneshot::Receiver<String>,
        timeout_secs: u64,
    ) -> BridgeResult<String> {
        match tokio::time::timeout(Duration::from_secs(timeout_secs), rx).await {
            Ok(Ok(text)) => Ok(text),
            // Sender dropped without resolving: the watcher was disposed.
            Ok(Err(_)) => Err(BridgeError::WatcherDisposed(id.to_string())),
            Err(_) => {
                self.pending
                    .lock()
                    .expect("pending lock poisoned")
                    .remove(id);
                Err(BridgeError::ResponseTimeout(
                    PathBuf::from(self.relative_response_path(id)),
                ))
            }
        }
    }

    /// Cancel the subscription and fail every outstanding wait immediately.
    pub fn dispose(&self) {
        // Dropping the senders resumes the waiters with a disposed error.
        let dropped = self
            .pending
            .lock()
            .expect("pending lock poisoned")
            .drain()
            .count();
        if dropped > 0 {
            info!("response watcher disposed with {} pending waits", dropped);
        }
        *self.watcher.lock().expect("watcher lock poisoned") = None;
    }

    fn spawn_dispatcher(self: Arc<Self>, mut event_rx: mpsc::Receiver<PathBuf>) {
        tokio::spawn(async move {
            while let Some(path) = event_rx.recv().await {
                self.handle_artifact(&path).await;
            }
            debug!("response watcher dispatcher finished");
        });
    }

    async fn handle_artifact(&self, path: &Path) {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return;
        };
        let Some(caps) = RESPONSE_FILE_RE.captures(name) else {
            return;
        };
        let id = caps[1].to_string();

        let has_waiter = self
            .pending
            .lock()
            .expect("pending lock poisoned")
            .contains_key(&id);
        if !has_waiter {
            return;
        }

        let text = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw.trim().to_string(),
            Err(e) => {
                warn!("failed reading response file '{}': {}", path.display(), e);
                return;
            }
        };
        // An empty artifact means "not written yet", not an answer.
        if text.is_empty() {
            return;
        }

        // First writer wins: removing the entry here makes any duplicate or
        // late artifact for the same id a no-op.
        let waiter = self
            .pending
            .lock()
            .expect("pending lock poisoned")
            .remove(&id);
        let Some(waiter) = waiter else {
            return;
        };
        let _ = waiter.send(text);

        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!("could not delete response file '{}': {}", path.display(), e);
        } else {
            info!("resolved and deleted response file for id: {}", id);
        }
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn watcher_in_tempdir() -> (TempDir, Arc<ResponseWatcher>) {
        let dir = TempDir::new().unwrap();
        let watcher = ResponseWatcher::start(dir.path(), ".code-bridge")
            .await
            .unwrap();
        (dir, watcher)
    }

    fn write_artifact(root: &Path, id: &str, content: &str) {
        std::fs::write(
            root.join(".code-bridge").join(format!("response-{}.md", id)),
            content,
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_artifact_resolves_waiter_with_trimmed_text() {
        let (dir, watcher) = watcher_in_tempdir().await;

        let id = watcher.mint_id();
        let wait = watcher.wait_for_response(&id, 5);
        let root = dir.path().to_path_buf();
        let write_id = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            write_artifact(&root, &write_id, "  the answer\n");
        });

        let text = wait.await.unwrap();
        assert_eq!(text, "the answer");
        assert_eq!(watcher.pending_len(), 0);

        // The resolved artifact is removed.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!dir
            .path()
            .join(".code-bridge")
            .join(format!("response-{}.md", id))
            .exists());
    }

    #[tokio::test]
    async fn test_artifact_arriving_before_await_is_still_delivered() {
        let (dir, watcher) = watcher_in_tempdir().await;

        // Register first, then let the artifact land before anyone awaits;
        // the answer must not be lost in between.
        let id = watcher.mint_id();
        let rx = watcher.register(&id);
        write_artifact(dir.path(), &id, "early answer");
        tokio::time::sleep(Duration::from_millis(500)).await;

        let text = watcher.await_registered(&id, rx, 5).await.unwrap();
        assert_eq!(text, "early answer");
    }

    #[tokio::test]
    async fn test_cancel_drops_pending_entry() {
        let (dir, watcher) = watcher_in_tempdir().await;

        let id = watcher.mint_id();
        let _rx = watcher.register(&id);
        assert_eq!(watcher.pending_len(), 1);
        watcher.cancel(&id);
        assert_eq!(watcher.pending_len(), 0);

        // A later artifact for the cancelled id has no observable effect.
        write_artifact(dir.path(), &id, "orphaned");
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(watcher.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_empty_artifact_is_ignored_until_timeout() {
        let (dir, watcher) = watcher_in_tempdir().await;

        let id = watcher.mint_id();
        write_artifact(dir.path(), &id, "");

        let err = watcher.wait_for_response(&id, 2).await.unwrap_err();
        assert!(matches!(err, BridgeError::ResponseTimeout(_)));
    }

    #[tokio::test]
    async fn test_late_artifact_after_timeout_is_ignored() {
        let (dir, watcher) = watcher_in_tempdir().await;

        let id = watcher.mint_id();
        let err = watcher.wait_for_response(&id, 1).await.unwrap_err();
        assert!(matches!(err, BridgeError::ResponseTimeout(_)));
        assert_eq!(watcher.pending_len(), 0);

        // Arrives too late: no pending entry, no observable effect.
        write_artifact(dir.path(), &id, "too late");
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(watcher.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_dispose_fails_pending_waits_immediately() {
        let (_dir, watcher) = watcher_in_tempdir().await;

        let id = watcher.mint_id();
        let wait = watcher.wait_for_response(&id, 60);
        let disposer = watcher.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            disposer.dispose();
        });

        let start = std::time::Instant::now();
        let err = wait.await.unwrap_err();
        assert!(matches!(err, BridgeError::WatcherDisposed(_)));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_relative_response_path_embeds_id() {
        // Path shape only; no watcher needed.
        assert!(RESPONSE_FILE_RE.is_match("response-abc123.md"));
        assert!(!RESPONSE_FILE_RE.is_match("notes.md"));
        let caps = RESPONSE_FILE_RE.captures("response-xyz.md").unwrap();
        assert_eq!(&caps[1], "xyz");
    }
}
