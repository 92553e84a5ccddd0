//! Headless-render bridge.
//!
//! Spawns the configured render helper (e.g., a Playwright script) and talks to
//! it over a JSON-lines stdin/stdout protocol. Requests carry an id, so many
//! pipelines can have renders in flight on one browser process; a reader task
//! routes each response back to its waiting caller.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use bookmarks_shared::{BookmarkError, RenderConfig, Result};

use crate::http::PageResponse;

/// How long the helper gets to report readiness.
const READY_TIMEOUT: Duration = Duration::from_secs(30);

/// How long the helper gets to exit after a shutdown message.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Protocol types
// ---------------------------------------------------------------------------

/// Request message sent to the bridge.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum RequestMessage<'a> {
    #[serde(rename = "render")]
    Render { id: &'a str, url: &'a str },
    #[serde(rename = "shutdown")]
    Shutdown,
}

/// Response message received from the bridge.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ResponseMessage {
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "result")]
    Result {
        id: String,
        final_url: String,
        /// Missing when the page produced no navigation response.
        #[serde(default)]
        status: Option<u16>,
        #[serde(default)]
        content: String,
    },
    #[serde(rename = "error")]
    Error {
        id: String,
        error: String,
        #[serde(default = "default_transient")]
        transient: bool,
    },
}

fn default_transient() -> bool {
    true
}

type Pending = Arc<StdMutex<HashMap<String, oneshot::Sender<Result<PageResponse>>>>>;

fn render_error(message: impl Into<String>, transient: bool) -> BookmarkError {
    BookmarkError::Render {
        message: message.into(),
        transient,
    }
}

// ---------------------------------------------------------------------------
// RenderBridge
// ---------------------------------------------------------------------------

/// Handle to the spawned render helper.
pub struct RenderBridge {
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    pending: Pending,
    request_counter: AtomicU64,
    reader: JoinHandle<()>,
}

impl RenderBridge {
    /// Spawn the bridge and wait for its ready message.
    pub async fn spawn(config: &RenderConfig) -> Result<Self> {
        let cmd = config
            .command
            .as_deref()
            .ok_or_else(|| BookmarkError::config("render.command is not set"))?;

        info!(%cmd, args = ?config.args, "spawning render bridge");

        let mut command = Command::new(cmd);
        command
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()) // Bridge logs go to parent stderr
            .kill_on_drop(true);
        if let Some(dir) = &config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            BookmarkError::config(format!("failed to spawn render bridge: {e}. Is `{cmd}` installed?"))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| render_error("failed to capture bridge stdin", false))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| render_error("failed to capture bridge stdout", false))?;

        let mut lines = BufReader::new(stdout).lines();
        wait_for_ready(&mut lines).await?;

        let pending: Pending = Arc::default();
        let reader = tokio::spawn(read_responses(lines, Arc::clone(&pending)));

        Ok(Self {
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            pending,
            request_counter: AtomicU64::new(0),
            reader,
        })
    }

    /// Render `url` in the headless browser.
    ///
    /// A 4xx/5xx navigation status is a failed render. A render without a
    /// navigation status but with content counts as 200.
    #[instrument(skip(self))]
    pub async fn render(&self, url: &str) -> Result<PageResponse> {
        let n = self.request_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("req-{n}");

        let (tx, rx) = oneshot::channel();
        self.lock_pending().insert(id.clone(), tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id: &id,
        };

        let mut json = serde_json::to_string(&RequestMessage::Render { id: &id, url })
            .map_err(|e| render_error(format!("failed to serialize request: {e}"), false))?;
        json.push('\n');

        {
            let mut stdin = self.stdin.lock().await;
            stdin
                .write_all(json.as_bytes())
                .await
                .map_err(|e| render_error(format!("failed to write to bridge stdin: {e}"), true))?;
            stdin
                .flush()
                .await
                .map_err(|e| render_error(format!("failed to flush bridge stdin: {e}"), true))?;
        }

        let page = rx
            .await
            .map_err(|_| render_error("bridge closed before responding", true))??;

        if page.status >= 400 {
            return Err(BookmarkError::HttpStatus {
                url: url.to_string(),
                status: page.status,
            });
        }
        debug!(final_url = %page.final_url, status = page.status, "render ok");
        Ok(page)
    }

    /// Send shutdown and wait for the bridge to exit (killing it on timeout).
    pub async fn shutdown(&self) -> Result<()> {
        if let Ok(json) = serde_json::to_string(&RequestMessage::Shutdown) {
            let mut stdin = self.stdin.lock().await;
            let _ = stdin.write_all(format!("{json}\n").as_bytes()).await;
            let _ = stdin.flush().await;
        }

        let mut child = self.child.lock().await;
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => info!(?status, "render bridge exited"),
            Ok(Err(e)) => warn!("render bridge wait error: {e}"),
            Err(_) => {
                warn!("render bridge did not exit, killing it");
                let _ = child.kill().await;
            }
        }
        self.reader.abort();
        Ok(())
    }

    fn lock_pending(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<Result<PageResponse>>>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for RenderBridge {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Removes a request's slot when its caller goes away (e.g., on timeout).
struct PendingGuard<'a> {
    pending: &'a Pending,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(self.id);
    }
}

/// Wait for the bridge to send its "ready" message.
async fn wait_for_ready(lines: &mut tokio::io::Lines<BufReader<ChildStdout>>) -> Result<()> {
    let line = tokio::time::timeout(READY_TIMEOUT, lines.next_line())
        .await
        .map_err(|_| render_error("bridge did not become ready in time", false))?
        .map_err(|e| render_error(format!("bridge read error: {e}"), false))?
        .ok_or_else(|| render_error("bridge exited before becoming ready", false))?;

    match serde_json::from_str::<ResponseMessage>(line.trim()) {
        Ok(ResponseMessage::Ready) => {
            info!("render bridge is ready");
            Ok(())
        }
        _ => Err(render_error(
            format!("expected ready message, got: {line}"),
            false,
        )),
    }
}

/// Route bridge responses to their callers until stdout closes.
async fn read_responses(mut lines: tokio::io::Lines<BufReader<ChildStdout>>, pending: Pending) {
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("render bridge read error: {e}");
                break;
            }
        };

        let msg: ResponseMessage = match serde_json::from_str(line.trim()) {
            Ok(msg) => msg,
            Err(e) => {
                let preview: String = line.chars().take(200).collect();
                warn!("invalid bridge response: {e} (got: {preview})");
                continue;
            }
        };

        let (id, outcome) = match msg {
            ResponseMessage::Result {
                id,
                final_url,
                status,
                content,
            } => {
                let outcome = match status {
                    Some(status) => Ok(PageResponse {
                        final_url,
                        status,
                        content,
                    }),
                    None if !content.is_empty() => Ok(PageResponse {
                        final_url,
                        status: 200,
                        content,
                    }),
                    None => Err(render_error("render produced no response and no content", true)),
                };
                (id, outcome)
            }
            ResponseMessage::Error {
                id,
                error,
                transient,
            } => (id, Err(render_error(error, transient))),
            ResponseMessage::Ready => continue,
        };

        let sender = pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&id);
        match sender {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => debug!(%id, "dropping response for abandoned render"),
        }
    }

    // Fail everything still waiting; dropping the senders wakes the callers.
    let abandoned = std::mem::take(
        &mut *pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()),
    );
    if !abandoned.is_empty() {
        warn!(count = abandoned.len(), "render bridge closed with requests in flight");
    }
}
