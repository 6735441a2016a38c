//! Agent-side collaborators: prompt injection and approval keystrokes.
//!
//! Injection delivers a prompt into whatever live agent surface exists; the
//! default implementation pipes it to a configured command's stdin.
//! `ForegroundKeys` simulates the accept/reject action for an approval
//! dialog surfaced by the editor. Both are best-effort and OS-dependent;
//! session and registry logic never depends on them succeeding.

use std::process::Stdio;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

#[async_trait]
pub trait AgentInjector: Send + Sync {
    async fn inject(&self, prompt: &str) -> Result<()>;
}

/// Injects by running a configured shell command with the prompt on stdin,
/// e.g. a small CLI that forwards text into the editor's agent pane.
pub struct CommandInjector {
    command: String,
}

impl CommandInjector {
    pub fn new(command: String) -> Self {
        Self { command }
    }
}

#[async_trait]
impl AgentInjector for CommandInjector {
    async fn inject(&self, prompt: &str) -> Result<()> {
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("spawning agent inject command")?;

        let mut stdin = child.stdin.take().context("inject command stdin missing")?;
        stdin
            .write_all(prompt.as_bytes())
            .await
            .context("writing prompt to inject command")?;
        stdin.flush().await.context("flushing inject command stdin")?;
        drop(stdin);

        let status = child.wait().await.context("waiting on inject command")?;
        if !status.success() {
            bail!("inject command exited with {}", status.code().unwrap_or(-1));
        }
        debug!("injected prompt into agent surface");
        Ok(())
    }
}

// ============================================================================
// Confirmation keystrokes
// ============================================================================

/// Simulates Enter/Escape in the foreground window to drive an
/// externally-surfaced approval dialog. Failures are logged, never fatal.
#[derive(Default)]
pub struct ForegroundKeys;

impl ForegroundKeys {
    pub async fn confirm(&self) {
        self.press("Return", "key code 36").await;
    }

    pub async fn deny(&self) {
        self.press("Escape", "key code 53").await;
    }

    async fn press(&self, x11_key: &str, mac_key_code: &str) {
        let result = if cfg!(target_os = "macos") {
            let script = format!("tell application \"System Events\" to {}", mac_key_code);
            run_tool("osascript", &["-e", &script]).await
        } else {
            run_tool("xdotool", &["key", x11_key]).await
        };

        if let Err(e) = result {
            warn!("keystroke simulation failed ({}): {}", x11_key, e);
        }
    }
}

async fn run_tool(bin: &str, args: &[&str]) -> Result<()> {
    let status = tokio::process::Command::new(bin)
        .args(args)
        .status()
        .await
        .with_context(|| format!("running {}", bin))?;
    if !status.success() {
        bail!("{} exited with {}", bin, status.code().unwrap_or(-1));
    }
    Ok(())
}
