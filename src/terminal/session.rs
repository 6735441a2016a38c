//! One terminal session: a working directory, an output ring buffer, and
//! at most one live child process.
//!
//! The child is spawned through `sh -c` with a scrubbed environment; stdout
//! and stderr stream into the capped buffer as they arrive. Natural exit,
//! spawn failure, and timeout kill all funnel through one final state
//! transition owned by the monitor task, so the running flag, exit code,
//! and trailer line always change together.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{BridgeError, BridgeResult};

/// Output buffer cap; oldest data is discarded past this point.
const MAX_BUFFER_CHARS: usize = 120_000;
/// `/out` returns at most this many trailing lines...
pub const SNAPSHOT_LINES: usize = 60;
/// ...further capped to this many chars.
const SNAPSHOT_CHARS: usize = 3500;

/// Environment variables forwarded to child commands. Everything else,
/// including ambient API keys, is stripped.
const SAFE_ENV_EXACT: &[&str] = &[
    "PATH", "HOME", "USER", "LOGNAME", "SHELL", "LANG", "TERM", "COLORTERM", "TZ", "TMPDIR",
    "EDITOR", "GOPATH", "GOROOT", "JAVA_HOME", "VIRTUAL_ENV",
];
const SAFE_ENV_PREFIXES: &[&str] = &[
    "LC_", "XDG_", "CARGO_", "RUSTUP_", "NVM_", "NPM_", "NODE_", "PYENV_", "PYTHON",
];

fn is_safe_env(name: &str) -> bool {
    SAFE_ENV_EXACT.contains(&name) || SAFE_ENV_PREFIXES.iter().any(|p| name.starts_with(p))
}

#[derive(Debug, Default)]
struct RunState {
    output: String,
    last_command: String,
    last_exit: Option<i32>,
    running: bool,
    started_at: Option<Instant>,
    child_pid: Option<u32>,
}

impl RunState {
    /// Append to the buffer, keeping only the most recent `MAX_BUFFER_CHARS`.
    fn append(&mut self, text: &str) {
        self.output.push_str(text);
        if self.output.len() > MAX_BUFFER_CHARS {
            let mut cut = self.output.len() - MAX_BUFFER_CHARS;
            while !self.output.is_char_boundary(cut) {
                cut += 1;
            }
            self.output.drain(..cut);
        }
    }
}

#[derive(Debug)]
pub struct TerminalSession {
    cwd: Mutex<PathBuf>,
    state: Arc<Mutex<RunState>>,
}

impl TerminalSession {
    pub fn new(initial_cwd: PathBuf) -> Self {
        Self {
            cwd: Mutex::new(initial_cwd),
            state: Arc::new(Mutex::new(RunState::default())),
        }
    }

    pub fn cwd(&self) -> PathBuf {
        self.cwd.lock().expect("cwd lock poisoned").clone()
    }

    /// Change the working directory. Succeeds only if the target exists and
    /// is a directory; otherwise leaves state unchanged.
    pub fn set_cwd(&self, next: &Path) -> bool {
        match std::fs::metadata(next) {
            Ok(meta) if meta.is_dir() => {
                *self.cwd.lock().expect("cwd lock poisoned") = next.to_path_buf();
                true
            }
            _ => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().expect("state lock poisoned").running
    }

    /// Spawn `command` through the shell with output capture and an optional
    /// timeout. Fails with `CommandBusy` if a command is already running.
    pub fn start(&self, command: &str, timeout_secs: u64) -> BridgeResult<()> {
        let cwd = self.cwd();
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&cwd)
            .env_clear()
            .envs(std::env::vars().filter(|(k, _)| is_safe_env(k)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut state = self.state.lock().expect("state lock poisoned");
        if state.running {
            return Err(BridgeError::CommandBusy);
        }

        state.output.clear();
        state.last_exit = None;
        state.last_command = command.to_string();
        state.started_at = Some(Instant::now());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                state.append(&format!("\n[failed to run command: {}]\n", e));
                state.last_exit = Some(1);
                return Err(BridgeError::ShellSpawn(e.to_string()));
            }
        };

        state.running = true;
        state.child_pid = child.id();
        drop(state);

        debug!(command, cwd = %cwd.display(), "spawned shell command");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_task = spawn_reader(self.state.clone(), stdout);
        let err_task = spawn_reader(self.state.clone(), stderr);

        let state = self.state.clone();
        tokio::spawn(async move {
            let (exit, timed_out) = if timeout_secs > 0 {
                let deadline = Duration::from_secs(timeout_secs);
                match tokio::time::timeout(deadline, child.wait()).await {
                    Ok(status) => (status, false),
                    Err(_) => {
                        warn!(timeout_secs, "command timed out, killing");
                        let _ = child.start_kill();
                        (child.wait().await, true)
                    }
                }
            } else {
                (child.wait().await, false)
            };

            // Let the readers drain whatever the process wrote before it died.
            let _ = out_task.await;
            let _ = err_task.await;

            let mut st = state.lock().expect("state lock poisoned");
            st.running = false;
            st.child_pid = None;
            if timed_out {
                st.append(&format!(
                    "\n[command timed out after {}s, killed]\n",
                    timeout_secs
                ));
            }
            match exit {
                Ok(status) => {
                    let code = status.code().unwrap_or(-1);
                    st.last_exit = Some(code);
                    st.append(&format!("\n[process exited with code {}]\n", code));
                }
                Err(e) => {
                    st.last_exit = Some(1);
                    st.append(&format!("\n[failed to run command: {}]\n", e));
                }
            }
        });

        Ok(())
    }

    /// Send SIGINT to the running command. Returns whether anything was
    /// actually running. The monitor task observes the resulting exit.
    pub fn kill(&self) -> bool {
        let state = self.state.lock().expect("state lock poisoned");
        match state.child_pid {
            Some(pid) => {
                unsafe {
                    libc::kill(pid as i32, libc::SIGINT);
                }
                true
            }
            None => false,
        }
    }

    pub fn status_text(&self) -> String {
        let state = self.state.lock().expect("state lock poisoned");
        let cwd = self.cwd();
        if state.running {
            let secs = state
                .started_at
                .map(|t| t.elapsed().as_secs().max(1))
                .unwrap_or(1);
            format!(
                "Status: running ({}s)\ncwd: {}\ncommand: {}",
                secs,
                cwd.display(),
                state.last_command
            )
        } else {
            let exit_info = state
                .last_exit
                .map(|c| c.to_string())
                .unwrap_or_else(|| "none".to_string());
            let last_command = if state.last_command.is_empty() {
                "(none)"
            } else {
                &state.last_command
            };
            format!(
                "Status: idle\ncwd: {}\nlast command: {}\nlast exit: {}",
                cwd.display(),
                last_command,
                exit_info
            )
        }
    }

    /// The most recent output: last `SNAPSHOT_LINES` lines, capped to
    /// `SNAPSHOT_CHARS` chars, tagged with whether the process still runs.
    pub fn output_snapshot(&self) -> String {
        let state = self.state.lock().expect("state lock poisoned");
        if state.output.is_empty() {
            return if state.running {
                drop(state);
                format!("No output yet.\n\n{}", self.status_text())
            } else {
                "No output captured yet. Run a command with /run first.".to_string()
            };
        }

        let tail = tail_lines(&state.output, SNAPSHOT_LINES);
        let tail = if tail.len() > SNAPSHOT_CHARS {
            let mut cut = tail.len() - SNAPSHOT_CHARS;
            while !tail.is_char_boundary(cut) {
                cut += 1;
            }
            &tail[cut..]
        } else {
            tail
        };

        let phase = if state.running { "running" } else { "finished" };
        format!(
            "Output snapshot ({}): {}\n\n{}",
            phase, state.last_command, tail
        )
    }
}

/// Last `n` lines of `text`; all of it when fewer exist.
fn tail_lines(text: &str, n: usize) -> &str {
    let trimmed = text.strip_suffix('\n').unwrap_or(text);
    let mut newlines = 0;
    for (i, b) in trimmed.bytes().enumerate().rev() {
        if b == b'\n' {
            newlines += 1;
            if newlines == n {
                return &text[i + 1..];
            }
        }
    }
    text
}

fn spawn_reader(
    state: Arc<Mutex<RunState>>,
    pipe: Option<impl tokio::io::AsyncRead + Unpin + Send + 'static>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let Some(mut pipe) = pipe else {
            return;
        };
        let mut buf = [0u8; 4096];
        loop {
            match pipe.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                    state.lock().expect("state lock poisoned").append(&chunk);
                }
                Err(_) => break,
            }
        }
    })
}
