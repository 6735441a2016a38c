//! Command router: the state machine over inbound chat text.
//!
//! One logical worker routes one message at a time, so session and
//! approval state transitions stay atomic. Precedence per message: empty
//! text, /auth, the authentication gate, approval tokens, /help, session
//! commands, /agent, unknown. Replies for session-scoped commands carry a
//! `[session: name]` prefix tag.
//!
//! `/agent` uses correlated wait by default: the prompt is injected with
//! delivery instructions for a freshly minted correlation id, and a
//! detached task awaits the response artifact so the worker stays free to
//! route the operator's yes/no approval in the meantime.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{error, info, warn};

use crate::agent::{AgentInjector, ForegroundKeys};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::security::{self, Verdict};
use crate::telegram::{ChatTransport, IncomingMessage};
use crate::terminal::{SessionRegistry, TerminalSession};

use super::ResponseWatcher;

/// Settle delay before a simulated approval keystroke, giving the editor
/// time to return to the foreground after the operator switched to chat.
const KEYSTROKE_SETTLE: Duration = Duration::from_millis(300);
/// How long after `/run` the automatic output snapshot is sent.
const RUN_FOLLOWUP_DELAY: Duration = Duration::from_secs(3);

pub struct BridgeRouter {
    transport: Arc<dyn ChatTransport>,
    watcher: Arc<ResponseWatcher>,
    registry: Mutex<SessionRegistry>,
    injector: Option<Arc<dyn AgentInjector>>,
    keys: ForegroundKeys,
    config: BridgeConfig,
    workspace_root: PathBuf,
    authenticated_chats: Mutex<HashSet<i64>>,
    pending_approval: AtomicBool,
}

impl BridgeRouter {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        watcher: Arc<ResponseWatcher>,
        registry: SessionRegistry,
        injector: Option<Arc<dyn AgentInjector>>,
        config: BridgeConfig,
        workspace_root: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            watcher,
            registry: Mutex::new(registry),
            injector,
            keys: ForegroundKeys,
            config,
            workspace_root,
            authenticated_chats: Mutex::new(HashSet::new()),
            pending_approval: AtomicBool::new(false),
        })
    }

    /// Route one inbound message. Never propagates an error: every failure
    /// becomes a chat reply so the next message is unaffected.
    pub async fn handle_message(self: &Arc<Self>, msg: IncomingMessage) {
        let chat_id = msg.chat_id;
        let text = msg.text.trim().to_string();
        let lower = text.to_lowercase();

        if text.is_empty() {
            self.reply(chat_id, "Empty message ignored.").await;
            return;
        }

        if lower == "/auth" || lower.starts_with("/auth ") {
            let secret = text.get(5..).unwrap_or("").trim().to_string();
            self.handle_auth(chat_id, &secret).await;
            return;
        }

        if self.config.auth_required() && !self.is_authenticated(chat_id) {
            self.reply(chat_id, "Not authenticated. Send /auth <secret> first.")
                .await;
            return;
        }

        match lower.as_str() {
            "yes" | "y" | "run" => {
                self.handle_approval(chat_id, true).await;
                return;
            }
            "no" | "n" | "deny" | "skip" => {
                self.handle_approval(chat_id, false).await;
                return;
            }
            "/help" => {
                self.reply(chat_id, &self.help_text()).await;
                return;
            }
            _ => {}
        }

        let (command, arg) = split_command(&text);
        match command {
            "/agent" => self.handle_agent(chat_id, arg).await,
            "/run" => self.handle_run(chat_id, arg).await,
            "/out" => self.with_active(chat_id, |s| s.output_snapshot()).await,
            "/status" => self.with_active(chat_id, |s| s.status_text()).await,
            "/pwd" => {
                self.with_active(chat_id, |s| format!("cwd: {}", s.cwd().display()))
                    .await
            }
            "/cd" => self.handle_cd(chat_id, arg).await,
            "/kill" => {
                self.with_active(chat_id, |s| {
                    if s.kill() {
                        "Sent SIGINT to running command.".to_string()
                    } else {
                        "No running command.".to_string()
                    }
                })
                .await
            }
            "/new" => self.handle_new(chat_id, arg).await,
            "/use" => self.handle_use(chat_id, arg).await,
            "/sessions" => self.handle_sessions(chat_id).await,
            _ => {
                self.reply(chat_id, "Unknown command. Use /help.").await;
            }
        }
    }

    // ========================================================================
    // Authentication and approval
    // ========================================================================

    async fn handle_auth(&self, chat_id: i64, secret: &str) {
        if !self.config.auth_required() {
            self.reply(
                chat_id,
                "Auth is not configured. All allowed chats have access.",
            )
            .await;
            return;
        }
        if secret.is_empty() {
            self.reply(chat_id, "Usage: /auth <secret>").await;
            return;
        }
        if secret == self.config.auth_secret {
            self.authenticated_chats
                .lock()
                .expect("auth lock poisoned")
                .insert(chat_id);
            info!("chat {} authenticated successfully", chat_id);
            self.reply(chat_id, "Authenticated successfully.").await;
        } else {
            warn!("failed auth attempt from chat {}", chat_id);
            self.reply(chat_id, "Invalid secret.").await;
        }
    }

    fn is_authenticated(&self, chat_id: i64) -> bool {
        self.authenticated_chats
            .lock()
            .expect("auth lock poisoned")
            .contains(&chat_id)
    }

    async fn handle_approval(&self, chat_id: i64, approve: bool) {
        // swap() both tests and clears the flag in one step.
        if !self.pending_approval.swap(false, Ordering::SeqCst) {
            let reply = if approve {
                "No pending approval to confirm."
            } else {
                "No pending approval to deny."
            };
            self.reply(chat_id, reply).await;
            return;
        }

        tokio::time::sleep(KEYSTROKE_SETTLE).await;
        if approve {
            info!("chat approval: pressing Run (Enter)");
            self.keys.confirm().await;
            self.reply(chat_id, "Approved. Pressed Run.").await;
        } else {
            info!("chat denial: pressing Skip (Escape)");
            self.keys.deny().await;
            self.reply(chat_id, "Denied. Pressed Skip.").await;
        }
    }

    // ========================================================================
    // Terminal commands
    // ========================================================================

    /// Resolve the active session without holding the registry lock past
    /// this call.
    fn active_session(&self) -> BridgeResult<(String, Arc<TerminalSession>)> {
        let registry = self.lock_registry();
        let session = registry.active()?;
        Ok((registry.active_name().to_string(), session))
    }

    /// Run a read-style operation against the active session and send the
    /// result tagged with the session name.
    async fn with_active(&self, chat_id: i64, op: impl FnOnce(&TerminalSession) -> String) {
        match self.active_session() {
            Ok((name, session)) => self.reply_tagged(chat_id, &name, &op(&session)).await,
            Err(e) => self.reply_internal(chat_id, e).await,
        }
    }

    async fn handle_run(self: &Arc<Self>, chat_id: i64, arg: &str) {
        let command = arg.trim();
        if command.is_empty() {
            self.reply(chat_id, "Usage: /run <command>").await;
            return;
        }

        if let Verdict::Denied(reason) = security::classify(command) {
            warn!("blocked command from chat {}: {}", chat_id, command);
            self.reply(chat_id, &reason).await;
            return;
        }

        let (name, session) = match self.active_session() {
            Ok(v) => v,
            Err(e) => return self.reply_internal(chat_id, e).await,
        };

        let timeout = self.config.command_timeout_sec;
        match session.start(command, timeout) {
            Ok(()) => {
                info!("running terminal command [{}]: {}", name, command);
                self.reply_tagged(
                    chat_id,
                    &name,
                    &format!(
                        "Started in {}:\n$ {}\n\nTimeout: {}s. Use /out to fetch output.",
                        session.cwd().display(),
                        command,
                        timeout
                    ),
                )
                .await;
                self.spawn_run_followup(chat_id, name, session);
            }
            Err(BridgeError::CommandBusy) => {
                self.reply_tagged(
                    chat_id,
                    &name,
                    "A command is already running. Use /status, /out, or /kill first.",
                )
                .await;
            }
            Err(e) => {
                self.reply_tagged(chat_id, &name, &e.to_string()).await;
            }
        }
    }

    /// A short while after /run, push a snapshot so quick commands report
    /// their output without the operator having to ask.
    fn spawn_run_followup(&self, chat_id: i64, name: String, session: Arc<TerminalSession>) {
        let transport = self.transport.clone();
        tokio::spawn(async move {
            tokio::time::sleep(RUN_FOLLOWUP_DELAY).await;
            let reply = format!("[session: {}]\n{}", name, session.output_snapshot());
            if let Err(e) = transport.send_message(chat_id, &reply).await {
                warn!("failed sending delayed run output: {}", e);
            }
        });
    }

    async fn handle_cd(&self, chat_id: i64, arg: &str) {
        let raw = arg.trim();
        if raw.is_empty() {
            self.reply(chat_id, "Usage: /cd <path>").await;
            return;
        }

        let (name, session) = match self.active_session() {
            Ok(v) => v,
            Err(e) => return self.reply_internal(chat_id, e).await,
        };

        let requested = Path::new(raw);
        let resolved = if requested.is_absolute() {
            normalize_path(requested)
        } else {
            normalize_path(&session.cwd().join(requested))
        };

        if self.config.confine_to_workspace && !resolved.starts_with(&self.workspace_root) {
            self.reply_tagged(
                chat_id,
                &name,
                &format!(
                    "Denied: path is outside workspace root ({})",
                    self.workspace_root.display()
                ),
            )
            .await;
            return;
        }

        let reply = if session.set_cwd(&resolved) {
            format!("cwd changed to {}", session.cwd().display())
        } else {
            format!("Cannot access directory: {}", resolved.display())
        };
        self.reply_tagged(chat_id, &name, &reply).await;
    }

    async fn handle_new(&self, chat_id: i64, arg: &str) {
        let name = arg.trim();
        if name.is_empty() {
            self.reply(chat_id, "Usage: /new <name>").await;
            return;
        }

        let result = {
            let mut registry = self.lock_registry();
            registry.create(name).and_then(|_| registry.switch_to(name))
        };

        match result {
            Ok(session) => {
                self.reply(
                    chat_id,
                    &format!(
                        "Created and switched to session: {}\ncwd: {}",
                        name,
                        session.cwd().display()
                    ),
                )
                .await;
            }
            Err(e) => self.reply(chat_id, &e.to_string()).await,
        }
    }

    async fn handle_use(&self, chat_id: i64, arg: &str) {
        let name = arg.trim();
        if name.is_empty() {
            self.reply(chat_id, "Usage: /use <name>").await;
            return;
        }

        let result = {
            let mut registry = self.lock_registry();
            registry.switch_to(name)
        };

        match result {
            Ok(session) => {
                self.reply(
                    chat_id,
                    &format!("Switched to session: {}\n{}", name, session.status_text()),
                )
                .await;
            }
            Err(e) => self.reply(chat_id, &e.to_string()).await,
        }
    }

    async fn handle_sessions(&self, chat_id: i64) {
        let listing = {
            let registry = self.lock_registry();
            let lines: Vec<String> = registry
                .list()
                .into_iter()
                .map(|(name, running, active)| {
                    let marker = if active { "*" } else { " " };
                    let status = if running { "running" } else { "idle" };
                    format!("{} {} ({})", marker, name, status)
                })
                .collect();
            format!(
                "Sessions ({}/{}):\n{}",
                registry.len(),
                registry.max_sessions(),
                lines.join("\n")
            )
        };
        self.reply(chat_id, &listing).await;
    }

    // ========================================================================
    // Agent bridge
    // ========================================================================

    async fn handle_agent(self: &Arc<Self>, chat_id: i64, arg: &str) {
        let prompt = arg.trim();
        if prompt.is_empty() {
            self.reply(chat_id, "Usage: /agent <message>").await;
            return;
        }

        let Some(injector) = self.injector.clone() else {
            self.reply(chat_id, "Agent bridge is not available in this session.")
                .await;
            return;
        };

        if !self.config.agent_wait_for_response {
            self.reply(chat_id, "Received. Sending to agent chat now...")
                .await;
            self.pending_approval.store(true, Ordering::SeqCst);
            if let Err(e) = injector.inject(prompt).await {
                self.pending_approval.store(false, Ordering::SeqCst);
                self.reply(chat_id, &format!("Failed to inject: {}", e)).await;
            }
            return;
        }

        // Correlated wait: tell the agent where to write its final answer.
        // The waiter is registered before injection so an answer written
        // while inject() is still in flight is not lost.
        let id = self.watcher.mint_id();
        let rx = self.watcher.register(&id);
        let response_path = self.watcher.relative_response_path(&id);
        let full_prompt = format!(
            "{}\n\nWhen you are completely done, write your final answer to the file '{}' in this workspace.",
            prompt, response_path
        );

        self.reply(
            chat_id,
            &format!(
                "Received. Sending to agent chat now... I will report back within {}s.",
                self.config.response_timeout_sec
            ),
        )
        .await;
        self.pending_approval.store(true, Ordering::SeqCst);

        if let Err(e) = injector.inject(&full_prompt).await {
            self.pending_approval.store(false, Ordering::SeqCst);
            self.watcher.cancel(&id);
            self.reply(chat_id, &format!("Failed to inject: {}", e)).await;
            return;
        }

        // Await the artifact on a detached task so the worker stays free to
        // route the operator's approval tokens while the agent works.
        let this = self.clone();
        let timeout = self.config.response_timeout_sec;
        tokio::spawn(async move {
            match this.watcher.await_registered(&id, rx, timeout).await {
                Ok(answer) => {
                    this.reply(chat_id, &format!("Agent response:\n\n{}", answer))
                        .await;
                }
                Err(e @ BridgeError::ResponseTimeout(_)) => {
                    this.reply(chat_id, &e.to_string()).await;
                }
                Err(e) => {
                    this.reply(chat_id, &format!("Agent response unavailable: {}", e))
                        .await;
                }
            }
        });
    }

    // ========================================================================
    // Replies
    // ========================================================================

    fn help_text(&self) -> String {
        let auth_line = if self.config.auth_required() {
            "/auth <secret> - authenticate session\n"
        } else {
            ""
        };
        format!(
            "Commands:\n{}\nTerminal:\n/run <command> - run command\n/out - latest output\n/status - session status\n/pwd - working directory\n/cd <path> - change directory\n/kill - stop running command\n/new <name> - new terminal session\n/use <name> - switch session\n/sessions - list sessions\n\nAgent:\n/agent <message> - send to the coding agent\nyes/no - approve/skip pending confirmation",
            auth_line
        )
    }

    async fn reply(&self, chat_id: i64, text: &str) {
        if let Err(e) = self.transport.send_message(chat_id, text).await {
            warn!("failed sending reply to chat {}: {}", chat_id, e);
        }
    }

    async fn reply_tagged(&self, chat_id: i64, session_name: &str, text: &str) {
        self.reply(chat_id, &format!("[session: {}]\n{}", session_name, text))
            .await;
    }

    async fn reply_internal(&self, chat_id: i64, err: BridgeError) {
        error!("router invariant violation: {}", err);
        self.reply(chat_id, &format!("Internal error: {}", err)).await;
    }

    fn lock_registry(&self) -> std::sync::MutexGuard<'_, SessionRegistry> {
        self.registry.lock().expect("registry lock poisoned")
    }
}

/// First whitespace-separated token and the rest.
fn split_command(text: &str) -> (&str, &str) {
    match text.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest),
        None => (text, ""),
    }
}

/// Lexically resolve `.` and `..` without touching the filesystem, so the
/// workspace-confinement check cannot be bypassed with `..` segments.
fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_command() {
        assert_eq!(split_command("/run echo hi"), ("/run", "echo hi"));
        assert_eq!(split_command("/status"), ("/status", ""));
        assert_eq!(split_command("/cd  ../src"), ("/cd", " ../src"));
    }

    #[test]
    fn test_normalize_path_resolves_dotdot() {
        assert_eq!(
            normalize_path(Path::new("/ws/sub/../other")),
            PathBuf::from("/ws/other")
        );
        assert_eq!(
            normalize_path(Path::new("/ws/./a/b/../..")),
            PathBuf::from("/ws")
        );
        // Escaping above the workspace is visible after normalization.
        assert_eq!(
            normalize_path(Path::new("/ws/../etc")),
            PathBuf::from("/etc")
        );
    }
}
