//! End-to-end routing tests against a real workspace directory, with the
//! chat transport mocked out.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;

use code_bridge::agent::{AgentInjector, CommandInjector};
use code_bridge::bridge::{BridgeRouter, ResponseWatcher};
use code_bridge::config::BridgeConfig;
use code_bridge::telegram::{ChatTransport, IncomingMessage};
use code_bridge::terminal::SessionRegistry;

const CHAT: i64 = 1001;

#[derive(Default)]
struct MockTransport {
    sent: Mutex<Vec<(i64, String)>>,
}

impl MockTransport {
    fn texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, text)| text.clone())
            .collect()
    }

    fn last(&self) -> String {
        self.sent
            .lock()
            .unwrap()
            .last()
            .map(|(_, text)| text.clone())
            .unwrap_or_default()
    }

    fn contains(&self, needle: &str) -> bool {
        self.texts().iter().any(|t| t.contains(needle))
    }
}

#[async_trait]
impl ChatTransport for MockTransport {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<()> {
        self.sent.lock().unwrap().push((chat_id, text.to_string()));
        Ok(())
    }
}

async fn build_router(
    workspace: &Path,
    config: BridgeConfig,
    injector: Option<Arc<dyn AgentInjector>>,
) -> (Arc<MockTransport>, Arc<BridgeRouter>, Arc<ResponseWatcher>) {
    let transport = Arc::new(MockTransport::default());
    let watcher = ResponseWatcher::start(workspace, &config.response_dir_name)
        .await
        .unwrap();
    let registry = SessionRegistry::new(workspace.to_path_buf(), config.max_sessions);
    let router = BridgeRouter::new(
        transport.clone(),
        watcher.clone(),
        registry,
        injector,
        config,
        workspace.to_path_buf(),
    );
    (transport, router, watcher)
}

async fn send(router: &Arc<BridgeRouter>, text: &str) {
    router
        .handle_message(IncomingMessage {
            chat_id: CHAT,
            text: text.to_string(),
        })
        .await;
}

#[tokio::test]
async fn test_auth_gate_blocks_until_secret_accepted() {
    let dir = TempDir::new().unwrap();
    let config = BridgeConfig {
        auth_secret: "hunter2".to_string(),
        ..BridgeConfig::default()
    };
    let (transport, router, _watcher) = build_router(dir.path(), config, None).await;

    send(&router, "/status").await;
    assert!(transport.last().contains("Not authenticated"));

    send(&router, "/auth wrong").await;
    assert_eq!(transport.last(), "Invalid secret.");

    send(&router, "/auth hunter2").await;
    assert_eq!(transport.last(), "Authenticated successfully.");

    send(&router, "/status").await;
    let reply = transport.last();
    assert!(reply.starts_with("[session: default]"));
    assert!(reply.contains("Status: idle"));
}

#[tokio::test]
async fn test_run_then_out_returns_captured_output() {
    let dir = TempDir::new().unwrap();
    let (transport, router, _watcher) =
        build_router(dir.path(), BridgeConfig::default(), None).await;

    send(&router, "/run echo bridge-works").await;
    let ack = transport.last();
    assert!(ack.contains("Started in"));
    assert!(ack.contains("$ echo bridge-works"));

    // Give the child a moment to finish.
    tokio::time::sleep(Duration::from_millis(800)).await;

    send(&router, "/out").await;
    let out = transport.last();
    assert!(out.contains("bridge-works"));
    assert!(out.contains("[process exited with code 0]"));
}

#[tokio::test]
async fn test_destructive_command_is_blocked() {
    let dir = TempDir::new().unwrap();
    let (transport, router, _watcher) =
        build_router(dir.path(), BridgeConfig::default(), None).await;

    send(&router, "/run rm -rf /").await;
    assert!(transport.last().starts_with("Blocked:"));

    // Nothing was started.
    send(&router, "/status").await;
    assert!(transport.last().contains("last command: (none)"));
}

#[tokio::test]
async fn test_session_lifecycle_create_switch_list() {
    let dir = TempDir::new().unwrap();
    let (transport, router, _watcher) =
        build_router(dir.path(), BridgeConfig::default(), None).await;

    send(&router, "/new build").await;
    assert!(transport.last().contains("Created and switched to session: build"));

    send(&router, "/sessions").await;
    let listing = transport.last();
    assert!(listing.contains("Sessions (2/5)"));
    assert!(listing.contains("* build (idle)"));
    assert!(listing.contains("  default (idle)"));

    send(&router, "/use default").await;
    assert!(transport.last().contains("Switched to session: default"));

    send(&router, "/use ghost").await;
    assert!(transport.last().contains("Session not found: ghost"));

    send(&router, "/new bad name").await;
    assert!(transport.last().contains("Invalid name"));
}

#[tokio::test]
async fn test_cd_confined_to_workspace() {
    let dir = TempDir::new().unwrap();
    let sub = dir.path().join("sub");
    std::fs::create_dir(&sub).unwrap();
    let (transport, router, _watcher) =
        build_router(dir.path(), BridgeConfig::default(), None).await;

    send(&router, "/cd sub").await;
    assert!(transport.last().contains("cwd changed to"));
    assert!(transport.last().contains("sub"));

    send(&router, "/cd /etc").await;
    assert!(transport.last().contains("Denied: path is outside workspace root"));

    // Dotdot traversal out of the workspace is caught too.
    send(&router, "/cd ../../..").await;
    assert!(transport.last().contains("Denied: path is outside workspace root"));
}

#[tokio::test]
async fn test_approval_without_pending_is_reported() {
    let dir = TempDir::new().unwrap();
    let (transport, router, _watcher) =
        build_router(dir.path(), BridgeConfig::default(), None).await;

    send(&router, "yes").await;
    assert_eq!(transport.last(), "No pending approval to confirm.");

    send(&router, "no").await;
    assert_eq!(transport.last(), "No pending approval to deny.");
}

#[tokio::test]
async fn test_agent_sets_pending_approval_and_yes_clears_it() {
    let dir = TempDir::new().unwrap();
    let injector: Arc<dyn AgentInjector> =
        Arc::new(CommandInjector::new("cat > /dev/null".to_string()));
    let (transport, router, _watcher) =
        build_router(dir.path(), BridgeConfig::default(), Some(injector)).await;

    send(&router, "/agent hello").await;
    assert!(transport.last().contains("Sending to agent chat"));

    // Injection armed the approval flag; yes consumes it.
    send(&router, "yes").await;
    assert_eq!(transport.last(), "Approved. Pressed Run.");

    // The flag is one-shot.
    send(&router, "yes").await;
    assert_eq!(transport.last(), "No pending approval to confirm.");
}

#[tokio::test]
async fn test_failed_injection_rolls_back_pending_approval() {
    let dir = TempDir::new().unwrap();
    let injector: Arc<dyn AgentInjector> =
        Arc::new(CommandInjector::new("cat > /dev/null; exit 3".to_string()));
    let (transport, router, _watcher) =
        build_router(dir.path(), BridgeConfig::default(), Some(injector)).await;

    send(&router, "/agent hello").await;
    assert!(transport.last().contains("Failed to inject"));

    // The rollback left no approval outstanding.
    send(&router, "yes").await;
    assert_eq!(transport.last(), "No pending approval to confirm.");
}

#[tokio::test]
async fn test_agent_unavailable_without_injector() {
    let dir = TempDir::new().unwrap();
    let (transport, router, _watcher) =
        build_router(dir.path(), BridgeConfig::default(), None).await;

    send(&router, "/agent please fix the tests").await;
    assert!(transport.last().contains("Agent bridge is not available"));
}

#[tokio::test]
async fn test_agent_round_trip_through_response_file() {
    let dir = TempDir::new().unwrap();
    let prompt_file = dir.path().join("prompt.txt");
    let injector: Arc<dyn AgentInjector> = Arc::new(CommandInjector::new(format!(
        "cat > {}",
        prompt_file.display()
    )));
    let (transport, router, _watcher) =
        build_router(dir.path(), BridgeConfig::default(), Some(injector)).await;

    send(&router, "/agent summarize the diff").await;
    assert!(transport.last().contains("Sending to agent chat"));

    // The injected prompt names the response file the agent must write.
    let prompt = std::fs::read_to_string(&prompt_file).unwrap();
    assert!(prompt.starts_with("summarize the diff"));
    let rel_path = prompt
        .split('\'')
        .nth(1)
        .expect("prompt names a response file");
    assert!(rel_path.starts_with(".code-bridge/response-"));

    // Play the agent: write the answer where instructed.
    std::fs::write(dir.path().join(rel_path), "All done.\n").unwrap();

    // The correlated reply arrives from a background task.
    for _ in 0..50 {
        if transport.contains("Agent response:") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(transport.contains("Agent response:\n\nAll done."));
}

#[tokio::test]
async fn test_unknown_and_empty_messages() {
    let dir = TempDir::new().unwrap();
    let (transport, router, _watcher) =
        build_router(dir.path(), BridgeConfig::default(), None).await;

    send(&router, "/frobnicate").await;
    assert_eq!(transport.last(), "Unknown command. Use /help.");

    send(&router, "   ").await;
    assert_eq!(transport.last(), "Empty message ignored.");

    send(&router, "/help").await;
    let help = transport.last();
    assert!(help.contains("/run <command>"));
    // No auth secret configured, so /help omits the auth line.
    assert!(!help.contains("/auth"));
}
