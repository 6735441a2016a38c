//! Telegram transport: long-polling Bot API client behind a small trait.
//!
//! The router only sees `ChatTransport::send_message`; the polling loop
//! filters messages against the chat-id allow-list before they ever reach
//! the router, replying to strangers with their chat id so they can ask the
//! operator to be added.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// An inbound text message from an allow-listed chat.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub chat_id: i64,
    pub text: String,
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<()>;
}

/// An empty allow-list means nobody is allowed.
pub fn is_allowed_chat(chat_id: i64, allowed: &[i64]) -> bool {
    allowed.contains(&chat_id)
}

// ============================================================================
// Bot API wire types (the subset we consume)
// ============================================================================

#[derive(Debug, Deserialize)]
struct UpdatesResponse {
    ok: bool,
    #[serde(default)]
    result: Vec<Update>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    message: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    chat: Chat,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

// ============================================================================
// Client
// ============================================================================

pub struct TelegramClient {
    http: reqwest::Client,
    base_url: String,
    allowed_chat_ids: Vec<i64>,
    poll_timeout_sec: u64,
}

impl TelegramClient {
    pub fn new(token: &str, allowed_chat_ids: Vec<i64>, poll_timeout_sec: u64) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(poll_timeout_sec + 10))
            .build()
            .context("building telegram http client")?;
        Ok(Self {
            http,
            base_url: format!("https://api.telegram.org/bot{}", token),
            allowed_chat_ids,
            poll_timeout_sec,
        })
    }

    /// Long-poll `getUpdates` forever, forwarding allow-listed text messages
    /// into `tx`. Poll errors are logged and retried after a short pause.
    pub async fn poll_updates(&self, tx: mpsc::Sender<IncomingMessage>) {
        info!("Telegram bot started (long polling)");
        let mut offset: i64 = 0;

        loop {
            let updates = match self.fetch_updates(offset).await {
                Ok(u) => u,
                Err(e) => {
                    warn!("getUpdates failed: {}", e);
                    tokio::time::sleep(std::time::Duration::from_secs(3)).await;
                    continue;
                }
            };

            for update in updates {
                offset = offset.max(update.update_id + 1);
                let Some(message) = update.message else {
                    continue;
                };
                let Some(text) = message.text else {
                    continue;
                };
                let chat_id = message.chat.id;

                if !is_allowed_chat(chat_id, &self.allowed_chat_ids) {
                    warn!("rejected message from unauthorized chat id: {}", chat_id);
                    let notice = format!(
                        "This chat is not authorized.\n\nYour chat ID is: {}\nAsk the operator to add it to the allow-list.",
                        chat_id
                    );
                    if let Err(e) = self.send_message(chat_id, &notice).await {
                        warn!("failed notifying unauthorized chat: {}", e);
                    }
                    continue;
                }

                if tx.send(IncomingMessage { chat_id, text }).await.is_err() {
                    info!("message channel closed, stopping telegram poll loop");
                    return;
                }
            }
        }
    }

    async fn fetch_updates(&self, offset: i64) -> Result<Vec<Update>> {
        let resp: UpdatesResponse = self
            .http
            .get(format!("{}/getUpdates", self.base_url))
            .query(&[
                ("offset", offset.to_string()),
                ("timeout", self.poll_timeout_sec.to_string()),
                ("allowed_updates", "[\"message\"]".to_string()),
            ])
            .send()
            .await
            .context("sending getUpdates")?
            .json()
            .await
            .context("decoding getUpdates response")?;

        if !resp.ok {
            anyhow::bail!("getUpdates returned ok=false");
        }
        Ok(resp.result)
    }
}

#[async_trait]
impl ChatTransport for TelegramClient {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<()> {
        let resp = self
            .http
            .post(format!("{}/sendMessage", self.base_url))
            .json(&serde_json::json!({ "chat_id": chat_id, "text": text }))
            .send()
            .await
            .context("sending message")?;

        if !resp.status().is_success() {
            anyhow::bail!("sendMessage failed with status {}", resp.status());
        }
        Ok(())
    }
}
