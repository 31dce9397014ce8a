//! Telegram status notifications.
//!
//! The controller never talks to Telegram directly: it enqueues an [`Event`]
//! on a [`NotifierHandle`] and goes back to the console. A single worker task
//! drains the queue and performs the sends, so network latency never blocks
//! operator input. Delivery is best-effort; failures are logged and dropped.

use anyhow::Result;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::TelegramConfig;

/// Outbound queue depth. The console produces at most one event per menu
/// action, so backpressure here only ever means Telegram is unreachable.
const QUEUE_DEPTH: usize = 32;

/// A state change worth mirroring to the chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Registered { username: String, account_id: i64 },
    SignedIn { username: String },
    SignedOut { username: String },
}

impl Event {
    /// Render the chat message text (Markdown).
    pub fn text(&self) -> String {
        match self {
            Event::Registered {
                username,
                account_id,
            } => {
                format!("❗ New account registered: `{username}` (ID: {account_id})")
            }
            Event::SignedIn { username } => format!("✔ Account `{username}` signed in"),
            Event::SignedOut { username } => format!("❌ Account `{username}` signed out"),
        }
    }
}

/// Telegram Bot API client for one destination chat.
pub struct Notifier {
    client: reqwest::Client,
    api_base: String,
    bot_token: String,
    chat_id: String,
}

#[derive(Deserialize)]
struct ApiStatus {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

impl Notifier {
    pub fn new(cfg: &TelegramConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: "https://api.telegram.org".to_string(),
            bot_token: cfg.bot_token.clone(),
            chat_id: cfg.chat_id.clone(),
        }
    }

    #[cfg(test)]
    fn with_api_base(mut self, base: &str) -> Self {
        self.api_base = base.trim_end_matches('/').to_string();
        self
    }

    /// Send one plain status message to the configured chat.
    pub async fn send(&self, text: &str) -> Result<()> {
        let url = format!("{}/bot{}/sendMessage", self.api_base, self.bot_token);
        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": text,
            "parse_mode": "Markdown",
        });

        let resp = self.client.post(&url).json(&body).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let api: Option<ApiStatus> = resp.json().await.ok();
            let detail = api
                .and_then(|a| if a.ok { None } else { a.description })
                .unwrap_or_default();
            anyhow::bail!("Telegram API error: {status} {detail}");
        }
        Ok(())
    }

    /// Verify the bot token is accepted (`getMe`). Warn-only at startup.
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/bot{}/getMe", self.api_base, self.bot_token);
        match self.client.get(&url).send().await {
            Ok(r) => r.status().is_success(),
            Err(_) => false,
        }
    }
}

/// Cheap cloneable handle the controller uses to enqueue events.
#[derive(Clone)]
pub struct NotifierHandle {
    tx: mpsc::Sender<Event>,
}

impl NotifierHandle {
    /// Fire-and-forget: a full or closed queue drops the event with a log
    /// line, never an error on the caller's path.
    pub fn notify(&self, event: Event) {
        if let Err(e) = self.tx.try_send(event) {
            tracing::warn!("Notification dropped: {e}");
        }
    }
}

/// Handle plus the receiving end of its queue, for asserting on enqueued
/// events without a worker.
#[cfg(test)]
pub(crate) fn test_pair(depth: usize) -> (NotifierHandle, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(depth);
    (NotifierHandle { tx }, rx)
}

/// Spawn the single consumer task that drains the queue and sends.
///
/// Dropping every [`NotifierHandle`] closes the queue; the worker drains
/// what is left and exits, so awaiting the returned task is the shutdown
/// barrier: no message is left in flight at exit.
pub fn spawn(notifier: Notifier) -> (NotifierHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Event>(QUEUE_DEPTH);
    let worker = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = event.text();
            match notifier.send(&text).await {
                Ok(()) => tracing::info!("Notification sent: {text}"),
                Err(e) => tracing::error!("Failed to send notification: {e}"),
            }
        }
    });
    (NotifierHandle { tx }, worker)
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cfg() -> TelegramConfig {
        TelegramConfig {
            bot_token: "123:abc".into(),
            chat_id: "-1000".into(),
        }
    }

    #[test]
    fn registered_event_text() {
        let e = Event::Registered {
            username: "alice".into(),
            account_id: 7,
        };
        assert_eq!(e.text(), "❗ New account registered: `alice` (ID: 7)");
    }

    #[test]
    fn signed_in_event_text_contains_name() {
        let e = Event::SignedIn {
            username: "alice".into(),
        };
        assert!(e.text().contains("`alice`"));
        assert!(e.text().contains("signed in"));
    }

    #[test]
    fn signed_out_event_text_contains_name() {
        let e = Event::SignedOut {
            username: "bob".into(),
        };
        assert!(e.text().contains("`bob`"));
        assert!(e.text().contains("signed out"));
    }

    #[tokio::test]
    async fn send_fails_against_unreachable_endpoint() {
        // Port 9 (discard) is never a Telegram server.
        let notifier = Notifier::new(&test_cfg()).with_api_base("http://127.0.0.1:9");
        assert!(notifier.send("hello").await.is_err());
        assert!(!notifier.health_check().await);
    }

    #[tokio::test]
    async fn worker_exits_when_handles_drop() {
        let notifier = Notifier::new(&test_cfg()).with_api_base("http://127.0.0.1:9");
        let (handle, worker) = spawn(notifier);

        // Failed sends are swallowed by the worker, not surfaced here.
        handle.notify(Event::SignedIn {
            username: "alice".into(),
        });
        drop(handle);

        worker.await.unwrap();
    }

    #[tokio::test]
    async fn notify_on_closed_queue_does_not_panic() {
        let (tx, rx) = mpsc::channel::<Event>(1);
        drop(rx);
        let handle = NotifierHandle { tx };

        // try_send fails with a closed channel; notify swallows it.
        handle.notify(Event::SignedOut {
            username: "bob".into(),
        });
    }
}
