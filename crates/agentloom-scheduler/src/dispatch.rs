//! Notification publishers — the outbound side of connectors.
//! Supports: Telegram Bot API, generic JSON webhooks, and the tracing log.

use std::sync::Arc;
use std::time::Duration;

use agentloom_core::config::NotificationConfig;
use agentloom_core::error::{LoomError, Result};
use agentloom_core::traits::Publisher;
use async_trait::async_trait;

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Telegram Bot API: `sendMessage` to a chat id.
pub struct TelegramPublisher {
    bot_token: String,
    api_base: String,
    client: reqwest::Client,
}

impl TelegramPublisher {
    pub fn new(bot_token: &str) -> Self {
        Self {
            bot_token: bot_token.to_string(),
            api_base: "https://api.telegram.org".into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_api_base(mut self, base: &str) -> Self {
        self.api_base = base.trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl Publisher for TelegramPublisher {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn publish(&self, external_id: &str, message: &str) -> Result<()> {
        let url = format!("{}/bot{}/sendMessage", self.api_base, self.bot_token);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "chat_id": external_id,
                "text": message,
                "disable_web_page_preview": true
            }))
            .timeout(SEND_TIMEOUT)
            .send()
            .await
            .map_err(|e| LoomError::Delivery(format!("Telegram send failed: {e}")))?;

        if resp.status().is_success() {
            tracing::info!("✅ Telegram notification sent to {external_id}");
            Ok(())
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(LoomError::Delivery(format!("Telegram API error {status}: {body}")))
        }
    }
}

/// Generic HTTP webhook: POST with a JSON body, registered under any connector name.
pub struct WebhookPublisher {
    name: String,
    url: String,
    headers: Vec<(String, String)>,
    client: reqwest::Client,
}

impl WebhookPublisher {
    pub fn new(name: &str, url: &str) -> Self {
        Self {
            name: name.trim().to_ascii_lowercase(),
            url: url.to_string(),
            headers: Vec::new(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.push((key.to_string(), value.to_string()));
        self
    }
}

#[async_trait]
impl Publisher for WebhookPublisher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, external_id: &str, message: &str) -> Result<()> {
        let mut req = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({
                "connector": self.name,
                "external_id": external_id,
                "text": message,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }))
            .timeout(SEND_TIMEOUT);

        for (key, value) in &self.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| LoomError::Delivery(format!("Webhook send failed: {e}")))?;

        if resp.status().is_success() {
            tracing::info!("✅ Webhook notification sent to {} ({external_id})", self.url);
            Ok(())
        } else {
            Err(LoomError::Delivery(format!("Webhook error {}", resp.status())))
        }
    }
}

/// Writes notifications to the log. Registered as connector `log`.
pub struct LogPublisher;

#[async_trait]
impl Publisher for LogPublisher {
    fn name(&self) -> &str {
        "log"
    }

    async fn publish(&self, external_id: &str, message: &str) -> Result<()> {
        tracing::info!(target: "agentloom::notify", external_id, "📢 {}", message.replace('\n', " | "));
        Ok(())
    }
}

/// Build publishers from config. `log` is always available.
pub fn publishers_from_config(config: &NotificationConfig) -> Vec<Arc<dyn Publisher>> {
    let mut publishers: Vec<Arc<dyn Publisher>> = Vec::new();

    if let Some(token) = config.telegram_bot_token.as_deref()
        && !token.trim().is_empty()
    {
        publishers.push(Arc::new(TelegramPublisher::new(token.trim())));
    }

    for (name, url) in &config.webhooks {
        if name.trim().is_empty() || url.trim().is_empty() {
            tracing::warn!("⚠️ Skipping webhook with empty name or url");
            continue;
        }
        publishers.push(Arc::new(WebhookPublisher::new(name, url.trim())));
    }

    publishers.push(Arc::new(LogPublisher));
    publishers
}
