//! Server-push outbound channel — fire-and-forget delivery to an external sink.
//!
//! Port of nanobot's `channels/raven.py`, generalized away from its
//! Raven-specific endpoint naming into a configuration-driven sink.
//!
//! Outbound-only: there is no inbound listener, just a credential check on
//! `start()`. `send()` resolves `chat_id` (`"owner"` or empty maps to the
//! configured `owner_dm_channel`, anything else is used as the literal sink
//! id) and POSTs the message to the configured endpoint. Delivery failures
//! are logged, never propagated — a down push sink must not stall the rest
//! of the turn engine.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use oxibot_core::bus::types::OutboundMessage;
use oxibot_core::config::schema::PushChannelConfig;

use crate::base::Channel;

/// Request timeout for the push endpoint.
const PUSH_TIMEOUT: Duration = Duration::from_secs(60);

/// Outbound-only channel that pushes assistant replies to an external sink
/// (e.g. a Frappe/Raven-style messaging endpoint).
pub struct PushChannel {
    config: PushChannelConfig,
    http: reqwest::Client,
    shutdown: Arc<Notify>,
}

impl PushChannel {
    /// Create a new push channel from config.
    pub fn new(config: PushChannelConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            shutdown: Arc::new(Notify::new()),
        }
    }

    fn is_configured(&self) -> bool {
        !self.config.site_url.is_empty()
            && !self.config.api_key.is_empty()
            && !self.config.api_secret.is_empty()
    }

    /// Resolve the outbound's `chat_id` into a concrete sink id.
    fn resolve_sink_id(&self, chat_id: &str) -> String {
        if chat_id.is_empty() || chat_id == "owner" {
            self.config.owner_dm_channel.clone()
        } else {
            chat_id.to_string()
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/api/method/raven.api.raven_message.send_message",
            self.config.site_url.trim_end_matches('/')
        )
    }

    fn auth_header(&self) -> String {
        format!("token {}:{}", self.config.api_key, self.config.api_secret)
    }

    async fn push(&self, sink_id: &str, text: &str) -> anyhow::Result<()> {
        let response = self
            .http
            .post(self.endpoint())
            .header("Authorization", self.auth_header())
            .timeout(PUSH_TIMEOUT)
            .json(&json!({ "channel_id": sink_id, "text": text }))
            .send()
            .await?;

        if response.status().is_success() {
            info!(sink_id = %sink_id, "push message delivered");
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let truncated: String = body.chars().take(200).collect();
            warn!(sink_id = %sink_id, %status, body = %truncated, "push message rejected");
        }

        Ok(())
    }
}

#[async_trait]
impl Channel for PushChannel {
    fn name(&self) -> &str {
        "push"
    }

    async fn start(&self) -> anyhow::Result<()> {
        if self.is_configured() {
            info!(site_url = %self.config.site_url, "push channel ready");
        } else {
            warn!("push channel not configured: missing site_url/api_key/api_secret");
        }

        self.shutdown.notified().await;
        info!("push channel shutting down");
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.shutdown.notify_waiters();
        Ok(())
    }

    async fn send(&self, msg: &OutboundMessage) -> anyhow::Result<()> {
        if !self.is_configured() {
            warn!("dropping push message: channel not configured");
            return Ok(());
        }

        if msg.content.trim().is_empty() {
            warn!("dropping push message: empty content");
            return Ok(());
        }

        let sink_id = self.resolve_sink_id(&msg.chat_id);
        if sink_id.is_empty() {
            warn!("dropping push message: no sink id resolved");
            return Ok(());
        }

        if let Err(e) = self.push(&sink_id, &msg.content).await {
            error!(error = %e, "push message delivery failed");
        }

        Ok(())
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn make_config() -> PushChannelConfig {
        PushChannelConfig {
            enabled: true,
            site_url: "https://push.example.com".into(),
            api_key: "key123".into(),
            api_secret: "secret456".into(),
            owner_dm_channel: "owner-dm-1".into(),
        }
    }

    #[test]
    fn test_channel_name() {
        let ch = PushChannel::new(make_config());
        assert_eq!(ch.name(), "push");
    }

    #[test]
    fn test_resolve_sink_id_owner_alias() {
        let ch = PushChannel::new(make_config());
        assert_eq!(ch.resolve_sink_id("owner"), "owner-dm-1");
        assert_eq!(ch.resolve_sink_id(""), "owner-dm-1");
    }

    #[test]
    fn test_resolve_sink_id_literal_passthrough() {
        let ch = PushChannel::new(make_config());
        assert_eq!(ch.resolve_sink_id("general-channel"), "general-channel");
    }

    #[test]
    fn test_endpoint_strips_trailing_slash() {
        let mut config = make_config();
        config.site_url = "https://push.example.com/".into();
        let ch = PushChannel::new(config);
        assert_eq!(
            ch.endpoint(),
            "https://push.example.com/api/method/raven.api.raven_message.send_message"
        );
    }

    #[test]
    fn test_auth_header_format() {
        let ch = PushChannel::new(make_config());
        assert_eq!(ch.auth_header(), "token key123:secret456");
    }

    #[tokio::test]
    async fn test_send_is_noop_when_unconfigured() {
        let ch = PushChannel::new(PushChannelConfig::default());
        let msg = OutboundMessage::new("push", "owner", "hello");
        assert!(ch.send(&msg).await.is_ok());
    }

    #[tokio::test]
    async fn test_send_is_noop_on_empty_content() {
        let ch = PushChannel::new(make_config());
        let msg = OutboundMessage::new("push", "owner", "   ");
        assert!(ch.send(&msg).await.is_ok());
    }

    #[tokio::test]
    async fn test_stop_notifies_shutdown() {
        let ch = Arc::new(PushChannel::new(make_config()));
        let ch2 = ch.clone();
        let handle = tokio::spawn(async move { ch2.start().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        ch.stop().await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(result.is_ok());
    }
}
