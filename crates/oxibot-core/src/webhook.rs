//! Fire-and-forget event webhook emitter.
//!
//! Replaces nanobot's `hooks/webhook.py` `WebhookEmitter`. Every call to
//! [`WebhookEmitter::emit`] spawns a background task and returns
//! immediately — callers never wait on delivery and a slow or unreachable
//! webhook endpoint never blocks the turn that triggered it.

use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::warn;

/// Posts structured lifecycle events to a configured HTTP endpoint.
///
/// `tokio::spawn`ed delivery tasks are tracked in `in_flight` so they are
/// not dropped (and silently cancelled) before they complete; each task
/// removes itself from the set once it finishes.
#[derive(Clone)]
pub struct WebhookEmitter {
    url: Option<String>,
    auth_header: Option<String>,
    token: Option<String>,
    client: reqwest::Client,
    in_flight: Arc<Mutex<HashMap<u64, JoinHandle<()>>>>,
    next_id: Arc<std::sync::atomic::AtomicU64>,
}

impl WebhookEmitter {
    /// Build an emitter. `url` is the delivery endpoint; `auth_header`, if
    /// set, is sent verbatim as the `Authorization` header; `token` is
    /// embedded in every payload under `nanobot_token` for the receiver to
    /// verify the sender's identity.
    pub fn new(url: Option<String>, auth_header: Option<String>, token: Option<String>) -> Self {
        WebhookEmitter {
            url,
            auth_header,
            token,
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(std::sync::atomic::AtomicU64::new(0)),
        }
    }

    /// Emit an event, without waiting on delivery. `fields` are merged
    /// into the payload alongside `event_type`, `nanobot_token`, and
    /// `event_timestamp`.
    pub fn emit(&self, event_type: &str, fields: Value) {
        let Some(url) = self.url.clone() else {
            return;
        };

        let mut payload = json!({
            "event_type": event_type,
            "event_timestamp": Utc::now().to_rfc3339(),
        });
        if let Some(token) = &self.token {
            payload["nanobot_token"] = json!(token);
        }
        if let Value::Object(extra) = fields {
            if let Value::Object(base) = &mut payload {
                base.extend(extra);
            }
        }

        let client = self.client.clone();
        let auth_header = self.auth_header.clone();
        let in_flight = self.in_flight.clone();
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let in_flight_for_task = in_flight.clone();
        let handle = tokio::spawn(async move {
            let mut req = client.post(&url).json(&payload);
            if let Some(auth) = &auth_header {
                req = req.header("Authorization", auth.clone());
            }
            match req.send().await {
                Ok(resp) if resp.status().as_u16() >= 300 => {
                    warn!(status = %resp.status(), %url, "webhook delivery returned non-success status");
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(%err, %url, "webhook delivery failed");
                }
            }
            in_flight_for_task.lock().unwrap().remove(&id);
        });

        // Retain the handle so the task isn't dropped (and cancelled)
        // before it completes; inserted synchronously so the task can't
        // finish and remove itself before it's tracked.
        in_flight.lock().unwrap().insert(id, handle);
    }
}

impl Default for WebhookEmitter {
    fn default() -> Self {
        WebhookEmitter::new(None, None, None)
    }
}
