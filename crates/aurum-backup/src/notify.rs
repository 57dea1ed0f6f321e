//! Notification delivery seams.
//!
//! The engine does not own email/SMS/in-app delivery; the host platform
//! does. [`Notifier`] is the narrow interface the monitor calls, returning
//! delivery booleans so a down notification fabric never fails a pipeline.

use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

/// Someone who should hear about alerts.
#[derive(Debug, Clone)]
pub struct Recipient {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

/// Directory of alert recipients (the platform-administrator role).
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    async fn platform_administrators(&self) -> Vec<Recipient>;
}

/// Fixed recipient list.
pub struct StaticIdentityDirectory {
    admins: Vec<Recipient>,
}

impl StaticIdentityDirectory {
    pub fn new(admins: Vec<Recipient>) -> Self {
        Self { admins }
    }
}

#[async_trait]
impl IdentityDirectory for StaticIdentityDirectory {
    async fn platform_administrators(&self) -> Vec<Recipient> {
        self.admins.clone()
    }
}

/// Delivery fabric interface. Each method returns whether delivery
/// succeeded on that channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn create_in_app(
        &self,
        recipient: &Recipient,
        title: &str,
        body: &str,
        action_url: Option<&str>,
    ) -> bool;

    async fn send_email(
        &self,
        recipient: &Recipient,
        template: &str,
        context: &Value,
        subject: Option<&str>,
    ) -> bool;

    async fn send_sms(&self, recipient: &Recipient, body: &str, kind: &str) -> bool;

    async fn post_webhook(&self, url: &str, payload: &Value) -> bool;
}

/// Production notifier: webhooks go out over HTTP; in-app, email and SMS are
/// handed to the host platform's delivery fabric, which is wired in at the
/// process boundary. Until a fabric is attached the non-webhook channels are
/// logged and reported as undelivered.
pub struct HttpNotifier {
    http: reqwest::Client,
}

impl HttpNotifier {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn create_in_app(
        &self,
        recipient: &Recipient,
        title: &str,
        _body: &str,
        _action_url: Option<&str>,
    ) -> bool {
        warn!(recipient = %recipient.id, title, "no in-app fabric attached, dropping notification");
        false
    }

    async fn send_email(
        &self,
        recipient: &Recipient,
        template: &str,
        _context: &Value,
        _subject: Option<&str>,
    ) -> bool {
        warn!(recipient = %recipient.id, template, "no email fabric attached, dropping notification");
        false
    }

    async fn send_sms(&self, recipient: &Recipient, _body: &str, kind: &str) -> bool {
        warn!(recipient = %recipient.id, kind, "no SMS fabric attached, dropping notification");
        false
    }

    async fn post_webhook(&self, url: &str, payload: &Value) -> bool {
        match self.http.post(url).json(payload).send().await {
            Ok(response) if response.status().is_success() => {
                info!(url, "posted alert webhook");
                true
            }
            Ok(response) => {
                warn!(url, status = %response.status(), "alert webhook rejected");
                false
            }
            Err(e) => {
                warn!(url, %e, "alert webhook failed");
                false
            }
        }
    }
}

/// Test notifier recording every delivery attempt.
#[derive(Default)]
pub struct RecordingNotifier {
    pub deliveries: Mutex<Vec<String>>,
    /// Channels that should report failure.
    pub failing_channels: Vec<&'static str>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, channel: &str, detail: String) -> bool {
        self.deliveries
            .lock()
            .unwrap()
            .push(format!("{channel}:{detail}"));
        !self.failing_channels.contains(&channel)
    }

    pub fn delivered(&self) -> Vec<String> {
        self.deliveries.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn create_in_app(
        &self,
        recipient: &Recipient,
        title: &str,
        _body: &str,
        _action_url: Option<&str>,
    ) -> bool {
        self.record("in_app", format!("{}:{title}", recipient.id))
    }

    async fn send_email(
        &self,
        recipient: &Recipient,
        template: &str,
        _context: &Value,
        _subject: Option<&str>,
    ) -> bool {
        self.record("email", format!("{}:{template}", recipient.id))
    }

    async fn send_sms(&self, recipient: &Recipient, _body: &str, kind: &str) -> bool {
        self.record("sms", format!("{}:{kind}", recipient.id))
    }

    async fn post_webhook(&self, url: &str, _payload: &Value) -> bool {
        self.record("webhook", url.to_string())
    }
}
