//! Outbound chat notifications and the inbound button payload.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::token::{CallbackToken, CallbackTokenError};
use crate::runtime::ActivityError;

pub mod colors {
    pub const DEFAULT: &str = "#009688";
    pub const ERROR: &str = "#ab2524";
    pub const SUCCESS: &str = "#5CB85C";
    pub const WARNING: &str = "#F0AD4E";
}

/// Incoming-webhook message body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlackMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<SlackAttachment>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlackAttachment {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pretext: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<SlackAction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlackAction {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl SlackMessage {
    /// A single coloured attachment carrying `text`.
    pub fn notification(title: &str, text: impl Into<String>, color: &str) -> Self {
        let text = text.into();
        SlackMessage {
            attachments: vec![SlackAttachment {
                fallback: Some(text.clone()),
                color: Some(color.to_string()),
                title: Some(title.to_string()),
                text: Some(text),
                footer: Some("cloud-scheduler".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}

/// A button on an approval prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptAction {
    pub label: String,
    pub style: Option<String>,
    pub callback_token: CallbackToken,
}

impl PromptAction {
    pub fn primary(label: impl Into<String>, token: CallbackToken) -> Self {
        Self {
            label: label.into(),
            style: Some("primary".into()),
            callback_token: token,
        }
    }

    pub fn danger(label: impl Into<String>, token: CallbackToken) -> Self {
        Self {
            label: label.into(),
            style: Some("danger".into()),
            callback_token: token,
        }
    }

    /// Link that raises this action's event through the HTTP surface.
    fn raise_url(&self, host: &str) -> Option<String> {
        let base = format!("https://{host}/api/HttpRaiseEvent");
        reqwest::Url::parse_with_params(
            &base,
            &[
                ("instanceid", self.callback_token.instance_id.as_str()),
                ("event", self.callback_token.event_name.as_str()),
            ],
        )
        .map(String::from)
        .map_err(|e| warn!(host, error=%e, "cannot build raise url"))
        .ok()
    }
}

/// Question put to a human, answered by pressing one of the actions.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalPrompt {
    pub text: String,
    pub image_url: Option<String>,
    pub actions: Vec<PromptAction>,
}

impl ApprovalPrompt {
    /// Render as a webhook message. Each button's `value` is its encoded
    /// callback token; `host` adds a direct link to the raise endpoint.
    pub fn render(&self, host: Option<&str>) -> SlackMessage {
        let actions = self
            .actions
            .iter()
            .map(|a| SlackAction {
                kind: "button".into(),
                name: a.callback_token.event_name.clone(),
                text: a.label.clone(),
                url: host.and_then(|h| a.raise_url(h)),
                style: a.style.clone(),
                value: Some(a.callback_token.to_string()),
            })
            .collect();
        let callback_id = self.actions.first().map(|a| a.callback_token.instance_id.clone());
        SlackMessage {
            attachments: vec![SlackAttachment {
                fallback: Some(self.text.clone()),
                color: Some(colors::DEFAULT.into()),
                title: Some("Approval needed".into()),
                text: Some(self.text.clone()),
                image_url: self.image_url.clone(),
                callback_id,
                actions,
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotifyError {
    /// Network failure or a 5xx from the receiver; worth retrying.
    #[error("notification transport failed: {0}")]
    Transport(String),
    #[error("notification rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

impl From<NotifyError> for ActivityError {
    fn from(e: NotifyError) -> Self {
        match e {
            NotifyError::Transport(_) => ActivityError::Transient(e.to_string()),
            NotifyError::Rejected { .. } => ActivityError::Application(e.to_string()),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &SlackMessage) -> Result<(), NotifyError>;
}

/// Posts messages to a Slack incoming webhook.
pub struct SlackWebhookNotifier {
    client: reqwest::Client,
    hook_url: String,
}

impl SlackWebhookNotifier {
    pub fn new(hook_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            hook_url: hook_url.into(),
        }
    }
}

#[async_trait]
impl Notifier for SlackWebhookNotifier {
    async fn send(&self, message: &SlackMessage) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.hook_url)
            .json(message)
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            debug!(status = status.as_u16(), "webhook accepted message");
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() {
            return Err(NotifyError::Transport(format!("status {}: {body}", status.as_u16())));
        }
        Err(NotifyError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

/// Keeps sent messages in memory. Used when no webhook is configured and in tests.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<SlackMessage>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<SlackMessage> {
        self.sent.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, message: &SlackMessage) -> Result<(), NotifyError> {
        debug!(?message, "recording notification");
        self.sent.lock().unwrap_or_else(|p| p.into_inner()).push(message.clone());
        Ok(())
    }
}

/// Body Slack posts (as the `payload` form field) when a button is pressed.
#[derive(Debug, Clone, Deserialize)]
pub struct SlackActionRequest {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub actions: Vec<SlackActionValue>,
    #[serde(default)]
    pub callback_id: Option<String>,
    #[serde(default)]
    pub user: Option<SlackUser>,
    #[serde(default)]
    pub response_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlackActionValue {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlackUser {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InteractionError {
    #[error("interaction payload carries no action value")]
    NoAction,
    #[error(transparent)]
    Token(#[from] CallbackTokenError),
}

impl SlackActionRequest {
    /// Decode the token carried by the first pressed action.
    pub fn callback_token(&self) -> Result<CallbackToken, InteractionError> {
        let value = self
            .actions
            .first()
            .and_then(|a| a.value.as_deref())
            .ok_or(InteractionError::NoAction)?;
        Ok(value.parse()?)
    }
}
