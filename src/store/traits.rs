use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Who wrote a message, from the business's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    Lead,
    Business,
}

impl Sender {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lead => "lead",
            Self::Business => "business",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "lead" => Some(Self::Lead),
            "business" => Some(Self::Business),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Video,
    Audio,
    Pdf,
}

impl MediaType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Pdf => "pdf",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "image" => Some(Self::Image),
            "video" => Some(Self::Video),
            "audio" => Some(Self::Audio),
            "pdf" => Some(Self::Pdf),
            _ => None,
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A prospective customer, keyed loosely by `telefono`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lead {
    pub id: String,
    pub telefono: String,
    pub nombre: String,
    pub source: String,
    pub estado: String,
    pub etiquetas: Vec<String>,
    pub unread_count: u32,
    pub fecha_creacion: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
    pub secuencias_activas: Vec<String>,
}

/// Reference to a stored lead.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeadRef {
    pub id: String,
}

impl LeadRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLead {
    pub telefono: String,
    pub nombre: String,
    pub source: String,
    pub estado: String,
    pub etiquetas: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// One message under a lead. `media_url` is present iff `media_type` is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub content: String,
    pub media_type: Option<MediaType>,
    pub media_url: Option<String>,
    pub sender: Sender,
    pub timestamp: DateTime<Utc>,
}

impl MessageRecord {
    pub fn text(content: impl Into<String>, sender: Sender, timestamp: DateTime<Utc>) -> Self {
        Self {
            content: content.into(),
            media_type: None,
            media_url: None,
            sender,
            timestamp,
        }
    }

    pub fn media(
        media_type: MediaType,
        media_url: impl Into<String>,
        sender: Sender,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            content: String::new(),
            media_type: Some(media_type),
            media_url: Some(media_url.into()),
            sender,
            timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub lead_id: String,
    #[serde(flatten)]
    pub record: MessageRecord,
}

/// Operator-managed singleton. A missing document means "do not auto-save".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub auto_save_leads: bool,
    #[serde(default)]
    pub default_trigger: Option<String>,
}

/// This server's entry in the status collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub session_id: String,
    pub base_url: Option<String>,
    pub status: String,
    pub work_state: String,
    pub last_work_switched_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Record store for leads, their messages, the app config and server status.
///
/// Lookups by phone return the first match; there is no uniqueness
/// constraint on `telefono`.
#[async_trait]
pub trait LeadStore: Send + Sync {
    fn name(&self) -> &str;

    async fn find_lead_by_phone(&self, phone: &str) -> anyhow::Result<Option<LeadRef>>;

    async fn create_lead(&self, lead: NewLead) -> anyhow::Result<LeadRef>;

    async fn get_lead(&self, id: &str) -> anyhow::Result<Option<Lead>>;

    /// Append a message under `lead`; returns the message id.
    async fn append_message(&self, lead: &LeadRef, message: &MessageRecord)
        -> anyhow::Result<String>;

    /// Messages of a lead in insertion order.
    async fn list_messages(&self, lead_id: &str) -> anyhow::Result<Vec<StoredMessage>>;

    /// Set `last_message_at` and atomically add `unread_increment` to the
    /// unread counter.
    async fn touch_lead(
        &self,
        lead: &LeadRef,
        last_message_at: DateTime<Utc>,
        unread_increment: u32,
    ) -> anyhow::Result<()>;

    /// `Ok(None)` when the config document does not exist.
    async fn app_config(&self) -> anyhow::Result<Option<AppConfig>>;

    async fn put_app_config(&self, config: &AppConfig) -> anyhow::Result<()>;

    /// Merge-upsert the full server record.
    async fn register_server(&self, status: &ServerStatus) -> anyhow::Result<()>;

    /// Update only `status` and `last_seen`.
    async fn update_server_status(
        &self,
        session_id: &str,
        status: &str,
        last_seen: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    async fn server_status(&self, session_id: &str) -> anyhow::Result<Option<ServerStatus>>;

    async fn health_check(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enums_serialize_lowercase() {
        assert_eq!(serde_json::to_value(Sender::Business).unwrap(), "business");
        assert_eq!(serde_json::to_value(MediaType::Pdf).unwrap(), "pdf");
        assert_eq!(MediaType::parse("video"), Some(MediaType::Video));
        assert_eq!(Sender::parse("robot"), None);
    }

    #[test]
    fn media_constructor_keeps_url_and_type_together() {
        let now = Utc::now();
        let msg = MessageRecord::media(MediaType::Image, "https://x/y", Sender::Lead, now);
        assert!(msg.content.is_empty());
        assert_eq!(msg.media_type.is_some(), msg.media_url.is_some());

        let text = MessageRecord::text("hola", Sender::Business, now);
        assert!(text.media_type.is_none() && text.media_url.is_none());
    }

    #[test]
    fn absent_app_config_fields_default_off() {
        let cfg: AppConfig = serde_json::from_str("{}").unwrap();
        assert!(!cfg.auto_save_leads);
        assert!(cfg.default_trigger.is_none());
    }
}
