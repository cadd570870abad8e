//! WhatsApp transport boundary.
//!
//! A [`Transport`] opens one connection per call to [`Transport::connect`]
//! and reports everything that happens on it as [`TransportEvent`]s. The
//! session manager is the only caller of `connect`.

pub mod auth_state;
pub mod loopback;
#[cfg(feature = "whatsapp-web")]
mod wa_store;
pub mod whatsapp_web;

pub use auth_state::{AuthState, Credentials};
pub use loopback::LoopbackTransport;
pub use whatsapp_web::WhatsAppWebTransport;

use crate::config::Config;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Why a connection closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The account unlinked this device; credentials are no longer valid.
    LoggedOut,
    ConnectionLost,
    ConnectionReplaced,
    RestartRequired,
    Other(String),
}

impl DisconnectReason {
    pub fn is_logged_out(&self) -> bool {
        matches!(self, Self::LoggedOut)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoggedOut => f.write_str("logged out"),
            Self::ConnectionLost => f.write_str("connection lost"),
            Self::ConnectionReplaced => f.write_str("connection replaced"),
            Self::RestartRequired => f.write_str("restart required"),
            Self::Other(reason) => write!(f, "{reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionUpdate {
    /// Pairing QR payload, to be scanned from the phone.
    Qr(String),
    /// Connection is authenticated; `me` is our own JID when known.
    Open { me: Option<String> },
    Close { reason: DisconnectReason },
}

/// `notify` batches are live traffic; `append` batches are history sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertKind {
    Notify,
    Append,
}

#[derive(Debug, Clone)]
pub struct MessagesUpsert {
    pub messages: Vec<InboundMessage>,
    pub kind: UpsertKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageKey {
    /// Chat address (`{user}@s.whatsapp.net`, `{id}@g.us`, ...).
    pub remote_jid: Option<String>,
    pub from_me: bool,
    pub id: String,
}

#[derive(Debug, Clone, Default)]
pub struct InboundMessage {
    pub key: MessageKey,
    pub push_name: Option<String>,
    pub message: Option<RawMessage>,
}

/// Payload slots of a WhatsApp message. At most one media slot is normally
/// populated; classification priority lives in the ingestion pipeline.
#[derive(Debug, Clone, Default)]
pub struct RawMessage {
    pub conversation: Option<String>,
    pub extended_text: Option<String>,
    pub video: Option<MediaPayload>,
    pub image: Option<MediaPayload>,
    pub audio: Option<MediaPayload>,
    pub document: Option<MediaPayload>,
}

/// Bytes behind a media message, fetched lazily.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn fetch(&self) -> anyhow::Result<Vec<u8>>;
}

#[derive(Clone)]
pub struct MediaPayload {
    pub mimetype: Option<String>,
    pub source: Arc<dyn MediaSource>,
}

impl MediaPayload {
    pub fn new(mimetype: Option<String>, source: Arc<dyn MediaSource>) -> Self {
        Self { mimetype, source }
    }

    /// Payload whose bytes are already in memory.
    pub fn inline(mimetype: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            mimetype: Some(mimetype.into()),
            source: Arc::new(InlineMedia(bytes)),
        }
    }
}

impl fmt::Debug for MediaPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaPayload")
            .field("mimetype", &self.mimetype)
            .finish_non_exhaustive()
    }
}

pub struct InlineMedia(pub Vec<u8>);

#[async_trait]
impl MediaSource for InlineMedia {
    async fn fetch(&self) -> anyhow::Result<Vec<u8>> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connection(ConnectionUpdate),
    /// Credentials changed and must be persisted before anything else.
    CredsUpdate(Credentials),
    MessagesUpsert(MessagesUpsert),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundPayload {
    Text(String),
    Audio {
        data: Vec<u8>,
        mimetype: String,
        /// Push-to-talk: rendered as a voice note.
        ptt: bool,
    },
}

/// Live connection returned by [`Transport::connect`].
#[async_trait]
pub trait TransportHandle: Send + Sync {
    /// Send to a full JID; returns the transport's message id.
    async fn send_message(&self, jid: &str, payload: OutboundPayload) -> anyhow::Result<String>;

    /// Tear the connection down. Idempotent.
    async fn close(&self) {}
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    /// Open a connection authenticated with `auth`. Events for this
    /// connection, ending with a `Close`, are pushed to `events`.
    async fn connect(
        &self,
        auth: &AuthState,
        events: mpsc::Sender<TransportEvent>,
    ) -> anyhow::Result<Arc<dyn TransportHandle>>;
}

/// Build the transport named by `[session].transport`.
pub fn create_transport(config: &Config) -> anyhow::Result<Arc<dyn Transport>> {
    match config.session.transport.as_str() {
        "whatsapp-web" | "whatsapp" => Ok(Arc::new(WhatsAppWebTransport::new(
            config.session.pair_phone.clone(),
        ))),
        "loopback" => Ok(Arc::new(LoopbackTransport::new())),
        other => anyhow::bail!("Unknown transport backend: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logged_out_is_the_only_terminal_reason() {
        assert!(DisconnectReason::LoggedOut.is_logged_out());
        assert!(!DisconnectReason::ConnectionLost.is_logged_out());
        assert!(!DisconnectReason::Other("428".into()).is_logged_out());
    }

    #[tokio::test]
    async fn inline_media_returns_its_bytes() {
        let payload = MediaPayload::inline("image/jpeg", vec![1, 2, 3]);
        assert_eq!(payload.source.fetch().await.unwrap(), vec![1, 2, 3]);
        assert_eq!(payload.mimetype.as_deref(), Some("image/jpeg"));
    }

    #[test]
    fn factory_selects_backend_by_name() {
        let mut config = Config::default();
        config.session.transport = "loopback".into();
        assert_eq!(create_transport(&config).unwrap().name(), "loopback");

        config.session.transport = "whatsapp-web".into();
        assert_eq!(create_transport(&config).unwrap().name(), "whatsapp-web");

        config.session.transport = "telegram".into();
        assert!(create_transport(&config).is_err());
    }
}
