//! WhatsApp Web transport using wa-rs (native Rust implementation).
//!
//! Requires the `whatsapp-web` feature:
//! ```sh
//! cargo build --features whatsapp-web
//! ```
//!
//! Device keys and Signal sessions live in the auth directory through
//! [`super::wa_store::WaAuthStore`], so a logout wipe unlinks the device.

use super::{AuthState, Transport, TransportEvent, TransportHandle};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

#[cfg(feature = "whatsapp-web")]
pub struct WhatsAppWebTransport {
    /// Phone number for pair-code linking instead of QR.
    pair_phone: Option<String>,
}

#[cfg(not(feature = "whatsapp-web"))]
pub struct WhatsAppWebTransport {
    _pair_phone: Option<String>,
}

impl WhatsAppWebTransport {
    #[cfg(feature = "whatsapp-web")]
    pub fn new(pair_phone: Option<String>) -> Self {
        Self { pair_phone }
    }

    #[cfg(not(feature = "whatsapp-web"))]
    pub fn new(pair_phone: Option<String>) -> Self {
        Self {
            _pair_phone: pair_phone,
        }
    }
}

#[cfg(feature = "whatsapp-web")]
mod imp {
    use super::super::{
        ConnectionUpdate, Credentials, DisconnectReason, InboundMessage, MediaPayload,
        MediaSource, MessageKey, MessagesUpsert, OutboundPayload, RawMessage, TransportEvent,
        TransportHandle, UpsertKind,
    };
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use wa_rs_proto::whatsapp::{message as proto, Message};

    pub(super) enum WaMedia {
        Image(Box<proto::ImageMessage>),
        Video(Box<proto::VideoMessage>),
        Audio(Box<proto::AudioMessage>),
        Document(Box<proto::DocumentMessage>),
    }

    /// Downloads and decrypts a media message on demand.
    pub(super) struct WaMediaSource {
        pub client: Arc<wa_rs::Client>,
        pub media: WaMedia,
    }

    #[async_trait]
    impl MediaSource for WaMediaSource {
        async fn fetch(&self) -> Result<Vec<u8>> {
            let bytes = match &self.media {
                WaMedia::Image(m) => self.client.download(m.as_ref()).await,
                WaMedia::Video(m) => self.client.download(m.as_ref()).await,
                WaMedia::Audio(m) => self.client.download(m.as_ref()).await,
                WaMedia::Document(m) => self.client.download(m.as_ref()).await,
            };
            bytes.map_err(|e| anyhow!("WhatsApp media download failed: {e}"))
        }
    }

    /// Strip `device_sent`, `ephemeral` and `view_once` wrappers.
    fn unwrap_message(msg: &Message) -> &Message {
        msg.device_sent_message
            .as_ref()
            .and_then(|d| d.message.as_deref())
            .or_else(|| {
                msg.ephemeral_message
                    .as_ref()
                    .and_then(|e| e.message.as_deref())
            })
            .or_else(|| {
                msg.view_once_message
                    .as_ref()
                    .and_then(|v| v.message.as_deref())
            })
            .unwrap_or(msg)
    }

    pub(super) fn to_raw_message(msg: &Message, client: &Arc<wa_rs::Client>) -> RawMessage {
        let inner = unwrap_message(msg);
        let payload = |mimetype: Option<String>, media: WaMedia| {
            MediaPayload::new(
                mimetype,
                Arc::new(WaMediaSource {
                    client: Arc::clone(client),
                    media,
                }),
            )
        };

        RawMessage {
            conversation: inner.conversation.clone(),
            extended_text: inner
                .extended_text_message
                .as_ref()
                .and_then(|e| e.text.clone()),
            video: inner
                .video_message
                .as_ref()
                .map(|m| payload(m.mimetype.clone(), WaMedia::Video(m.clone()))),
            image: inner
                .image_message
                .as_ref()
                .map(|m| payload(m.mimetype.clone(), WaMedia::Image(m.clone()))),
            audio: inner
                .audio_message
                .as_ref()
                .map(|m| payload(m.mimetype.clone(), WaMedia::Audio(m.clone()))),
            document: inner
                .document_message
                .as_ref()
                .map(|m| payload(m.mimetype.clone(), WaMedia::Document(m.clone()))),
        }
    }

    pub(super) fn inbound(
        msg: &Message,
        info: &wa_rs_core::types::message::MessageInfo,
        client: &Arc<wa_rs::Client>,
    ) -> TransportEvent {
        let push_name = Some(info.push_name.clone()).filter(|n| !n.is_empty());
        TransportEvent::MessagesUpsert(MessagesUpsert {
            kind: UpsertKind::Notify,
            messages: vec![InboundMessage {
                key: MessageKey {
                    remote_jid: Some(info.source.chat.to_string()),
                    from_me: info.source.is_from_me,
                    id: info.id.clone(),
                },
                push_name,
                message: Some(to_raw_message(msg, client)),
            }],
        })
    }

    pub(super) fn open_events(me: Option<String>, push_name: Option<String>) -> [TransportEvent; 2] {
        [
            TransportEvent::CredsUpdate(Credentials {
                me: me.clone(),
                push_name,
                registered: true,
            }),
            TransportEvent::Connection(ConnectionUpdate::Open { me }),
        ]
    }

    pub(super) fn close_event(reason: DisconnectReason) -> TransportEvent {
        TransportEvent::Connection(ConnectionUpdate::Close { reason })
    }

    pub(super) struct WaHandle {
        pub client: Arc<wa_rs::Client>,
        pub bot_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    }

    #[async_trait]
    impl TransportHandle for WaHandle {
        async fn send_message(&self, jid: &str, payload: OutboundPayload) -> Result<String> {
            let to = jid
                .parse::<wa_rs_binary::jid::Jid>()
                .map_err(|e| anyhow!("Invalid WhatsApp JID `{jid}`: {e}"))?;

            let outgoing = match payload {
                OutboundPayload::Text(text) => Message {
                    conversation: Some(text),
                    ..Default::default()
                },
                OutboundPayload::Audio {
                    data,
                    mimetype,
                    ptt,
                } => {
                    let upload = self
                        .client
                        .upload(data, wa_rs::download::MediaType::Audio)
                        .await
                        .map_err(|e| anyhow!("WhatsApp audio upload failed: {e}"))?;
                    Message {
                        audio_message: Some(Box::new(proto::AudioMessage {
                            mimetype: Some(mimetype),
                            ptt: Some(ptt),
                            url: Some(upload.url),
                            direct_path: Some(upload.direct_path),
                            media_key: Some(upload.media_key),
                            file_enc_sha256: Some(upload.file_enc_sha256),
                            file_sha256: Some(upload.file_sha256),
                            file_length: Some(upload.file_length),
                            ..Default::default()
                        })),
                        ..Default::default()
                    }
                }
            };

            let message_id = self.client.send_message(to, outgoing).await?;
            tracing::debug!("WhatsApp Web: sent message to {jid} (id: {message_id})");
            Ok(message_id)
        }

        async fn close(&self) {
            if let Some(task) = self.bot_task.lock().take() {
                task.abort();
            }
        }
    }
}

#[cfg(feature = "whatsapp-web")]
#[async_trait]
impl Transport for WhatsAppWebTransport {
    fn name(&self) -> &str {
        "whatsapp-web"
    }

    async fn connect(
        &self,
        auth: &AuthState,
        events: mpsc::Sender<TransportEvent>,
    ) -> anyhow::Result<Arc<dyn TransportHandle>> {
        use super::wa_store::WaAuthStore;
        use super::DisconnectReason;
        use wa_rs::bot::Bot;
        use wa_rs::pair_code::PairCodeOptions;
        use wa_rs::store::DeviceStore;
        use wa_rs_core::types::events::Event;
        use wa_rs_tokio_transport::TokioWebSocketTransportFactory;
        use wa_rs_ureq_http::UreqHttpClient;

        let backend = Arc::new(WaAuthStore::new(auth.clone())?);
        if backend.exists().await? {
            tracing::info!("WhatsApp Web: found existing device in {}", auth.dir().display());
        } else {
            tracing::info!("WhatsApp Web: no linked device, pairing will be required");
        }

        let mut transport_factory = TokioWebSocketTransportFactory::new();
        if let Ok(ws_url) = std::env::var("WHATSAPP_WS_URL") {
            transport_factory = transport_factory.with_url(ws_url);
        }

        let device_store = Arc::clone(&backend);
        let mut builder = Bot::builder()
            .with_backend(backend)
            .with_transport_factory(transport_factory)
            .with_http_client(UreqHttpClient::new())
            .on_event(move |event, client| {
                let events = events.clone();
                let device_store = Arc::clone(&device_store);
                async move {
                    let mapped: Vec<TransportEvent> = match event {
                        Event::Message(msg, info) => vec![imp::inbound(&msg, &info, &client)],
                        Event::Connected(_) => {
                            let device = device_store.load().await.ok().flatten();
                            let me = device.as_ref().and_then(|d| d.pn.as_ref()).map(ToString::to_string);
                            let push_name = device
                                .map(|d| d.push_name)
                                .filter(|n| !n.is_empty());
                            imp::open_events(me, push_name).into()
                        }
                        Event::PairingQrCode { code, .. } => {
                            vec![TransportEvent::Connection(super::ConnectionUpdate::Qr(code))]
                        }
                        Event::PairingCode { code, .. } => {
                            tracing::info!("WhatsApp Web pair code received: {code}");
                            tracing::info!(
                                "Link your phone by entering this code in WhatsApp > Linked Devices"
                            );
                            Vec::new()
                        }
                        Event::LoggedOut(_) => vec![imp::close_event(DisconnectReason::LoggedOut)],
                        Event::Disconnected(_) => {
                            vec![imp::close_event(DisconnectReason::ConnectionLost)]
                        }
                        Event::StreamError(stream_error) => vec![imp::close_event(
                            DisconnectReason::Other(format!("stream error: {stream_error:?}")),
                        )],
                        _ => Vec::new(),
                    };

                    for event in mapped {
                        if events.send(event).await.is_err() {
                            tracing::debug!("WhatsApp Web: session no longer listening");
                            return;
                        }
                    }
                }
            });

        if let Some(ref phone) = self.pair_phone {
            tracing::info!("WhatsApp Web: pair-code flow enabled for configured phone number");
            builder = builder.with_pair_code(PairCodeOptions {
                phone_number: phone.clone(),
                ..Default::default()
            });
        }

        let mut bot = builder.build().await?;
        let client = bot.client();
        let bot_task = bot.run().await?;

        Ok(Arc::new(imp::WaHandle {
            client,
            bot_task: parking_lot::Mutex::new(Some(bot_task)),
        }))
    }
}

#[cfg(not(feature = "whatsapp-web"))]
#[async_trait]
impl Transport for WhatsAppWebTransport {
    fn name(&self) -> &str {
        "whatsapp-web"
    }

    async fn connect(
        &self,
        _auth: &AuthState,
        _events: mpsc::Sender<TransportEvent>,
    ) -> anyhow::Result<Arc<dyn TransportHandle>> {
        anyhow::bail!(
            "WhatsApp Web transport requires the 'whatsapp-web' feature. \
            Enable with: cargo build --features whatsapp-web"
        );
    }
}
