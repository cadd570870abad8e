//! Outbound sends and their history mirror.

use crate::error::{BridgeError, BridgeResult};
use crate::media::{MediaMaterializer, OUTBOUND_AUDIO_CONTENT_TYPE};
use crate::phone;
use crate::session::Session;
use crate::store::{LeadStore, MediaType, MessageRecord, Sender};
use crate::transport::{OutboundPayload, TransportHandle};
use chrono::Utc;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendReceipt {
    pub message_id: String,
    /// Lead the message was mirrored under, if one matched.
    pub lead_id: Option<String>,
    pub media_url: Option<String>,
}

pub struct OutboundSender {
    session: Arc<Session>,
    store: Arc<dyn LeadStore>,
    media: Arc<MediaMaterializer>,
}

impl OutboundSender {
    pub fn new(
        session: Arc<Session>,
        store: Arc<dyn LeadStore>,
        media: Arc<MediaMaterializer>,
    ) -> Self {
        Self {
            session,
            store,
            media,
        }
    }

    fn handle(&self) -> BridgeResult<Arc<dyn TransportHandle>> {
        self.session
            .live_transport_handle()
            .ok_or(BridgeError::NotConnected)
    }

    pub async fn send_text(&self, phone: &str, text: &str) -> BridgeResult<SendReceipt> {
        let handle = self.handle()?;
        let phone = phone::normalize(phone)?;

        let message_id = handle
            .send_message(
                &phone::to_user_jid(&phone),
                OutboundPayload::Text(text.to_string()),
            )
            .await
            .map_err(|e| BridgeError::transport(format!("{e:#}")))?;
        tracing::info!("Sent text {message_id} to {phone}");

        let record = MessageRecord::text(text, Sender::Business, Utc::now());
        let lead_id = self.mirror(&phone, &record).await;
        Ok(SendReceipt {
            message_id,
            lead_id,
            media_url: None,
        })
    }

    /// Send the file at `file_path` as a voice note and keep a copy in blob
    /// storage for the history entry.
    pub async fn send_audio(&self, phone: &str, file_path: &Path) -> BridgeResult<SendReceipt> {
        let handle = self.handle()?;
        let phone = phone::normalize(phone)?;
        let data = tokio::fs::read(file_path).await?;

        let message_id = handle
            .send_message(
                &phone::to_user_jid(&phone),
                OutboundPayload::Audio {
                    data: data.clone(),
                    mimetype: OUTBOUND_AUDIO_CONTENT_TYPE.to_string(),
                    ptt: true,
                },
            )
            .await
            .map_err(|e| BridgeError::transport(format!("{e:#}")))?;
        tracing::info!(
            "Sent voice note {message_id} to {phone} ({} bytes)",
            data.len()
        );

        let stored = self.media.store_outbound_audio(&phone, data).await?;
        let record =
            MessageRecord::media(MediaType::Audio, stored.url.clone(), Sender::Business, Utc::now());
        let lead_id = self.mirror(&phone, &record).await;
        Ok(SendReceipt {
            message_id,
            lead_id,
            media_url: Some(stored.url),
        })
    }

    /// Append `record` under the lead for `phone`. The send already
    /// happened, so every failure here is logged and swallowed.
    async fn mirror(&self, phone: &str, record: &MessageRecord) -> Option<String> {
        let lead = match self.store.find_lead_by_phone(phone).await {
            Ok(Some(lead)) => lead,
            Ok(None) => {
                tracing::debug!("No lead for {phone}; outbound message not recorded");
                return None;
            }
            Err(e) => {
                tracing::warn!("Lead lookup for {phone} failed: {e:#}");
                return None;
            }
        };
        if let Err(e) = self.store.append_message(&lead, record).await {
            tracing::warn!("Failed to record outbound message for lead {}: {e:#}", lead.id);
            return None;
        }
        if let Err(e) = self.store.touch_lead(&lead, record.timestamp, 0).await {
            tracing::warn!("Failed to update lead {}: {e:#}", lead.id);
        }
        Some(lead.id)
    }
}
