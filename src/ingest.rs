//! Inbound message ingestion.
//!
//! Consumes the batches the session manager forwards and writes each entry
//! as a message under its lead. Entries are independent: a failure is logged
//! and counted, and the rest of the batch continues.

use crate::error::{BridgeError, BridgeResult};
use crate::leads::{LeadResolver, Resolution};
use crate::media::{MediaKind, MediaMaterializer, PDF_MIMETYPE};
use crate::phone;
use crate::store::{LeadStore, MessageRecord, Sender};
use crate::transport::{InboundMessage, MediaPayload, MessagesUpsert, RawMessage, UpsertKind};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;

const COMPONENT: &str = "ingest";

#[derive(Debug, Clone)]
pub enum Content {
    Media(MediaKind, MediaPayload),
    Text(String),
}

/// Pick what an entry carries: video, image, audio, PDF document, then text.
/// Documents of any other type are read as text, usually empty.
pub fn classify(message: Option<&RawMessage>) -> Content {
    let Some(raw) = message else {
        return Content::Text(String::new());
    };
    if let Some(video) = &raw.video {
        return Content::Media(MediaKind::Video, video.clone());
    }
    if let Some(image) = &raw.image {
        return Content::Media(MediaKind::Image, image.clone());
    }
    if let Some(audio) = &raw.audio {
        return Content::Media(MediaKind::Audio, audio.clone());
    }
    if let Some(doc) = &raw.document {
        if doc.mimetype.as_deref() == Some(PDF_MIMETYPE) {
            return Content::Media(MediaKind::Pdf, doc.clone());
        }
    }
    Content::Text(
        raw.conversation
            .clone()
            .or_else(|| raw.extended_text.clone())
            .unwrap_or_default(),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoSender,
    Group,
    Broadcast,
    AutoSaveDisabled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOutcome {
    Persisted { lead_id: String, message_id: String },
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub persisted: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct IngestionPipeline {
    store: Arc<dyn LeadStore>,
    resolver: LeadResolver,
    media: Arc<MediaMaterializer>,
}

impl IngestionPipeline {
    pub fn new(store: Arc<dyn LeadStore>, media: Arc<MediaMaterializer>) -> Self {
        Self {
            resolver: LeadResolver::new(store.clone()),
            store,
            media,
        }
    }

    /// Drain `rx` until every sender is dropped.
    pub async fn run(&self, mut rx: mpsc::Receiver<MessagesUpsert>) {
        crate::health::mark_component_ok(COMPONENT);
        while let Some(batch) = rx.recv().await {
            if batch.kind != UpsertKind::Notify {
                tracing::debug!(
                    "Ignoring {:?} batch of {} message(s)",
                    batch.kind,
                    batch.messages.len()
                );
                continue;
            }
            let report = self.process_batch(&batch).await;
            tracing::debug!(
                "Ingested batch: {} persisted, {} skipped, {} failed",
                report.persisted,
                report.skipped,
                report.failed
            );
            if report.failed > 0 {
                crate::health::mark_component_error(
                    COMPONENT,
                    format!("{} entries failed in last batch", report.failed),
                );
            } else {
                crate::health::mark_component_ok(COMPONENT);
            }
        }
        tracing::info!("Inbound channel closed; ingestion stopped");
    }

    pub async fn process_batch(&self, batch: &MessagesUpsert) -> BatchReport {
        let mut report = BatchReport::default();
        for entry in &batch.messages {
            match self.process_entry(entry).await {
                Ok(EntryOutcome::Persisted { .. }) => report.persisted += 1,
                Ok(EntryOutcome::Skipped(reason)) => {
                    tracing::debug!("Skipped message {}: {reason:?}", entry.key.id);
                    report.skipped += 1;
                }
                Err(e) => {
                    tracing::warn!("Failed to ingest message {}: {e}", entry.key.id);
                    report.failed += 1;
                }
            }
        }
        report
    }

    pub async fn process_entry(&self, entry: &InboundMessage) -> BridgeResult<EntryOutcome> {
        let Some(jid) = entry.key.remote_jid.as_deref().filter(|j| !j.is_empty()) else {
            return Ok(EntryOutcome::Skipped(SkipReason::NoSender));
        };
        if phone::is_group_jid(jid) {
            return Ok(EntryOutcome::Skipped(SkipReason::Group));
        }
        if phone::is_broadcast_jid(jid) {
            return Ok(EntryOutcome::Skipped(SkipReason::Broadcast));
        }

        let sender = if entry.key.from_me {
            Sender::Business
        } else {
            Sender::Lead
        };
        let phone = phone::lead_key(phone::jid_user(jid));
        let timestamp = Utc::now();

        // Media is stored before the lead lookup so a decode failure leaves
        // no trace in the record store.
        let record = match classify(entry.message.as_ref()) {
            Content::Media(kind, payload) => {
                let stored = self.media.materialize(&phone, kind, &payload).await?;
                MessageRecord::media(kind.media_type(), stored.url, sender, timestamp)
            }
            Content::Text(text) => MessageRecord::text(text, sender, timestamp),
        };

        let lead = match self
            .resolver
            .resolve_or_create(&phone, entry.push_name.as_deref())
            .await?
        {
            Resolution::Existing(lead) | Resolution::Created(lead) => lead,
            Resolution::Skipped => {
                return Ok(EntryOutcome::Skipped(SkipReason::AutoSaveDisabled));
            }
        };

        let message_id = self
            .store
            .append_message(&lead, &record)
            .await
            .map_err(|e| BridgeError::store(format!("{e:#}")))?;
        let unread = u32::from(sender == Sender::Lead);
        self.store
            .touch_lead(&lead, timestamp, unread)
            .await
            .map_err(|e| BridgeError::store(format!("{e:#}")))?;

        Ok(EntryOutcome::Persisted {
            lead_id: lead.id,
            message_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::LocalBlobStore;
    use crate::store::{AppConfig, InMemoryLeadStore, MediaType};
    use crate::transport::{MediaSource, MessageKey};
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct Broken;

    #[async_trait]
    impl MediaSource for Broken {
        async fn fetch(&self) -> anyhow::Result<Vec<u8>> {
            anyhow::bail!("cdn returned 404")
        }
    }

    fn pipeline(tmp: &TempDir, auto_save: bool) -> (Arc<InMemoryLeadStore>, IngestionPipeline) {
        let store = Arc::new(InMemoryLeadStore::with_app_config(AppConfig {
            auto_save_leads: auto_save,
            default_trigger: None,
        }));
        let blobs =
            Arc::new(LocalBlobStore::new(tmp.path(), "http://127.0.0.1:3000", "beef").unwrap());
        let media = Arc::new(MediaMaterializer::new(blobs));
        (store.clone(), IngestionPipeline::new(store, media))
    }

    fn entry(jid: &str, from_me: bool, raw: RawMessage) -> InboundMessage {
        InboundMessage {
            key: MessageKey {
                remote_jid: Some(jid.into()),
                from_me,
                id: "ABC".into(),
            },
            push_name: None,
            message: Some(raw),
        }
    }

    fn text(body: &str) -> RawMessage {
        RawMessage {
            conversation: Some(body.into()),
            ..RawMessage::default()
        }
    }

    fn notify(messages: Vec<InboundMessage>) -> MessagesUpsert {
        MessagesUpsert {
            messages,
            kind: UpsertKind::Notify,
        }
    }

    #[test]
    fn classification_priority() {
        let both = RawMessage {
            conversation: Some("caption".into()),
            image: Some(MediaPayload::inline("image/jpeg", vec![1])),
            video: Some(MediaPayload::inline("video/mp4", vec![2])),
            ..RawMessage::default()
        };
        assert!(matches!(classify(Some(&both)), Content::Media(MediaKind::Video, _)));

        let extended = RawMessage {
            extended_text: Some("link".into()),
            ..RawMessage::default()
        };
        assert!(matches!(classify(Some(&extended)), Content::Text(t) if t == "link"));
        assert!(matches!(classify(None), Content::Text(t) if t.is_empty()));
    }

    #[test]
    fn non_pdf_documents_fall_back_to_text() {
        let doc = RawMessage {
            document: Some(MediaPayload::inline("application/msword", vec![1])),
            ..RawMessage::default()
        };
        assert!(matches!(classify(Some(&doc)), Content::Text(t) if t.is_empty()));

        let pdf = RawMessage {
            document: Some(MediaPayload::inline("application/pdf", vec![1])),
            ..RawMessage::default()
        };
        assert!(matches!(classify(Some(&pdf)), Content::Media(MediaKind::Pdf, _)));
    }

    #[tokio::test]
    async fn first_contact_creates_lead_message_and_unread() {
        let tmp = TempDir::new().unwrap();
        let (store, p) = pipeline(&tmp, true);
        let report = p
            .process_batch(&notify(vec![entry(
                "5215512345678@s.whatsapp.net",
                false,
                text("hola"),
            )]))
            .await;
        assert_eq!(report, BatchReport { persisted: 1, skipped: 0, failed: 0 });

        let leads = store.leads();
        assert_eq!(leads.len(), 1);
        assert_eq!(leads[0].etiquetas, vec!["NuevoLead".to_string()]);
        assert_eq!(leads[0].unread_count, 1);

        let messages = store.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].record.content, "hola");
        assert_eq!(messages[0].record.media_type, None);
        assert_eq!(messages[0].record.sender, Sender::Lead);
    }

    #[tokio::test]
    async fn auto_save_off_persists_nothing() {
        let tmp = TempDir::new().unwrap();
        let (store, p) = pipeline(&tmp, false);
        let report = p
            .process_batch(&notify(vec![entry(
                "5215512345678@s.whatsapp.net",
                false,
                text("hola"),
            )]))
            .await;
        assert_eq!(report.skipped, 1);
        assert!(store.leads().is_empty());
        assert!(store.messages().is_empty());
    }

    #[tokio::test]
    async fn group_and_broadcast_are_dropped() {
        let tmp = TempDir::new().unwrap();
        let (store, p) = pipeline(&tmp, true);
        let outcome = p
            .process_entry(&entry("120363@g.us", false, text("hola")))
            .await
            .unwrap();
        assert_eq!(outcome, EntryOutcome::Skipped(SkipReason::Group));
        let outcome = p
            .process_entry(&entry("status@broadcast", false, text("hola")))
            .await
            .unwrap();
        assert_eq!(outcome, EntryOutcome::Skipped(SkipReason::Broadcast));
        let outcome = p
            .process_entry(&InboundMessage::default())
            .await
            .unwrap();
        assert_eq!(outcome, EntryOutcome::Skipped(SkipReason::NoSender));
        assert!(store.leads().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_first_contacts_never_lose_a_message() {
        use crate::store::SqliteLeadStore;

        let tmp = TempDir::new().unwrap();
        let store = Arc::new(SqliteLeadStore::open(&tmp.path().join("leads.db")).unwrap());
        store
            .put_app_config(&AppConfig {
                auto_save_leads: true,
                default_trigger: None,
            })
            .await
            .unwrap();
        let blobs = Arc::new(
            LocalBlobStore::new(tmp.path().join("media"), "http://127.0.0.1:3000", "beef").unwrap(),
        );
        let p = IngestionPipeline::new(store.clone(), Arc::new(MediaMaterializer::new(blobs)));

        let first = entry("525512345678@s.whatsapp.net", false, text("hola"));
        let second = entry("525512345678@s.whatsapp.net", false, text("¿hay alguien?"));
        let (a, b) = tokio::join!(p.process_entry(&first), p.process_entry(&second));

        let mut lead_ids = Vec::new();
        for outcome in [a.unwrap(), b.unwrap()] {
            let lead_id = match outcome {
                EntryOutcome::Persisted { lead_id, .. } => lead_id,
                other => panic!("entry was not persisted: {other:?}"),
            };
            if !lead_ids.contains(&lead_id) {
                lead_ids.push(lead_id);
            }
        }
        assert!((1..=2).contains(&lead_ids.len()));

        let mut messages = 0;
        let mut unread = 0;
        for id in &lead_ids {
            messages += store.list_messages(id).await.unwrap().len();
            unread += store.get_lead(id).await.unwrap().unwrap().unread_count;
        }
        assert_eq!(messages, 2);
        assert_eq!(unread, 2);
        assert!(store.find_lead_by_phone("525512345678").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn own_messages_are_business_without_unread() {
        let tmp = TempDir::new().unwrap();
        let (store, p) = pipeline(&tmp, true);
        p.process_entry(&entry("525512345678@s.whatsapp.net", true, text("gracias")))
            .await
            .unwrap();
        assert_eq!(store.messages()[0].record.sender, Sender::Business);
        assert_eq!(store.leads()[0].unread_count, 0);
    }

    #[tokio::test]
    async fn image_is_stored_with_url_and_empty_content() {
        let tmp = TempDir::new().unwrap();
        let (store, p) = pipeline(&tmp, true);
        let raw = RawMessage {
            image: Some(MediaPayload::inline("image/jpeg", vec![0xff, 0xd8])),
            ..RawMessage::default()
        };
        p.process_entry(&entry("525512345678@s.whatsapp.net", false, raw))
            .await
            .unwrap();

        let msg = &store.messages()[0].record;
        assert_eq!(msg.media_type, Some(MediaType::Image));
        assert!(msg.content.is_empty());
        assert!(msg.media_url.as_deref().unwrap().contains("/media/images/525512345678-"));
        assert!(tmp.path().join("images").read_dir().unwrap().next().is_some());
    }

    #[tokio::test]
    async fn failed_media_only_skips_that_entry() {
        let tmp = TempDir::new().unwrap();
        let (store, p) = pipeline(&tmp, true);
        let broken = RawMessage {
            audio: Some(MediaPayload::new(Some("audio/ogg".into()), Arc::new(Broken))),
            ..RawMessage::default()
        };
        let report = p
            .process_batch(&notify(vec![
                entry("525512345678@s.whatsapp.net", false, broken),
                entry("525512345678@s.whatsapp.net", false, text("sigues ahí?")),
            ]))
            .await;
        assert_eq!(report, BatchReport { persisted: 1, skipped: 0, failed: 1 });
        assert_eq!(store.messages().len(), 1);
        assert_eq!(store.messages()[0].record.content, "sigues ahí?");
    }

    #[tokio::test]
    async fn config_outage_counts_as_failure_and_creates_nothing() {
        let tmp = TempDir::new().unwrap();
        let (store, p) = pipeline(&tmp, true);
        store.fail_app_config(Some("unavailable"));
        let err = p
            .process_entry(&entry("525512345678@s.whatsapp.net", false, text("hola")))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::ConfigUnavailable(_)));
        assert!(store.leads().is_empty());
    }

    #[tokio::test]
    async fn run_ignores_append_batches_and_stops_on_close() {
        let tmp = TempDir::new().unwrap();
        let (store, p) = pipeline(&tmp, true);
        let (tx, rx) = mpsc::channel(4);
        tx.send(MessagesUpsert {
            messages: vec![entry("525512345678@s.whatsapp.net", false, text("viejo"))],
            kind: UpsertKind::Append,
        })
        .await
        .unwrap();
        tx.send(notify(vec![entry(
            "525512345678@s.whatsapp.net",
            false,
            text("nuevo"),
        )]))
        .await
        .unwrap();
        drop(tx);

        p.run(rx).await;
        let messages = store.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].record.content, "nuevo");
    }
}
