//! Media classification and storage.
//!
//! Inbound media lands at `{category}/{phone}-{unix_millis}.{ext}`; outbound
//! voice notes at `audios/{phone}-{unix_millis}.m4a`. Every stored blob gets
//! a signed URL that stays valid until 2500-03-01.

use crate::blob::{long_lived_expiry, BlobStore};
use crate::error::{BridgeError, BridgeResult};
use crate::store::MediaType;
use crate::transport::MediaPayload;
use chrono::Utc;
use std::sync::Arc;

pub const OUTBOUND_AUDIO_CONTENT_TYPE: &str = "audio/mp4";
pub const PDF_MIMETYPE: &str = "application/pdf";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Image,
    Audio,
    Pdf,
}

impl MediaKind {
    pub fn category(self) -> &'static str {
        match self {
            Self::Video => "videos",
            Self::Image => "images",
            Self::Audio => "audios",
            Self::Pdf => "pdfs",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Video => "mp4",
            Self::Image => "jpg",
            Self::Audio => "ogg",
            Self::Pdf => "pdf",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::Video => "video/mp4",
            Self::Image => "image/jpeg",
            Self::Audio => "audio/ogg",
            Self::Pdf => PDF_MIMETYPE,
        }
    }

    pub fn media_type(self) -> MediaType {
        match self {
            Self::Video => MediaType::Video,
            Self::Image => MediaType::Image,
            Self::Audio => MediaType::Audio,
            Self::Pdf => MediaType::Pdf,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterializedMedia {
    pub path: String,
    pub url: String,
}

/// Blob key for one piece of media. The key is derived from sender and
/// millisecond only, so two media of one kind from one phone in the same
/// millisecond share a key and the later write replaces the earlier blob.
pub fn blob_path(category: &str, phone: &str, unix_millis: i64, extension: &str) -> String {
    format!("{category}/{phone}-{unix_millis}.{extension}")
}

/// Downloads media and stores it under [`blob_path`] keys. Both message
/// records of a same-millisecond collision end up pointing at the second
/// upload.
pub struct MediaMaterializer {
    blobs: Arc<dyn BlobStore>,
}

impl MediaMaterializer {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    /// Fetch an inbound payload and store it. Fetch failures are
    /// [`BridgeError::MediaDecode`]; storage failures [`BridgeError::Upload`].
    pub async fn materialize(
        &self,
        phone: &str,
        kind: MediaKind,
        payload: &MediaPayload,
    ) -> BridgeResult<MaterializedMedia> {
        let bytes = payload
            .source
            .fetch()
            .await
            .map_err(|e| BridgeError::MediaDecode(format!("{e:#}")))?;

        let path = blob_path(
            kind.category(),
            phone,
            Utc::now().timestamp_millis(),
            kind.extension(),
        );
        self.upload(path, bytes, kind.content_type()).await
    }

    /// Store a voice note that was just sent to `phone`.
    pub async fn store_outbound_audio(
        &self,
        phone: &str,
        bytes: Vec<u8>,
    ) -> BridgeResult<MaterializedMedia> {
        let path = blob_path("audios", phone, Utc::now().timestamp_millis(), "m4a");
        self.upload(path, bytes, OUTBOUND_AUDIO_CONTENT_TYPE).await
    }

    async fn upload(
        &self,
        path: String,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> BridgeResult<MaterializedMedia> {
        self.blobs
            .put(&path, bytes, content_type)
            .await
            .map_err(|e| BridgeError::Upload(format!("{path}: {e:#}")))?;
        let url = self
            .blobs
            .signed_url(&path, long_lived_expiry())
            .await
            .map_err(|e| BridgeError::Upload(format!("{path}: {e:#}")))?;
        Ok(MaterializedMedia { path, url })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::LocalBlobStore;
    use crate::transport::MediaSource;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct Broken;

    #[async_trait]
    impl MediaSource for Broken {
        async fn fetch(&self) -> anyhow::Result<Vec<u8>> {
            anyhow::bail!("media key mismatch")
        }
    }

    fn materializer(tmp: &TempDir) -> (Arc<LocalBlobStore>, MediaMaterializer) {
        let blobs = Arc::new(
            LocalBlobStore::new(tmp.path(), "http://127.0.0.1:3000", "abcd").unwrap(),
        );
        (blobs.clone(), MediaMaterializer::new(blobs))
    }

    #[test]
    fn kind_table_matches_storage_layout() {
        let rows: Vec<_> = [MediaKind::Video, MediaKind::Image, MediaKind::Audio, MediaKind::Pdf]
            .into_iter()
            .map(|k| (k.category(), k.extension(), k.content_type(), k.media_type().as_str()))
            .collect();
        assert_eq!(
            rows,
            vec![
                ("videos", "mp4", "video/mp4", "video"),
                ("images", "jpg", "image/jpeg", "image"),
                ("audios", "ogg", "audio/ogg", "audio"),
                ("pdfs", "pdf", "application/pdf", "pdf"),
            ]
        );
    }

    #[test]
    fn blob_path_layout() {
        assert_eq!(
            blob_path("images", "525512345678", 1_700_000_000_000, "jpg"),
            "images/525512345678-1700000000000.jpg"
        );
    }

    #[test]
    fn blob_path_is_keyed_by_phone_and_millisecond_only() {
        let a = blob_path("audios", "525512345678", 1_700_000_000_000, "ogg");
        assert_eq!(a, blob_path("audios", "525512345678", 1_700_000_000_000, "ogg"));
        assert_ne!(a, blob_path("audios", "525512345678", 1_700_000_000_001, "ogg"));
        assert_ne!(a, blob_path("audios", "525500000000", 1_700_000_000_000, "ogg"));
    }

    #[tokio::test]
    async fn materialize_stores_bytes_and_signs_url() {
        let tmp = TempDir::new().unwrap();
        let (blobs, m) = materializer(&tmp);
        let payload = MediaPayload::inline("video/mp4", vec![9; 16]);

        let stored = m
            .materialize("5215512345678", MediaKind::Video, &payload)
            .await
            .unwrap();
        assert!(stored.path.starts_with("videos/5215512345678-"));
        assert!(stored.path.ends_with(".mp4"));
        assert!(stored.url.contains("/media/videos/5215512345678-"));
        assert!(stored.url.contains("signature="));

        let (bytes, ct) = blobs.read(&stored.path).await.unwrap().unwrap();
        assert_eq!(bytes.len(), 16);
        assert_eq!(ct, "video/mp4");
    }

    #[tokio::test]
    async fn fetch_failure_is_media_decode() {
        let tmp = TempDir::new().unwrap();
        let (_blobs, m) = materializer(&tmp);
        let payload = MediaPayload::new(Some("image/jpeg".into()), Arc::new(Broken));
        let err = m
            .materialize("525512345678", MediaKind::Image, &payload)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::MediaDecode(ref msg) if msg.contains("media key")));
    }

    #[tokio::test]
    async fn outbound_audio_uses_m4a_and_mp4_content_type() {
        let tmp = TempDir::new().unwrap();
        let (blobs, m) = materializer(&tmp);
        let stored = m
            .store_outbound_audio("525512345678", vec![1, 2])
            .await
            .unwrap();
        assert!(stored.path.starts_with("audios/525512345678-"));
        assert!(stored.path.ends_with(".m4a"));
        assert_eq!(blobs.read(&stored.path).await.unwrap().unwrap().1, "audio/mp4");
    }
}
