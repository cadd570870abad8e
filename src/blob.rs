//! Blob storage with signed, time-limited read URLs.
//!
//! [`LocalBlobStore`] keeps blobs under a root directory and signs URLs that
//! point back at the gateway's `/media/{path}` route:
//!
//! ```text
//! {base_url}/media/{path}?expires={unix}&signature={hex(hmac_sha256(key, "{path}\n{unix}"))}
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::path::{Component, Path, PathBuf};

type HmacSha256 = Hmac<Sha256>;

/// 2500-03-01T00:00:00Z, used for links stored in message history.
pub const SIGNED_URL_EXPIRY_UNIX: i64 = 16_730_323_200;

pub fn long_lived_expiry() -> DateTime<Utc> {
    Utc.timestamp_opt(SIGNED_URL_EXPIRY_UNIX, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    fn name(&self) -> &str;

    /// Store `bytes` at `path` (e.g. `images/525512345678-1700000000000.jpg`).
    async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<()>;

    /// Read URL for `path` valid until `expires`.
    async fn signed_url(&self, path: &str, expires: DateTime<Utc>) -> Result<String>;
}

pub struct LocalBlobStore {
    root: PathBuf,
    base_url: String,
    key: Vec<u8>,
}

const CONTENT_TYPE_DIR: &str = ".content-types";

impl LocalBlobStore {
    /// `signing_key` is hex when it decodes as hex, raw bytes otherwise.
    pub fn new(root: impl Into<PathBuf>, base_url: &str, signing_key: &str) -> Result<Self> {
        if signing_key.is_empty() {
            anyhow::bail!("media signing key is empty");
        }
        let key = hex::decode(signing_key).unwrap_or_else(|_| signing_key.as_bytes().to_vec());
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create media root: {}", root.display()))?;
        Ok(Self {
            root,
            base_url: base_url.trim_end_matches('/').to_string(),
            key,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn mac(&self, path: &str, expires: i64) -> Result<HmacSha256> {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).context("failed to initialize hmac signer")?;
        mac.update(path.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        Ok(mac)
    }

    pub fn sign(&self, path: &str, expires: i64) -> Result<String> {
        Ok(hex::encode(self.mac(path, expires)?.finalize().into_bytes()))
    }

    /// Check a signature and expiry for `path` at time `now`.
    pub fn verify(&self, path: &str, expires: i64, signature: &str, now: DateTime<Utc>) -> bool {
        if expires < now.timestamp() {
            return false;
        }
        let (Ok(sig), Ok(mac)) = (hex::decode(signature), self.mac(path, expires)) else {
            return false;
        };
        mac.verify_slice(&sig).is_ok()
    }

    /// Bytes and content type of a stored blob, `None` when absent.
    pub async fn read(&self, path: &str) -> Result<Option<(Vec<u8>, String)>> {
        let file = self.resolve(path)?;
        let bytes = match tokio::fs::read(&file).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", file.display())),
        };
        let content_type = match tokio::fs::read_to_string(self.content_type_path(path)?).await {
            Ok(ct) if !ct.trim().is_empty() => ct.trim().to_string(),
            _ => mime_guess::from_path(&file).first_or_octet_stream().to_string(),
        };
        Ok(Some((bytes, content_type)))
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        Ok(self.root.join(validate_blob_path(path)?))
    }

    fn content_type_path(&self, path: &str) -> Result<PathBuf> {
        Ok(self.root.join(CONTENT_TYPE_DIR).join(validate_blob_path(path)?))
    }
}

/// Blob paths are relative, `/`-separated and may not escape the root.
pub fn validate_blob_path(path: &str) -> Result<&Path> {
    let candidate = Path::new(path);
    let valid = !path.is_empty()
        && !path.contains('\\')
        && !path.starts_with(CONTENT_TYPE_DIR)
        && candidate
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if !valid {
        anyhow::bail!("invalid blob path: {path}");
    }
    Ok(candidate)
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().context("blob path has no parent")?;
    tokio::fs::create_dir_all(parent)
        .await
        .with_context(|| format!("Failed to create {}", parent.display()))?;
    let temp = parent.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
    tokio::fs::write(&temp, bytes)
        .await
        .with_context(|| format!("Failed to write {}", temp.display()))?;
    if let Err(e) = tokio::fs::rename(&temp, path).await {
        let _ = tokio::fs::remove_file(&temp).await;
        anyhow::bail!("Failed to move blob into place at {}: {e}", path.display());
    }
    Ok(())
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    fn name(&self) -> &str {
        "local"
    }

    async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        let file = self.resolve(path)?;
        write_atomic(&file, &bytes).await?;
        write_atomic(&self.content_type_path(path)?, content_type.as_bytes()).await?;
        tracing::debug!("Stored blob {path} ({} bytes, {content_type})", bytes.len());
        Ok(())
    }

    async fn signed_url(&self, path: &str, expires: DateTime<Utc>) -> Result<String> {
        validate_blob_path(path)?;
        let expires = expires.timestamp();
        let encoded: Vec<String> = path
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        Ok(format!(
            "{}/media/{}?expires={expires}&signature={}",
            self.base_url,
            encoded.join("/"),
            self.sign(path, expires)?
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(tmp: &TempDir) -> LocalBlobStore {
        LocalBlobStore::new(tmp.path().join("media"), "https://bridge.example.com/", "00ff").unwrap()
    }

    fn query_param<'a>(url: &'a str, name: &str) -> &'a str {
        url.split(['?', '&'])
            .find_map(|kv| kv.strip_prefix(&format!("{name}=")))
            .unwrap()
    }

    #[test]
    fn long_lived_expiry_is_march_2500() {
        assert_eq!(
            long_lived_expiry().to_rfc3339(),
            "2500-03-01T00:00:00+00:00"
        );
    }

    #[tokio::test]
    async fn put_then_read_keeps_content_type() {
        let tmp = TempDir::new().unwrap();
        let blobs = store(&tmp);
        blobs
            .put("audios/525512345678-1.m4a", vec![1, 2, 3], "audio/mp4")
            .await
            .unwrap();

        let (bytes, ct) = blobs.read("audios/525512345678-1.m4a").await.unwrap().unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
        assert_eq!(ct, "audio/mp4");
        assert!(blobs.read("audios/missing.m4a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn signed_url_verifies_and_rejects_tampering() {
        let tmp = TempDir::new().unwrap();
        let blobs = store(&tmp);
        let path = "images/525512345678-1700000000000.jpg";
        let url = blobs.signed_url(path, long_lived_expiry()).await.unwrap();

        assert!(url.starts_with("https://bridge.example.com/media/images/"));
        let expires: i64 = query_param(&url, "expires").parse().unwrap();
        let signature = query_param(&url, "signature");
        assert_eq!(expires, SIGNED_URL_EXPIRY_UNIX);

        let now = Utc::now();
        assert!(blobs.verify(path, expires, signature, now));
        assert!(!blobs.verify("images/other.jpg", expires, signature, now));
        assert!(!blobs.verify(path, expires - 1, signature, now));
        assert!(!blobs.verify(path, expires, "zz", now));
    }

    #[test]
    fn expired_signatures_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let blobs = store(&tmp);
        let now = Utc::now();
        let past = now.timestamp() - 10;
        let sig = blobs.sign("pdfs/a.pdf", past).unwrap();
        assert!(!blobs.verify("pdfs/a.pdf", past, &sig, now));
    }

    #[test]
    fn traversal_paths_are_rejected() {
        for bad in ["", "../etc/passwd", "/abs/file", "a/../../b", "a\\b", ".content-types/x"] {
            assert!(validate_blob_path(bad).is_err(), "{bad} should be rejected");
        }
        assert!(validate_blob_path("videos/5255-1.mp4").is_ok());
    }

    #[test]
    fn empty_signing_key_is_refused() {
        let tmp = TempDir::new().unwrap();
        assert!(LocalBlobStore::new(tmp.path(), "http://x", "").is_err());
    }
}
