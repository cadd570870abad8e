//! Multi-file credential directory.
//!
//! Layout under the auth directory:
//!
//! ```text
//! creds.json                 account identity (own JID, push name)
//! device.json                transport device keys (whatsapp-web)
//! <namespace>/<hex key>      one file per protocol key or session record
//! ```
//!
//! Every write goes through a temp file and a rename. Logging out wipes the
//! whole directory.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const CREDS_FILE: &str = "creds.json";

/// Account identity, persisted on every `CredsUpdate`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Own JID, e.g. `5215512345678:4@s.whatsapp.net`.
    #[serde(default)]
    pub me: Option<String>,
    #[serde(default)]
    pub push_name: Option<String>,
    #[serde(default)]
    pub registered: bool,
}

#[derive(Debug, Clone)]
pub struct AuthState {
    dir: PathBuf,
}

impl AuthState {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ensure(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).with_context(|| {
            format!("Failed to create auth directory: {}", self.dir.display())
        })
    }

    pub fn load_credentials(&self) -> Result<Option<Credentials>> {
        let path = self.dir.join(CREDS_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read(&path)
            .with_context(|| format!("Failed to read credentials: {}", path.display()))?;
        let creds = serde_json::from_slice(&raw)
            .with_context(|| format!("Failed to parse credentials: {}", path.display()))?;
        Ok(Some(creds))
    }

    pub fn save_credentials(&self, creds: &Credentials) -> Result<()> {
        let raw = serde_json::to_vec_pretty(creds).context("Failed to serialize credentials")?;
        self.write_file(&self.dir.join(CREDS_FILE), &raw)
    }

    /// Remove every entry in the auth directory. The directory itself stays.
    pub fn wipe(&self) -> Result<usize> {
        if !self.dir.exists() {
            return Ok(0);
        }
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to list auth directory: {}", self.dir.display()))?
        {
            let path = entry?.path();
            let result = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            result.with_context(|| format!("Failed to remove {}", path.display()))?;
            removed += 1;
        }
        Ok(removed)
    }

    pub fn is_empty(&self) -> bool {
        fs::read_dir(&self.dir).map_or(true, |mut entries| entries.next().is_none())
    }

    // ── Keyed records ────────────────────────────────────────────

    fn entry_path(&self, namespace: &str, key: &str) -> PathBuf {
        self.dir.join(namespace).join(hex::encode(key.as_bytes()))
    }

    pub fn read_entry(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.entry_path(namespace, key);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    pub fn write_entry(&self, namespace: &str, key: &str, value: &[u8]) -> Result<()> {
        let path = self.entry_path(namespace, key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        self.write_file(&path, value)
    }

    /// Returns whether an entry was removed.
    pub fn remove_entry(&self, namespace: &str, key: &str) -> Result<bool> {
        let path = self.entry_path(namespace, key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }

    /// All `(key, value)` pairs in a namespace. Unreadable names are skipped.
    pub fn list_entries(&self, namespace: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let dir = self.dir.join(namespace);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(key) = name
                .to_str()
                .and_then(|n| hex::decode(n).ok())
                .and_then(|b| String::from_utf8(b).ok())
            else {
                continue;
            };
            out.push((key, fs::read(entry.path())?));
        }
        Ok(out)
    }

    pub fn read_json<T: serde::de::DeserializeOwned>(
        &self,
        namespace: &str,
        key: &str,
    ) -> Result<Option<T>> {
        self.read_entry(namespace, key)?
            .map(|raw| serde_json::from_slice(&raw).context("Failed to parse auth record"))
            .transpose()
    }

    pub fn write_json<T: Serialize>(&self, namespace: &str, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_vec(value).context("Failed to serialize auth record")?;
        self.write_entry(namespace, key, &raw)
    }

    /// Top-level file that is not part of a namespace (e.g. `device.json`).
    pub fn read_file(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.dir.join(name);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    pub fn write_named(&self, name: &str, value: &[u8]) -> Result<()> {
        self.write_file(&self.dir.join(name), value)
    }

    fn write_file(&self, path: &Path, value: &[u8]) -> Result<()> {
        let parent = path.parent().unwrap_or(&self.dir);
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
        let temp_path = parent.join(format!(".tmp-{}", uuid::Uuid::new_v4()));

        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .with_context(|| format!("Failed to create {}", temp_path.display()))?;
        file.write_all(value)?;
        file.sync_all()?;
        drop(file);

        if let Err(e) = fs::rename(&temp_path, path) {
            let _ = fs::remove_file(&temp_path);
            anyhow::bail!("Failed to replace {}: {e}", path.display());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn state() -> (TempDir, AuthState) {
        let tmp = TempDir::new().unwrap();
        let auth = AuthState::new(tmp.path().join("auth"));
        auth.ensure().unwrap();
        (tmp, auth)
    }

    #[test]
    fn credentials_round_trip() {
        let (_tmp, auth) = state();
        assert!(auth.load_credentials().unwrap().is_none());

        let creds = Credentials {
            me: Some("5215512345678:4@s.whatsapp.net".into()),
            push_name: Some("Ventas".into()),
            registered: true,
        };
        auth.save_credentials(&creds).unwrap();
        assert_eq!(auth.load_credentials().unwrap(), Some(creds));
    }

    #[test]
    fn keyed_entries_survive_arbitrary_key_characters() {
        let (_tmp, auth) = state();
        auth.write_entry("session", "5215512345678.0:1/x", b"rec").unwrap();
        assert_eq!(
            auth.read_entry("session", "5215512345678.0:1/x").unwrap(),
            Some(b"rec".to_vec())
        );

        let listed = auth.list_entries("session").unwrap();
        assert_eq!(listed, vec![("5215512345678.0:1/x".to_string(), b"rec".to_vec())]);

        assert!(auth.remove_entry("session", "5215512345678.0:1/x").unwrap());
        assert!(!auth.remove_entry("session", "5215512345678.0:1/x").unwrap());
    }

    #[test]
    fn wipe_removes_files_and_namespaces() {
        let (_tmp, auth) = state();
        auth.save_credentials(&Credentials::default()).unwrap();
        auth.write_entry("prekey", "1", b"k").unwrap();
        auth.write_named("device.json", b"{}").unwrap();

        assert_eq!(auth.wipe().unwrap(), 3);
        assert!(auth.is_empty());
        assert!(auth.dir().exists());
        assert!(auth.load_credentials().unwrap().is_none());
    }

    #[test]
    fn wipe_of_missing_directory_is_noop() {
        let tmp = TempDir::new().unwrap();
        let auth = AuthState::new(tmp.path().join("never-created"));
        assert_eq!(auth.wipe().unwrap(), 0);
    }
}
