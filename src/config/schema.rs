use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory (credentials, database, media) - computed, not serialized
    #[serde(skip)]
    pub data_dir: PathBuf,
    /// Path to config.toml - computed, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub media: MediaConfig,

    #[serde(default)]
    pub reliability: ReliabilityConfig,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
}

// ── Gateway ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Gateway port (default: 3000)
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    /// Gateway host (default: 127.0.0.1)
    #[serde(default = "default_gateway_host")]
    pub host: String,
    /// Max accepted JSON body size.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_gateway_port() -> u16 {
    3000
}

fn default_gateway_host() -> String {
    "127.0.0.1".into()
}

fn default_max_body_bytes() -> usize {
    65_536
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            host: default_gateway_host(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

// ── Session ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Identifier this server registers under in the status collection.
    #[serde(default = "default_session_id")]
    pub session_id: String,
    /// Public URL of this server, published with the heartbeat.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Transport backend: `whatsapp-web` or `loopback`.
    #[serde(default = "default_transport")]
    pub transport: String,
    /// Credential directory; defaults to `<data_dir>/auth`. Wiped on logout.
    #[serde(default)]
    pub auth_dir: Option<PathBuf>,
    /// Phone number for pair-code linking instead of QR (whatsapp-web only).
    #[serde(default)]
    pub pair_phone: Option<String>,
    /// Capacity of the inbound batch queue between transport and ingestion.
    #[serde(default = "default_inbound_queue_capacity")]
    pub inbound_queue_capacity: usize,
}

fn default_session_id() -> String {
    "01".into()
}

fn default_transport() -> String {
    "whatsapp-web".into()
}

fn default_inbound_queue_capacity() -> usize {
    256
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_id: default_session_id(),
            base_url: None,
            transport: default_transport(),
            auth_dir: None,
            pair_phone: None,
            inbound_queue_capacity: default_inbound_queue_capacity(),
        }
    }
}

// ── Record store ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// `sqlite` (default) or `memory`
    #[serde(default = "default_store_backend")]
    pub backend: String,
    /// SQLite file; defaults to `<data_dir>/leads.db`.
    #[serde(default)]
    pub db_path: Option<PathBuf>,
}

fn default_store_backend() -> String {
    "sqlite".into()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            db_path: None,
        }
    }
}

// ── Media / blobs ────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Blob root; defaults to `<data_dir>/media`.
    #[serde(default)]
    pub root: Option<PathBuf>,
    /// Base URL used in signed links; defaults to `session.base_url`, then
    /// the gateway's own address.
    #[serde(default)]
    pub public_base_url: Option<String>,
    /// Hex-encoded HMAC key for signed links. Generated on first run.
    #[serde(default)]
    pub signing_key: String,
}

// ── Reliability ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReliabilityConfig {
    /// First delay before reconnecting a dropped WhatsApp session.
    #[serde(default = "default_reconnect_initial_backoff_ms")]
    pub reconnect_initial_backoff_ms: u64,
    /// Upper bound for the reconnect delay.
    #[serde(default = "default_reconnect_max_backoff_ms")]
    pub reconnect_max_backoff_ms: u64,
    /// Initial backoff for daemon component restarts.
    #[serde(default = "default_component_backoff_secs")]
    pub component_initial_backoff_secs: u64,
    /// Max backoff for daemon component restarts.
    #[serde(default = "default_component_backoff_max_secs")]
    pub component_max_backoff_secs: u64,
}

fn default_reconnect_initial_backoff_ms() -> u64 {
    1_000
}

fn default_reconnect_max_backoff_ms() -> u64 {
    60_000
}

fn default_component_backoff_secs() -> u64 {
    2
}

fn default_component_backoff_max_secs() -> u64 {
    60
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            reconnect_initial_backoff_ms: default_reconnect_initial_backoff_ms(),
            reconnect_max_backoff_ms: default_reconnect_max_backoff_ms(),
            component_initial_backoff_secs: default_component_backoff_secs(),
            component_max_backoff_secs: default_component_backoff_max_secs(),
        }
    }
}

// ── Heartbeat ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_heartbeat_interval_minutes")]
    pub interval_minutes: u32,
}

fn default_true() -> bool {
    true
}

fn default_heartbeat_interval_minutes() -> u32 {
    5
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_minutes: default_heartbeat_interval_minutes(),
        }
    }
}

// ── Loading / saving ─────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        let home =
            UserDirs::new().map_or_else(|| PathBuf::from("."), |u| u.home_dir().to_path_buf());
        let data_dir = home.join(".leadbridge");

        Self {
            config_path: data_dir.join("config.toml"),
            data_dir,
            gateway: GatewayConfig::default(),
            session: SessionConfig::default(),
            store: StoreConfig::default(),
            media: MediaConfig::default(),
            reliability: ReliabilityConfig::default(),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

impl Config {
    /// Load `config.toml` from `$LEADBRIDGE_HOME` (or `~/.leadbridge`),
    /// creating it with defaults on first run.
    pub fn load_or_init() -> Result<Self> {
        let data_dir = match std::env::var("LEADBRIDGE_HOME") {
            Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => UserDirs::new()
                .map(|u| u.home_dir().to_path_buf())
                .context("Could not find home directory")?
                .join(".leadbridge"),
        };

        let mut config = Self::load_or_init_in(&data_dir)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Same as [`Config::load_or_init`] against an explicit directory and
    /// without environment overrides.
    pub fn load_or_init_in(data_dir: &Path) -> Result<Self> {
        let config_path = data_dir.join("config.toml");

        if !data_dir.exists() {
            fs::create_dir_all(data_dir).context("Failed to create data directory")?;
        }

        if config_path.exists() {
            let contents =
                fs::read_to_string(&config_path).context("Failed to read config file")?;
            let mut config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            // Set computed paths that are skipped during serialization
            config.config_path = config_path;
            config.data_dir = data_dir.to_path_buf();
            if config.media.signing_key.is_empty() {
                config.media.signing_key = generate_signing_key();
                config.save()?;
            }
            Ok(config)
        } else {
            let mut config = Config {
                config_path,
                data_dir: data_dir.to_path_buf(),
                ..Config::default()
            };
            config.media.signing_key = generate_signing_key();
            config.save()?;
            Ok(config)
        }
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        // Session id: SESSION_ID
        if let Ok(id) = std::env::var("SESSION_ID") {
            if !id.is_empty() {
                self.session.session_id = id;
            }
        }

        // Public URL: CHILD_BASE_URL
        if let Ok(url) = std::env::var("CHILD_BASE_URL") {
            if !url.is_empty() {
                self.session.base_url = Some(url);
            }
        }

        // Gateway port: LEADBRIDGE_GATEWAY_PORT or PORT
        if let Ok(port_str) =
            std::env::var("LEADBRIDGE_GATEWAY_PORT").or_else(|_| std::env::var("PORT"))
        {
            if let Ok(port) = port_str.parse::<u16>() {
                self.gateway.port = port;
            }
        }

        // Gateway host: LEADBRIDGE_GATEWAY_HOST or HOST
        if let Ok(host) =
            std::env::var("LEADBRIDGE_GATEWAY_HOST").or_else(|_| std::env::var("HOST"))
        {
            if !host.is_empty() {
                self.gateway.host = host;
            }
        }

        if let Ok(dir) = std::env::var("LEADBRIDGE_AUTH_DIR") {
            if !dir.is_empty() {
                self.session.auth_dir = Some(PathBuf::from(dir));
            }
        }

        if let Ok(transport) = std::env::var("LEADBRIDGE_TRANSPORT") {
            if !transport.is_empty() {
                self.session.transport = transport;
            }
        }

        if let Ok(path) = std::env::var("LEADBRIDGE_DB_PATH") {
            if !path.is_empty() {
                self.store.db_path = Some(PathBuf::from(path));
            }
        }

        if let Ok(dir) = std::env::var("LEADBRIDGE_MEDIA_DIR") {
            if !dir.is_empty() {
                self.media.root = Some(PathBuf::from(dir));
            }
        }

        if let Ok(key) = std::env::var("LEADBRIDGE_SIGNING_KEY") {
            if !key.is_empty() {
                self.media.signing_key = key;
            }
        }
    }

    pub fn auth_dir(&self) -> PathBuf {
        self.session
            .auth_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("auth"))
    }

    pub fn db_path(&self) -> PathBuf {
        self.store
            .db_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("leads.db"))
    }

    pub fn media_root(&self) -> PathBuf {
        self.media
            .root
            .clone()
            .unwrap_or_else(|| self.data_dir.join("media"))
    }

    /// Base URL that signed media links are rooted at.
    pub fn media_base_url(&self) -> String {
        self.media
            .public_base_url
            .clone()
            .or_else(|| self.session.base_url.clone())
            .unwrap_or_else(|| format!("http://{}:{}", self.gateway.host, self.gateway.port))
            .trim_end_matches('/')
            .to_string()
    }

    pub fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let parent_dir = self
            .config_path
            .parent()
            .context("Config path must have a parent directory")?;
        fs::create_dir_all(parent_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                parent_dir.display()
            )
        })?;

        let file_name = self
            .config_path
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or("config.toml");
        let temp_path = parent_dir.join(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));

        let mut temp_file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .with_context(|| {
                format!(
                    "Failed to create temporary config file: {}",
                    temp_path.display()
                )
            })?;
        temp_file
            .write_all(toml_str.as_bytes())
            .context("Failed to write temporary config contents")?;
        temp_file
            .sync_all()
            .context("Failed to fsync temporary config file")?;
        drop(temp_file);

        if let Err(e) = fs::rename(&temp_path, &self.config_path) {
            let _ = fs::remove_file(&temp_path);
            anyhow::bail!("Failed to atomically replace config file: {e}");
        }

        sync_directory(parent_dir)?;
        Ok(())
    }
}

fn generate_signing_key() -> String {
    hex::encode(rand::random::<[u8; 32]>())
}

#[cfg(unix)]
fn sync_directory(path: &Path) -> Result<()> {
    let dir = File::open(path)
        .with_context(|| format!("Failed to open directory for fsync: {}", path.display()))?;
    dir.sync_all()
        .with_context(|| format!("Failed to fsync directory metadata: {}", path.display()))?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_directory(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // ── Defaults ─────────────────────────────────────────────

    #[test]
    fn config_default_has_sane_values() {
        let c = Config::default();
        assert_eq!(c.gateway.port, 3000);
        assert_eq!(c.session.session_id, "01");
        assert_eq!(c.session.transport, "whatsapp-web");
        assert_eq!(c.store.backend, "sqlite");
        assert!(c.heartbeat.enabled);
        assert_eq!(c.heartbeat.interval_minutes, 5);
        assert!(c.config_path.to_string_lossy().contains("config.toml"));
    }

    #[test]
    fn reliability_defaults_cap_reconnects() {
        let r = ReliabilityConfig::default();
        assert!(r.reconnect_initial_backoff_ms < r.reconnect_max_backoff_ms);
        assert_eq!(r.component_max_backoff_secs, 60);
    }

    // ── Paths ────────────────────────────────────────────────

    #[test]
    fn derived_paths_live_under_data_dir() {
        let c = Config {
            data_dir: PathBuf::from("/srv/bridge"),
            ..Config::default()
        };
        assert_eq!(c.auth_dir(), PathBuf::from("/srv/bridge/auth"));
        assert_eq!(c.db_path(), PathBuf::from("/srv/bridge/leads.db"));
        assert_eq!(c.media_root(), PathBuf::from("/srv/bridge/media"));
    }

    #[test]
    fn explicit_auth_dir_wins() {
        let mut c = Config::default();
        c.session.auth_dir = Some(PathBuf::from("/var/data"));
        assert_eq!(c.auth_dir(), PathBuf::from("/var/data"));
    }

    #[test]
    fn media_base_url_falls_back_in_order() {
        let mut c = Config::default();
        assert_eq!(c.media_base_url(), "http://127.0.0.1:3000");

        c.session.base_url = Some("https://child-01.example.com/".into());
        assert_eq!(c.media_base_url(), "https://child-01.example.com");

        c.media.public_base_url = Some("https://cdn.example.com".into());
        assert_eq!(c.media_base_url(), "https://cdn.example.com");
    }

    // ── Persistence ──────────────────────────────────────────

    #[test]
    fn load_or_init_creates_config_with_signing_key() {
        let tmp = TempDir::new().unwrap();
        let config = Config::load_or_init_in(tmp.path()).unwrap();
        assert!(tmp.path().join("config.toml").exists());
        assert_eq!(config.media.signing_key.len(), 64);

        let reloaded = Config::load_or_init_in(tmp.path()).unwrap();
        assert_eq!(reloaded.media.signing_key, config.media.signing_key);
        assert_eq!(reloaded.data_dir, tmp.path());
    }

    #[test]
    fn partial_toml_uses_section_defaults() {
        let tmp = TempDir::new().unwrap();
        fs::write(
            tmp.path().join("config.toml"),
            "[session]\nsession_id = \"07\"\ntransport = \"loopback\"\n",
        )
        .unwrap();

        let config = Config::load_or_init_in(tmp.path()).unwrap();
        assert_eq!(config.session.session_id, "07");
        assert_eq!(config.session.transport, "loopback");
        assert_eq!(config.gateway.port, 3000);
        assert!(!config.media.signing_key.is_empty());
    }

    #[test]
    fn save_round_trips_sections() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::load_or_init_in(tmp.path()).unwrap();
        config.gateway.port = 8080;
        config.session.base_url = Some("https://bridge.example.com".into());
        config.save().unwrap();

        let reloaded = Config::load_or_init_in(tmp.path()).unwrap();
        assert_eq!(reloaded.gateway.port, 8080);
        assert_eq!(
            reloaded.session.base_url.as_deref(),
            Some("https://bridge.example.com")
        );
    }
}
