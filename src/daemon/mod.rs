use crate::blob::LocalBlobStore;
use crate::config::Config;
use crate::gateway::GatewayState;
use crate::heartbeat::StatusReporter;
use crate::ingest::IngestionPipeline;
use crate::media::MediaMaterializer;
use crate::outbound::OutboundSender;
use crate::session::{Session, SessionManager};
use crate::store::LeadStore;
use crate::transport::{AuthState, Transport};
use anyhow::Result;
use chrono::Utc;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

const STATUS_FLUSH_SECONDS: u64 = 5;

/// Shared components of a running bridge.
#[derive(Clone)]
pub struct Bridge {
    pub session: Arc<Session>,
    pub store: Arc<dyn LeadStore>,
    pub blobs: Arc<LocalBlobStore>,
    pub media: Arc<MediaMaterializer>,
    pub outbound: Arc<OutboundSender>,
}

impl Bridge {
    pub fn new(store: Arc<dyn LeadStore>, blobs: Arc<LocalBlobStore>) -> Self {
        let session = Arc::new(Session::new());
        let media = Arc::new(MediaMaterializer::new(blobs.clone()));
        let outbound = Arc::new(OutboundSender::new(
            session.clone(),
            store.clone(),
            media.clone(),
        ));
        Self {
            session,
            store,
            blobs,
            media,
            outbound,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let store = crate::store::create_store(config)?;
        let blobs = Arc::new(LocalBlobStore::new(
            config.media_root(),
            &config.media_base_url(),
            &config.media.signing_key,
        )?);
        Ok(Self::new(store, blobs))
    }

    pub fn gateway_state(&self) -> GatewayState {
        GatewayState {
            session: self.session.clone(),
            outbound: self.outbound.clone(),
            blobs: self.blobs.clone(),
        }
    }

    pub fn ingestion(&self) -> IngestionPipeline {
        IngestionPipeline::new(self.store.clone(), self.media.clone())
    }
}

pub async fn run(config: Config, host: String, port: u16) -> Result<()> {
    let initial_backoff = config.reliability.component_initial_backoff_secs.max(1);
    let max_backoff = config
        .reliability
        .component_max_backoff_secs
        .max(initial_backoff);

    crate::health::mark_component_ok("daemon");

    let bridge = Bridge::from_config(&config)?;
    let transport = crate::transport::create_transport(&config)?;
    let (inbound_tx, inbound_rx) = mpsc::channel(config.session.inbound_queue_capacity.max(1));

    let mut handles: Vec<JoinHandle<()>> = vec![spawn_state_writer(config.clone())];

    {
        let pipeline = bridge.ingestion();
        handles.push(tokio::spawn(async move { pipeline.run(inbound_rx).await }));
    }

    handles.push(spawn_session(
        bridge.session.clone(),
        transport,
        AuthState::new(config.auth_dir()),
        &config,
        inbound_tx,
    ));

    {
        let state = bridge.gateway_state();
        let gateway_cfg = config.gateway.clone();
        let gateway_host = host.clone();
        handles.push(spawn_component_supervisor(
            "gateway",
            initial_backoff,
            max_backoff,
            move || {
                let state = state.clone();
                let cfg = gateway_cfg.clone();
                let host = gateway_host.clone();
                async move { crate::gateway::run_gateway(&host, port, state, &cfg).await }
            },
        ));
    }

    if config.heartbeat.enabled {
        let reporter = Arc::new(StatusReporter::new(
            bridge.store.clone(),
            bridge.session.clone(),
            config.session.session_id.clone(),
            config.session.base_url.clone(),
        ));
        let interval = crate::heartbeat::interval_from_minutes(config.heartbeat.interval_minutes);
        handles.push(spawn_component_supervisor(
            "heartbeat",
            initial_backoff,
            max_backoff,
            move || {
                let reporter = reporter.clone();
                async move { reporter.run(interval).await }
            },
        ));
    } else {
        tracing::info!("Heartbeat disabled; server status will not be published");
    }

    println!("leadbridge daemon started");
    println!("   Gateway:   http://{host}:{port}");
    println!("   Session:   {}", config.session.session_id);
    println!("   Transport: {}", config.session.transport);
    println!("   Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    crate::health::mark_component_error("daemon", "shutdown requested");

    if let Some(handle) = bridge.session.live_transport_handle() {
        handle.close().await;
    }
    for handle in &handles {
        handle.abort();
    }
    for handle in handles {
        let _ = handle.await;
    }

    Ok(())
}

/// The session supervisor reconnects on its own; this task ends only when
/// ingestion stops.
fn spawn_session(
    session: Arc<Session>,
    transport: Arc<dyn Transport>,
    auth: AuthState,
    config: &Config,
    inbound: mpsc::Sender<crate::transport::MessagesUpsert>,
) -> JoinHandle<()> {
    let manager = SessionManager::new(session, transport, auth, config.reliability.clone());
    tokio::spawn(async move {
        if let Err(e) = manager.run(inbound).await {
            crate::health::mark_component_error("whatsapp", format!("{e:#}"));
            tracing::error!("WhatsApp session supervisor stopped: {e:#}");
        }
    })
}

pub fn state_file_path(config: &Config) -> PathBuf {
    config
        .config_path
        .parent()
        .map_or_else(|| PathBuf::from("."), PathBuf::from)
        .join("daemon_state.json")
}

fn spawn_state_writer(config: Config) -> JoinHandle<()> {
    tokio::spawn(async move {
        let path = state_file_path(&config);
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }

        let mut interval = tokio::time::interval(Duration::from_secs(STATUS_FLUSH_SECONDS));
        loop {
            interval.tick().await;
            let mut json = crate::health::snapshot_json();
            if let Some(obj) = json.as_object_mut() {
                obj.insert(
                    "written_at".into(),
                    serde_json::json!(Utc::now().to_rfc3339()),
                );
            }
            let data = serde_json::to_vec_pretty(&json).unwrap_or_else(|_| b"{}".to_vec());
            let _ = tokio::fs::write(&path, data).await;
        }
    })
}

fn spawn_component_supervisor<F, Fut>(
    name: &'static str,
    initial_backoff_secs: u64,
    max_backoff_secs: u64,
    mut run_component: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut backoff = initial_backoff_secs.max(1);
        let max_backoff = max_backoff_secs.max(backoff);

        loop {
            crate::health::mark_component_ok(name);
            match run_component().await {
                Ok(()) => {
                    crate::health::mark_component_error(name, "component exited unexpectedly");
                    tracing::warn!("Daemon component '{name}' exited unexpectedly");
                }
                Err(e) => {
                    crate::health::mark_component_error(name, format!("{e:#}"));
                    tracing::error!("Daemon component '{name}' failed: {e:#}");
                }
            }

            crate::health::bump_component_restart(name);
            tokio::time::sleep(Duration::from_secs(backoff)).await;
            backoff = backoff.saturating_mul(2).min(max_backoff);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(tmp: &TempDir) -> Config {
        let mut config = Config::load_or_init_in(tmp.path()).unwrap();
        config.store.backend = "memory".into();
        config
    }

    #[test]
    fn state_file_path_uses_config_directory() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        assert_eq!(state_file_path(&config), tmp.path().join("daemon_state.json"));
    }

    #[test]
    fn bridge_builds_from_config() {
        let tmp = TempDir::new().unwrap();
        let config = test_config(&tmp);
        let bridge = Bridge::from_config(&config).unwrap();
        assert_eq!(bridge.store.name(), "memory");
        assert_eq!(bridge.blobs.root(), tmp.path().join("media").as_path());
        assert!(bridge.session.live_transport_handle().is_none());
    }

    #[tokio::test]
    async fn supervisor_marks_error_and_restart_on_failure() {
        let handle = spawn_component_supervisor("daemon-test-fail", 1, 1, || async {
            anyhow::bail!("boom")
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();
        let _ = handle.await;

        let component = crate::health::component("daemon-test-fail").unwrap();
        assert_eq!(component.status, crate::health::ComponentStatus::Error);
        assert!(component.restart_count >= 1);
        assert!(component.last_error.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn supervisor_marks_unexpected_exit_as_error() {
        let handle = spawn_component_supervisor("daemon-test-exit", 1, 1, || async { Ok(()) });

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();
        let _ = handle.await;

        let component = crate::health::component("daemon-test-exit").unwrap();
        assert_eq!(component.status, crate::health::ComponentStatus::Error);
        assert!(component.restart_count >= 1);
        assert!(component
            .last_error
            .unwrap()
            .contains("component exited unexpectedly"));
    }
}
