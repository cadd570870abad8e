//! Periodic publication of this server's connection status to the record
//! store's status collection.

use crate::session::Session;
use crate::store::{LeadStore, ServerStatus};
use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use tokio::time::Duration;

pub const RESTING_WORK_STATE: &str = "resting";

pub struct StatusReporter {
    store: Arc<dyn LeadStore>,
    session: Arc<Session>,
    session_id: String,
    base_url: Option<String>,
}

impl StatusReporter {
    pub fn new(
        store: Arc<dyn LeadStore>,
        session: Arc<Session>,
        session_id: impl Into<String>,
        base_url: Option<String>,
    ) -> Self {
        Self {
            store,
            session,
            session_id: session_id.into(),
            base_url,
        }
    }

    /// Upsert the full server record. Resets `work_state` to resting.
    pub async fn register(&self) -> Result<()> {
        let now = Utc::now();
        self.store
            .register_server(&ServerStatus {
                session_id: self.session_id.clone(),
                base_url: self.base_url.clone(),
                status: self.session.status().to_string(),
                work_state: RESTING_WORK_STATE.to_string(),
                last_work_switched_at: now,
                last_seen: now,
            })
            .await
            .with_context(|| format!("Failed to register server {}", self.session_id))
    }

    /// Refresh `status` and `last_seen` only.
    pub async fn report(&self) -> Result<()> {
        self.store
            .update_server_status(&self.session_id, &self.session.status().to_string(), Utc::now())
            .await
            .with_context(|| format!("Failed to update status of server {}", self.session_id))
    }

    /// Register, then report every `interval` until cancelled.
    pub async fn run(&self, interval: Duration) -> Result<()> {
        self.register().await?;
        tracing::info!(
            "Registered server {} (heartbeat every {}s)",
            self.session_id,
            interval.as_secs()
        );

        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately; registration already covered it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match self.report().await {
                Ok(()) => crate::health::mark_component_ok("heartbeat"),
                Err(e) => {
                    crate::health::mark_component_error("heartbeat", format!("{e:#}"));
                    tracing::warn!("Heartbeat failed: {e:#}");
                }
            }
        }
    }
}

pub fn interval_from_minutes(minutes: u32) -> Duration {
    Duration::from_secs(u64::from(minutes.max(1)) * 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryLeadStore;

    fn reporter(store: &Arc<InMemoryLeadStore>, session: &Arc<Session>) -> StatusReporter {
        StatusReporter::new(
            store.clone(),
            session.clone(),
            "07",
            Some("https://bridge-07.example.com".into()),
        )
    }

    #[tokio::test]
    async fn register_writes_full_record() {
        let store = Arc::new(InMemoryLeadStore::new());
        let session = Arc::new(Session::new());
        reporter(&store, &session).register().await.unwrap();

        let status = store.server_status("07").await.unwrap().unwrap();
        assert_eq!(status.status, "disconnected");
        assert_eq!(status.work_state, "resting");
        assert_eq!(status.base_url.as_deref(), Some("https://bridge-07.example.com"));
        assert_eq!(status.last_seen, status.last_work_switched_at);
    }

    #[tokio::test]
    async fn report_updates_status_and_last_seen_only() {
        let store = Arc::new(InMemoryLeadStore::new());
        let session = Arc::new(Session::new());
        let r = reporter(&store, &session);
        r.register().await.unwrap();
        let before = store.server_status("07").await.unwrap().unwrap();

        session.mark_connected(Some("525512345678".into()));
        tokio::time::sleep(Duration::from_millis(5)).await;
        r.report().await.unwrap();

        let after = store.server_status("07").await.unwrap().unwrap();
        assert_eq!(after.status, "connected");
        assert!(after.last_seen > before.last_seen);
        assert_eq!(after.last_work_switched_at, before.last_work_switched_at);
        assert_eq!(after.work_state, before.work_state);
    }

    #[tokio::test]
    async fn report_before_register_fails() {
        let store = Arc::new(InMemoryLeadStore::new());
        let session = Arc::new(Session::new());
        assert!(reporter(&store, &session).report().await.is_err());
    }

    #[test]
    fn interval_has_a_one_minute_floor() {
        assert_eq!(interval_from_minutes(0), Duration::from_secs(60));
        assert_eq!(interval_from_minutes(5), Duration::from_secs(300));
    }
}
