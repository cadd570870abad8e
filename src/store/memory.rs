use super::traits::{
    AppConfig, Lead, LeadRef, LeadStore, MessageRecord, NewLead, ServerStatus, StoredMessage,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Default)]
struct State {
    leads: Vec<Lead>,
    messages: Vec<StoredMessage>,
    app_config: Option<AppConfig>,
    app_config_error: Option<String>,
    servers: BTreeMap<String, ServerStatus>,
}

/// Process-local store. Used with `[store] backend = "memory"` and in tests;
/// `fail_app_config` simulates an unreachable config document.
#[derive(Default)]
pub struct InMemoryLeadStore {
    state: Mutex<State>,
}

impl InMemoryLeadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_app_config(config: AppConfig) -> Self {
        let store = Self::default();
        store.state.lock().app_config = Some(config);
        store
    }

    /// Make `app_config()` fail with `error` until cleared with `None`.
    pub fn fail_app_config(&self, error: Option<&str>) {
        self.state.lock().app_config_error = error.map(String::from);
    }

    pub fn leads(&self) -> Vec<Lead> {
        self.state.lock().leads.clone()
    }

    pub fn messages(&self) -> Vec<StoredMessage> {
        self.state.lock().messages.clone()
    }
}

#[async_trait]
impl LeadStore for InMemoryLeadStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn find_lead_by_phone(&self, phone: &str) -> anyhow::Result<Option<LeadRef>> {
        Ok(self
            .state
            .lock()
            .leads
            .iter()
            .find(|l| l.telefono == phone)
            .map(|l| LeadRef::new(l.id.clone())))
    }

    async fn create_lead(&self, lead: NewLead) -> anyhow::Result<LeadRef> {
        let id = Uuid::new_v4().to_string();
        self.state.lock().leads.push(Lead {
            id: id.clone(),
            telefono: lead.telefono,
            nombre: lead.nombre,
            source: lead.source,
            estado: lead.estado,
            etiquetas: lead.etiquetas,
            unread_count: 0,
            fecha_creacion: lead.created_at,
            last_message_at: lead.created_at,
            secuencias_activas: Vec::new(),
        });
        Ok(LeadRef::new(id))
    }

    async fn get_lead(&self, id: &str) -> anyhow::Result<Option<Lead>> {
        Ok(self.state.lock().leads.iter().find(|l| l.id == id).cloned())
    }

    async fn append_message(
        &self,
        lead: &LeadRef,
        message: &MessageRecord,
    ) -> anyhow::Result<String> {
        let mut state = self.state.lock();
        if !state.leads.iter().any(|l| l.id == lead.id) {
            anyhow::bail!("lead {} not found", lead.id);
        }
        let id = Uuid::new_v4().to_string();
        state.messages.push(StoredMessage {
            id: id.clone(),
            lead_id: lead.id.clone(),
            record: message.clone(),
        });
        Ok(id)
    }

    async fn list_messages(&self, lead_id: &str) -> anyhow::Result<Vec<StoredMessage>> {
        Ok(self
            .state
            .lock()
            .messages
            .iter()
            .filter(|m| m.lead_id == lead_id)
            .cloned()
            .collect())
    }

    async fn touch_lead(
        &self,
        lead: &LeadRef,
        last_message_at: DateTime<Utc>,
        unread_increment: u32,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        let Some(stored) = state.leads.iter_mut().find(|l| l.id == lead.id) else {
            anyhow::bail!("lead {} not found", lead.id);
        };
        stored.last_message_at = last_message_at;
        stored.unread_count = stored.unread_count.saturating_add(unread_increment);
        Ok(())
    }

    async fn app_config(&self) -> anyhow::Result<Option<AppConfig>> {
        let state = self.state.lock();
        if let Some(err) = &state.app_config_error {
            anyhow::bail!("{err}");
        }
        Ok(state.app_config.clone())
    }

    async fn put_app_config(&self, config: &AppConfig) -> anyhow::Result<()> {
        self.state.lock().app_config = Some(config.clone());
        Ok(())
    }

    async fn register_server(&self, status: &ServerStatus) -> anyhow::Result<()> {
        self.state
            .lock()
            .servers
            .insert(status.session_id.clone(), status.clone());
        Ok(())
    }

    async fn update_server_status(
        &self,
        session_id: &str,
        status: &str,
        last_seen: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        let Some(server) = state.servers.get_mut(session_id) else {
            anyhow::bail!("server {session_id} is not registered");
        };
        server.status = status.to_string();
        server.last_seen = last_seen;
        Ok(())
    }

    async fn server_status(&self, session_id: &str) -> anyhow::Result<Option<ServerStatus>> {
        Ok(self.state.lock().servers.get(session_id).cloned())
    }

    async fn health_check(&self) -> bool {
        true
    }
}
