//! Find-or-create of leads for inbound messages.
//!
//! The lookup and the insert are two separate store calls. Two first-contact
//! messages from the same number that interleave between them can both
//! create a lead; readers take the first match by phone.

use crate::error::{BridgeError, BridgeResult};
use crate::store::{LeadRef, LeadStore, NewLead};
use chrono::Utc;
use std::sync::Arc;

pub const DEFAULT_TAG: &str = "NuevoLead";
pub const NEW_LEAD_STATE: &str = "nuevo";
pub const LEAD_SOURCE: &str = "WhatsApp";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Existing(LeadRef),
    Created(LeadRef),
    /// No lead exists and auto-save is off.
    Skipped,
}

impl Resolution {
    pub fn lead(&self) -> Option<&LeadRef> {
        match self {
            Self::Existing(lead) | Self::Created(lead) => Some(lead),
            Self::Skipped => None,
        }
    }
}

pub struct LeadResolver {
    store: Arc<dyn LeadStore>,
}

impl LeadResolver {
    pub fn new(store: Arc<dyn LeadStore>) -> Self {
        Self { store }
    }

    pub async fn resolve_or_create(
        &self,
        phone: &str,
        push_name: Option<&str>,
    ) -> BridgeResult<Resolution> {
        if let Some(existing) = self
            .store
            .find_lead_by_phone(phone)
            .await
            .map_err(|e| BridgeError::store(format!("{e:#}")))?
        {
            return Ok(Resolution::Existing(existing));
        }

        // A config read failure must not fall through to creation.
        let config = self
            .store
            .app_config()
            .await
            .map_err(|e| BridgeError::ConfigUnavailable(format!("{e:#}")))?
            .unwrap_or_default();
        if !config.auto_save_leads {
            tracing::debug!("Auto-save disabled; not creating lead for {phone}");
            return Ok(Resolution::Skipped);
        }

        let tag = config
            .default_trigger
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_TAG.to_string());
        let lead = self
            .store
            .create_lead(NewLead {
                telefono: phone.to_string(),
                nombre: push_name.unwrap_or_default().to_string(),
                source: LEAD_SOURCE.to_string(),
                estado: NEW_LEAD_STATE.to_string(),
                etiquetas: vec![tag],
                created_at: Utc::now(),
            })
            .await
            .map_err(|e| BridgeError::store(format!("{e:#}")))?;
        tracing::info!("Created lead {} for {phone}", lead.id);
        Ok(Resolution::Created(lead))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AppConfig, InMemoryLeadStore};

    fn resolver(store: &Arc<InMemoryLeadStore>) -> LeadResolver {
        LeadResolver::new(store.clone())
    }

    #[tokio::test]
    async fn creates_lead_with_default_tag() {
        let store = Arc::new(InMemoryLeadStore::with_app_config(AppConfig {
            auto_save_leads: true,
            default_trigger: None,
        }));
        let res = resolver(&store)
            .resolve_or_create("5215512345678", Some("Ana"))
            .await
            .unwrap();
        assert!(matches!(res, Resolution::Created(_)));

        let leads = store.leads();
        assert_eq!(leads.len(), 1);
        assert_eq!(leads[0].telefono, "5215512345678");
        assert_eq!(leads[0].nombre, "Ana");
        assert_eq!(leads[0].estado, "nuevo");
        assert_eq!(leads[0].source, "WhatsApp");
        assert_eq!(leads[0].etiquetas, vec!["NuevoLead".to_string()]);
        assert_eq!(leads[0].unread_count, 0);
        assert!(leads[0].secuencias_activas.is_empty());
    }

    #[tokio::test]
    async fn configured_trigger_becomes_the_tag() {
        let store = Arc::new(InMemoryLeadStore::with_app_config(AppConfig {
            auto_save_leads: true,
            default_trigger: Some("Promo".into()),
        }));
        resolver(&store)
            .resolve_or_create("525512345678", None)
            .await
            .unwrap();
        assert_eq!(store.leads()[0].etiquetas, vec!["Promo".to_string()]);
        assert_eq!(store.leads()[0].nombre, "");
    }

    #[tokio::test]
    async fn existing_lead_is_reused_regardless_of_config() {
        let store = Arc::new(InMemoryLeadStore::with_app_config(AppConfig {
            auto_save_leads: true,
            default_trigger: None,
        }));
        let r = resolver(&store);
        let first = r.resolve_or_create("525512345678", None).await.unwrap();

        store.fail_app_config(Some("offline"));
        let second = r.resolve_or_create("525512345678", None).await.unwrap();
        assert_eq!(second, Resolution::Existing(first.lead().unwrap().clone()));
        assert_eq!(store.leads().len(), 1);
    }

    #[tokio::test]
    async fn missing_or_disabled_config_skips() {
        let store = Arc::new(InMemoryLeadStore::new());
        let r = resolver(&store);
        assert_eq!(
            r.resolve_or_create("525512345678", None).await.unwrap(),
            Resolution::Skipped
        );

        store
            .put_app_config(&AppConfig {
                auto_save_leads: false,
                default_trigger: Some("X".into()),
            })
            .await
            .unwrap();
        assert_eq!(
            r.resolve_or_create("525512345678", None).await.unwrap(),
            Resolution::Skipped
        );
        assert!(store.leads().is_empty());
    }

    #[tokio::test]
    async fn config_failure_fails_closed() {
        let store = Arc::new(InMemoryLeadStore::with_app_config(AppConfig {
            auto_save_leads: true,
            default_trigger: None,
        }));
        store.fail_app_config(Some("permission denied"));
        let err = resolver(&store)
            .resolve_or_create("525512345678", None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::ConfigUnavailable(_)));
        assert!(store.leads().is_empty());
    }
}
