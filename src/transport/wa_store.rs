//! wa-rs storage traits over the multi-file [`AuthState`] directory.
//!
//! Signal records are stored as raw bytes; structured records as JSON.

use super::auth_state::AuthState;
use async_trait::async_trait;
use prost::Message;
use serde::{Deserialize, Serialize};
use wa_rs_binary::jid::Jid;
use wa_rs_core::appstate::hash::HashState;
use wa_rs_core::appstate::processor::AppStateMutationMAC;
use wa_rs_core::store::Device as CoreDevice;
use wa_rs_core::store::error::{Result as StoreResult, StoreError};
use wa_rs_core::store::traits::DeviceStore as DeviceStoreTrait;
use wa_rs_core::store::traits::*;

const DEVICE_FILE: &str = "device.json";
const DEVICE_ID: i32 = 1;

fn db_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Database(e.to_string())
}

#[derive(Clone)]
pub struct WaAuthStore {
    auth: AuthState,
}

impl WaAuthStore {
    pub fn new(auth: AuthState) -> anyhow::Result<Self> {
        auth.ensure()?;
        Ok(Self { auth })
    }

    fn get(&self, ns: &str, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.auth.read_entry(ns, key).map_err(db_err)
    }

    fn put(&self, ns: &str, key: &str, value: &[u8]) -> StoreResult<()> {
        self.auth.write_entry(ns, key, value).map_err(db_err)
    }

    fn del(&self, ns: &str, key: &str) -> StoreResult<()> {
        self.auth.remove_entry(ns, key).map(|_| ()).map_err(db_err)
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, ns: &str, key: &str) -> StoreResult<Option<T>> {
        self.auth.read_json(ns, key).map_err(db_err)
    }

    fn put_json<T: Serialize>(&self, ns: &str, key: &str, value: &T) -> StoreResult<()> {
        self.auth.write_json(ns, key, value).map_err(db_err)
    }
}

// ── Signal ───────────────────────────────────────────────────────

#[async_trait]
impl SignalStore for WaAuthStore {
    async fn put_identity(&self, address: &str, key: [u8; 32]) -> StoreResult<()> {
        self.put("identity", address, &key)
    }

    async fn load_identity(&self, address: &str) -> StoreResult<Option<Vec<u8>>> {
        self.get("identity", address)
    }

    async fn delete_identity(&self, address: &str) -> StoreResult<()> {
        self.del("identity", address)
    }

    async fn get_session(&self, address: &str) -> StoreResult<Option<Vec<u8>>> {
        self.get("session", address)
    }

    async fn put_session(&self, address: &str, session: &[u8]) -> StoreResult<()> {
        self.put("session", address, session)
    }

    async fn delete_session(&self, address: &str) -> StoreResult<()> {
        self.del("session", address)
    }

    async fn store_prekey(&self, id: u32, record: &[u8], _uploaded: bool) -> StoreResult<()> {
        self.put("pre-key", &id.to_string(), record)
    }

    async fn load_prekey(&self, id: u32) -> StoreResult<Option<Vec<u8>>> {
        self.get("pre-key", &id.to_string())
    }

    async fn remove_prekey(&self, id: u32) -> StoreResult<()> {
        self.del("pre-key", &id.to_string())
    }

    async fn store_signed_prekey(&self, id: u32, record: &[u8]) -> StoreResult<()> {
        self.put("signed-pre-key", &id.to_string(), record)
    }

    async fn load_signed_prekey(&self, id: u32) -> StoreResult<Option<Vec<u8>>> {
        self.get("signed-pre-key", &id.to_string())
    }

    async fn load_all_signed_prekeys(&self) -> StoreResult<Vec<(u32, Vec<u8>)>> {
        let entries = self.auth.list_entries("signed-pre-key").map_err(db_err)?;
        Ok(entries
            .into_iter()
            .filter_map(|(id, record)| id.parse().ok().map(|id| (id, record)))
            .collect())
    }

    async fn remove_signed_prekey(&self, id: u32) -> StoreResult<()> {
        self.del("signed-pre-key", &id.to_string())
    }

    async fn put_sender_key(&self, address: &str, record: &[u8]) -> StoreResult<()> {
        self.put("sender-key", address, record)
    }

    async fn get_sender_key(&self, address: &str) -> StoreResult<Option<Vec<u8>>> {
        self.get("sender-key", address)
    }

    async fn delete_sender_key(&self, address: &str) -> StoreResult<()> {
        self.del("sender-key", address)
    }
}

// ── App state sync ───────────────────────────────────────────────

fn mac_key(name: &str, index_mac: &[u8]) -> String {
    format!("{name}/{}", hex::encode(index_mac))
}

#[async_trait]
impl AppSyncStore for WaAuthStore {
    async fn get_sync_key(&self, key_id: &[u8]) -> StoreResult<Option<AppStateSyncKey>> {
        self.get_json("app-state-sync-key", &hex::encode(key_id))
    }

    async fn set_sync_key(&self, key_id: &[u8], key: AppStateSyncKey) -> StoreResult<()> {
        self.put_json("app-state-sync-key", &hex::encode(key_id), &key)
    }

    async fn get_version(&self, name: &str) -> StoreResult<HashState> {
        self.get_json("app-state-version", name)?
            .ok_or_else(|| db_err(format!("no app state version for {name}")))
    }

    async fn set_version(&self, name: &str, state: HashState) -> StoreResult<()> {
        self.put_json("app-state-version", name, &state)
    }

    async fn put_mutation_macs(
        &self,
        name: &str,
        _version: u64,
        mutations: &[AppStateMutationMAC],
    ) -> StoreResult<()> {
        for mutation in mutations {
            self.put(
                "app-state-mac",
                &mac_key(name, &mutation.index_mac),
                &mutation.value_mac,
            )?;
        }
        Ok(())
    }

    async fn get_mutation_mac(&self, name: &str, index_mac: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.get("app-state-mac", &mac_key(name, index_mac))
    }

    async fn delete_mutation_macs(&self, name: &str, index_macs: &[Vec<u8>]) -> StoreResult<()> {
        for index_mac in index_macs {
            self.del("app-state-mac", &mac_key(name, index_mac))?;
        }
        Ok(())
    }
}

// ── Protocol bookkeeping ─────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct StoredLidMapping {
    lid: String,
    phone_number: String,
    created_at: i64,
    updated_at: i64,
    learning_source: String,
}

impl From<&LidPnMappingEntry> for StoredLidMapping {
    fn from(e: &LidPnMappingEntry) -> Self {
        Self {
            lid: e.lid.clone(),
            phone_number: e.phone_number.clone(),
            created_at: e.created_at,
            updated_at: e.updated_at,
            learning_source: e.learning_source.clone(),
        }
    }
}

impl From<StoredLidMapping> for LidPnMappingEntry {
    fn from(s: StoredLidMapping) -> Self {
        Self {
            lid: s.lid,
            phone_number: s.phone_number,
            created_at: s.created_at,
            updated_at: s.updated_at,
            learning_source: s.learning_source,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct StoredDeviceList {
    user: String,
    devices: Vec<DeviceInfo>,
    timestamp: i64,
    phash: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct StoredTcToken {
    token: Vec<u8>,
    token_timestamp: i64,
    sender_timestamp: Option<i64>,
}

impl WaAuthStore {
    fn all_lid_mappings(&self) -> StoreResult<Vec<StoredLidMapping>> {
        let entries = self.auth.list_entries("lid-mapping").map_err(db_err)?;
        entries
            .into_iter()
            .map(|(_, raw)| serde_json::from_slice(&raw).map_err(db_err))
            .collect()
    }
}

#[async_trait]
impl ProtocolStore for WaAuthStore {
    async fn get_skdm_recipients(&self, group_jid: &str) -> StoreResult<Vec<Jid>> {
        let stored: Vec<String> = self.get_json("skdm", group_jid)?.unwrap_or_default();
        Ok(stored.iter().filter_map(|j| j.parse().ok()).collect())
    }

    async fn add_skdm_recipients(&self, group_jid: &str, device_jids: &[Jid]) -> StoreResult<()> {
        let mut stored: Vec<String> = self.get_json("skdm", group_jid)?.unwrap_or_default();
        for jid in device_jids {
            let jid = jid.to_string();
            if !stored.contains(&jid) {
                stored.push(jid);
            }
        }
        self.put_json("skdm", group_jid, &stored)
    }

    async fn clear_skdm_recipients(&self, group_jid: &str) -> StoreResult<()> {
        self.del("skdm", group_jid)
    }

    async fn get_lid_mapping(&self, lid: &str) -> StoreResult<Option<LidPnMappingEntry>> {
        Ok(self
            .get_json::<StoredLidMapping>("lid-mapping", lid)?
            .map(Into::into))
    }

    async fn get_pn_mapping(&self, phone: &str) -> StoreResult<Option<LidPnMappingEntry>> {
        Ok(self
            .all_lid_mappings()?
            .into_iter()
            .filter(|m| m.phone_number == phone)
            .max_by_key(|m| m.updated_at)
            .map(Into::into))
    }

    async fn put_lid_mapping(&self, entry: &LidPnMappingEntry) -> StoreResult<()> {
        self.put_json("lid-mapping", &entry.lid, &StoredLidMapping::from(entry))
    }

    async fn get_all_lid_mappings(&self) -> StoreResult<Vec<LidPnMappingEntry>> {
        Ok(self
            .all_lid_mappings()?
            .into_iter()
            .map(Into::into)
            .collect())
    }

    async fn save_base_key(&self, address: &str, message_id: &str, base_key: &[u8]) -> StoreResult<()> {
        self.put("base-key", &format!("{address}/{message_id}"), base_key)
    }

    async fn has_same_base_key(
        &self,
        address: &str,
        message_id: &str,
        current_base_key: &[u8],
    ) -> StoreResult<bool> {
        Ok(self
            .get("base-key", &format!("{address}/{message_id}"))?
            .is_some_and(|saved| saved == current_base_key))
    }

    async fn delete_base_key(&self, address: &str, message_id: &str) -> StoreResult<()> {
        self.del("base-key", &format!("{address}/{message_id}"))
    }

    async fn update_device_list(&self, record: DeviceListRecord) -> StoreResult<()> {
        let stored = StoredDeviceList {
            user: record.user.clone(),
            devices: record.devices,
            timestamp: record.timestamp,
            phash: record.phash,
        };
        self.put_json("device-list", &record.user, &stored)
    }

    async fn get_devices(&self, user: &str) -> StoreResult<Option<DeviceListRecord>> {
        Ok(self
            .get_json::<StoredDeviceList>("device-list", user)?
            .map(|s| DeviceListRecord {
                user: s.user,
                devices: s.devices,
                timestamp: s.timestamp,
                phash: s.phash,
            }))
    }

    async fn mark_forget_sender_key(&self, group_jid: &str, participant: &str) -> StoreResult<()> {
        let mut marks: Vec<String> = self.get_json("forget-mark", group_jid)?.unwrap_or_default();
        if !marks.iter().any(|p| p == participant) {
            marks.push(participant.to_string());
        }
        self.put_json("forget-mark", group_jid, &marks)
    }

    async fn consume_forget_marks(&self, group_jid: &str) -> StoreResult<Vec<String>> {
        let marks: Vec<String> = self.get_json("forget-mark", group_jid)?.unwrap_or_default();
        self.del("forget-mark", group_jid)?;
        Ok(marks)
    }

    async fn get_tc_token(&self, jid: &str) -> StoreResult<Option<TcTokenEntry>> {
        Ok(self
            .get_json::<StoredTcToken>("tc-token", jid)?
            .map(|s| TcTokenEntry {
                token: s.token,
                token_timestamp: s.token_timestamp,
                sender_timestamp: s.sender_timestamp,
            }))
    }

    async fn put_tc_token(&self, jid: &str, entry: &TcTokenEntry) -> StoreResult<()> {
        let stored = StoredTcToken {
            token: entry.token.clone(),
            token_timestamp: entry.token_timestamp,
            sender_timestamp: entry.sender_timestamp,
        };
        self.put_json("tc-token", jid, &stored)
    }

    async fn delete_tc_token(&self, jid: &str) -> StoreResult<()> {
        self.del("tc-token", jid)
    }

    async fn get_all_tc_token_jids(&self) -> StoreResult<Vec<String>> {
        let entries = self.auth.list_entries("tc-token").map_err(db_err)?;
        Ok(entries.into_iter().map(|(jid, _)| jid).collect())
    }

    async fn delete_expired_tc_tokens(&self, cutoff_timestamp: i64) -> StoreResult<u32> {
        let mut deleted = 0u32;
        for (jid, raw) in self.auth.list_entries("tc-token").map_err(db_err)? {
            let token: StoredTcToken = serde_json::from_slice(&raw).map_err(db_err)?;
            if token.token_timestamp < cutoff_timestamp {
                self.del("tc-token", &jid)?;
                deleted = deleted.saturating_add(1);
            }
        }
        Ok(deleted)
    }
}

// ── Device ───────────────────────────────────────────────────────

/// Key pairs are `private(32) || public(32)`.
#[derive(Serialize, Deserialize)]
struct StoredDevice {
    lid: Option<String>,
    pn: Option<String>,
    registration_id: u32,
    noise_key: String,
    identity_key: String,
    signed_pre_key: String,
    signed_pre_key_id: u32,
    signed_pre_key_signature: String,
    adv_secret_key: String,
    account: Option<String>,
    push_name: String,
    app_version_primary: u32,
    app_version_secondary: u32,
    app_version_tertiary: u32,
    app_version_last_fetched_ms: i64,
    edge_routing_info: Option<Vec<u8>>,
    props_hash: Option<String>,
}

fn encode_key_pair(pair: &wa_rs_core::libsignal::protocol::KeyPair) -> String {
    let mut bytes = pair.private_key.serialize().to_vec();
    bytes.extend_from_slice(pair.public_key.public_key_bytes());
    hex::encode(bytes)
}

fn decode_key_pair(encoded: &str) -> StoreResult<wa_rs_core::libsignal::protocol::KeyPair> {
    use wa_rs_core::libsignal::protocol::{KeyPair, PrivateKey, PublicKey};

    let bytes = hex::decode(encoded).map_err(db_err)?;
    if bytes.len() != 64 {
        return Err(db_err(format!("key pair has {} bytes, expected 64", bytes.len())));
    }
    Ok(KeyPair::new(
        PublicKey::from_djb_public_key_bytes(&bytes[32..64]).map_err(db_err)?,
        PrivateKey::deserialize(&bytes[0..32]).map_err(db_err)?,
    ))
}

fn decode_fixed<const N: usize>(encoded: &str, what: &str) -> StoreResult<[u8; N]> {
    let bytes = hex::decode(encoded).map_err(db_err)?;
    bytes
        .try_into()
        .map_err(|_| db_err(format!("{what} must be {N} bytes")))
}

#[async_trait]
impl DeviceStoreTrait for WaAuthStore {
    async fn save(&self, device: &CoreDevice) -> StoreResult<()> {
        let stored = StoredDevice {
            lid: device.lid.as_ref().map(ToString::to_string),
            pn: device.pn.as_ref().map(ToString::to_string),
            registration_id: device.registration_id,
            noise_key: encode_key_pair(&device.noise_key),
            identity_key: encode_key_pair(&device.identity_key),
            signed_pre_key: encode_key_pair(&device.signed_pre_key),
            signed_pre_key_id: device.signed_pre_key_id,
            signed_pre_key_signature: hex::encode(device.signed_pre_key_signature),
            adv_secret_key: hex::encode(device.adv_secret_key),
            account: device.account.as_ref().map(|a| hex::encode(a.encode_to_vec())),
            push_name: device.push_name.clone(),
            app_version_primary: device.app_version_primary,
            app_version_secondary: device.app_version_secondary,
            app_version_tertiary: device.app_version_tertiary,
            app_version_last_fetched_ms: device.app_version_last_fetched_ms,
            edge_routing_info: device.edge_routing_info.clone(),
            props_hash: device.props_hash.clone(),
        };
        let raw = serde_json::to_vec_pretty(&stored).map_err(db_err)?;
        self.auth.write_named(DEVICE_FILE, &raw).map_err(db_err)
    }

    async fn load(&self) -> StoreResult<Option<CoreDevice>> {
        let Some(raw) = self.auth.read_file(DEVICE_FILE).map_err(db_err)? else {
            return Ok(None);
        };
        let stored: StoredDevice = serde_json::from_slice(&raw).map_err(db_err)?;

        let account = stored
            .account
            .as_deref()
            .map(|hex_account| {
                let bytes = hex::decode(hex_account).map_err(db_err)?;
                wa_rs_proto::whatsapp::AdvSignedDeviceIdentity::decode(&*bytes).map_err(db_err)
            })
            .transpose()?;

        Ok(Some(CoreDevice {
            lid: stored.lid.and_then(|s| s.parse().ok()),
            pn: stored.pn.and_then(|s| s.parse().ok()),
            registration_id: stored.registration_id,
            noise_key: decode_key_pair(&stored.noise_key)?,
            identity_key: decode_key_pair(&stored.identity_key)?,
            signed_pre_key: decode_key_pair(&stored.signed_pre_key)?,
            signed_pre_key_id: stored.signed_pre_key_id,
            signed_pre_key_signature: decode_fixed::<64>(
                &stored.signed_pre_key_signature,
                "signed pre-key signature",
            )?,
            adv_secret_key: decode_fixed::<32>(&stored.adv_secret_key, "adv secret")?,
            account,
            push_name: stored.push_name,
            app_version_primary: stored.app_version_primary,
            app_version_secondary: stored.app_version_secondary,
            app_version_tertiary: stored.app_version_tertiary,
            app_version_last_fetched_ms: stored.app_version_last_fetched_ms,
            edge_routing_info: stored.edge_routing_info,
            props_hash: stored.props_hash,
            ..Default::default()
        }))
    }

    async fn exists(&self) -> StoreResult<bool> {
        Ok(self.auth.read_file(DEVICE_FILE).map_err(db_err)?.is_some())
    }

    async fn create(&self) -> StoreResult<i32> {
        Ok(DEVICE_ID)
    }

    async fn snapshot_db(&self, name: &str, extra_content: Option<&[u8]>) -> StoreResult<()> {
        let Some(device) = self.auth.read_file(DEVICE_FILE).map_err(db_err)? else {
            return Ok(());
        };
        self.auth
            .write_named(&format!("{DEVICE_FILE}.snapshot.{name}"), &device)
            .map_err(db_err)?;
        if let Some(content) = extra_content {
            self.auth
                .write_named(&format!("{DEVICE_FILE}.snapshot.{name}.extra"), content)
                .map_err(db_err)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, WaAuthStore) {
        let tmp = TempDir::new().unwrap();
        let store = WaAuthStore::new(AuthState::new(tmp.path())).unwrap();
        (tmp, store)
    }

    #[tokio::test]
    async fn pn_mapping_picks_most_recent_lid() {
        let (_tmp, store) = store();
        for (lid, updated_at) in [("100000000000001", 10), ("100000000000002", 20)] {
            let entry = LidPnMappingEntry {
                lid: lid.to_string(),
                phone_number: "5215512345678".to_string(),
                created_at: 1,
                updated_at,
                learning_source: "usync".to_string(),
            };
            ProtocolStore::put_lid_mapping(&store, &entry).await.unwrap();
        }

        let latest = ProtocolStore::get_pn_mapping(&store, "5215512345678")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.lid, "100000000000002");
        assert_eq!(latest.learning_source, "usync");
    }

    #[tokio::test]
    async fn expired_tc_tokens_are_counted_and_removed() {
        let (_tmp, store) = store();
        let expired = TcTokenEntry {
            token: vec![1],
            token_timestamp: 10,
            sender_timestamp: None,
        };
        let fresh = TcTokenEntry {
            token: vec![2],
            token_timestamp: 1000,
            sender_timestamp: Some(1000),
        };
        ProtocolStore::put_tc_token(&store, "a@s.whatsapp.net", &expired).await.unwrap();
        ProtocolStore::put_tc_token(&store, "b@s.whatsapp.net", &fresh).await.unwrap();

        assert_eq!(ProtocolStore::delete_expired_tc_tokens(&store, 100).await.unwrap(), 1);
        assert_eq!(
            ProtocolStore::get_all_tc_token_jids(&store).await.unwrap(),
            vec!["b@s.whatsapp.net".to_string()]
        );
    }

    #[tokio::test]
    async fn forget_marks_are_consumed_once() {
        let (_tmp, store) = store();
        ProtocolStore::mark_forget_sender_key(&store, "g@g.us", "p1").await.unwrap();
        ProtocolStore::mark_forget_sender_key(&store, "g@g.us", "p1").await.unwrap();
        assert_eq!(
            ProtocolStore::consume_forget_marks(&store, "g@g.us").await.unwrap(),
            vec!["p1".to_string()]
        );
        assert!(ProtocolStore::consume_forget_marks(&store, "g@g.us").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn device_is_absent_until_saved() {
        let (_tmp, store) = store();
        assert!(!DeviceStoreTrait::exists(&store).await.unwrap());
        assert!(DeviceStoreTrait::load(&store).await.unwrap().is_none());
    }
}
