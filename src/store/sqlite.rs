use super::traits::{
    AppConfig, Lead, LeadRef, LeadStore, MediaType, MessageRecord, NewLead, Sender, ServerStatus,
    StoredMessage,
};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// SQLite-backed record store.
///
/// One connection behind a mutex; every query runs on the blocking pool.
pub struct SqliteLeadStore {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

impl SqliteLeadStore {
    pub fn open(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path).context("SQLite failed to open database")?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;

        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: db_path.to_path_buf(),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn init_schema(conn: &Connection) -> anyhow::Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS leads (
                id                  TEXT PRIMARY KEY,
                telefono            TEXT NOT NULL,
                nombre              TEXT NOT NULL DEFAULT '',
                source              TEXT NOT NULL,
                estado              TEXT NOT NULL,
                etiquetas           TEXT NOT NULL DEFAULT '[]',
                secuencias_activas  TEXT NOT NULL DEFAULT '[]',
                unread_count        INTEGER NOT NULL DEFAULT 0,
                fecha_creacion      TEXT NOT NULL,
                last_message_at     TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_leads_telefono ON leads(telefono);

            CREATE TABLE IF NOT EXISTS messages (
                id          TEXT PRIMARY KEY,
                lead_id     TEXT NOT NULL REFERENCES leads(id) ON DELETE CASCADE,
                content     TEXT NOT NULL DEFAULT '',
                media_type  TEXT,
                media_url   TEXT,
                sender      TEXT NOT NULL,
                timestamp   TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_lead ON messages(lead_id);

            CREATE TABLE IF NOT EXISTS app_config (
                id               INTEGER PRIMARY KEY CHECK (id = 1),
                auto_save_leads  INTEGER NOT NULL DEFAULT 0,
                default_trigger  TEXT
            );

            CREATE TABLE IF NOT EXISTS whatsapp_servers (
                session_id             TEXT PRIMARY KEY,
                base_url               TEXT,
                status                 TEXT NOT NULL,
                work_state             TEXT NOT NULL,
                last_work_switched_at  TEXT NOT NULL,
                last_seen              TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    async fn with_conn<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            f(&conn)
        })
        .await?
    }
}

fn parse_ts(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("invalid timestamp in store: {raw}"))?
        .with_timezone(&Utc))
}

fn parse_list(raw: &str) -> anyhow::Result<Vec<String>> {
    serde_json::from_str(raw).context("invalid JSON list in store")
}

#[async_trait]
impl LeadStore for SqliteLeadStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn find_lead_by_phone(&self, phone: &str) -> anyhow::Result<Option<LeadRef>> {
        let phone = phone.to_string();
        self.with_conn(move |conn| {
            let id: Option<String> = conn
                .query_row(
                    "SELECT id FROM leads WHERE telefono = ?1 ORDER BY rowid LIMIT 1",
                    params![phone],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(id.map(LeadRef::new))
        })
        .await
    }

    async fn create_lead(&self, lead: NewLead) -> anyhow::Result<LeadRef> {
        self.with_conn(move |conn| {
            let id = Uuid::new_v4().to_string();
            let created = lead.created_at.to_rfc3339();
            conn.execute(
                "INSERT INTO leads (id, telefono, nombre, source, estado, etiquetas,
                                    secuencias_activas, unread_count, fecha_creacion, last_message_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, '[]', 0, ?7, ?7)",
                params![
                    id,
                    lead.telefono,
                    lead.nombre,
                    lead.source,
                    lead.estado,
                    serde_json::to_string(&lead.etiquetas)?,
                    created,
                ],
            )?;
            Ok(LeadRef::new(id))
        })
        .await
    }

    async fn get_lead(&self, id: &str) -> anyhow::Result<Option<Lead>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT id, telefono, nombre, source, estado, etiquetas, unread_count,
                            fecha_creacion, last_message_at, secuencias_activas
                     FROM leads WHERE id = ?1",
                    params![id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, String>(5)?,
                            row.get::<_, u32>(6)?,
                            row.get::<_, String>(7)?,
                            row.get::<_, String>(8)?,
                            row.get::<_, String>(9)?,
                        ))
                    },
                )
                .optional()?;

            let Some((id, telefono, nombre, source, estado, etiquetas, unread, created, last, seqs)) =
                row
            else {
                return Ok(None);
            };

            Ok(Some(Lead {
                id,
                telefono,
                nombre,
                source,
                estado,
                etiquetas: parse_list(&etiquetas)?,
                unread_count: unread,
                fecha_creacion: parse_ts(&created)?,
                last_message_at: parse_ts(&last)?,
                secuencias_activas: parse_list(&seqs)?,
            }))
        })
        .await
    }

    async fn append_message(
        &self,
        lead: &LeadRef,
        message: &MessageRecord,
    ) -> anyhow::Result<String> {
        let lead_id = lead.id.clone();
        let message = message.clone();
        self.with_conn(move |conn| {
            let id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO messages (id, lead_id, content, media_type, media_url, sender, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id,
                    lead_id,
                    message.content,
                    message.media_type.map(MediaType::as_str),
                    message.media_url,
                    message.sender.as_str(),
                    message.timestamp.to_rfc3339(),
                ],
            )?;
            Ok(id)
        })
        .await
    }

    async fn list_messages(&self, lead_id: &str) -> anyhow::Result<Vec<StoredMessage>> {
        let lead_id = lead_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, lead_id, content, media_type, media_url, sender, timestamp
                 FROM messages WHERE lead_id = ?1 ORDER BY rowid",
            )?;
            let rows = stmt.query_map(params![lead_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (id, lead_id, content, media_type, media_url, sender, ts) = row?;
                let media_type = match media_type {
                    Some(kind) => Some(
                        MediaType::parse(&kind)
                            .with_context(|| format!("unknown media type in store: {kind}"))?,
                    ),
                    None => None,
                };
                out.push(StoredMessage {
                    id,
                    lead_id,
                    record: MessageRecord {
                        content,
                        media_type,
                        media_url,
                        sender: Sender::parse(&sender)
                            .with_context(|| format!("unknown sender in store: {sender}"))?,
                        timestamp: parse_ts(&ts)?,
                    },
                });
            }
            Ok(out)
        })
        .await
    }

    async fn touch_lead(
        &self,
        lead: &LeadRef,
        last_message_at: DateTime<Utc>,
        unread_increment: u32,
    ) -> anyhow::Result<()> {
        let lead_id = lead.id.clone();
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE leads
                 SET last_message_at = ?2, unread_count = unread_count + ?3
                 WHERE id = ?1",
                params![lead_id, last_message_at.to_rfc3339(), unread_increment],
            )?;
            if updated == 0 {
                anyhow::bail!("lead {lead_id} not found");
            }
            Ok(())
        })
        .await
    }

    async fn app_config(&self) -> anyhow::Result<Option<AppConfig>> {
        self.with_conn(|conn| {
            let cfg = conn
                .query_row(
                    "SELECT auto_save_leads, default_trigger FROM app_config WHERE id = 1",
                    [],
                    |row| {
                        Ok(AppConfig {
                            auto_save_leads: row.get::<_, bool>(0)?,
                            default_trigger: row.get(1)?,
                        })
                    },
                )
                .optional()?;
            Ok(cfg)
        })
        .await
    }

    async fn put_app_config(&self, config: &AppConfig) -> anyhow::Result<()> {
        let config = config.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO app_config (id, auto_save_leads, default_trigger)
                 VALUES (1, ?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET
                    auto_save_leads = excluded.auto_save_leads,
                    default_trigger = excluded.default_trigger",
                params![config.auto_save_leads, config.default_trigger],
            )?;
            Ok(())
        })
        .await
    }

    async fn register_server(&self, status: &ServerStatus) -> anyhow::Result<()> {
        let status = status.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO whatsapp_servers
                    (session_id, base_url, status, work_state, last_work_switched_at, last_seen)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(session_id) DO UPDATE SET
                    base_url = excluded.base_url,
                    status = excluded.status,
                    work_state = excluded.work_state,
                    last_work_switched_at = excluded.last_work_switched_at,
                    last_seen = excluded.last_seen",
                params![
                    status.session_id,
                    status.base_url,
                    status.status,
                    status.work_state,
                    status.last_work_switched_at.to_rfc3339(),
                    status.last_seen.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn update_server_status(
        &self,
        session_id: &str,
        status: &str,
        last_seen: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let session_id = session_id.to_string();
        let status = status.to_string();
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE whatsapp_servers SET status = ?2, last_seen = ?3 WHERE session_id = ?1",
                params![session_id, status, last_seen.to_rfc3339()],
            )?;
            if updated == 0 {
                anyhow::bail!("server {session_id} is not registered");
            }
            Ok(())
        })
        .await
    }

    async fn server_status(&self, session_id: &str) -> anyhow::Result<Option<ServerStatus>> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT session_id, base_url, status, work_state, last_work_switched_at, last_seen
                     FROM whatsapp_servers WHERE session_id = ?1",
                    params![session_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, Option<String>>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, String>(5)?,
                        ))
                    },
                )
                .optional()?;

            row.map(|(session_id, base_url, status, work_state, switched, seen)| {
                Ok(ServerStatus {
                    session_id,
                    base_url,
                    status,
                    work_state,
                    last_work_switched_at: parse_ts(&switched)?,
                    last_seen: parse_ts(&seen)?,
                })
            })
            .transpose()
        })
        .await
    }

    async fn health_check(&self) -> bool {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || conn.lock().execute_batch("SELECT 1").is_ok())
            .await
            .unwrap_or(false)
    }
}
