//! Single WhatsApp session: connection state plus the supervisor loop that
//! owns the transport.
//!
//! [`Session`] is the shared, read-mostly view (status endpoint, outbound
//! sender). [`SessionManager::run`] is the only writer and the only caller
//! of [`Transport::connect`], so connect attempts never overlap.

mod backoff;

pub use backoff::Backoff;

use crate::config::ReliabilityConfig;
use crate::health;
use crate::phone;
use crate::transport::{
    AuthState, ConnectionUpdate, DisconnectReason, MessagesUpsert, Transport, TransportEvent,
    TransportHandle,
};
use anyhow::{anyhow, Result};
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

const COMPONENT: &str = "whatsapp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    QrPending,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::QrPending => "qr-pending",
            Self::Connected => "connected",
        })
    }
}

/// Body of `GET /api/whatsapp/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub status: ConnectionState,
    pub qr: Option<String>,
    pub phone: Option<String>,
}

#[derive(Default)]
struct SessionInner {
    state: ConnectionState,
    qr: Option<String>,
    phone: Option<String>,
    handle: Option<Arc<dyn TransportHandle>>,
}

#[derive(Default)]
pub struct Session {
    inner: RwLock<SessionInner>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> ConnectionState {
        self.inner.read().state
    }

    /// Present only while waiting for the QR to be scanned.
    pub fn latest_qr(&self) -> Option<String> {
        self.inner.read().qr.clone()
    }

    pub fn session_phone(&self) -> Option<String> {
        self.inner.read().phone.clone()
    }

    /// The handle to send through, only while connected.
    pub fn live_transport_handle(&self) -> Option<Arc<dyn TransportHandle>> {
        let inner = self.inner.read();
        match inner.state {
            ConnectionState::Connected => inner.handle.clone(),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = self.inner.read();
        SessionSnapshot {
            status: inner.state,
            qr: inner.qr.clone(),
            phone: inner.phone.clone(),
        }
    }

    pub(crate) fn attach(&self, handle: Arc<dyn TransportHandle>) {
        self.inner.write().handle = Some(handle);
    }

    pub(crate) fn set_qr(&self, code: String) {
        let mut inner = self.inner.write();
        inner.state = ConnectionState::QrPending;
        inner.qr = Some(code);
    }

    pub(crate) fn mark_connected(&self, phone: Option<String>) {
        let mut inner = self.inner.write();
        inner.state = ConnectionState::Connected;
        inner.qr = None;
        if phone.is_some() {
            inner.phone = phone;
        }
    }

    /// Returns the detached handle so the caller can close it outside the lock.
    pub(crate) fn mark_disconnected(&self) -> Option<Arc<dyn TransportHandle>> {
        let mut inner = self.inner.write();
        inner.state = ConnectionState::Disconnected;
        inner.qr = None;
        inner.handle.take()
    }

    pub(crate) fn set_phone(&self, phone: Option<String>) {
        self.inner.write().phone = phone;
    }
}

/// Canonical phone of an account JID such as `5215512345678:4@s.whatsapp.net`.
pub fn phone_from_jid(jid: &str) -> String {
    phone::lead_key(phone::jid_user(jid))
}

/// Render a pairing QR payload as terminal text.
pub fn render_qr(code: &str) -> Result<String> {
    let payload = code.trim();
    if payload.is_empty() {
        anyhow::bail!("QR payload is empty");
    }

    let qr = qrcode::QrCode::new(payload.as_bytes())
        .map_err(|err| anyhow!("Failed to encode pairing QR payload: {err}"))?;

    Ok(qr
        .render::<qrcode::render::unicode::Dense1x2>()
        .quiet_zone(true)
        .build())
}

/// Wipe stored credentials without a running connection.
pub fn logout(auth: &AuthState) -> Result<usize> {
    let removed = auth.wipe()?;
    tracing::info!(
        "Removed {removed} credential entries from {}",
        auth.dir().display()
    );
    Ok(removed)
}

/// How one connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionOutcome {
    Closed {
        reason: DisconnectReason,
        reached_open: bool,
    },
    /// The ingestion side went away; the supervisor should stop.
    InboundClosed,
}

pub struct SessionManager {
    session: Arc<Session>,
    transport: Arc<dyn Transport>,
    auth: AuthState,
    reliability: ReliabilityConfig,
    print_qr: bool,
}

impl SessionManager {
    pub fn new(
        session: Arc<Session>,
        transport: Arc<dyn Transport>,
        auth: AuthState,
        reliability: ReliabilityConfig,
    ) -> Self {
        Self {
            session,
            transport,
            auth,
            reliability,
            print_qr: true,
        }
    }

    /// Disable printing pairing QRs to stderr.
    pub fn quiet(mut self) -> Self {
        self.print_qr = false;
        self
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Connect, consume events, reconnect with backoff. Returns when the
    /// inbound receiver is dropped.
    pub async fn run(&self, inbound: mpsc::Sender<MessagesUpsert>) -> Result<()> {
        let mut backoff = Backoff::from_millis(
            self.reliability.reconnect_initial_backoff_ms,
            self.reliability.reconnect_max_backoff_ms,
        );

        loop {
            match self.connect_once(&inbound).await {
                Ok(ConnectionOutcome::InboundClosed) => {
                    tracing::info!("Inbound queue closed, stopping WhatsApp session");
                    return Ok(());
                }
                Ok(ConnectionOutcome::Closed {
                    reason,
                    reached_open,
                }) => {
                    health::mark_component_error(COMPONENT, format!("closed: {reason}"));
                    if reached_open || reason.is_logged_out() {
                        backoff.reset();
                    }
                }
                Err(e) => {
                    tracing::warn!("WhatsApp connect failed: {e:#}");
                    health::mark_component_error(COMPONENT, format!("{e:#}"));
                }
            }

            if inbound.is_closed() {
                return Ok(());
            }

            let delay = backoff.next_delay();
            tracing::info!("Reconnecting WhatsApp in {}ms", delay.as_millis());
            health::bump_component_restart(COMPONENT);
            tokio::time::sleep(delay).await;
        }
    }

    /// One connection lifetime: connect, then apply events until it closes.
    pub async fn connect_once(
        &self,
        inbound: &mpsc::Sender<MessagesUpsert>,
    ) -> Result<ConnectionOutcome> {
        self.auth.ensure()?;
        if let Some(me) = self.auth.load_credentials()?.and_then(|c| c.me) {
            self.session.set_phone(Some(phone_from_jid(&me)));
        }

        let (tx, mut rx) = mpsc::channel(64);
        let handle = self.transport.connect(&self.auth, tx).await?;
        self.session.attach(handle);
        tracing::info!("WhatsApp transport `{}` connecting", self.transport.name());

        let mut reached_open = false;
        let reason = loop {
            let Some(event) = rx.recv().await else {
                break DisconnectReason::ConnectionLost;
            };

            match event {
                TransportEvent::Connection(ConnectionUpdate::Qr(code)) => {
                    tracing::info!("Pairing QR received (scan with WhatsApp > Linked Devices)");
                    if self.print_qr {
                        match render_qr(&code) {
                            Ok(rendered) => {
                                eprintln!();
                                eprintln!("WhatsApp QR code (scan in WhatsApp > Linked Devices):");
                                eprintln!("{rendered}");
                                eprintln!();
                            }
                            Err(err) => {
                                tracing::warn!("Failed to render pairing QR: {err}");
                            }
                        }
                    }
                    self.session.set_qr(code);
                }
                TransportEvent::Connection(ConnectionUpdate::Open { me }) => {
                    reached_open = true;
                    self.session.mark_connected(me.as_deref().map(phone_from_jid));
                    health::mark_component_ok(COMPONENT);
                    tracing::info!("WhatsApp connected");
                }
                TransportEvent::Connection(ConnectionUpdate::Close { reason }) => break reason,
                TransportEvent::CredsUpdate(creds) => {
                    if let Err(e) = self.auth.save_credentials(&creds) {
                        tracing::error!("Failed to persist WhatsApp credentials: {e:#}");
                    }
                    if let Some(me) = creds.me.as_deref() {
                        self.session.set_phone(Some(phone_from_jid(me)));
                    }
                }
                TransportEvent::MessagesUpsert(batch) => {
                    if inbound.send(batch).await.is_err() {
                        self.detach().await;
                        return Ok(ConnectionOutcome::InboundClosed);
                    }
                }
            }
        };

        self.detach().await;
        tracing::warn!("WhatsApp connection closed: {reason}");

        if reason.is_logged_out() {
            if let Err(e) = logout(&self.auth) {
                tracing::error!("Failed to wipe credentials after logout: {e:#}");
            }
            self.session.set_phone(None);
        }

        Ok(ConnectionOutcome::Closed {
            reason,
            reached_open,
        })
    }

    async fn detach(&self) {
        if let Some(handle) = self.session.mark_disconnected() {
            handle.close().await;
        }
    }
}
