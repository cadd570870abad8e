//! In-process transport for local development and tests.
//!
//! `connect` behaves like a real linked device: with stored credentials the
//! connection opens immediately, otherwise a pairing QR is issued and the
//! connection opens once [`LoopbackTransport::pair`] is called. Inbound
//! traffic and disconnects are injected through the same handle.

use super::{
    AuthState, ConnectionUpdate, Credentials, DisconnectReason, MessagesUpsert, OutboundPayload,
    Transport, TransportEvent, TransportHandle,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub jid: String,
    pub payload: OutboundPayload,
    pub message_id: String,
}

#[derive(Default)]
struct Inner {
    connects: AtomicUsize,
    failing_connects: AtomicUsize,
    fail_sends: AtomicBool,
    events: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    sent: Mutex<Vec<SentMessage>>,
}

#[derive(Clone, Default)]
pub struct LoopbackTransport {
    inner: Arc<Inner>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.inner.failing_connects.store(n, Ordering::SeqCst);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.inner.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn sent_messages(&self) -> Vec<SentMessage> {
        self.inner.sent.lock().clone()
    }

    /// Push an event onto the current connection. Returns false when no
    /// connection is listening.
    pub async fn emit(&self, event: TransportEvent) -> bool {
        let sender = self.inner.events.lock().clone();
        match sender {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Complete pairing as account `me`.
    pub async fn pair(&self, me: &str) -> bool {
        let creds = Credentials {
            me: Some(me.to_string()),
            push_name: None,
            registered: true,
        };
        self.emit(TransportEvent::CredsUpdate(creds)).await
            && self
                .emit(TransportEvent::Connection(ConnectionUpdate::Open {
                    me: Some(me.to_string()),
                }))
                .await
    }

    pub async fn deliver(&self, batch: MessagesUpsert) -> bool {
        self.emit(TransportEvent::MessagesUpsert(batch)).await
    }

    pub async fn disconnect(&self, reason: DisconnectReason) -> bool {
        self.emit(TransportEvent::Connection(ConnectionUpdate::Close { reason }))
            .await
    }

    /// Poll until at least `n` connects happened or `timeout` elapses.
    pub async fn wait_for_connects(&self, n: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.connect_count() < n {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        true
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn name(&self) -> &str {
        "loopback"
    }

    async fn connect(
        &self,
        auth: &AuthState,
        events: mpsc::Sender<TransportEvent>,
    ) -> anyhow::Result<Arc<dyn TransportHandle>> {
        let attempt = self.inner.connects.fetch_add(1, Ordering::SeqCst) + 1;

        let failing = self.inner.failing_connects.load(Ordering::SeqCst);
        if failing > 0 {
            self.inner
                .failing_connects
                .store(failing - 1, Ordering::SeqCst);
            anyhow::bail!("loopback connect attempt {attempt} refused");
        }

        *self.inner.events.lock() = Some(events.clone());

        let first = match auth.load_credentials()?.and_then(|c| c.me) {
            Some(me) => ConnectionUpdate::Open { me: Some(me) },
            None => ConnectionUpdate::Qr(format!("loopback-pairing-{attempt}")),
        };
        events.send(TransportEvent::Connection(first)).await?;

        Ok(Arc::new(LoopbackHandle {
            inner: Arc::clone(&self.inner),
            closed: AtomicBool::new(false),
        }))
    }
}

struct LoopbackHandle {
    inner: Arc<Inner>,
    closed: AtomicBool,
}

#[async_trait]
impl TransportHandle for LoopbackHandle {
    async fn send_message(&self, jid: &str, payload: OutboundPayload) -> anyhow::Result<String> {
        if self.closed.load(Ordering::SeqCst) {
            anyhow::bail!("loopback connection is closed");
        }
        if self.inner.fail_sends.load(Ordering::SeqCst) {
            anyhow::bail!("loopback send refused");
        }
        let message_id = format!("LB{}", uuid::Uuid::new_v4().simple());
        self.inner.sent.lock().push(SentMessage {
            jid: jid.to_string(),
            payload,
            message_id: message_id.clone(),
        });
        Ok(message_id)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn unpaired_connect_issues_qr() {
        let tmp = TempDir::new().unwrap();
        let transport = LoopbackTransport::new();
        let (tx, mut rx) = mpsc::channel(8);

        transport
            .connect(&AuthState::new(tmp.path()), tx)
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            TransportEvent::Connection(ConnectionUpdate::Qr(code)) => {
                assert_eq!(code, "loopback-pairing-1");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stored_credentials_open_immediately() {
        let tmp = TempDir::new().unwrap();
        let auth = AuthState::new(tmp.path());
        auth.save_credentials(&Credentials {
            me: Some("5215512345678@s.whatsapp.net".into()),
            ..Credentials::default()
        })
        .unwrap();

        let transport = LoopbackTransport::new();
        let (tx, mut rx) = mpsc::channel(8);
        transport.connect(&auth, tx).await.unwrap();

        assert!(matches!(
            rx.recv().await.unwrap(),
            TransportEvent::Connection(ConnectionUpdate::Open { me: Some(_) })
        ));
    }

    #[tokio::test]
    async fn failing_connects_are_consumed() {
        let tmp = TempDir::new().unwrap();
        let auth = AuthState::new(tmp.path());
        let transport = LoopbackTransport::new();
        transport.fail_next_connects(1);

        let (tx, _rx) = mpsc::channel(8);
        assert!(transport.connect(&auth, tx.clone()).await.is_err());
        assert!(transport.connect(&auth, tx).await.is_ok());
        assert_eq!(transport.connect_count(), 2);
    }

    #[tokio::test]
    async fn closed_handle_refuses_sends() {
        let tmp = TempDir::new().unwrap();
        let transport = LoopbackTransport::new();
        let (tx, _rx) = mpsc::channel(8);
        let handle = transport
            .connect(&AuthState::new(tmp.path()), tx)
            .await
            .unwrap();

        let id = handle
            .send_message("525512345678@s.whatsapp.net", OutboundPayload::Text("hola".into()))
            .await
            .unwrap();
        assert!(id.starts_with("LB"));
        assert_eq!(transport.sent_messages().len(), 1);

        handle.close().await;
        assert!(handle
            .send_message("525512345678@s.whatsapp.net", OutboundPayload::Text("x".into()))
            .await
            .is_err());
    }
}
