/// Error kinds surfaced by the bridge core.
///
/// Backends speak `anyhow::Result`; components wrap those failures into the
/// variant that describes which boundary failed so callers can decide whether
/// an entry is skipped, a request fails, or a connection is retried.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Phone number that cannot be canonicalised.
    #[error("invalid phone number format: {0}")]
    Validation(String),

    /// No live transport handle (not paired, reconnecting, or logged out).
    #[error("no active WhatsApp connection")]
    NotConnected,

    /// Inbound media payload could not be fetched or decoded.
    #[error("media decode failed: {0}")]
    MediaDecode(String),

    /// Blob upload or signed-URL generation failed.
    #[error("upload failed: {0}")]
    Upload(String),

    /// Transport refused or failed to deliver an outbound message.
    #[error("transport error: {0}")]
    Transport(String),

    /// App config could not be read while deciding whether to create a lead.
    #[error("app config unavailable: {0}")]
    ConfigUnavailable(String),

    /// Record store read or write failure.
    #[error("record store error: {0}")]
    Store(String),

    /// Local filesystem failure (audio file, credentials directory).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    pub fn store(err: impl std::fmt::Display) -> Self {
        Self::Store(err.to_string())
    }

    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }
}

pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_name_the_failing_boundary() {
        assert_eq!(
            BridgeError::Validation("123".into()).to_string(),
            "invalid phone number format: 123"
        );
        assert_eq!(
            BridgeError::NotConnected.to_string(),
            "no active WhatsApp connection"
        );
        assert!(BridgeError::store("disk full").to_string().contains("disk full"));
    }

    #[test]
    fn io_errors_convert() {
        let err: BridgeError = std::io::Error::new(std::io::ErrorKind::NotFound, "nope").into();
        assert!(matches!(err, BridgeError::Io(_)));
    }
}
