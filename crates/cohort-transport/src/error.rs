use crate::Address;

/// Errors returned by the Cohort transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: Address,
        #[source]
        source: std::io::Error,
    },

    #[error("connection to {address} failed: {source}")]
    Connect {
        address: Address,
        #[source]
        source: std::io::Error,
    },

    #[error("tls handshake failed: {0}")]
    Tls(String),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("connection closed")]
    Closed,

    #[error("i/o error: {0}")]
    Io(std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl TransportError {
    /// Whether this error came out of TLS negotiation or a TLS alert.
    pub fn is_tls(&self) -> bool {
        matches!(self, TransportError::Tls(_))
    }
}

// tokio-rustls reports handshake failures and received alerts as
// `InvalidData` i/o errors wrapping a `rustls::Error`.
impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        if let Some(tls) = e
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        {
            return TransportError::Tls(tls.to_string());
        }
        TransportError::Io(e)
    }
}

impl From<rustls::Error> for TransportError {
    fn from(e: rustls::Error) -> Self {
        TransportError::Tls(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rustls_errors_inside_io_errors_become_tls() {
        let io = std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            rustls::Error::AlertReceived(rustls::AlertDescription::BadCertificate),
        );
        let err = TransportError::from(io);
        assert!(err.is_tls(), "got {err:?}");
    }

    #[test]
    fn plain_io_errors_stay_io() {
        let io = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        let err = TransportError::from(io);
        assert!(matches!(err, TransportError::Io(_)));
    }

    #[test]
    fn display_frame_too_large() {
        let err = TransportError::FrameTooLarge { size: 128, max: 64 };
        assert_eq!(err.to_string(), "frame too large: 128 bytes (max 64)");
    }
}
