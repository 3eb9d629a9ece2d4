use std::time::Duration;

use crate::{TlsConfig, TransportError, DEFAULT_MAX_FRAME_SIZE};

/// Transport settings shared by every connection of a communicator.
///
/// All fields have sensible defaults. Use the builder pattern:
///
/// ```rust
/// use cohort_transport::TransportConfig;
///
/// let config = TransportConfig::new()
///     .max_frame_size(2 * 1024 * 1024)
///     .dial_backoff(std::time::Duration::from_millis(5), std::time::Duration::from_millis(100));
/// ```
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Maximum payload size of a single frame in bytes.
    pub(crate) max_frame_size: usize,
    /// Mutual TLS; plaintext when `None`.
    pub(crate) tls: Option<TlsConfig>,
    /// First retry delay when a dial is refused.
    pub(crate) dial_min_delay: Duration,
    /// Upper bound on the retry delay when a dial is refused.
    pub(crate) dial_max_delay: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportConfig {
    /// Create a new config with defaults.
    ///
    /// If the `COHORT_MAX_FRAME_SIZE` environment variable holds a valid
    /// byte count it replaces the default frame limit. This can be
    /// overridden with [`.max_frame_size()`](Self::max_frame_size).
    pub fn new() -> Self {
        let max_frame_size = std::env::var("COHORT_MAX_FRAME_SIZE")
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(DEFAULT_MAX_FRAME_SIZE);

        Self {
            max_frame_size,
            tls: None,
            dial_min_delay: Duration::from_millis(10),
            dial_max_delay: Duration::from_millis(250),
        }
    }

    /// Set maximum frame payload size (default: 64 MiB).
    pub fn max_frame_size(mut self, bytes: usize) -> Self {
        self.max_frame_size = bytes;
        self
    }

    /// Enable mutual TLS on every connection.
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Bounds of the exponential backoff used while a peer is not yet
    /// listening.
    pub fn dial_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.dial_min_delay = min;
        self.dial_max_delay = max.max(min);
        self
    }

    /// Load TLS settings from `COHORT_TLS_CERT`, `COHORT_TLS_KEY` and
    /// `COHORT_TLS_TRUSTED` (comma-separated PEM files) when present.
    pub fn tls_from_env(self) -> Result<Self, TransportError> {
        let cert = std::env::var("COHORT_TLS_CERT").ok();
        let key = std::env::var("COHORT_TLS_KEY").ok();
        match (cert, key) {
            (None, None) => Ok(self),
            (Some(cert), Some(key)) => {
                let mut tls = TlsConfig::from_pem_files(cert.trim(), key.trim())?;
                if let Ok(trusted) = std::env::var("COHORT_TLS_TRUSTED") {
                    for path in trusted.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                        tls = tls.trust_pem_file(path)?;
                    }
                }
                Ok(self.tls(tls))
            }
            _ => Err(TransportError::Config(
                "COHORT_TLS_CERT and COHORT_TLS_KEY must be set together".into(),
            )),
        }
    }

    pub fn frame_limit(&self) -> usize {
        self.max_frame_size
    }

    pub fn tls_config(&self) -> Option<&TlsConfig> {
        self.tls.as_ref()
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }
}
