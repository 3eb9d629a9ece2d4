//! Cohort transport layer.
//!
//! Addressing (`tcp://` and `file://`), listeners and retrying dialers,
//! optional mutual TLS, and a self-delimiting frame codec over any
//! duplex byte stream. The communicator crate builds its connection mesh
//! on top of these pieces.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use cohort_transport::{Address, Connection, Frame, Listener, TransportConfig};
//!
//! # async fn example() -> Result<(), cohort_transport::TransportError> {
//! let config = TransportConfig::new();
//! let listener = Listener::bind(&"tcp://127.0.0.1:0".parse()?).await?;
//! let address = listener.local_address()?;
//!
//! let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
//! let stream = cohort_transport::dial(&address, deadline, &config).await?;
//! let mut conn = Connection::new(stream, config.frame_limit());
//! conn.send(Frame::new(7, 0, 0, b"hello".to_vec())).await?;
//! # Ok(())
//! # }
//! ```

mod address;
mod config;
mod connection;
mod error;
mod frame;
mod socket;
mod tls;

pub use address::{Address, Family};
pub use config::TransportConfig;
pub use connection::{Connection, FrameReader, FrameWriter};
pub use error::TransportError;
pub use frame::{Frame, FrameCodec, FLAG_ACK_REQUESTED, HEADER_LEN};
pub use socket::{dial, AsyncStream, BoxedStream, Listener};
pub use tls::{TlsConfig, TlsContext, TlsIdentity, TLS_SERVER_NAME};

/// Default upper bound on a single frame's payload (64 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;
