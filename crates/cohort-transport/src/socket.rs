use std::io;
use std::path::PathBuf;

use backon::{ExponentialBuilder, Retryable};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::time::Instant;

use crate::{Address, TransportConfig, TransportError};

/// Any duplex byte stream a connection can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Type-erased stream: plain TCP, Unix socket, or either wrapped in TLS.
pub type BoxedStream = Box<dyn AsyncStream>;

/// A bound listening socket.
///
/// Dropping a Unix-socket listener removes its socket file, so repeated
/// bind/drop cycles on the same path do not fail with `AddrInUse`.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    File { listener: UnixListener, path: PathBuf },
}

impl Listener {
    pub async fn bind(address: &Address) -> Result<Self, TransportError> {
        let bind_err = |source| TransportError::Bind {
            address: address.clone(),
            source,
        };
        match address {
            Address::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port))
                    .await
                    .map_err(bind_err)?;
                Ok(Listener::Tcp(listener))
            }
            Address::File(path) => {
                let listener = UnixListener::bind(path).map_err(bind_err)?;
                Ok(Listener::File {
                    listener,
                    path: path.clone(),
                })
            }
        }
    }

    /// The address peers should dial. For TCP this carries the port the
    /// OS actually assigned, so binding port 0 is fine.
    pub fn local_address(&self) -> Result<Address, TransportError> {
        match self {
            Listener::Tcp(listener) => {
                let addr = listener.local_addr()?;
                Ok(Address::tcp(addr.ip().to_string(), addr.port()))
            }
            Listener::File { path, .. } => Ok(Address::File(path.clone())),
        }
    }

    pub async fn accept(&self) -> Result<BoxedStream, TransportError> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                tracing::trace!(%peer, "accepted tcp connection");
                Ok(Box::new(stream))
            }
            Listener::File { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::File { path, .. } = self {
            if let Err(e) = std::fs::remove_file(&*path) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::debug!(path = %path.display(), "failed to remove socket file: {e}");
                }
            }
        }
    }
}

async fn connect_once(address: &Address) -> io::Result<BoxedStream> {
    match address {
        Address::Tcp { host, port } => {
            let stream = TcpStream::connect((host.as_str(), *port)).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
        Address::File(path) => Ok(Box::new(UnixStream::connect(path).await?)),
    }
}

/// Errors meaning "the peer is not listening yet".
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::NotFound
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::AddrNotAvailable
    )
}

/// Dial `address`, retrying with exponential backoff while the peer is
/// not yet listening, until `deadline`.
///
/// Peers start in arbitrary order, so a refused connection early in a
/// rendezvous is normal.
pub async fn dial(
    address: &Address,
    deadline: Instant,
    config: &TransportConfig,
) -> Result<BoxedStream, TransportError> {
    let backoff = ExponentialBuilder::default()
        .with_min_delay(config.dial_min_delay)
        .with_max_delay(config.dial_max_delay)
        .with_max_times(usize::MAX)
        .with_jitter();

    let attempt = || connect_once(address);
    let retried = attempt
        .retry(backoff)
        .when(is_transient)
        .notify(|e: &io::Error, delay| {
            tracing::trace!(%address, ?delay, "dial failed, retrying: {e}");
        });

    match tokio::time::timeout_at(deadline, retried).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(source)) => Err(TransportError::Connect {
            address: address.clone(),
            source,
        }),
        Err(_) => Err(TransportError::Connect {
            address: address.clone(),
            source: io::Error::new(io::ErrorKind::TimedOut, "peer never started listening"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn tcp_bind_reports_assigned_port() {
        let listener = Listener::bind(&Address::tcp("127.0.0.1", 0)).await.unwrap();
        let Address::Tcp { host, port } = listener.local_address().unwrap() else {
            panic!("expected tcp address")
        };
        assert_eq!(host, "127.0.0.1");
        assert_ne!(port, 0);
    }

    #[tokio::test]
    async fn unix_socket_file_is_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let address = Address::file(dir.path().join("drop.sock")).unwrap();

        let listener = Listener::bind(&address).await.unwrap();
        assert!(dir.path().join("drop.sock").exists());
        drop(listener);
        assert!(!dir.path().join("drop.sock").exists());

        // rebinding the same path works
        let _again = Listener::bind(&address).await.unwrap();
    }

    #[tokio::test]
    async fn dial_waits_for_late_listener() {
        let dir = tempfile::tempdir().unwrap();
        let address = Address::file(dir.path().join("late.sock")).unwrap();
        let config = TransportConfig::new();

        let late = address.clone();
        let server = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let listener = Listener::bind(&late).await.unwrap();
            let mut stream = listener.accept().await.unwrap();
            stream.write_all(b"ok").await.unwrap();
            stream.flush().await.unwrap();
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut stream = dial(&address, deadline, &config).await.unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn dial_gives_up_at_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let address = Address::file(dir.path().join("never.sock")).unwrap();
        let deadline = Instant::now() + Duration::from_millis(150);

        let started = Instant::now();
        let err = dial(&address, deadline, &TransportConfig::new())
            .await
            .err()
            .expect("dial should fail");
        assert!(matches!(err, TransportError::Connect { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
