//! Integration tests: framed connections between two endpoints on localhost.

use std::time::Duration;

use cohort_transport::{
    dial, Address, Connection, Frame, Listener, TlsConfig, TlsContext, TlsIdentity,
    TransportConfig, TransportError,
};
use futures_util::{SinkExt, StreamExt};
use tokio::time::Instant;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .try_init();
}

fn deadline() -> Instant {
    Instant::now() + Duration::from_secs(10)
}

/// Listener on `address`, one dialer; frames flow both ways.
async fn exchange_over(address: Address) {
    let config = TransportConfig::new();
    let listener = Listener::bind(&address).await.unwrap();
    let address = listener.local_address().unwrap();

    let server = tokio::spawn(async move {
        let stream = listener.accept().await.unwrap();
        let mut conn = Connection::new(stream, 1024 * 1024);
        let frame = conn.recv().await.unwrap();
        conn.send(Frame::new(frame.tag + 1, 1, 0, frame.payload))
            .await
            .unwrap();
    });

    let stream = dial(&address, deadline(), &config).await.unwrap();
    let mut conn = Connection::new(stream, config.frame_limit());
    conn.send(Frame::new(41, 0, 0, b"payload".to_vec()))
        .await
        .unwrap();
    let reply = conn.recv().await.unwrap();
    assert_eq!(reply.tag, 42);
    assert_eq!(reply.sender, 1);
    assert_eq!(&reply.payload[..], b"payload");
    server.await.unwrap();
}

#[tokio::test]
async fn tcp_exchange() {
    init_tracing();
    exchange_over(Address::tcp("127.0.0.1", 0)).await;
}

#[tokio::test]
async fn unix_socket_exchange() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    exchange_over(Address::file(dir.path().join("exchange.sock")).unwrap()).await;
}

/// Split halves keep per-connection ordering under load.
#[tokio::test(flavor = "multi_thread")]
async fn split_halves_preserve_order() {
    init_tracing();
    const COUNT: u64 = 20_000;

    let listener = Listener::bind(&Address::tcp("127.0.0.1", 0)).await.unwrap();
    let address = listener.local_address().unwrap();
    let config = TransportConfig::new();

    let receiver = tokio::spawn(async move {
        let stream = listener.accept().await.unwrap();
        let (mut reader, _writer) = Connection::new(stream, 1024).split();
        let mut expected = 0u64;
        while let Some(frame) = reader.next().await {
            let frame = frame.unwrap();
            assert_eq!(frame.sequence, expected);
            expected += 1;
        }
        expected
    });

    let stream = dial(&address, deadline(), &config).await.unwrap();
    let (read_half, mut writer) = Connection::new(stream, 1024).split();
    for seq in 0..COUNT {
        writer
            .feed(Frame::new(0, 0, seq, seq.to_be_bytes().to_vec()))
            .await
            .unwrap();
    }
    writer.close().await.unwrap();
    drop(read_half);

    assert_eq!(receiver.await.unwrap(), COUNT);
}

/// Frames travel inside TLS when both sides trust each other.
#[tokio::test]
async fn tls_framed_exchange() {
    init_tracing();
    let a = TlsIdentity::self_signed().unwrap();
    let b = TlsIdentity::self_signed().unwrap();
    let a_ctx =
        TlsContext::new(&TlsConfig::new(a.clone()).trust(b.certificate().clone())).unwrap();
    let b_ctx = TlsContext::new(&TlsConfig::new(b).trust(a.certificate().clone())).unwrap();

    let listener = Listener::bind(&Address::tcp("127.0.0.1", 0)).await.unwrap();
    let address = listener.local_address().unwrap();

    let server = tokio::spawn(async move {
        let stream = b_ctx.accept(listener.accept().await.unwrap()).await.unwrap();
        let mut conn = Connection::new(stream, 1024);
        conn.recv().await.unwrap()
    });

    let stream = dial(&address, deadline(), &TransportConfig::new())
        .await
        .unwrap();
    let mut conn = Connection::new(a_ctx.connect(stream).await.unwrap(), 1024);
    conn.send(Frame::new(9, 3, 7, b"secret".to_vec()))
        .await
        .unwrap();

    let frame = server.await.unwrap();
    assert_eq!((frame.tag, frame.sender, frame.sequence), (9, 3, 7));
    assert_eq!(&frame.payload[..], b"secret");
}

/// Oversized frames fail locally without touching the wire.
#[tokio::test]
async fn reject_oversized_frame() {
    init_tracing();
    let (a, _b) = tokio::io::duplex(1024);
    let mut conn = Connection::new(Box::new(a), 64);
    match conn.send(Frame::new(0, 0, 0, vec![0u8; 128])).await {
        Err(TransportError::FrameTooLarge { size, max }) => {
            assert_eq!(size, 128);
            assert_eq!(max, 64);
        }
        other => panic!("expected FrameTooLarge, got: {other:?}"),
    }
}
