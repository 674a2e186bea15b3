#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! The mux transport over real loopback TCP with the smux multiplexer.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use overmux::{MuxTransport, TransportError};
use overmux::smux::SmuxMultiplexer;
use overmux_core::{Addr, NetProtocol};

fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("overmux=debug")
        .with_test_writer()
        .try_init();
}

async fn read_exactly<R: AsyncReadExt + Unpin>(reader: &mut R, len: usize) -> String {
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await.unwrap();
    String::from_utf8(buf).unwrap()
}

#[tokio::test]
async fn hello_world_over_tcp() {
    init_test_tracing();

    let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let bound = socket.local_addr().unwrap();
    let target = Addr::from_socket_addr(bound, NetProtocol::Tcp)
        .join(&"/mux".parse().unwrap());

    let transport = MuxTransport::with_defaults(SmuxMultiplexer::<TcpStream>::default());
    let listener = transport.listen(&target).await.unwrap();

    let server = {
        let transport = transport.clone();
        let target = target.clone();
        tokio::spawn(async move {
            let (conn, _) = socket.accept().await.unwrap();
            transport.server_accept(&target, conn).await.unwrap()
        })
    };

    let raw = TcpStream::connect(bound).await.unwrap();
    let mut hello = transport.client_connect(&target, raw).await.unwrap();
    hello.write_all(b"hello").await.unwrap();
    hello.flush().await.unwrap();

    let mut world = transport.dial(&target).await.unwrap();
    world.write_all(b"world").await.unwrap();
    world.flush().await.unwrap();

    let mut first = server.await.unwrap();
    assert_eq!(read_exactly(&mut first, 5).await, "hello");
    assert_eq!(first.local_addr(), &target);

    let mut second = listener.accept().await.unwrap();
    assert_eq!(read_exactly(&mut second, 5).await, "world");
    assert_eq!(second.remote_addr(), hello.local_addr());

    let stats = transport.stats().await;
    assert_eq!(stats.sessions, 1);
    assert_eq!(stats.queues, 1);

    transport.shutdown().await;
    assert!(listener.is_closed());
}

#[tokio::test]
async fn dropped_server_session_releases_tcp_connection() {
    init_test_tracing();

    let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let bound = socket.local_addr().unwrap();
    let target = Addr::from_socket_addr(bound, NetProtocol::Tcp)
        .join(&"/mux".parse().unwrap());

    let server_side = MuxTransport::with_defaults(SmuxMultiplexer::<TcpStream>::default());
    let client_side = MuxTransport::with_defaults(SmuxMultiplexer::<TcpStream>::default());

    let server = {
        let target = target.clone();
        tokio::spawn(async move {
            let (conn, _) = socket.accept().await.unwrap();
            server_side.server_accept(&target, conn).await.unwrap()
        })
    };

    let raw = TcpStream::connect(bound).await.unwrap();
    let mut hello = client_side.client_connect(&target, raw).await.unwrap();
    hello.write_all(b"hello").await.unwrap();
    hello.flush().await.unwrap();

    // No listener: the first stream holds the last reference to the session.
    let mut first = server.await.unwrap();
    assert_eq!(read_exactly(&mut first, 5).await, "hello");
    drop(first);

    let ended = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match client_side.dial(&target).await {
                Err(TransportError::StreamOpenFailed { source, .. }) => {
                    assert!(source.is_session_end());
                    break;
                }
                Ok(conn) => drop(conn),
                Err(other) => panic!("unexpected dial error: {other}"),
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(ended.is_ok(), "server session kept its TCP connection open");
    assert!(matches!(
        client_side.dial(&target).await.unwrap_err(),
        TransportError::SessionNotFound { .. }
    ));
}
