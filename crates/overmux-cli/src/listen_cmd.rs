//! `listen`: serve a line echo on every logical stream.
//!
//! User-facing output uses writeln! to stdout (this is a CLI binary, not debug output).

use std::io::{self, Write};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use overmux::{MuxConn, MuxListener, TransportError};
use overmux_core::{Addr, NetProtocol};

use crate::TcpTransport;

/// Bind `addr`, register a listener and serve until Ctrl-C.
pub async fn run(transport: &TcpTransport, addr: &Addr) -> anyhow::Result<()> {
    let (socket_addr, protocol, _) = addr.resolve_net_addr()?;
    anyhow::ensure!(
        protocol == NetProtocol::Tcp,
        "listen needs a tcp address, got {addr}"
    );

    let socket = TcpListener::bind(socket_addr).await?;
    let listener = transport.listen(addr).await?;
    info!(addr = %addr, bound = %socket.local_addr()?, "Listening");

    let forwarded = tokio::spawn(accept_forwarded(listener));

    loop {
        tokio::select! {
            accepted = socket.accept() => {
                let (conn, peer) = accepted?;
                debug!(peer = %peer, "TCP connection accepted");
                let transport = transport.clone();
                let addr = addr.clone();
                tokio::spawn(async move {
                    match transport.server_accept(&addr, conn).await {
                        Ok(stream) => echo(stream).await,
                        Err(e) => warn!(peer = %peer, error = %e, "Server accept failed"),
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    transport
        .close(addr, async move {
            drop(socket);
            Ok(())
        })
        .await?;
    forwarded.await?;
    transport.shutdown().await;
    Ok(())
}

/// Serve streams forwarded to the listener until it closes.
async fn accept_forwarded(listener: MuxListener) {
    loop {
        match listener.accept().await {
            Ok(stream) => {
                tokio::spawn(echo(stream));
            }
            Err(TransportError::ListenerClosed { .. }) => break,
            Err(e) => warn!(addr = %listener.addr(), error = %e, "Forwarded stream failed"),
        }
    }
}

async fn echo(stream: MuxConn) {
    let peer = stream.remote_addr().clone();
    let session = stream.session_id();
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                info!(session, peer = %peer, bytes = line.len(), "Received line");
                if let Err(e) = print_line(&peer, &line) {
                    warn!(error = %e, "Failed to write to stdout");
                }
                let reply = format!("{line}\n");
                if let Err(e) = writer.write_all(reply.as_bytes()).await {
                    warn!(session, peer = %peer, error = %e, "Echo failed");
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(session, peer = %peer, error = %e, "Read failed");
                break;
            }
        }
    }
    debug!(session, peer = %peer, "Stream finished");
}

fn print_line(peer: &Addr, line: &str) -> io::Result<()> {
    let mut out = io::stdout().lock();
    writeln!(out, "{peer} {line}")
}
