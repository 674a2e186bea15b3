//! `send`: one logical stream per message over a single TCP connection.
//!
//! User-facing output uses writeln! to stdout (this is a CLI binary, not debug output).

use std::io::{self, Write};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::info;

use overmux_core::{Addr, NetProtocol};

use crate::TcpTransport;

/// Bootstrap the session with the first message and dial for the rest.
pub async fn run(transport: &TcpTransport, addr: &Addr, messages: &[String]) -> anyhow::Result<()> {
    let (socket_addr, protocol, _) = addr.resolve_net_addr()?;
    anyhow::ensure!(
        protocol == NetProtocol::Tcp,
        "send needs a tcp address, got {addr}"
    );

    let mut raw = Some(TcpStream::connect(socket_addr).await?);
    info!(addr = %addr, "Connected");

    for message in messages {
        let stream = match raw.take() {
            Some(conn) => transport.client_connect(addr, conn).await?,
            None => transport.dial(addr).await?,
        };
        let session = stream.session_id();

        let mut stream = BufReader::new(stream);
        let line = format!("{}\n", message.trim_end_matches('\n'));
        stream.get_mut().write_all(line.as_bytes()).await?;
        stream.get_mut().flush().await?;

        let mut reply = String::new();
        stream.read_line(&mut reply).await?;
        info!(session, bytes = reply.len(), "Echo received");
        print_reply(reply.trim_end())?;

        stream.into_inner().close().await?;
    }

    let stats = transport.stats().await;
    info!(sessions = stats.sessions, "All messages sent");
    transport.shutdown().await;
    Ok(())
}

fn print_reply(reply: &str) -> io::Result<()> {
    let mut out = io::stdout().lock();
    writeln!(out, "{reply}")
}
