//! The client listener.
//!
//! Serves the operator command surface (CLUSTER ...) and the demo string
//! keyspace over the inline protocol: one whitespace-separated command per
//! line, typed reply frames back. Each connection carries its own
//! ASKING/READONLY routing flags.

use flint_cluster::ClientState;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::bus::Bus;
use crate::commands;
use crate::resp::{parse_inline, Reply};
use crate::time::now_ms;

/// Accept loop for client connections.
pub async fn run(bus: Bus, listener: TcpListener) -> std::io::Error {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!(peer = %addr, "client connected");
                let bus = bus.clone();
                tokio::spawn(async move {
                    serve(bus, stream).await;
                });
            }
            Err(err) => return err,
        }
    }
}

async fn serve(bus: Bus, stream: TcpStream) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let mut client = ClientState::default();

    while let Ok(Some(line)) = lines.next_line().await {
        let argv = parse_inline(&line);
        if argv.is_empty() {
            continue;
        }
        if argv[0].eq_ignore_ascii_case(b"quit") {
            let mut buf = bytes::BytesMut::new();
            Reply::ok().encode(&mut buf);
            let _ = write_half.write_all(&buf).await;
            return;
        }

        let now = now_ms();
        let reply = {
            let mut engine = bus.engine().lock().await;
            commands::dispatch(&mut engine, &argv, &mut client, now)
        };
        bus.settle(now).await;

        let mut buf = bytes::BytesMut::new();
        reply.encode(&mut buf);
        if write_half.write_all(&buf).await.is_err() {
            return;
        }
    }
}

/// Binds the client listener.
pub async fn bind(host: &str, port: u16) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind((host, port)).await?;
    info!(%host, port, "client listener ready");
    Ok(listener)
}
