//! Internal-side bootstrap: listens for the external proxy's single inbound link connection and
//! drives the ping-then-connect sequence that opens each emulated client's socket to the real
//! Minecraft server.
//!
//! A second inbound link connection while one is already being served is refused outright --
//! this side only ever serves one link at a time, in contrast to the external side's many
//! client connections.

use crate::chunk_cache_module::ChunkCacheRelay;
use crate::cipher::LinkKey;
use crate::config::{self, Config};
use crate::error::LinkError;
use crate::link::{LinkConnection, LinkRole, LocalEvent};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Runs the internal proxy until a fatal bind error or `ctrl_c`. Serves link connections from the
/// external proxy one at a time on `config.internal.bind`; a second inbound connection while one
/// is already active is dropped outright rather than queued.
pub async fn run(config: Config) -> io::Result<()> {
    let listener = TcpListener::bind(&config.internal.bind).await?;
    info!(bind = %config.internal.bind, "internal proxy listening");

    let (real_host, real_port) = config::parse_host_port("internal.minecraft", &config.internal.minecraft)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

    let link_active = Arc::new(AtomicBool::new(false));

    loop {
        tokio::select! {
            biased;

            _ = tokio::signal::ctrl_c() => {
                info!("internal proxy shutting down");
                return Ok(());
            }

            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, addr)) => {
                        if link_active.swap(true, Ordering::SeqCst) {
                            warn!(%addr, "a link connection is already active, dropping second inbound connection");
                            drop(socket);
                            continue;
                        }
                        info!(%addr, "external proxy connected");
                        let link_active = link_active.clone();
                        let config = config.clone();
                        let real_host = real_host.clone();
                        tokio::spawn(async move {
                            serve_link(socket, &config, real_host, real_port).await;
                            link_active.store(false, Ordering::SeqCst);
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        }
    }
}

/// Serves one link connection end-to-end, returning once it ends so the accept loop can wait for
/// the external side to reconnect.
async fn serve_link(socket: TcpStream, config: &Config, real_host: String, real_port: u16) {
    let _ = socket.set_nodelay(true);

    let cipher = if config.global.secret.is_empty() {
        None
    } else {
        Some(LinkKey::derive(&config.global.secret))
    };

    let relay = Arc::new(Mutex::new(ChunkCacheRelay::new()));
    let (local_tx, local_rx) = mpsc::unbounded_channel();
    let (add_conn_tx, mut add_conn_rx) = mpsc::unbounded_channel();

    let link = LinkConnection::new(socket, LinkRole::Internal, config.global.password.clone(), cipher, config.global.buffer_ms)
        .with_server_rewrite(real_host.clone(), real_port, config.global.ip_forwarding)
        .with_chunk_relay(relay)
        .with_local_events(local_tx.clone(), local_rx)
        .with_add_conn_notifications(add_conn_tx);

    let protocol_version = config.global.protocol_version;
    let mut link_task = tokio::spawn(link.run());

    loop {
        tokio::select! {
            biased;

            result = &mut link_task => {
                let err = result.unwrap_or_else(|e| LinkError::Transport(io::Error::other(e)));
                if !err.is_connection_closed() {
                    warn!(error = %err, "link to external proxy ended");
                } else {
                    info!("link to external proxy closed");
                }
                return;
            }

            Some(()) = add_conn_rx.recv() => {
                let host = real_host.clone();
                let local_tx = local_tx.clone();
                tokio::spawn(connect_emulated_client(host, real_port, protocol_version, local_tx));
            }
        }
    }
}

/// Pings the real server, then (on success) opens a fresh TCP connection to it and hands it to the
/// link as a [`LocalEvent::EmulatedConnected`], which fills whichever sentinel session slot is
/// still waiting. A failed ping or connect simply means one fewer emulated client gets opened; the
/// triggering `add_conn` already registered its session as a sentinel, which stays empty until a
/// later attempt succeeds.
async fn connect_emulated_client(host: String, port: u16, protocol_version: i32, local_tx: mpsc::UnboundedSender<LocalEvent>) {
    if let Err(e) = crate::pinger::ping(&host, port, protocol_version).await {
        warn!(error = %e, host, port, "server ping failed, not opening an emulated client connection");
        return;
    }

    let socket = match TcpStream::connect((host.as_str(), port)).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!(error = %e, host, port, "emulated client connect failed");
            return;
        }
    };
    let _ = socket.set_nodelay(true);

    let (read_half, write_half) = socket.into_split();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    tokio::spawn(write_socket_loop(write_half, outbound_rx));

    let _ = local_tx.send(LocalEvent::EmulatedConnected {
        outbound: outbound_tx,
        read_half,
    });
}

async fn write_socket_loop(mut write_half: tokio::net::tcp::OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<bytes::Bytes>) {
    use tokio::io::AsyncWriteExt;
    while let Some(frame) = rx.recv().await {
        if write_half.write_all(&frame).await.is_err() {
            return;
        }
    }
}
