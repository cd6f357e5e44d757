//! External-side bootstrap: the TCP accept loop and its supporting timers that turn a
//! [`crate::link::LinkConnection`] into a running client-facing proxy.
//!
//! Follows the usual `tokio::select!`-over-`listener.accept()`-and-a-shutdown-signal accept loop
//! shape, one spawned task per accepted connection, adapted so each accepted socket becomes a
//! [`crate::link::LocalEvent::ExternalAccepted`] fed to the link rather than being served directly
//! -- the link, not the accept loop, owns the session table.

use crate::admission::AdmissionGate;
use crate::chunk_cache::{ChunkCache, FileChunkCache, InMemoryChunkCache};
use crate::chunk_cache_module::{dimension_file_name, ChunkCacheModule, ChunkCacheState, DIMENSIONS};
use crate::cipher::LinkKey;
use crate::config::Config;
use crate::error::LinkError;
use crate::link::{self, LinkRole, LocalEvent};
use crate::module::Module;
use crate::session::SessionId;
use bytes::Bytes;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{info, warn};

/// Entries per dimension kept by the in-memory chunk cache absent any size hint from configuration.
const DEFAULT_CACHE_CAPACITY: usize = 8192;

/// Runs the external proxy until a fatal bind error or `ctrl_c`. Accepts clients on
/// `config.external.bind`, relaying each across a link connection to `config.external.internal`,
/// reconnecting with backoff whenever that link drops.
pub async fn run(config: Config) -> io::Result<()> {
    let listener = TcpListener::bind(&config.external.bind).await?;
    info!(bind = %config.external.bind, "external proxy listening");

    let cache_state = build_chunk_cache_state(&config);
    tokio::spawn(chunk_cache_maintenance_loop(cache_state.clone(), config.global.buffer_ms));

    let cipher = if config.global.secret.is_empty() {
        None
    } else {
        Some(LinkKey::derive(&config.global.secret))
    };

    let gate = Arc::new(Mutex::new(AdmissionGate::new(config.external.player_limit)));

    'reconnect: loop {
        let link = link::connect_with_backoff(
            &config.external.internal,
            LinkRole::External,
            config.global.password.clone(),
            cipher.clone(),
            config.global.buffer_ms,
        )
        .await;

        let (local_tx, local_rx) = mpsc::unbounded_channel();
        let (toggle_tx, toggle_rx) = mpsc::unbounded_channel();
        let link = link.with_local_events(local_tx.clone(), local_rx).with_toggle_source(toggle_rx);

        let mut link_task = tokio::spawn(link.run());

        loop {
            tokio::select! {
                biased;

                _ = tokio::signal::ctrl_c() => {
                    info!("external proxy shutting down");
                    link_task.abort();
                    return Ok(());
                }

                result = &mut link_task => {
                    let err = result.unwrap_or_else(|e| LinkError::Transport(io::Error::other(e)));
                    if !err.is_connection_closed() {
                        warn!(error = %err, "link to internal proxy ended, reconnecting");
                    } else {
                        info!("link to internal proxy closed, reconnecting");
                    }
                    continue 'reconnect;
                }

                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, addr)) => {
                            accept_one(socket, addr, &local_tx, &toggle_tx, &cache_state, &gate);
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    }
                }
            }
        }
    }
}

fn accept_one(
    socket: TcpStream,
    addr: std::net::SocketAddr,
    local_tx: &mpsc::UnboundedSender<LocalEvent>,
    toggle_tx: &crate::chunk_cache_module::ToggleChunkSender,
    cache_state: &Option<Arc<Mutex<ChunkCacheState>>>,
    gate: &Arc<Mutex<AdmissionGate>>,
) {
    if !gate.lock().unwrap().try_admit() {
        warn!(%addr, "player limit reached, rejecting connection");
        drop(socket);
        return;
    }

    let _ = socket.set_nodelay(true);
    let id = SessionId::new();
    let (read_half, write_half) = socket.into_split();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

    // `write_socket_loop` exits exactly when its `rx` is closed, which happens when the session's
    // `ClientSession` (and the outbound sender it holds) is dropped from the session table -- the
    // natural signal that this connection's admission slot is free again.
    let gate_for_release = gate.clone();
    tokio::spawn(async move {
        write_socket_loop(write_half, outbound_rx).await;
        gate_for_release.lock().unwrap().release();
    });

    let mut modules: Vec<Box<dyn Module>> = Vec::new();
    if let Some(shared) = cache_state {
        modules.push(Box::new(ChunkCacheModule::new(shared.clone(), toggle_tx.clone())));
    }

    if local_tx
        .send(LocalEvent::ExternalAccepted {
            id,
            outbound: outbound_tx,
            modules,
            read_half,
        })
        .is_err()
    {
        // the link died between accept() returning and this send; dropping `outbound_tx` here
        // (it already was, going out of scope above) lets the write loop above exit and release
        // the gate slot on its own.
        return;
    }

    info!(%addr, session = ?id, "client connected");
}

async fn write_socket_loop(mut write_half: tokio::net::tcp::OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Bytes>) {
    use tokio::io::AsyncWriteExt;
    while let Some(frame) = rx.recv().await {
        if write_half.write_all(&frame).await.is_err() {
            return;
        }
    }
}

async fn chunk_cache_maintenance_loop(state: Option<Arc<Mutex<ChunkCacheState>>>, buffer_ms: u64) {
    let Some(state) = state else {
        return;
    };
    let mut ticker = interval(Duration::from_millis(buffer_ms.max(1) * 2));
    loop {
        ticker.tick().await;
        let mut guard = state.lock().unwrap();
        guard.clear_recent_hashes();
        guard.gc_all();
    }
}

fn build_chunk_cache_state(config: &Config) -> Option<Arc<Mutex<ChunkCacheState>>> {
    if !config.chunk_caching.enabled {
        return None;
    }

    let mut caches: HashMap<i32, Box<dyn ChunkCache>> = HashMap::new();
    for dimension in DIMENSIONS {
        let cache: Box<dyn ChunkCache> = if config.chunk_caching.path == ":memory:" {
            Box::new(InMemoryChunkCache::new(DEFAULT_CACHE_CAPACITY))
        } else {
            let path = PathBuf::from(format!("{}_{}.db", config.chunk_caching.path, dimension_file_name(dimension)));
            match FileChunkCache::open(path, DEFAULT_CACHE_CAPACITY) {
                Ok(cache) => Box::new(cache),
                Err(e) => {
                    warn!(error = %e, dimension, "failed to open chunk cache file, falling back to in-memory");
                    Box::new(InMemoryChunkCache::new(DEFAULT_CACHE_CAPACITY))
                }
            }
        };
        caches.insert(dimension, cache);
    }

    Some(Arc::new(Mutex::new(ChunkCacheState::new(caches, config.chunk_caching.threshold))))
}
