//! Central error taxonomy for the link, split along subsystem boundaries: transport, framing,
//! protocol, crypto, worker, cache, and configuration errors each get their own enum rather than
//! one crate-wide catch-all.

use crate::session::SessionId;
use std::io;

/// Errors that can occur while decoding or encoding the inter-proxy wire format or the handful
/// of Minecraft packets this core inspects.
#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    /// The buffer ran out before a full field could be read. Never fatal: callers rewind and
    /// wait for more bytes (the `tokio_util::codec::Decoder` contract turns this into `Ok(None)`
    /// at the frame boundary).
    #[error("short buffer")]
    ShortBuffer,
    /// A `VarInt` did not terminate within the maximum allowed byte count.
    #[error("invalid varint")]
    InvalidVarInt,
    /// A length-prefixed field declared a length larger than the configured packet cap.
    #[error("packet of length {0} exceeds the configured maximum")]
    PacketTooLarge(usize),
    /// A string field was not valid UTF-8.
    #[error("invalid utf-8 string field")]
    InvalidString,
    /// NBT decoding failed.
    #[error("invalid nbt: {0}")]
    InvalidNbt(#[from] fastnbt::error::Error),
    /// A length-only NBT tag walk encountered an id outside the 13 standard NBT tag types.
    #[error("unknown nbt tag id {0}")]
    InvalidNbtTag(u8),
    /// Underlying IO failure while framing.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Errors surfaced by the inter-proxy link, covering transport, authentication and
/// protocol-level failures. These are kept local to the link/session that produced them; only
/// a configuration error is fatal to the whole process.
#[derive(thiserror::Error, Debug)]
pub enum LinkError {
    /// Transport failure (peer close, reset, etc). Triggers reconnect-with-backoff on the
    /// external side.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    /// A link frame could not be decoded.
    #[error("framing error: {0}")]
    Framing(#[from] CodecError),
    /// The peer sent a packet ID this link does not know.
    #[error("unknown link packet id: {0}")]
    UnknownPacketId(u64),
    /// Non-auth data arrived before the link authenticated.
    #[error("unauthenticated data received on link")]
    Unauthenticated,
    /// The presented password hash did not match.
    #[error("authentication failed")]
    AuthenticationFailed,
    /// Decryption failed (bad tag / corrupt ciphertext). Fatal to the link, not to the process.
    #[error("decryption failed")]
    Decrypt,
    /// A single worker-pool item failed to compress or decompress.
    #[error("compression failed for item {index}")]
    Compress {
        /// Index of the failed item, still consumed by the reassembler.
        index: u64,
    },
    /// The session referenced by an inbound poem item is unknown; the item is dropped, not
    /// fatal.
    #[error("unknown session {0:?}")]
    UnknownSession(SessionId),
}

impl LinkError {
    /// Whether this error represents an ordinary, expected connection teardown rather than a
    /// failure worth logging at `warn`.
    #[must_use]
    pub fn is_connection_closed(&self) -> bool {
        matches!(
            self,
            LinkError::Transport(e) if matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe
            )
        )
    }
}

/// Errors from the chunk cache backings.
#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    /// Underlying IO failure for a file-backed cache.
    #[error("cache io error: {0}")]
    Io(#[from] io::Error),
}

/// Configuration errors; the only error class that aborts the whole process.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// The underlying `config` crate failed to build or deserialize the configuration.
    #[error("configuration error: {0}")]
    Source(#[from] config::ConfigError),
    /// No configuration file was found; a template was written and the process should exit.
    #[error("no configuration found, a template was written to {0}")]
    TemplateWritten(String),
    /// An address field could not be parsed as `host:port`.
    #[error("invalid address {field}: {value}")]
    InvalidAddress {
        /// The config field that held the bad value.
        field: &'static str,
        /// The value that failed to parse.
        value: String,
    },
    /// `chunk_caching.threshold` was configured to `0`, which is not a valid pull count.
    #[error("chunk_caching.threshold must be >= 1")]
    InvalidThreshold,
}
