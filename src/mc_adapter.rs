//! Per-client Minecraft protocol adapter: packet name/id resolution, handshake rewriting and
//! `ProtocolMode` transitions.
//!
//! Full Minecraft packet ID tables are explicitly out of scope; this module only hand-maintains
//! the handful of packet names the core actually inspects, a small hand-rolled table rather than
//! a generated protocol definition. Any packet id outside that table still gets a stable,
//! round-trippable name so it can flow through the poem unexamined.

use crate::codec::{ByteReader, ByteWriter};
use crate::error::CodecError;
use crate::session::{Direction, ProtocolMode};
use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};

/// One entry in the hand-maintained packet table: the packets this core's modules actually touch.
struct KnownPacket {
    mode: ProtocolMode,
    direction: Direction,
    id: i32,
    name: &'static str,
}

/// Packets this core inspects or whose mode-transition semantics it relies on. IDs are
/// illustrative stand-ins for a real protocol-version table, not taken from any specific
/// Minecraft release -- a real deployment would source these from the configured protocol
/// version's actual packet id table instead.
const KNOWN_PACKETS: &[KnownPacket] = &[
    KnownPacket {
        mode: ProtocolMode::Init,
        direction: Direction::Downstream,
        id: 0x00,
        name: "handshake",
    },
    KnownPacket {
        mode: ProtocolMode::Status,
        direction: Direction::Downstream,
        id: 0x00,
        name: "status_request",
    },
    KnownPacket {
        mode: ProtocolMode::Status,
        direction: Direction::Upstream,
        id: 0x00,
        name: "status_response",
    },
    KnownPacket {
        mode: ProtocolMode::Status,
        direction: Direction::Downstream,
        id: 0x01,
        name: "ping",
    },
    KnownPacket {
        mode: ProtocolMode::Status,
        direction: Direction::Upstream,
        id: 0x01,
        name: "pong",
    },
    KnownPacket {
        mode: ProtocolMode::Login,
        direction: Direction::Downstream,
        id: 0x00,
        name: "login_start",
    },
    KnownPacket {
        mode: ProtocolMode::Login,
        direction: Direction::Upstream,
        id: 0x02,
        name: "login_success",
    },
    KnownPacket {
        mode: ProtocolMode::Play,
        direction: Direction::Upstream,
        id: 0x23,
        name: "join_game",
    },
    KnownPacket {
        mode: ProtocolMode::Play,
        direction: Direction::Upstream,
        id: 0x38,
        name: "respawn",
    },
    KnownPacket {
        mode: ProtocolMode::Play,
        direction: Direction::Upstream,
        id: 0x20,
        name: "chunk_data",
    },
    KnownPacket {
        mode: ProtocolMode::Play,
        direction: Direction::Upstream,
        id: 0x0B,
        name: "block_change",
    },
    KnownPacket {
        mode: ProtocolMode::Play,
        direction: Direction::Upstream,
        id: 0x0F,
        name: "multi_block_change",
    },
    KnownPacket {
        mode: ProtocolMode::Play,
        direction: Direction::Upstream,
        id: 0x1C,
        name: "explosion",
    },
    KnownPacket {
        mode: ProtocolMode::Play,
        direction: Direction::Upstream,
        id: 0x09,
        name: "update_block_entity",
    },
];

/// Lazily-interned names for packet ids outside [`KNOWN_PACKETS`], so that arbitrary gameplay
/// packets still round-trip through the poem's string-keyed wire format unexamined. Shared process
/// -wide since an id's synthesized name doesn't depend on which session saw it first.
static UNKNOWN_NAMES: LazyLock<Mutex<HashMap<i32, &'static str>>> = LazyLock::new(|| Mutex::new(HashMap::new()));

fn intern_unknown(id: i32) -> &'static str {
    let mut table = UNKNOWN_NAMES.lock().unwrap();
    if let Some(name) = table.get(&id) {
        return name;
    }
    let name: &'static str = Box::leak(format!("packet_0x{id:02x}").into_boxed_str());
    table.insert(id, name);
    name
}

/// Resolves a decoded packet id to a stable name under `(mode, direction)`.
#[must_use]
pub fn resolve_name(mode: ProtocolMode, direction: Direction, id: i32) -> &'static str {
    for entry in KNOWN_PACKETS {
        if entry.mode == mode && entry.direction == direction && entry.id == id {
            return entry.name;
        }
    }
    intern_unknown(id)
}

/// Resolves a packet name back to its numeric id under `(mode, direction)`, for re-encoding.
/// Falls back to parsing the `packet_0x..` synthesized form for anything [`resolve_name`] didn't
/// recognize.
#[must_use]
pub fn resolve_id(mode: ProtocolMode, direction: Direction, name: &str) -> Option<i32> {
    for entry in KNOWN_PACKETS {
        if entry.mode == mode && entry.direction == direction && entry.name == name {
            return Some(entry.id);
        }
    }
    name.strip_prefix("packet_0x")
        .and_then(|hex| i32::from_str_radix(hex, 16).ok())
}

/// Lazily-interned arbitrary packet names arriving from the peer's poem items, so they can be
/// held as `&'static str` alongside the rest of this core's packet-name plumbing without forcing
/// every call site to carry owned `String`s.
static INTERNED_NAMES: LazyLock<Mutex<HashMap<String, &'static str>>> = LazyLock::new(|| Mutex::new(HashMap::new()));

/// Interns an arbitrary packet name string as a `&'static str`, reusing a previous interning of
/// the same name if one exists. Used when decoding a `PoemItem` off the wire, whose name arrives
/// as an owned `String`.
#[must_use]
pub fn intern(name: &str) -> &'static str {
    for entry in KNOWN_PACKETS {
        if entry.name == name {
            return entry.name;
        }
    }
    let mut table = INTERNED_NAMES.lock().unwrap();
    if let Some(&interned) = table.get(name) {
        return interned;
    }
    let interned: &'static str = Box::leak(name.to_string().into_boxed_str());
    table.insert(name.to_string(), interned);
    interned
}

/// Splits a framed packet body into `(name, payload)` under `(mode, direction)`.
pub fn decode_packet(mode: ProtocolMode, direction: Direction, frame: &[u8]) -> Result<(&'static str, bytes::Bytes), CodecError> {
    let mut reader = ByteReader::new(frame);
    let id = reader.read_varint()?;
    let payload = reader.read_remaining();
    Ok((resolve_name(mode, direction, id), bytes::Bytes::from(payload)))
}

/// Re-encodes `(name, payload)` into a packet id + body under `(mode, direction)`. Returns `None` if `name`
/// isn't resolvable under this table, in which case the caller should drop the packet rather than
/// guess an id.
#[must_use]
pub fn encode_packet(mode: ProtocolMode, direction: Direction, name: &str, payload: &[u8]) -> Option<Vec<u8>> {
    let id = resolve_id(mode, direction, name)?;
    let mut writer = ByteWriter::new();
    writer.write_varint(id);
    writer.write_raw(payload);
    Some(writer.into_inner())
}

/// Rewrites a serverbound `handshake` packet's destination host/port to the real Minecraft server
/// address, unless `ip_forwarding` is set. Returns the rewritten payload and the
/// mode this session should transition to (`status` for `next_state == 1`, otherwise `login`).
pub fn rewrite_handshake(
    payload: &[u8],
    real_host: &str,
    real_port: u16,
    ip_forwarding: bool,
) -> Result<(Vec<u8>, ProtocolMode), CodecError> {
    let mut reader = ByteReader::new(payload);
    let protocol_version = reader.read_varint()?;
    let host = reader.read_string()?;
    let port = reader.read_u16()?;
    let next_state = reader.read_varint()?;

    let (out_host, out_port) = if ip_forwarding {
        (host, port)
    } else {
        (real_host.to_string(), real_port)
    };

    let mut writer = ByteWriter::new();
    writer.write_varint(protocol_version);
    writer.write_string(&out_host);
    writer.write_u16(out_port);
    writer.write_varint(next_state);

    let next_mode = if next_state == 1 {
        ProtocolMode::Status
    } else {
        ProtocolMode::Login
    };

    Ok((writer.into_inner(), next_mode))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake_payload(host: &str, port: u16, next_state: i32) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        writer.write_varint(340);
        writer.write_string(host);
        writer.write_u16(port);
        writer.write_varint(next_state);
        writer.into_inner()
    }

    #[test]
    fn handshake_is_rewritten_when_ip_forwarding_disabled() {
        let payload = handshake_payload("a.example", 25500, 2);
        let (rewritten, mode) = rewrite_handshake(&payload, "10.0.0.5", 25565, false).unwrap();
        assert_eq!(mode, ProtocolMode::Login);

        let mut reader = ByteReader::new(&rewritten);
        let _version = reader.read_varint().unwrap();
        assert_eq!(reader.read_string().unwrap(), "10.0.0.5");
        assert_eq!(reader.read_u16().unwrap(), 25565);
        assert_eq!(reader.read_varint().unwrap(), 2);
    }

    #[test]
    fn handshake_preserves_original_address_when_ip_forwarding_enabled() {
        let payload = handshake_payload("a.example", 25500, 2);
        let (rewritten, mode) = rewrite_handshake(&payload, "10.0.0.5", 25565, true).unwrap();
        assert_eq!(mode, ProtocolMode::Login);

        let mut reader = ByteReader::new(&rewritten);
        let _version = reader.read_varint().unwrap();
        assert_eq!(reader.read_string().unwrap(), "a.example");
        assert_eq!(reader.read_u16().unwrap(), 25500);
    }

    #[test]
    fn handshake_next_state_one_selects_status_mode() {
        let payload = handshake_payload("a.example", 25500, 1);
        let (_rewritten, mode) = rewrite_handshake(&payload, "10.0.0.5", 25565, false).unwrap();
        assert_eq!(mode, ProtocolMode::Status);
    }

    #[test]
    fn known_packet_name_roundtrips_to_its_id() {
        let id = resolve_id(ProtocolMode::Play, Direction::Upstream, "chunk_data").unwrap();
        assert_eq!(resolve_name(ProtocolMode::Play, Direction::Upstream, id), "chunk_data");
    }

    #[test]
    fn unknown_packet_id_gets_a_stable_synthesized_name() {
        let name = resolve_name(ProtocolMode::Play, Direction::Upstream, 0x7f);
        assert_eq!(name, "packet_0x7f");
        assert_eq!(resolve_id(ProtocolMode::Play, Direction::Upstream, name), Some(0x7f));
    }

    #[test]
    fn decode_then_encode_roundtrips_a_known_packet() {
        let mut writer = ByteWriter::new();
        writer.write_varint(0x23);
        writer.write_raw(b"join game body");
        let frame = writer.into_inner();

        let (name, payload) = decode_packet(ProtocolMode::Play, Direction::Upstream, &frame).unwrap();
        assert_eq!(name, "join_game");

        let encoded = encode_packet(ProtocolMode::Play, Direction::Upstream, name, &payload).unwrap();
        assert_eq!(encoded, frame);
    }
}
