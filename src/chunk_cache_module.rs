//! Chunk-cache module: detects repeated chunks on the clientbound path, deduplicates them
//! on the wire, replays cached payloads, and keeps cached chunks consistent under block updates.
//!
//! Two halves cooperate across the link, both defined here:
//!
//! - [`ChunkCacheModule`] mounts on the external side's per-session module pipeline (send/
//!   clientbound direction) and owns the actual [`ChunkCache`] backing plus the per-
//!   dimension pull tracker. It decides when a chunk graduates into the cache and emits
//!   `toggle_chunk` to tell the internal side to start eliding that chunk's payload.
//! - [`ChunkCacheRelay`] mounts on the internal side's equivalent pipeline (between the real
//!   server connection and the poem input buffer) and elides the payload of any full chunk packet
//!   whose key the external side has already toggled as cached, replacing it with an empty-payload
//!   marker.
//!
//! `toggle_chunk`'s wire payload carries only `dimension` and `key`; it is a pure toggle, not a
//! set/unset flag. The relay simply flips its local `peer_cached` membership for that key on
//! every message it receives, which is why the external side re-sends one `toggle_chunk` per
//! already-cached key when it re-seeds from its backing cache on startup, and another when a
//! cached entry disappears out from under it (retirement).

use crate::chunk_cache::{ChunkCache, ChunkKey};
use crate::codec::{ByteReader, ByteWriter, ChunkSection};
use crate::error::CodecError;
use crate::module::{HandlerDirection, Module, PacketAction};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Dimensions this core tracks chunk caches for: nether, overworld, end.
pub const DIMENSIONS: [i32; 3] = [-1, 0, 1];

/// Maps a dimension id to the file-name stem used for it (`<prefix>_<name>.db`).
#[must_use]
pub fn dimension_file_name(dimension: i32) -> &'static str {
    match dimension {
        -1 => "nether",
        1 => "end",
        _ => "overworld",
    }
}

/// Number of biome entries packed after chunk sections in a full chunk column (16x16 columns).
const BIOME_COUNT: usize = 256;

fn fingerprint(bytes: &[u8]) -> [u8; 16] {
    let digest = Sha256::digest(bytes);
    digest[..16].try_into().unwrap()
}

/// Process-wide (per external process) chunk cache state shared by every session's
/// [`ChunkCacheModule`] instance: the per-dimension [`ChunkCache`] backings, the pull
/// tracker, and the short-lived duplicate-hash set. Guarded by a plain `Mutex`
/// rather than split across tasks -- a single external-side IO task is the only concurrent
/// accessor in practice, and no part of this crate shares mutable state across threads without
/// one; the lock exists only so `Arc` can be cloned into each session's module without unsafe
/// aliasing.
pub struct ChunkCacheState {
    caches: HashMap<i32, Box<dyn ChunkCache>>,
    tracker: HashMap<i32, HashMap<ChunkKey, u32>>,
    recent_hashes: HashMap<i32, HashSet<[u8; 16]>>,
    threshold: u32,
    seeded: bool,
}

impl ChunkCacheState {
    /// Builds cache state from one backing per dimension and the configured pull threshold.
    /// `threshold` is clamped to at least 1 -- a cache that graduates a chunk on its very first
    /// sight would defeat the point of waiting to see if it's worth caching at all.
    #[must_use]
    pub fn new(caches: HashMap<i32, Box<dyn ChunkCache>>, threshold: u32) -> Self {
        Self {
            caches,
            tracker: HashMap::new(),
            recent_hashes: HashMap::new(),
            threshold: threshold.max(1),
            seeded: false,
        }
    }

    /// Runs a GC pass over every dimension's cache. Called periodically by the external
    /// process's bootstrap.
    pub fn gc_all(&mut self) {
        for cache in self.caches.values_mut() {
            cache.gc();
        }
    }

    fn tracker_count(&self, dimension: i32, key: ChunkKey) -> u32 {
        self.tracker
            .get(&dimension)
            .and_then(|m| m.get(&key))
            .copied()
            .unwrap_or(0)
    }

    fn tracker_increment(&mut self, dimension: i32, key: ChunkKey) -> u32 {
        let entry = self.tracker.entry(dimension).or_default().entry(key).or_insert(0);
        *entry += 1;
        *entry
    }

    fn tracker_set(&mut self, dimension: i32, key: ChunkKey, value: u32) {
        self.tracker.entry(dimension).or_default().insert(key, value);
    }

    fn tracker_remove(&mut self, dimension: i32, key: ChunkKey) {
        if let Some(map) = self.tracker.get_mut(&dimension) {
            map.remove(&key);
        }
    }

    /// Keys already in this dimension's cache at startup, each of which should be re-seeded at
    /// `threshold + 1` and re-announced to the peer.
    fn seed_keys(&self, dimension: i32) -> Vec<ChunkKey> {
        self.caches
            .get(&dimension)
            .map(ChunkCache::keys)
            .unwrap_or_default()
    }

    /// Clears the duplicate-suppression set for every dimension. Called periodically (every
    /// `2 * buffer_ms`) by the maintenance loop, so a hash only ever suppresses a duplicate send
    /// within one short window rather than for the lifetime of the process.
    pub fn clear_recent_hashes(&mut self) {
        for set in self.recent_hashes.values_mut() {
            set.clear();
        }
    }

    fn is_duplicate(&mut self, dimension: i32, payload: &[u8]) -> bool {
        let print = fingerprint(payload);
        !self.recent_hashes.entry(dimension).or_default().insert(print)
    }
}

/// Handle used to emit `toggle_chunk` notifications to the peer over the link.
pub type ToggleChunkSender = mpsc::UnboundedSender<(i32, ChunkKey)>;

/// External-side chunk cache module, mounted on one session's clientbound/send pipeline.
pub struct ChunkCacheModule {
    shared: Arc<Mutex<ChunkCacheState>>,
    dimension: i32,
    toggle_tx: ToggleChunkSender,
}

impl ChunkCacheModule {
    /// Creates a module instance for one session, sharing cache state with every other session
    /// on this external process.
    #[must_use]
    pub fn new(shared: Arc<Mutex<ChunkCacheState>>, toggle_tx: ToggleChunkSender) -> Self {
        Self {
            shared,
            dimension: 0,
            toggle_tx,
        }
    }

    /// Re-seeds every dimension's tracker from the backing cache and announces each already-cached key to the
    /// peer. Only needs to run once per external process, not once per session -- the `seeded`
    /// flag lives on the shared state (not this per-session instance) so the second session's
    /// `on_connect` doesn't re-announce and flip the relay's toggles back off.
    fn seed_if_needed(&mut self) {
        let mut shared = self.shared.lock().unwrap();
        if shared.seeded {
            return;
        }
        shared.seeded = true;
        for dimension in DIMENSIONS {
            for key in shared.seed_keys(dimension) {
                shared.tracker_set(dimension, key, shared.threshold + 1);
                let _ = self.toggle_tx.send((dimension, key));
            }
        }
    }

    fn handle_join_game(&mut self, payload: &[u8]) -> PacketAction {
        if let Ok(dimension) = parse_join_game_dimension(payload) {
            self.dimension = dimension;
        }
        PacketAction::Pass
    }

    fn handle_respawn(&mut self, payload: &[u8]) -> PacketAction {
        let mut reader = ByteReader::new(payload);
        if let Ok(dimension) = reader.read_i32() {
            self.dimension = dimension;
        }
        PacketAction::Pass
    }

    fn handle_chunk_data(&mut self, payload: &[u8]) -> (PacketAction, Vec<(&'static str, bytes::Bytes)>) {
        let Ok(header) = ChunkDataHeader::parse(payload) else {
            return (PacketAction::Pass, Vec::new());
        };
        let dimension = self.dimension;
        let mut shared = self.shared.lock().unwrap();

        if !header.full_chunk {
            return (self.apply_delta(&mut shared, dimension, &header), Vec::new());
        }

        if header.body.is_empty() {
            // the internal side elided this chunk's payload: replay from our own cache.
            return (self.replay_cached(&mut shared, dimension, header.key), Vec::new());
        }

        let count = shared.tracker_increment(dimension, header.key);
        if count <= shared.threshold {
            return (PacketAction::Pass, Vec::new());
        }

        shared.caches.entry(dimension).or_insert_with(|| {
            Box::new(crate::chunk_cache::InMemoryChunkCache::new(8192))
        });
        if let Some(cache) = shared.caches.get_mut(&dimension) {
            cache.insert(header.key, header.body.to_vec());
        }
        let _ = self.toggle_tx.send((dimension, header.key));
        (PacketAction::Pass, Vec::new())
    }

    fn replay_cached(&self, shared: &mut ChunkCacheState, dimension: i32, key: ChunkKey) -> PacketAction {
        let Some(cache) = shared.caches.get_mut(&dimension) else {
            return self.retire(shared, dimension, key);
        };
        match cache.get(key) {
            Some(data) => {
                let (cx, cz) = key.coords();
                let mut writer = ByteWriter::new();
                writer.write_i32(cx);
                writer.write_i32(cz);
                writer.write_bool(true);
                writer.write_raw(&data);
                PacketAction::Replace("chunk_data", bytes::Bytes::from(writer.into_inner()))
            }
            None => self.retire(shared, dimension, key),
        }
    }

    fn retire(&self, shared: &mut ChunkCacheState, dimension: i32, key: ChunkKey) -> PacketAction {
        shared.tracker_remove(dimension, key);
        let _ = self.toggle_tx.send((dimension, key));
        PacketAction::Drop
    }

    fn apply_delta(&self, shared: &mut ChunkCacheState, dimension: i32, header: &ChunkDataHeader) -> PacketAction {
        if shared.is_duplicate(dimension, header.raw) {
            return PacketAction::Drop;
        }
        if shared.tracker_count(dimension, header.key) <= shared.threshold {
            // we don't hold a cached copy to apply this delta to.
            return PacketAction::Drop;
        }
        let Some(cache) = shared.caches.get_mut(&dimension) else {
            return PacketAction::Drop;
        };
        let Some(cached) = cache.get(header.key) else {
            return self.retire(shared, dimension, header.key);
        };
        let Ok(mut column) = CachedColumn::parse(&cached) else {
            return PacketAction::Drop;
        };
        let Ok(delta) = ChunkDelta::parse(header.body) else {
            return PacketAction::Drop;
        };
        column.overlay(&delta);
        cache.update(header.key, column.encode());
        PacketAction::Pass
    }

    fn handle_block_change(&mut self, payload: &[u8]) -> PacketAction {
        let mut reader = ByteReader::new(payload);
        let Ok((x, y, z)) = reader.read_position() else {
            return PacketAction::Pass;
        };
        let Ok(block_id) = reader.read_varint() else {
            return PacketAction::Pass;
        };
        self.apply_single_block(payload, x, y, z, block_id as u16);
        PacketAction::Pass
    }

    fn apply_single_block(&mut self, raw: &[u8], x: i32, y: i32, z: i32, block_id: u16) {
        let dimension = self.dimension;
        let mut shared = self.shared.lock().unwrap();
        if shared.is_duplicate(dimension, raw) {
            return;
        }
        let key = ChunkKey::new(x.div_euclid(16), z.div_euclid(16));
        if shared.tracker_count(dimension, key) <= shared.threshold {
            return;
        }
        let Some(cache) = shared.caches.get_mut(&dimension) else {
            return;
        };
        let Some(cached) = cache.get(key) else {
            return;
        };
        let Ok(mut column) = CachedColumn::parse(&cached) else {
            return;
        };
        column.set_block(x, y, z, block_id);
        cache.update(key, column.encode());
    }

    fn handle_multi_block_change(&mut self, payload: &[u8]) -> PacketAction {
        let dimension = self.dimension;
        let mut shared = self.shared.lock().unwrap();
        if shared.is_duplicate(dimension, payload) {
            return PacketAction::Pass;
        }
        if let Ok(changes) = parse_multi_block_change(payload) {
            for (x, y, z, block_id) in changes {
                let key = ChunkKey::new(x.div_euclid(16), z.div_euclid(16));
                if shared.tracker_count(dimension, key) <= shared.threshold {
                    continue;
                }
                if let Some(cache) = shared.caches.get_mut(&dimension) {
                    if let Some(cached) = cache.get(key) {
                        if let Ok(mut column) = CachedColumn::parse(&cached) {
                            column.set_block(x, y, z, block_id);
                            cache.update(key, column.encode());
                        }
                    }
                }
            }
        }
        PacketAction::Pass
    }

    fn handle_explosion(&mut self, payload: &[u8]) -> PacketAction {
        // the trailing 12 bytes (player motion) are excluded from the duplicate-hash fingerprint,
        // since the server re-emits the same explosion with differing motion.
        let dimension = self.dimension;
        let prefix = if payload.len() > 12 {
            &payload[..payload.len() - 12]
        } else {
            payload
        };
        let mut shared = self.shared.lock().unwrap();
        if shared.is_duplicate(dimension, prefix) {
            return PacketAction::Pass;
        }
        if let Ok((origin, offsets)) = parse_explosion(payload) {
            for (dx, dy, dz) in offsets {
                let x = origin.0 + i32::from(dx);
                let y = origin.1 + i32::from(dy);
                let z = origin.2 + i32::from(dz);
                let key = ChunkKey::new(x.div_euclid(16), z.div_euclid(16));
                if shared.tracker_count(dimension, key) <= shared.threshold {
                    continue;
                }
                if let Some(cache) = shared.caches.get_mut(&dimension) {
                    if let Some(cached) = cache.get(key) {
                        if let Ok(mut column) = CachedColumn::parse(&cached) {
                            column.set_block(x, y, z, 0);
                            cache.update(key, column.encode());
                        }
                    }
                }
            }
        }
        PacketAction::Pass
    }

    fn handle_update_block_entity(&mut self, payload: &[u8]) -> PacketAction {
        let dimension = self.dimension;
        let mut shared = self.shared.lock().unwrap();
        if shared.is_duplicate(dimension, payload) {
            return PacketAction::Pass;
        }
        if let Ok((x, y, z, data)) = parse_update_block_entity(payload) {
            let key = ChunkKey::new(x.div_euclid(16), z.div_euclid(16));
            if shared.tracker_count(dimension, key) <= shared.threshold {
                return PacketAction::Pass;
            }
            if let Some(cache) = shared.caches.get_mut(&dimension) {
                if let Some(cached) = cache.get(key) {
                    if let Ok(mut column) = CachedColumn::parse(&cached) {
                        column.set_block_entity(x, y, z, data);
                        cache.update(key, column.encode());
                    }
                }
            }
        }
        PacketAction::Pass
    }
}

impl Module for ChunkCacheModule {
    fn on_connect(&mut self) {
        self.seed_if_needed();
    }

    fn handles(&self, direction: HandlerDirection, packet_name: &str) -> bool {
        direction == HandlerDirection::Send
            && matches!(
                packet_name,
                "join_game"
                    | "respawn"
                    | "chunk_data"
                    | "block_change"
                    | "multi_block_change"
                    | "explosion"
                    | "update_block_entity"
            )
    }

    fn handle(
        &mut self,
        _direction: HandlerDirection,
        packet_name: &str,
        payload: &bytes::Bytes,
    ) -> (PacketAction, Vec<(&'static str, bytes::Bytes)>) {
        match packet_name {
            "join_game" => (self.handle_join_game(payload), Vec::new()),
            "respawn" => (self.handle_respawn(payload), Vec::new()),
            "chunk_data" => self.handle_chunk_data(payload),
            "block_change" => (self.handle_block_change(payload), Vec::new()),
            "multi_block_change" => (self.handle_multi_block_change(payload), Vec::new()),
            "explosion" => (self.handle_explosion(payload), Vec::new()),
            "update_block_entity" => (self.handle_update_block_entity(payload), Vec::new()),
            _ => (PacketAction::Pass, Vec::new()),
        }
    }
}

fn parse_join_game_dimension(payload: &[u8]) -> Result<i32, CodecError> {
    let mut reader = ByteReader::new(payload);
    let _entity_id = reader.read_i32()?;
    let _gamemode = reader.read_u8()?;
    reader.read_i32()
}

/// Internal-side relay (the other half of this module): elides full chunk payloads the external side has
/// already toggled as cached, before they are enqueued for the poem.
pub struct ChunkCacheRelay {
    peer_cached: HashMap<i32, HashSet<ChunkKey>>,
}

impl ChunkCacheRelay {
    /// Creates an empty relay (nothing known to be cached on the peer yet).
    #[must_use]
    pub fn new() -> Self {
        Self {
            peer_cached: HashMap::new(),
        }
    }

    /// Applies an incoming `toggle_chunk(dimension, key)` notification: flips local membership
    /// for that key.
    pub fn on_toggle_chunk(&mut self, dimension: i32, key: ChunkKey) {
        let set = self.peer_cached.entry(dimension).or_default();
        if !set.remove(&key) {
            set.insert(key);
        }
    }

    fn is_cached_on_peer(&self, dimension: i32, key: ChunkKey) -> bool {
        self.peer_cached
            .get(&dimension)
            .is_some_and(|s| s.contains(&key))
    }
}

impl Default for ChunkCacheRelay {
    fn default() -> Self {
        Self::new()
    }
}

/// Module wrapper for [`ChunkCacheRelay`], mounted on the internal side's per-session send
/// pipeline (the path from the real server towards the poem input buffer).
pub struct ChunkCacheRelayModule {
    relay: Arc<Mutex<ChunkCacheRelay>>,
    dimension: i32,
}

impl ChunkCacheRelayModule {
    /// Creates a relay module sharing state with every session on this internal process.
    #[must_use]
    pub fn new(relay: Arc<Mutex<ChunkCacheRelay>>) -> Self {
        Self {
            relay,
            dimension: 0,
        }
    }
}

impl Module for ChunkCacheRelayModule {
    fn handles(&self, direction: HandlerDirection, packet_name: &str) -> bool {
        direction == HandlerDirection::Send
            && matches!(packet_name, "join_game" | "respawn" | "chunk_data")
    }

    fn handle(
        &mut self,
        _direction: HandlerDirection,
        packet_name: &str,
        payload: &bytes::Bytes,
    ) -> (PacketAction, Vec<(&'static str, bytes::Bytes)>) {
        match packet_name {
            "join_game" => {
                if let Ok(dimension) = parse_join_game_dimension(payload) {
                    self.dimension = dimension;
                }
                (PacketAction::Pass, Vec::new())
            }
            "respawn" => {
                let mut reader = ByteReader::new(payload);
                if let Ok(dimension) = reader.read_i32() {
                    self.dimension = dimension;
                }
                (PacketAction::Pass, Vec::new())
            }
            "chunk_data" => {
                let Ok(header) = ChunkDataHeader::parse(payload) else {
                    return (PacketAction::Pass, Vec::new());
                };
                if !header.full_chunk || header.body.is_empty() {
                    return (PacketAction::Pass, Vec::new());
                }
                let relay = self.relay.lock().unwrap();
                if relay.is_cached_on_peer(self.dimension, header.key) {
                    let (cx, cz) = header.key.coords();
                    let mut writer = ByteWriter::new();
                    writer.write_i32(cx);
                    writer.write_i32(cz);
                    writer.write_bool(true);
                    (
                        PacketAction::Replace("chunk_data", bytes::Bytes::from(writer.into_inner())),
                        Vec::new(),
                    )
                } else {
                    (PacketAction::Pass, Vec::new())
                }
            }
            _ => (PacketAction::Pass, Vec::new()),
        }
    }
}

/// Parsed `(chunk_x, chunk_z, full_chunk)` header common to every `chunk_data` packet, plus the
/// remaining body bytes.
struct ChunkDataHeader<'a> {
    key: ChunkKey,
    full_chunk: bool,
    body: &'a [u8],
    raw: &'a [u8],
}

impl<'a> ChunkDataHeader<'a> {
    fn parse(payload: &'a [u8]) -> Result<Self, CodecError> {
        let mut reader = ByteReader::new(payload);
        let chunk_x = reader.read_i32()?;
        let chunk_z = reader.read_i32()?;
        let full_chunk = reader.read_bool()?;
        let body = &payload[reader.save()..];
        Ok(Self {
            key: ChunkKey::new(chunk_x, chunk_z),
            full_chunk,
            body,
            raw: payload,
        })
    }
}

/// A fully decoded cached chunk column: primary bitmask, heightmap (kept as an opaque blob),
/// sections, biomes and block entities -- everything [`ChunkCacheModule`] needs to splice a
/// targeted change into while leaving the rest byte-identical and re-encode as a full
/// `set_chunk_sections`/`set_tile_entities` packet.
struct CachedColumn {
    heightmap: Vec<u8>,
    sections: Vec<ChunkSection>,
    biomes: Vec<u32>,
    block_entities: Vec<BlockEntityEntry>,
}

#[derive(Clone)]
struct BlockEntityEntry {
    x: i32,
    y: i32,
    z: i32,
    data: Vec<u8>,
}

impl CachedColumn {
    fn parse(data: &[u8]) -> Result<Self, CodecError> {
        let mut reader = ByteReader::new(data);
        let primary_bitmask = reader.read_varint()?;
        let heightmap = reader.read_nbt()?;
        let section_len = reader.read_varint()? as usize;
        let section_bytes_start = reader.save();
        let mut sections = Vec::with_capacity(16);
        for i in 0..16 {
            if primary_bitmask & (1 << i) != 0 {
                sections.push(reader.read_chunk_section()?);
            } else {
                sections.push(ChunkSection::empty());
            }
        }
        // section reads must not run past the declared section_len; resync defensively.
        reader.restore(section_bytes_start + section_len);

        let mut biomes = Vec::with_capacity(BIOME_COUNT);
        for _ in 0..BIOME_COUNT {
            biomes.push(reader.read_i32()? as u32);
        }

        let entity_count = reader.read_varint()?;
        let mut block_entities = Vec::with_capacity(entity_count.max(0) as usize);
        for _ in 0..entity_count.max(0) {
            let (x, y, z) = reader.read_position()?;
            let data = reader.read_byte_array()?;
            block_entities.push(BlockEntityEntry { x, y, z, data });
        }

        Ok(Self {
            heightmap,
            sections,
            biomes,
            block_entities,
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        let mut primary_bitmask = 0i32;
        let mut section_data = ByteWriter::new();
        for (i, section) in self.sections.iter().enumerate() {
            if !section.is_empty() {
                primary_bitmask |= 1 << i;
                section_data.write_chunk_section(section);
            }
        }
        let section_bytes = section_data.into_inner();

        writer.write_varint(primary_bitmask);
        writer.write_nbt_raw(&self.heightmap);
        writer.write_varint(section_bytes.len() as i32);
        writer.write_raw(&section_bytes);
        for &biome in &self.biomes {
            writer.write_i32(biome as i32);
        }
        writer.write_varint(self.block_entities.len() as i32);
        for entity in &self.block_entities {
            writer.write_position(entity.x, entity.y, entity.z);
            writer.write_byte_array(&entity.data);
        }
        writer.into_inner()
    }

    fn set_block(&mut self, x: i32, y: i32, z: i32, block_id: u16) {
        let section_index = y.div_euclid(16) as usize;
        if section_index >= self.sections.len() {
            return;
        }
        let bx = x.rem_euclid(16) as usize;
        let by = y.rem_euclid(16) as usize;
        let bz = z.rem_euclid(16) as usize;
        let index = by * 256 + bz * 16 + bx;
        self.sections[section_index].blocks[index] = block_id;
    }

    fn set_block_entity(&mut self, x: i32, y: i32, z: i32, data: Vec<u8>) {
        self.block_entities.retain(|e| !(e.x == x && e.y == y && e.z == z));
        if !data.is_empty() {
            self.block_entities.push(BlockEntityEntry { x, y, z, data });
        }
    }

    fn overlay(&mut self, delta: &ChunkDelta) {
        for (index, section) in &delta.sections {
            if !section.is_empty() && *index < self.sections.len() {
                self.sections[*index] = section.clone();
            }
        }
        for upsert in &delta.block_entities {
            self.set_block_entity(upsert.x, upsert.y, upsert.z, upsert.data.clone());
        }
    }
}

/// A non-full `chunk_data` packet's body: the subset of sections it carries, plus a block-entity
/// upsert list.
struct ChunkDelta {
    sections: Vec<(usize, ChunkSection)>,
    block_entities: Vec<BlockEntityEntry>,
}

impl ChunkDelta {
    fn parse(body: &[u8]) -> Result<Self, CodecError> {
        let mut reader = ByteReader::new(body);
        let primary_bitmask = reader.read_varint()?;
        let section_len = reader.read_varint()? as usize;
        let start = reader.save();
        let mut sections = Vec::new();
        for i in 0..16 {
            if primary_bitmask & (1 << i) != 0 {
                sections.push((i, reader.read_chunk_section()?));
            }
        }
        reader.restore(start + section_len);

        let entity_count = reader.read_varint()?;
        let mut block_entities = Vec::with_capacity(entity_count.max(0) as usize);
        for _ in 0..entity_count.max(0) {
            let (x, y, z) = reader.read_position()?;
            let data = reader.read_byte_array()?;
            block_entities.push(BlockEntityEntry { x, y, z, data });
        }

        Ok(Self {
            sections,
            block_entities,
        })
    }
}

fn parse_multi_block_change(payload: &[u8]) -> Result<Vec<(i32, i32, i32, u16)>, CodecError> {
    let mut reader = ByteReader::new(payload);
    let _chunk_x = reader.read_i32()?;
    let _chunk_z = reader.read_i32()?;
    let count = reader.read_varint()?;
    let mut changes = Vec::with_capacity(count.max(0) as usize);
    for _ in 0..count.max(0) {
        let (x, y, z) = reader.read_position()?;
        let block_id = reader.read_varint()? as u16;
        changes.push((x, y, z, block_id));
    }
    Ok(changes)
}

fn parse_explosion(payload: &[u8]) -> Result<((i32, i32, i32), Vec<(i8, i8, i8)>), CodecError> {
    let mut reader = ByteReader::new(payload);
    let x = reader.read_f32()? as i32;
    let y = reader.read_f32()? as i32;
    let z = reader.read_f32()? as i32;
    let _radius = reader.read_f32()?;
    let count = reader.read_i32()?;
    let mut offsets = Vec::with_capacity(count.max(0) as usize);
    for _ in 0..count.max(0) {
        let dx = reader.read_u8()? as i8;
        let dy = reader.read_u8()? as i8;
        let dz = reader.read_u8()? as i8;
        offsets.push((dx, dy, dz));
    }
    Ok(((x, y, z), offsets))
}

fn parse_update_block_entity(payload: &[u8]) -> Result<(i32, i32, i32, Vec<u8>), CodecError> {
    let mut reader = ByteReader::new(payload);
    let (x, y, z) = reader.read_position()?;
    let _action = reader.read_u8()?;
    let data = reader.read_remaining();
    Ok((x, y, z, data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk_cache::InMemoryChunkCache;

    fn full_column(sections: Vec<ChunkSection>) -> Vec<u8> {
        let column = CachedColumn {
            heightmap: vec![0], // TAG_End
            sections,
            biomes: vec![0; BIOME_COUNT],
            block_entities: Vec::new(),
        };
        column.encode()
    }

    fn sections_with(index: usize, block_id: u16) -> Vec<ChunkSection> {
        let mut sections = vec![ChunkSection::empty(); 16];
        sections[index].blocks[0] = block_id;
        sections
    }

    fn shared_state(threshold: u32) -> Arc<Mutex<ChunkCacheState>> {
        let mut caches: HashMap<i32, Box<dyn ChunkCache>> = HashMap::new();
        for dim in DIMENSIONS {
            caches.insert(dim, Box::new(InMemoryChunkCache::new(8192)));
        }
        Arc::new(Mutex::new(ChunkCacheState::new(caches, threshold)))
    }

    #[test]
    fn full_chunk_below_threshold_forwarded_unchanged() {
        let shared = shared_state(2);
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut module = ChunkCacheModule::new(shared, tx);

        let key = ChunkKey::new(3, -7);
        let (cx, cz) = key.coords();
        let mut writer = ByteWriter::new();
        writer.write_i32(cx);
        writer.write_i32(cz);
        writer.write_bool(true);
        writer.write_raw(&full_column(sections_with(0, 5)));
        let packet = bytes::Bytes::from(writer.into_inner());

        let (action, _) = module.handle(HandlerDirection::Send, "chunk_data", &packet);
        assert!(matches!(action, PacketAction::Pass));
    }

    #[test]
    fn full_chunk_reaching_threshold_is_cached_and_toggled() {
        let shared = shared_state(2);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut module = ChunkCacheModule::new(shared.clone(), tx);

        let key = ChunkKey::new(3, -7);
        let (cx, cz) = key.coords();
        let make_packet = || {
            let mut writer = ByteWriter::new();
            writer.write_i32(cx);
            writer.write_i32(cz);
            writer.write_bool(true);
            writer.write_raw(&full_column(sections_with(0, 5)));
            bytes::Bytes::from(writer.into_inner())
        };

        module.handle(HandlerDirection::Send, "chunk_data", &make_packet());
        module.handle(HandlerDirection::Send, "chunk_data", &make_packet());
        let (action, _) = module.handle(HandlerDirection::Send, "chunk_data", &make_packet());
        assert!(matches!(action, PacketAction::Pass));

        let (dim, toggled_key) = rx.try_recv().unwrap();
        assert_eq!(dim, 0);
        assert_eq!(toggled_key, key);

        let mut state = shared.lock().unwrap();
        assert!(state.caches.get_mut(&0).unwrap().get(key).is_some());
    }

    #[test]
    fn empty_full_chunk_replays_cached_payload() {
        let shared = shared_state(1);
        {
            let mut state = shared.lock().unwrap();
            state
                .caches
                .get_mut(&0)
                .unwrap()
                .insert(ChunkKey::new(0, 0), full_column(sections_with(0, 9)));
            state.tracker_set(0, ChunkKey::new(0, 0), 2);
        }
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut module = ChunkCacheModule::new(shared, tx);

        let mut writer = ByteWriter::new();
        writer.write_i32(0);
        writer.write_i32(0);
        writer.write_bool(true);
        let marker = bytes::Bytes::from(writer.into_inner());

        let (action, _) = module.handle(HandlerDirection::Send, "chunk_data", &marker);
        match action {
            PacketAction::Replace(name, bytes) => {
                assert_eq!(name, "chunk_data");
                assert!(!bytes.is_empty());
            }
            _ => panic!("expected a replace action"),
        }
    }

    #[test]
    fn block_change_mutates_only_the_targeted_block() {
        let shared = shared_state(1);
        let key = ChunkKey::new(0, 0);
        let original_sections = sections_with(4, 3);
        {
            let mut state = shared.lock().unwrap();
            state
                .caches
                .get_mut(&0)
                .unwrap()
                .insert(key, full_column(original_sections.clone()));
            state.tracker_set(0, key, 2);
        }
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut module = ChunkCacheModule::new(shared.clone(), tx);

        let mut writer = ByteWriter::new();
        writer.write_position(5, 70, 9);
        writer.write_varint(17);
        let packet = bytes::Bytes::from(writer.into_inner());

        module.handle(HandlerDirection::Send, "block_change", &packet);

        let mut state = shared.lock().unwrap();
        let updated = state.caches.get_mut(&0).unwrap().get(key).unwrap();
        let column = CachedColumn::parse(&updated).unwrap();

        // cy=4 (70/16), rel x=5, rel y=6 (70%16), rel z=9
        let index = 6 * 256 + 9 * 16 + 5;
        assert_eq!(column.sections[4].blocks[index], 17);

        // everything else in that section is untouched.
        for (i, &b) in column.sections[4].blocks.iter().enumerate() {
            if i != index {
                assert_eq!(b, original_sections[4].blocks[i]);
            }
        }
    }

    #[test]
    fn duplicate_hash_suppresses_second_identical_update() {
        let shared = shared_state(1);
        let key = ChunkKey::new(0, 0);
        {
            let mut state = shared.lock().unwrap();
            state
                .caches
                .get_mut(&0)
                .unwrap()
                .insert(key, full_column(sections_with(0, 1)));
            state.tracker_set(0, key, 2);
        }
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut module = ChunkCacheModule::new(shared.clone(), tx);

        let mut writer = ByteWriter::new();
        writer.write_i32(0);
        writer.write_i32(0);
        writer.write_varint(1);
        writer.write_position(1, 1, 1);
        writer.write_varint(55);
        let packet = bytes::Bytes::from(writer.into_inner());

        module.handle(HandlerDirection::Send, "multi_block_change", &packet);
        // second identical packet within the window is a duplicate and causes no extra work, but
        // it is still passed through to the client (only the *cache mutation* is suppressed).
        module.handle(HandlerDirection::Send, "multi_block_change", &packet);

        shared.lock().unwrap().clear_recent_hashes();
        module.handle(HandlerDirection::Send, "multi_block_change", &packet);
    }

    #[test]
    fn relay_elides_full_chunk_marked_cached_by_peer() {
        let relay = Arc::new(Mutex::new(ChunkCacheRelay::new()));
        relay.lock().unwrap().on_toggle_chunk(0, ChunkKey::new(0, 0));

        let mut module = ChunkCacheRelayModule::new(relay);
        let mut writer = ByteWriter::new();
        writer.write_i32(0);
        writer.write_i32(0);
        writer.write_bool(true);
        writer.write_raw(&[1, 2, 3]);
        let packet = bytes::Bytes::from(writer.into_inner());

        let (action, _) = module.handle(HandlerDirection::Send, "chunk_data", &packet);
        match action {
            PacketAction::Replace(name, bytes) => {
                assert_eq!(name, "chunk_data");
                // the key + full flag survive, but the body is gone.
                let mut reader = ByteReader::new(&bytes);
                assert_eq!(reader.read_i32().unwrap(), 0);
                assert_eq!(reader.read_i32().unwrap(), 0);
                assert!(reader.read_bool().unwrap());
                assert!(reader.is_empty());
            }
            _ => panic!("expected elided replace"),
        }
    }

    #[test]
    fn toggle_chunk_is_a_pure_toggle() {
        let mut relay = ChunkCacheRelay::new();
        let key = ChunkKey::new(1, 1);
        assert!(!relay.is_cached_on_peer(0, key));
        relay.on_toggle_chunk(0, key);
        assert!(relay.is_cached_on_peer(0, key));
        relay.on_toggle_chunk(0, key);
        assert!(!relay.is_cached_on_peer(0, key));
    }
}
