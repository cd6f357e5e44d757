//! Frame codec: length-prefixed framing, varint fields, and the handful of typed Minecraft
//! field readers/writers this core needs (strings, UUIDs, positions, NBT compounds and chunk
//! sections).
//!
//! Two layers are provided:
//!
//! - [`LengthPrefixedCodec`], a [`tokio_util::codec::Decoder`]/[`Encoder`] for the outer
//!   varint-length-prefixed frame. Short reads are handled for free by returning `Ok(None)`,
//!   which is the idiomatic equivalent of the "save cursor, rewind on buffer underrun" pattern
//!   the inter-proxy wire format relies on.
//! - [`ByteReader`]/[`ByteWriter`], plain cursor-based readers/writers over an in-memory slice
//!   used to decode/encode the *contents* of a frame once it has been fully received. These
//!   expose an explicit [`ByteReader::save`]/[`ByteReader::restore`] pair so callers that parse a
//!   sequence of sub-items (poem items, chunk cache entries) can stop cleanly on a short read.

use crate::error::CodecError;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use uuid::Uuid;

/// Largest `VarInt` this codec will accept for a 32-bit value (5 LEB128 bytes).
const VARINT_MAX_BYTES: u32 = 5;

/// A cursor-based reader over an in-memory byte slice, supporting restartable reads.
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    /// Wraps `data` for reading, starting at offset 0.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Returns the current cursor offset, to be handed back to [`Self::restore`].
    #[must_use]
    pub fn save(&self) -> usize {
        self.pos
    }

    /// Rewinds the cursor to a previously saved offset. Used when a sub-item decode hits
    /// [`CodecError::ShortBuffer`] partway through and the caller wants to treat the remainder
    /// as not-yet-available rather than fail outright.
    pub fn restore(&mut self, pos: usize) {
        self.pos = pos;
    }

    /// Number of bytes left unread.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Whether the reader is exhausted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::ShortBuffer);
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Reads a single byte.
    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    /// Reads a `bool` (single byte, `!= 0`).
    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.read_u8()? != 0)
    }

    /// Reads a Minecraft-style LEB128 `VarInt`, capped at 5 bytes (32-bit values).
    pub fn read_varint(&mut self) -> Result<i32, CodecError> {
        let mut result: i32 = 0;
        for i in 0..VARINT_MAX_BYTES {
            let byte = self.read_u8()?;
            result |= i32::from(byte & 0x7F) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
        Err(CodecError::InvalidVarInt)
    }

    /// Reads a Minecraft-style LEB128 `VarLong`, capped at 10 bytes (64-bit values).
    pub fn read_varlong(&mut self) -> Result<i64, CodecError> {
        let mut result: i64 = 0;
        for i in 0..10u32 {
            let byte = self.read_u8()?;
            result |= i64::from(byte & 0x7F) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
        Err(CodecError::InvalidVarInt)
    }

    /// Reads a big-endian `u16`.
    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    /// Reads a big-endian `i32`.
    pub fn read_i32(&mut self) -> Result<i32, CodecError> {
        let bytes = self.take(4)?;
        Ok(i32::from_be_bytes(bytes.try_into().unwrap()))
    }

    /// Reads a big-endian `i64`.
    pub fn read_i64(&mut self) -> Result<i64, CodecError> {
        let bytes = self.take(8)?;
        Ok(i64::from_be_bytes(bytes.try_into().unwrap()))
    }

    /// Reads a big-endian `f32`.
    pub fn read_f32(&mut self) -> Result<f32, CodecError> {
        let bytes = self.take(4)?;
        Ok(f32::from_be_bytes(bytes.try_into().unwrap()))
    }

    /// Reads a big-endian `f64`.
    pub fn read_f64(&mut self) -> Result<f64, CodecError> {
        let bytes = self.take(8)?;
        Ok(f64::from_be_bytes(bytes.try_into().unwrap()))
    }

    /// Reads a `VarInt`-length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String, CodecError> {
        let len = self.read_varint()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidString)
    }

    /// Reads a raw 16-byte UUID.
    pub fn read_uuid(&mut self) -> Result<Uuid, CodecError> {
        let bytes = self.take(16)?;
        Ok(Uuid::from_slice(bytes).expect("exactly 16 bytes"))
    }

    /// Reads a `VarInt`-length-prefixed byte array.
    pub fn read_byte_array(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.read_varint()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// Reads the remainder of the buffer verbatim.
    pub fn read_remaining(&mut self) -> Vec<u8> {
        let rest = self.data[self.pos..].to_vec();
        self.pos = self.data.len();
        rest
    }

    /// Reads a packed 64-bit world position (x:26 | z:26 | y:12), as used by `block_change`.
    pub fn read_position(&mut self) -> Result<(i32, i32, i32), CodecError> {
        let val = self.read_i64()?;
        let mut x = (val >> 38) as i32;
        let mut y = (val & 0xFFF) as i32;
        let mut z = ((val << 26) >> 38) as i32;
        if x >= 1 << 25 {
            x -= 1 << 26;
        }
        if y >= 1 << 11 {
            y -= 1 << 12;
        }
        if z >= 1 << 25 {
            z -= 1 << 26;
        }
        Ok((x, y, z))
    }

    /// Reads a network-NBT compound (used for the chunk column heightmap) and returns its raw
    /// encoded bytes (tag id included) verbatim, without fully decoding it.
    ///
    /// The cache only ever needs to splice this blob through untouched, so rather than
    /// reconstructing it from a decoded value we determine its length with a tag-walk and hand
    /// back the exact source bytes. Use [`parse_nbt_value`] if the decoded value is actually
    /// needed (e.g. for debug logging).
    pub fn read_nbt(&mut self) -> Result<Vec<u8>, CodecError> {
        let start = self.pos;
        let tag = self.read_u8()?;
        let end = nbt::skip_payload(self.data, self.pos, tag)?;
        self.pos = end;
        Ok(self.data[start..end].to_vec())
    }

    /// Reads one chunk section: a 16x16x16 block-id array packed as `u16` little-endian values,
    /// mirroring the simplified chunk-section layout this core cares about (full per-block-state
    /// bit-packing is out of scope -- the cache only needs to splice sections
    /// through, not interpret block semantics beyond the id).
    pub fn read_chunk_section(&mut self) -> Result<ChunkSection, CodecError> {
        let mut blocks = vec![0u16; 4096];
        for block in &mut blocks {
            *block = self.read_u16()?;
        }
        Ok(ChunkSection { blocks })
    }
}

/// A single cached chunk section: a flat array of 4096 block ids (16x16x16), indexed as
/// `y*256 + z*16 + x`, matching the offset convention the chunk-cache module's `set_blocks`
/// helper expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSection {
    /// Flat block-id array, index = `y*256 + z*16 + x`.
    pub blocks: Vec<u16>,
}

impl ChunkSection {
    /// An empty (all-air) section.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            blocks: vec![0u16; 4096],
        }
    }

    /// Whether every block in the section is air (id 0).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.iter().all(|&b| b == 0)
    }
}

/// A cursor-based writer building up an in-memory buffer.
#[derive(Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    /// Creates an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes the writer, returning the accumulated bytes.
    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    /// Writes a single byte.
    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    /// Writes a `bool` as a single byte.
    pub fn write_bool(&mut self, value: bool) {
        self.write_u8(u8::from(value));
    }

    /// Writes a Minecraft-style LEB128 `VarInt`.
    pub fn write_varint(&mut self, value: i32) {
        let mut int = value as u32;
        loop {
            let mut byte = (int & 0x7F) as u8;
            int >>= 7;
            if int != 0 {
                byte |= 0x80;
            }
            self.buf.push(byte);
            if int == 0 {
                break;
            }
        }
    }

    /// Writes a Minecraft-style LEB128 `VarLong`.
    pub fn write_varlong(&mut self, value: i64) {
        let mut int = value as u64;
        loop {
            let mut byte = (int & 0x7F) as u8;
            int >>= 7;
            if int != 0 {
                byte |= 0x80;
            }
            self.buf.push(byte);
            if int == 0 {
                break;
            }
        }
    }

    /// Writes a big-endian `u16`.
    pub fn write_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Writes a big-endian `i32`.
    pub fn write_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Writes a big-endian `i64`.
    pub fn write_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Writes a `VarInt`-length-prefixed UTF-8 string.
    pub fn write_string(&mut self, value: &str) {
        self.write_varint(value.len() as i32);
        self.buf.extend_from_slice(value.as_bytes());
    }

    /// Writes a raw 16-byte UUID.
    pub fn write_uuid(&mut self, value: &Uuid) {
        self.buf.extend_from_slice(value.as_bytes());
    }

    /// Writes a `VarInt`-length-prefixed byte array.
    pub fn write_byte_array(&mut self, value: &[u8]) {
        self.write_varint(value.len() as i32);
        self.buf.extend_from_slice(value);
    }

    /// Writes raw bytes with no length prefix.
    pub fn write_raw(&mut self, value: &[u8]) {
        self.buf.extend_from_slice(value);
    }

    /// Writes a previously read (or otherwise pre-encoded) NBT blob verbatim.
    pub fn write_nbt_raw(&mut self, encoded: &[u8]) {
        self.buf.extend_from_slice(encoded);
    }

    /// Writes a packed 64-bit world position.
    pub fn write_position(&mut self, x: i32, y: i32, z: i32) {
        let packed = ((i64::from(x) & 0x3FF_FFFF) << 38)
            | ((i64::from(z) & 0x3FF_FFFF) << 12)
            | (i64::from(y) & 0xFFF);
        self.write_i64(packed);
    }

    /// Writes one chunk section as a flat `u16` block-id array.
    pub fn write_chunk_section(&mut self, section: &ChunkSection) {
        for &block in &section.blocks {
            self.write_u16(block);
        }
    }
}

/// `VarInt`-length-prefixed frame codec for the outer wire format (both the inter-proxy link and
/// the plain Minecraft handshake/status/login packets reuse this framing).
#[derive(Default)]
pub struct LengthPrefixedCodec {
    max_length: usize,
}

impl LengthPrefixedCodec {
    /// Creates a codec that rejects frames longer than `max_length` bytes.
    #[must_use]
    pub fn new(max_length: usize) -> Self {
        Self { max_length }
    }
}

impl Decoder for LengthPrefixedCodec {
    type Item = BytesMut;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // peek the varint length prefix without consuming, so a short read leaves `src`
        // untouched for the next call -- the `tokio_util::codec::Framed` equivalent of
        // save-cursor/rewind-on-underrun.
        let mut len: u32 = 0;
        let mut consumed = 0usize;
        let mut found = false;
        for (i, &byte) in src.iter().take(VARINT_MAX_BYTES as usize).enumerate() {
            len |= u32::from(byte & 0x7F) << (7 * i);
            consumed = i + 1;
            if byte & 0x80 == 0 {
                found = true;
                break;
            }
        }
        if !found {
            if consumed >= VARINT_MAX_BYTES as usize {
                return Err(CodecError::InvalidVarInt);
            }
            return Ok(None);
        }

        let len = len as usize;
        if len > self.max_length {
            return Err(CodecError::PacketTooLarge(len));
        }

        if src.len() < consumed + len {
            src.reserve(consumed + len - src.len());
            return Ok(None);
        }

        src.advance(consumed);
        Ok(Some(src.split_to(len)))
    }
}

impl Encoder<Vec<u8>> for LengthPrefixedCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Vec<u8>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut writer = ByteWriter::new();
        writer.write_varint(item.len() as i32);
        dst.put_slice(&writer.into_inner());
        dst.put_slice(&item);
        Ok(())
    }
}

/// Decodes a raw network-NBT blob (as returned by [`ByteReader::read_nbt`]) into a
/// [`fastnbt::Value`], for the rare case a caller actually needs to inspect it rather than just
/// splice it through.
pub fn parse_nbt_value(encoded: &[u8]) -> Result<fastnbt::Value, CodecError> {
    fastnbt::from_bytes_with_opts(encoded, fastnbt::DeOpts::network_nbt())
        .map_err(CodecError::InvalidNbt)
}

/// Length-only NBT tag walker, used to find the byte extent of a blob we intend to splice
/// through verbatim rather than reconstruct from a decoded value.
mod nbt {
    use crate::error::CodecError;

    fn need(data: &[u8], pos: usize, n: usize) -> Result<(), CodecError> {
        if pos + n > data.len() {
            return Err(CodecError::ShortBuffer);
        }
        Ok(())
    }

    fn read_u8(data: &[u8], pos: usize) -> Result<u8, CodecError> {
        need(data, pos, 1)?;
        Ok(data[pos])
    }

    fn read_i32(data: &[u8], pos: usize) -> Result<i32, CodecError> {
        need(data, pos, 4)?;
        Ok(i32::from_be_bytes(data[pos..pos + 4].try_into().unwrap()))
    }

    /// Skips a network-NBT string (`u16` big-endian length prefix + UTF-8 bytes), returning the
    /// offset just past it.
    fn skip_string(data: &[u8], pos: usize) -> Result<usize, CodecError> {
        need(data, pos, 2)?;
        let len = u16::from_be_bytes([data[pos], data[pos + 1]]) as usize;
        let pos = pos + 2;
        need(data, pos, len)?;
        Ok(pos + len)
    }

    /// Skips the payload of a single NBT tag (the tag id itself must already have been
    /// consumed), returning the offset just past it.
    pub(super) fn skip_payload(data: &[u8], pos: usize, tag: u8) -> Result<usize, CodecError> {
        match tag {
            0 => Ok(pos),
            1 => {
                need(data, pos, 1)?;
                Ok(pos + 1)
            }
            2 => {
                need(data, pos, 2)?;
                Ok(pos + 2)
            }
            3 | 5 => {
                need(data, pos, 4)?;
                Ok(pos + 4)
            }
            4 | 6 => {
                need(data, pos, 8)?;
                Ok(pos + 8)
            }
            7 => {
                let len = read_i32(data, pos)? as usize;
                let pos = pos + 4;
                need(data, pos, len)?;
                Ok(pos + len)
            }
            8 => skip_string(data, pos),
            9 => {
                let elem_tag = read_u8(data, pos)?;
                let mut pos = pos + 1;
                let count = read_i32(data, pos)?;
                pos += 4;
                for _ in 0..count.max(0) {
                    pos = skip_payload(data, pos, elem_tag)?;
                }
                Ok(pos)
            }
            10 => {
                let mut pos = pos;
                loop {
                    let sub_tag = read_u8(data, pos)?;
                    pos += 1;
                    if sub_tag == 0 {
                        break;
                    }
                    pos = skip_string(data, pos)?;
                    pos = skip_payload(data, pos, sub_tag)?;
                }
                Ok(pos)
            }
            11 => {
                let len = read_i32(data, pos)? as usize;
                let pos = pos + 4;
                need(data, pos, len * 4)?;
                Ok(pos + len * 4)
            }
            12 => {
                let len = read_i32(data, pos)? as usize;
                let pos = pos + 4;
                need(data, pos, len * 8)?;
                Ok(pos + len * 8)
            }
            _ => Err(CodecError::InvalidNbtTag(tag)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_roundtrip() {
        for value in [0, 1, 127, 128, 255, 25565, i32::MAX, -1, i32::MIN] {
            let mut writer = ByteWriter::new();
            writer.write_varint(value);
            let bytes = writer.into_inner();
            let mut reader = ByteReader::new(&bytes);
            assert_eq!(reader.read_varint().unwrap(), value);
            assert!(reader.is_empty());
        }
    }

    #[test]
    fn short_buffer_is_not_fatal_and_rewinds() {
        let mut writer = ByteWriter::new();
        writer.write_varint(300);
        let bytes = writer.into_inner();
        // truncate to simulate a partial read mid-varint
        let mut reader = ByteReader::new(&bytes[..bytes.len() - 1]);
        let save = reader.save();
        assert!(matches!(reader.read_varint(), Err(CodecError::ShortBuffer)));
        reader.restore(save);
        assert_eq!(reader.save(), save);
    }

    #[test]
    fn string_roundtrip() {
        let mut writer = ByteWriter::new();
        writer.write_string("a.example");
        let bytes = writer.into_inner();
        let mut reader = ByteReader::new(&bytes);
        assert_eq!(reader.read_string().unwrap(), "a.example");
    }

    #[test]
    fn uuid_roundtrip() {
        let id = Uuid::new_v4();
        let mut writer = ByteWriter::new();
        writer.write_uuid(&id);
        let bytes = writer.into_inner();
        let mut reader = ByteReader::new(&bytes);
        assert_eq!(reader.read_uuid().unwrap(), id);
    }

    #[test]
    fn position_roundtrip() {
        let mut writer = ByteWriter::new();
        writer.write_position(5, 70, 9);
        let bytes = writer.into_inner();
        let mut reader = ByteReader::new(&bytes);
        assert_eq!(reader.read_position().unwrap(), (5, 70, 9));
    }

    #[test]
    fn position_roundtrip_negative() {
        let mut writer = ByteWriter::new();
        writer.write_position(-5, 12, -200);
        let bytes = writer.into_inner();
        let mut reader = ByteReader::new(&bytes);
        assert_eq!(reader.read_position().unwrap(), (-5, 12, -200));
    }

    #[tokio::test]
    async fn length_prefixed_codec_waits_for_full_frame() {
        let mut codec = LengthPrefixedCodec::new(1024);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[5, b'h', b'e']);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&[b'l', b'l', b'o']);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], b"hello");
    }
}
