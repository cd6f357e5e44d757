//! Parallel compressor: a [`WorkerPool`](crate::workpool::WorkerPool) instance bound to a
//! zlib compress/decompress transform.
//!
//! Compression uses `flate2`'s zlib codec, the same crate several Minecraft server
//! implementations reach for to compress their own chunk packets. A one-byte meta header
//! distinguishes "stored raw" from "zlib deflated" blobs per item, since bypassing compression
//! is allowed when it would not shrink the input.

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use std::io::{Read, Write};

/// Marks a blob as stored without compression.
const RAW: u8 = 0;
/// Marks a blob as zlib-deflated.
const ZLIB: u8 = 1;

/// Compresses `data`, prefixing the result with a one-byte marker. Falls back to storing the
/// input raw (marker [`RAW`]) when deflating would not shrink it. Never fails: worst case the
/// bypass path is taken.
#[must_use]
pub fn compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    let deflated = encoder
        .write_all(data)
        .and_then(|()| encoder.finish())
        .ok();

    match deflated {
        Some(deflated) if deflated.len() < data.len() => {
            let mut out = Vec::with_capacity(deflated.len() + 1);
            out.push(ZLIB);
            out.extend_from_slice(&deflated);
            out
        }
        _ => {
            let mut out = Vec::with_capacity(data.len() + 1);
            out.push(RAW);
            out.extend_from_slice(data);
            out
        }
    }
}

/// Decompresses a blob produced by [`compress`]. Returns `None` on malformed input, which the
/// worker pool turns into a dropped, index-preserving completion.
#[must_use]
pub fn decompress(data: &[u8]) -> Option<Vec<u8>> {
    let (marker, body) = data.split_first()?;
    match *marker {
        RAW => Some(body.to_vec()),
        ZLIB => {
            let mut decoder = ZlibDecoder::new(body);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out).ok()?;
            Some(out)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compress_decompress_roundtrips_arbitrary_bytes() {
        for input in [
            b"".to_vec(),
            b"a".to_vec(),
            b"hello world hello world hello world".to_vec(),
            (0..=255u8).collect::<Vec<u8>>(),
        ] {
            let compressed = compress(&input);
            assert_eq!(decompress(&compressed).unwrap(), input);
        }
    }

    #[test]
    fn incompressible_short_input_falls_back_to_raw() {
        let input = vec![7u8, 3, 9];
        let compressed = compress(&input);
        assert_eq!(compressed[0], RAW);
        assert_eq!(decompress(&compressed).unwrap(), input);
    }

    #[test]
    fn malformed_input_fails_without_panicking() {
        assert!(decompress(&[ZLIB, 0xFF, 0xFF, 0xFF]).is_none());
        assert!(decompress(&[]).is_none());
    }
}
