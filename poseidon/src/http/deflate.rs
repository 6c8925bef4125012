//! Per-connection deflate streams for permessage-deflate (RFC 7692).
//!
//! Messages travel as raw deflate blocks flushed with an empty stored
//! block; the trailing `00 00 FF FF` marker is stripped on transmit and
//! restored before inflation. With context takeover (the default) the
//! sliding window persists across messages.

use anyhow::{anyhow, Result};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use parking_lot::Mutex;

const SYNC_TAIL: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

/// The compressing half of a connection.
pub struct Deflator {
    inner: Mutex<Compress>,
}

impl Default for Deflator {
    fn default() -> Self {
        Self::new()
    }
}

impl Deflator {
    pub fn new() -> Self {
        Self {
            // Raw deflate, no zlib wrapper.
            inner: Mutex::new(Compress::new(Compression::default(), false)),
        }
    }

    /// Compresses one whole message, without the sync-flush tail.
    pub fn deflate_message(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut z = self.inner.lock();
        let mut out = Vec::with_capacity(data.len() / 2 + 64);
        let mut pos = 0usize;

        loop {
            out.reserve(256);
            let before = z.total_in();
            let status = z
                .compress_vec(&data[pos..], &mut out, FlushCompress::Sync)
                .map_err(|e| anyhow!("deflate failed: {}", e))?;
            pos += (z.total_in() - before) as usize;

            match status {
                Status::Ok | Status::BufError => {
                    if pos == data.len() && out.len() < out.capacity() {
                        break;
                    }
                }
                Status::StreamEnd => break,
            }
        }

        if out.ends_with(&SYNC_TAIL) {
            out.truncate(out.len() - SYNC_TAIL.len());
        }
        Ok(out)
    }

    /// Discards the sliding window, for `no_context_takeover` mode.
    pub fn reset(&self) {
        self.inner.lock().reset();
    }
}

/// The decompressing half of a connection.
pub struct Inflator {
    inner: Mutex<Decompress>,
}

impl Default for Inflator {
    fn default() -> Self {
        Self::new()
    }
}

impl Inflator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Decompress::new(false)),
        }
    }

    /// Decompresses one whole message, restoring the sync-flush tail
    /// first. `limit` of zero means unbounded.
    pub fn inflate_message(&self, data: &[u8], limit: usize) -> Result<Vec<u8>> {
        let mut z = self.inner.lock();

        let mut input = Vec::with_capacity(data.len() + SYNC_TAIL.len());
        input.extend_from_slice(data);
        input.extend_from_slice(&SYNC_TAIL);

        let mut out = Vec::with_capacity(data.len() * 2 + 64);
        let mut pos = 0usize;

        loop {
            out.reserve(1024);
            let before = z.total_in();
            let status = z
                .decompress_vec(&input[pos..], &mut out, FlushDecompress::Sync)
                .map_err(|e| anyhow!("inflate failed: {}", e))?;
            pos += (z.total_in() - before) as usize;

            if limit != 0 && out.len() > limit {
                return Err(anyhow!("inflated message exceeds {} bytes", limit));
            }

            match status {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => {
                    if pos == input.len() && out.len() < out.capacity() {
                        break;
                    }
                }
            }
        }

        Ok(out)
    }

    pub fn reset(&self) {
        self.inner.lock().reset(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(b"".to_vec())]
    #[case(b"hello deflate".to_vec())]
    #[case(vec![0u8; 100_000])]
    #[case((0..=255u8).cycle().take(70_000).collect::<Vec<u8>>())]
    fn test_deflate_inflate_round_trip(#[case] original: Vec<u8>) {
        let deflator = Deflator::new();
        let inflator = Inflator::new();

        let packed = deflator.deflate_message(&original).unwrap();
        assert!(!packed.ends_with(&SYNC_TAIL));

        let unpacked = inflator.inflate_message(&packed, 0).unwrap();
        assert_eq!(unpacked, original);
    }

    #[test]
    fn test_context_takeover_across_messages() {
        let deflator = Deflator::new();
        let inflator = Inflator::new();

        // The second message back-references the first one's window, so
        // both ends must keep their streams alive between messages.
        let first = deflator.deflate_message(b"a repeated phrase").unwrap();
        let second = deflator.deflate_message(b"a repeated phrase").unwrap();
        assert!(second.len() <= first.len());

        assert_eq!(
            inflator.inflate_message(&first, 0).unwrap(),
            b"a repeated phrase"
        );
        assert_eq!(
            inflator.inflate_message(&second, 0).unwrap(),
            b"a repeated phrase"
        );
    }

    #[test]
    fn test_inflate_limit_enforced() {
        let deflator = Deflator::new();
        let inflator = Inflator::new();

        let packed = deflator.deflate_message(&vec![7u8; 10_000]).unwrap();
        assert!(inflator.inflate_message(&packed, 100).is_err());
    }

    #[test]
    fn test_reset_discards_window() {
        let deflator = Deflator::new();
        let inflator = Inflator::new();

        let first = deflator.deflate_message(b"no takeover here").unwrap();
        deflator.reset();
        let second = deflator.deflate_message(b"no takeover here").unwrap();
        // Without a window the second message cannot shrink.
        assert_eq!(first, second);

        assert_eq!(
            inflator.inflate_message(&first, 0).unwrap(),
            b"no takeover here"
        );
        inflator.reset();
        assert_eq!(
            inflator.inflate_message(&second, 0).unwrap(),
            b"no takeover here"
        );
    }
}
