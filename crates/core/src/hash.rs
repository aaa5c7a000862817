//! SHA-512 hashing primitives for content-addressed storage

use crate::error::{RcsError, Result};
use sha2::{Digest, Sha512};
use std::io::{Read, Write};

/// A SHA-512 content hash (64 bytes)
#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ContentHash([u8; 64]);

impl ContentHash {
    /// Create a new ContentHash from bytes
    pub const fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Get the hash as a byte slice
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    /// Convert to lowercase hex string (the on-disk storage key)
    pub fn to_hex(&self) -> String {
        const HEX_CHARS: &[u8] = b"0123456789abcdef";
        let mut hex = String::with_capacity(128);
        for &byte in &self.0 {
            hex.push(HEX_CHARS[(byte >> 4) as usize] as char);
            hex.push(HEX_CHARS[(byte & 0xf) as usize] as char);
        }
        hex
    }

    /// Parse from hex string
    pub fn from_hex(hex: &str) -> Result<Self> {
        if hex.len() != 128 {
            return Err(RcsError::Integrity {
                expected: "128 hex characters".into(),
                computed: format!("{} characters", hex.len()),
            });
        }

        let mut bytes = [0u8; 64];
        for i in 0..64 {
            let high = hex_char_to_nibble(hex.as_bytes()[i * 2])?;
            let low = hex_char_to_nibble(hex.as_bytes()[i * 2 + 1])?;
            bytes[i] = (high << 4) | low;
        }
        Ok(Self(bytes))
    }
}

/// Helper function to convert a hex character to a nibble
fn hex_char_to_nibble(c: u8) -> Result<u8> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(RcsError::Integrity {
            expected: "hex digit".into(),
            computed: format!("{:?}", c as char),
        }),
    }
}

impl std::fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Hash bytes using SHA-512
pub fn hash_bytes(data: &[u8]) -> ContentHash {
    let digest = Sha512::digest(data);
    ContentHash::from_bytes(digest.into())
}

/// Hash a byte stream using SHA-512, returning the digest and byte count
///
/// Used by verify-and-restore to recompute a live resource's digest through
/// the same streaming path used at capture time.
pub fn hash_reader<R: Read>(mut reader: R) -> Result<(ContentHash, u64)> {
    let mut hasher = Sha512::new();
    let mut total = 0u64;

    let mut buffer = [0u8; 8192];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
        total += bytes_read as u64;
    }

    Ok((ContentHash::from_bytes(hasher.finalize().into()), total))
}

/// Writer adapter that accumulates a SHA-512 digest of everything written
///
/// Blob ingest streams serialized content through this so the digest and the
/// temp file are produced in a single pass.
pub struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha512,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    /// Wrap a writer
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha512::new(),
            written: 0,
        }
    }

    /// Finalize, returning the wrapped writer, the digest, and the byte count
    pub fn finish(self) -> (W, ContentHash, u64) {
        let hash = ContentHash::from_bytes(self.hasher.finalize().into());
        (self.inner, hash, self.written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_consistency() {
        let data = b"hello world";
        let hash1 = hash_bytes(data);
        let hash2 = hash_bytes(data);
        assert_eq!(hash1, hash2);
    }

    #[test]
    fn test_hex_encoding_roundtrip() {
        let original = ContentHash::from_bytes([42; 64]);
        let hex = original.to_hex();
        let decoded = ContentHash::from_hex(&hex).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_hex_encoding_lowercase() {
        let mut bytes = [0u8; 64];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = (i as u8).wrapping_mul(0xde);
        }
        let hex = ContentHash::from_bytes(bytes).to_hex();
        assert!(hex.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert_eq!(hex.len(), 128);
    }

    #[test]
    fn test_hex_decoding_invalid_length() {
        assert!(ContentHash::from_hex("abc").is_err());
        assert!(ContentHash::from_hex("").is_err());
        assert!(ContentHash::from_hex(&"a".repeat(127)).is_err());
    }

    #[test]
    fn test_hex_decoding_invalid_chars() {
        let invalid = "g".repeat(128);
        assert!(ContentHash::from_hex(&invalid).is_err());
    }

    #[test]
    fn test_hashing_writer_matches_direct_hash() {
        let data = b"streamed content";
        let direct = hash_bytes(data);

        let mut writer = HashingWriter::new(Vec::new());
        writer.write_all(&data[..8]).unwrap();
        writer.write_all(&data[8..]).unwrap();
        let (buf, streamed, written) = writer.finish();

        assert_eq!(direct, streamed);
        assert_eq!(buf, data);
        assert_eq!(written, data.len() as u64);
    }

    #[test]
    fn test_hash_reader_matches_direct_hash() {
        let data = vec![0xAB; 3 * 8192 + 17];
        let direct = hash_bytes(&data);
        let (streamed, count) = hash_reader(&data[..]).unwrap();
        assert_eq!(direct, streamed);
        assert_eq!(count, data.len() as u64);
    }

    #[test]
    fn test_different_data_different_hash() {
        assert_ne!(hash_bytes(b"hello"), hash_bytes(b"world"));
    }
}
