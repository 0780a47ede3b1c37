use std::any::Any;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A type-erased, thread-safe container for node outputs.
pub(crate) type Dynamic = Arc<dyn Any + Send + Sync>;

/// Atomic reference-counted string type used for parameters and identifiers.
pub type ArcStr = Arc<str>;

/// A 32-byte BLAKE3 hash used for signatures and change detection.
///
/// Every completed node is summarized by one of these (its *stamp*), and every
/// node about to run is summarized by another (its *signature*), which mixes
/// the recipe identity with the stamps of everything it needs. Comparing the
/// signature against the journal is how unchanged work gets skipped.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    /// Hashes a file's content. Large files are memory mapped and hashed on
    /// the rayon pool, which is what font binaries and archives usually are.
    pub fn hash_file(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        Ok(blake3::Hasher::new()
            .update_mmap_rayon(path)?
            .finalize()
            .into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in self.0.iter() {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }

    /// Short form for log lines.
    pub fn short(self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(12);
        hex
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl std::fmt::Display for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Incremental hasher for composite digests.
///
/// Each written chunk is length-prefixed, so `["ab", "c"]` and `["a", "bc"]`
/// never collide.
#[derive(Default)]
pub(crate) struct Blake3Hasher(blake3::Hasher);

impl Blake3Hasher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn chunk(&mut self, bytes: impl AsRef<[u8]>) -> &mut Self {
        let bytes = bytes.as_ref();
        self.0.update(&(bytes.len() as u64).to_le_bytes());
        self.0.update(bytes);
        self
    }

    pub(crate) fn digest(&mut self, hash: Hash32) -> &mut Self {
        self.0.update(&hash.0);
        self
    }

    pub(crate) fn finish32(&self) -> Hash32 {
        self.0.finalize().into()
    }
}

impl From<Blake3Hasher> for Hash32 {
    fn from(value: Blake3Hasher) -> Self {
        value.finish32()
    }
}

impl std::hash::Hasher for Blake3Hasher {
    fn finish(&self) -> u64 {
        let mut output = [0u8; 8];
        self.0.finalize_xof().fill(&mut output);
        u64::from_le_bytes(output)
    }

    fn write(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }
}

/// Serializes a value to CBOR, the encoding used for journaled outputs.
pub(crate) fn to_cbor<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<Vec<u8>> {
    let mut buffer = Vec::new();
    ciborium::into_writer(value, &mut buffer)?;
    Ok(buffer)
}

pub(crate) fn from_cbor<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> anyhow::Result<T> {
    Ok(ciborium::from_reader(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_is_lowercase_and_full_length() {
        let hash = Hash32::hash(b"karakuri");
        let hex = hash.to_hex();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(hash.short(), hex[..12]);
    }

    #[test]
    fn test_chunks_are_length_prefixed() {
        let a = Blake3Hasher::new().chunk("ab").chunk("c").finish32();
        let b = Blake3Hasher::new().chunk("a").chunk("bc").finish32();
        assert_ne!(a, b);
    }

    #[test]
    fn test_hash_file_matches_buffer_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        std::fs::write(&path, b"glyph outlines").unwrap();
        assert_eq!(Hash32::hash_file(&path).unwrap(), Hash32::hash(b"glyph outlines"));
    }

    #[test]
    fn test_cbor_round_trip_of_hash() {
        let hash = Hash32::hash("x");
        let bytes = to_cbor(&hash).unwrap();
        assert_eq!(from_cbor::<Hash32>(&bytes).unwrap(), hash);
    }
}
