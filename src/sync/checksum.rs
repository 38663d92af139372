//! Content digests for change detection.
//!
//! Whole-file digests are the fast path for deciding whether a file changed at
//! all; fixed-size block digests localize the change so only differing blocks
//! are retransferred.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::ops::Range;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::{IoContext, SyncResult};

/// Streaming buffer for whole-file hashing.
const READ_BUFFER: usize = 64 * 1024;

/// Hash algorithm used for both whole-file and block digests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashType {
    /// BLAKE3 - fast and secure (default).
    #[default]
    Blake3,
    /// SHA-256, for parity with digests produced by other tools.
    Sha256,
}

/// A 256-bit content digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest([u8; 32]);

impl Digest {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", &self.to_hex()[..16])
    }
}

/// Digest of an entire file's bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileChecksum {
    pub algorithm: HashType,
    pub digest: Digest,
    pub size: u64,
}

/// Per-block digests of one file, indexed from zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockChecksum {
    pub block_size: u64,
    pub file_len: u64,
    pub blocks: BTreeMap<u64, Digest>,
}

impl BlockChecksum {
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Byte range covered by block `index` in the file these digests describe.
    pub fn block_range(&self, index: u64) -> Range<u64> {
        let start = index * self.block_size;
        let end = (start + self.block_size).min(self.file_len);
        start..end
    }

    /// Indices of blocks in `self` whose digest is missing from or differs in `other`.
    pub fn differing_blocks(&self, other: &BlockChecksum) -> Vec<u64> {
        self.blocks
            .iter()
            .filter(|(index, digest)| other.blocks.get(*index) != Some(*digest))
            .map(|(index, _)| *index)
            .collect()
    }
}

enum Hasher {
    Blake3(Box<blake3::Hasher>),
    Sha256(Sha256),
}

impl Hasher {
    fn new(algorithm: HashType) -> Self {
        match algorithm {
            HashType::Blake3 => Hasher::Blake3(Box::new(blake3::Hasher::new())),
            HashType::Sha256 => Hasher::Sha256(Sha256::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Blake3(h) => {
                h.update(data);
            }
            Hasher::Sha256(h) => h.update(data),
        }
    }

    fn finalize(self) -> Digest {
        match self {
            Hasher::Blake3(h) => Digest(*h.finalize().as_bytes()),
            Hasher::Sha256(h) => Digest(h.finalize().into()),
        }
    }
}

/// Hash bytes with the given algorithm.
pub fn hash_bytes(algorithm: HashType, data: &[u8]) -> Digest {
    let mut hasher = Hasher::new(algorithm);
    hasher.update(data);
    hasher.finalize()
}

/// Fill `buf` from `reader`, looping over short reads. Returns bytes read;
/// less than `buf.len()` only at EOF.
pub(crate) fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Computes whole-file and per-block digests.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChecksumCalculator {
    algorithm: HashType,
}

impl ChecksumCalculator {
    pub fn new(algorithm: HashType) -> Self {
        Self { algorithm }
    }

    pub fn algorithm(&self) -> HashType {
        self.algorithm
    }

    /// Stream the whole file through the digest once.
    pub fn whole_file_checksum(&self, path: &Path) -> SyncResult<FileChecksum> {
        let mut file = File::open(path).with_path("opening", path)?;
        let mut hasher = Hasher::new(self.algorithm);
        let mut buffer = vec![0u8; READ_BUFFER];
        let mut size = 0u64;

        loop {
            let n = read_full(&mut file, &mut buffer).with_path("reading", path)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
            size += n as u64;
        }

        Ok(FileChecksum {
            algorithm: self.algorithm,
            digest: hasher.finalize(),
            size,
        })
    }

    /// Hash each `block_size` chunk independently. An empty file yields no blocks.
    pub fn block_checksums(&self, path: &Path, block_size: u64) -> SyncResult<BlockChecksum> {
        let mut file = File::open(path).with_path("opening", path)?;
        let mut buffer = vec![0u8; block_size as usize];
        let mut blocks = BTreeMap::new();
        let mut file_len = 0u64;

        for index in 0u64.. {
            let n = read_full(&mut file, &mut buffer).with_path("reading", path)?;
            if n == 0 {
                break;
            }
            blocks.insert(index, hash_bytes(self.algorithm, &buffer[..n]));
            file_len += n as u64;
            if n < buffer.len() {
                break;
            }
        }

        Ok(BlockChecksum {
            block_size,
            file_len,
            blocks,
        })
    }

    /// Async wrapper that hashes on the blocking pool.
    pub async fn whole_file_checksum_async(&self, path: &Path) -> SyncResult<FileChecksum> {
        let calculator = *self;
        let owned = path.to_path_buf();
        tokio::task::spawn_blocking(move || calculator.whole_file_checksum(&owned))
            .await
            .map_err(|e| crate::error::SyncError::from_io(io::Error::other(e), "hashing", path))?
    }
}
