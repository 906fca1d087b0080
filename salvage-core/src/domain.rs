// salvage_core/src/domain.rs
use crate::crypto::hex::{hex_bytes, hex_opt};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque content hash shared by every file with identical content.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Signature(#[serde(with = "hex_bytes")] pub Vec<u8>);

impl Signature {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Signature {
    fn from(v: Vec<u8>) -> Self {
        Signature(v)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({self})")
    }
}

/// One file entry in a snapshot listing.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileDescriptor {
    #[serde(default)]
    pub signature: Signature,
    pub size: u64,
    pub relative_path: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub mode: u32,
    /// Wrapped per-file key; `None` means the content is stored in the clear.
    #[serde(default, with = "hex_opt", skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<Vec<u8>>,
    /// Plaintext size after file decryption; `0` selects the trailer format.
    #[serde(default)]
    pub decrypted_size: u64,
    /// Seconds since the Unix epoch.
    #[serde(default)]
    pub last_modified: i64,
}

impl FileDescriptor {
    pub fn has_signature(&self) -> bool {
        !self.signature.is_empty()
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryption_key.is_some()
    }
}

/// A segment of ciphertext inside a container.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Key material including its 1-byte type prefix.
    #[serde(with = "hex_bytes")]
    pub key: Vec<u8>,
    /// Checksum including its 1-byte type prefix.
    #[serde(default, with = "hex_opt", skip_serializing_if = "Option::is_none")]
    pub checksum: Option<Vec<u8>>,
    pub length: u32,
}

impl Chunk {
    pub fn key_type(&self) -> Option<u8> {
        self.key.first().copied()
    }
}

/// A batch of chunks fetched with one request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub host: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    pub chunks: Vec<Chunk>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl Container {
    /// Total bytes the request is expected to return.
    pub fn byte_len(&self) -> u64 {
        self.chunks.iter().map(|c| c.length as u64).sum()
    }
}

/// A slice of one container's decrypted byte stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkReference {
    pub container: usize,
    pub offset: u64,
    pub length: u64,
}

/// Ordered slices that rebuild the content behind one signature.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureReferences {
    pub signature: Signature,
    pub chunks: Vec<ChunkReference>,
}

impl SignatureReferences {
    pub fn touches(&self, container: usize) -> bool {
        self.chunks.iter().any(|r| r.container == container)
    }
}

/// What the authorization step hands back for a set of files.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileGroup {
    pub containers: Vec<Container>,
    pub references: Vec<SignatureReferences>,
}

impl FileGroup {
    pub fn byte_len(&self) -> u64 {
        self.containers.iter().map(Container::byte_len).sum()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Outcome {
    Success,
    SuccessDecrypted,
    FailedDownload,
    FailedDecryptError,
    FailedDecryptNoFile,
    FailedDecryptNoKey,
}

impl Outcome {
    pub fn is_success(self) -> bool {
        matches!(self, Outcome::Success | Outcome::SuccessDecrypted)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub id: u64,
    #[serde(default)]
    pub committed: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: u64,
    #[serde(default)]
    pub committed: bool,
    #[serde(default)]
    pub files: Vec<FileDescriptor>,
}

impl Snapshot {
    pub fn info(&self) -> SnapshotInfo {
        SnapshotInfo {
            id: self.id,
            committed: self.committed,
        }
    }
}
