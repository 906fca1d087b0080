#![allow(dead_code)]

use aes::cipher::{BlockEncrypt, KeyInit};
use aes::{Aes128, Aes256, Block};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};

use salvage_core::config::DownloadOptions;
use salvage_core::crypto::chunk::{KEY_TYPE_AES128, checksum};
use salvage_core::crypto::file::{BLOCK_SIZE, BlockIvs};
use salvage_core::domain::{
    Chunk, ChunkReference, Container, FileDescriptor, FileGroup, Signature, SignatureReferences,
    Snapshot, SnapshotInfo,
};
use salvage_core::error::{Result, SalvageError};
use salvage_core::repo::BackupService;

/// AES-CFB128 with a zero IV, the inverse of the chunk decrypter.
pub fn seal_chunk(key: &[u8; 16], plain: &[u8]) -> (Chunk, Vec<u8>) {
    let cipher = Aes128::new_from_slice(key).unwrap();
    let mut ct = Vec::with_capacity(plain.len());
    let mut feedback = [0u8; 16];
    for segment in plain.chunks(16) {
        let mut stream = Block::from(feedback);
        cipher.encrypt_block(&mut stream);
        let out: Vec<u8> = segment.iter().zip(stream.iter()).map(|(p, k)| p ^ k).collect();
        if out.len() == 16 {
            feedback.copy_from_slice(&out);
        }
        ct.extend(out);
    }
    let mut k = vec![KEY_TYPE_AES128];
    k.extend_from_slice(key);
    let mut sum = vec![1u8];
    sum.extend_from_slice(&checksum(plain));
    let chunk = Chunk {
        key: k,
        checksum: Some(sum),
        length: plain.len() as u32,
    };
    (chunk, ct)
}

/// Per-block AES-CBC with derived IVs, zero-padded to the AES block size.
pub fn seal_file(key: &[u8], plain: &[u8]) -> Vec<u8> {
    let ivs = BlockIvs::new(key);
    let mut padded = plain.to_vec();
    padded.resize(plain.len().div_ceil(16) * 16, 0);
    let mut out = Vec::with_capacity(padded.len());
    for (i, block) in padded.chunks(BLOCK_SIZE).enumerate() {
        let mut prev = ivs.iv(i as u64);
        for blk in block.chunks(16) {
            let mut x = [0u8; 16];
            for j in 0..16 {
                x[j] = blk[j] ^ prev[j];
            }
            let mut b = Block::from(x);
            match key.len() {
                16 => Aes128::new_from_slice(key).unwrap().encrypt_block(&mut b),
                _ => Aes256::new_from_slice(key).unwrap().encrypt_block(&mut b),
            }
            prev = b.into();
            out.extend_from_slice(&prev);
        }
    }
    out
}

pub fn sample(seed: u8, n: usize) -> Vec<u8> {
    (0..n)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

pub fn sig(n: u8) -> Signature {
    Signature(vec![0xa0, n])
}

pub fn fd(signature: Signature, size: u64, domain: &str, path: &str) -> FileDescriptor {
    FileDescriptor {
        signature,
        size,
        relative_path: path.into(),
        domain: domain.into(),
        mode: 0o644,
        encryption_key: None,
        decrypted_size: 0,
        last_modified: 1_600_000_000,
    }
}

/// Lay `contents` out back to back over containers of `container_len`
/// bytes, each split into chunks of at most `chunk_len` bytes. Content that
/// crosses a container boundary gets a reference list spanning both.
pub fn pack(
    prefix: &str,
    contents: &[(Signature, Vec<u8>)],
    container_len: usize,
    chunk_len: usize,
) -> (FileGroup, HashMap<String, Vec<u8>>) {
    let stream: Vec<u8> = contents.iter().flat_map(|(_, c)| c.iter().copied()).collect();
    let mut containers = Vec::new();
    let mut bodies = HashMap::new();
    for (ci, piece) in stream.chunks(container_len).enumerate() {
        let host = format!("{prefix}/c{ci}");
        let mut chunks = Vec::new();
        let mut body = Vec::new();
        for (k, part) in piece.chunks(chunk_len).enumerate() {
            let key = [(ci * 31 + k) as u8 ^ 0x5a; 16];
            let (chunk, ct) = seal_chunk(&key, part);
            chunks.push(chunk);
            body.extend(ct);
        }
        containers.push(Container {
            host: host.clone(),
            method: "GET".into(),
            headers: vec![],
            chunks,
        });
        bodies.insert(host, body);
    }

    let mut references = Vec::new();
    let mut pos = 0usize;
    for (signature, content) in contents {
        let end = pos + content.len();
        let mut start = pos;
        let mut chunks = Vec::new();
        while start < end {
            let ci = start / container_len;
            let off = start % container_len;
            let len = (container_len - off).min(end - start);
            chunks.push(ChunkReference {
                container: ci,
                offset: off as u64,
                length: len as u64,
            });
            start += len;
        }
        references.push(SignatureReferences {
            signature: signature.clone(),
            chunks,
        });
        pos = end;
    }
    (
        FileGroup {
            containers,
            references,
        },
        bodies,
    )
}

/// In-memory backup service with switchable failures.
#[derive(Default)]
pub struct MemService {
    pub snapshots: Vec<Snapshot>,
    pub groups: Vec<FileGroup>,
    pub bodies: HashMap<String, Vec<u8>>,
    /// Hosts that always answer 503.
    pub broken: HashSet<String>,
    /// Hosts that answer 503 this many more times.
    pub flaky: Mutex<HashMap<String, usize>>,
    pub unauthorized: AtomicBool,
    pub fetches: Mutex<HashMap<String, usize>>,
    /// Raised on every fetch while set.
    pub interrupt_on_fetch: Mutex<Option<Arc<AtomicBool>>>,
}

impl MemService {
    pub fn new(snapshot: Snapshot, group: FileGroup, bodies: HashMap<String, Vec<u8>>) -> Self {
        Self {
            snapshots: vec![snapshot],
            groups: vec![group],
            bodies,
            ..Default::default()
        }
    }

    pub fn fetch_count(&self, host: &str) -> usize {
        self.fetches.lock().unwrap().get(host).copied().unwrap_or(0)
    }
}

impl BackupService for MemService {
    fn snapshots(&self, _backup: &str) -> Result<Vec<SnapshotInfo>> {
        Ok(self.snapshots.iter().map(Snapshot::info).collect())
    }

    fn snapshot(&self, _backup: &str, id: u64) -> Result<Option<Snapshot>> {
        Ok(self.snapshots.iter().find(|s| s.id == id).cloned())
    }

    fn authorize(
        &self,
        _backup: &str,
        _snapshot: u64,
        files: &[FileDescriptor],
    ) -> Result<Vec<FileGroup>> {
        if self.unauthorized.load(Ordering::SeqCst) {
            return Err(SalvageError::from_status(401, "token expired"));
        }
        let wanted: HashSet<&Signature> = files.iter().map(|f| &f.signature).collect();
        Ok(self
            .groups
            .iter()
            .filter_map(|g| {
                let references: Vec<_> = g
                    .references
                    .iter()
                    .filter(|r| wanted.contains(&r.signature))
                    .cloned()
                    .collect();
                (!references.is_empty()).then(|| FileGroup {
                    containers: g.containers.clone(),
                    references,
                })
            })
            .collect())
    }

    fn fetch(&self, container: &Container) -> Result<Vec<u8>> {
        *self
            .fetches
            .lock()
            .unwrap()
            .entry(container.host.clone())
            .or_default() += 1;
        if let Some(flag) = self.interrupt_on_fetch.lock().unwrap().as_ref() {
            flag.store(true, Ordering::SeqCst);
        }
        if self.broken.contains(&container.host) {
            return Err(SalvageError::from_status(503, "unavailable"));
        }
        if let Some(n) = self.flaky.lock().unwrap().get_mut(&container.host) {
            if *n > 0 {
                *n -= 1;
                return Err(SalvageError::from_status(503, "try later"));
            }
        }
        self.bodies
            .get(&container.host)
            .cloned()
            .ok_or_else(|| SalvageError::from_status(404, container.host.clone()))
    }
}

pub fn fast_opts() -> DownloadOptions {
    DownloadOptions {
        threads: 3,
        stagger_ms: 0,
        retry_count: 2,
        requeue_limit: 1,
        batch_min_bytes: 8,
        fetch_attempts: 2,
        backoff_min_ms: 1,
        backoff_max_ms: 2,
        ..Default::default()
    }
}
