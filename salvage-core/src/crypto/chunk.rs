use aes::cipher::{BlockEncrypt, KeyInit};
use aes::{Aes128, Block as AesBlock};
use sha2::{Digest, Sha256};
use tracing::{trace, warn};

use crate::domain::{Chunk, Container};
use crate::error::DecodeFailure;

pub const KEY_TYPE_AES128: u8 = 1;
pub const CHECKSUM_LEN: usize = 20;
const BLOCK: usize = 16;

/// Decrypts the raw body of one container into per-chunk plaintext.
///
/// Holds no cipher state between calls; each worker owns its own value.
#[derive(Debug, Default)]
pub struct ChunkDecrypter {
    unverified: usize,
}

impl ChunkDecrypter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Chunks accepted without a checksum since this decrypter was created.
    pub fn unverified(&self) -> usize {
        self.unverified
    }

    /// All chunks in declaration order, or nothing.
    pub fn decrypt(
        &mut self,
        container: &Container,
        raw: &[u8],
    ) -> Result<Vec<Vec<u8>>, DecodeFailure> {
        let need = container.byte_len();
        if (raw.len() as u64) < need {
            return Err(DecodeFailure::Truncated {
                need,
                have: raw.len() as u64,
            });
        }

        let mut out = Vec::with_capacity(container.chunks.len());
        let mut off = 0usize;
        for (i, chunk) in container.chunks.iter().enumerate() {
            let end = off + chunk.length as usize;
            let plain = self.decrypt_chunk(i, chunk, &raw[off..end])?;
            out.push(plain);
            off = end;
        }
        trace!(chunks = out.len(), bytes = off, host = %container.host, "container decoded");
        Ok(out)
    }

    fn decrypt_chunk(
        &mut self,
        index: usize,
        chunk: &Chunk,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, DecodeFailure> {
        let key = chunk_key(chunk)?;
        let plain = cfb128_decrypt(&key, ciphertext);

        match &chunk.checksum {
            Some(expected) => {
                let expected = expected.get(1..).unwrap_or_default();
                if checksum(&plain)[..] != *expected {
                    return Err(DecodeFailure::ChecksumMismatch { chunk: index });
                }
            }
            None => {
                self.unverified += 1;
                warn!(chunk = index, "chunk has no checksum; integrity not verified");
            }
        }
        Ok(plain)
    }
}

fn chunk_key(chunk: &Chunk) -> Result<Aes128, DecodeFailure> {
    match chunk.key_type() {
        Some(KEY_TYPE_AES128) => {}
        Some(other) => return Err(DecodeFailure::UnsupportedKeyType(other)),
        None => return Err(DecodeFailure::BadKeyLength(0)),
    }
    let material = &chunk.key[1..];
    Aes128::new_from_slice(material).map_err(|_| DecodeFailure::BadKeyLength(material.len()))
}

/// SHA256(SHA256(data)) truncated to 20 bytes.
pub fn checksum(data: &[u8]) -> [u8; CHECKSUM_LEN] {
    let inner = Sha256::digest(data);
    let outer = Sha256::digest(inner);
    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(&outer[..CHECKSUM_LEN]);
    out
}

/// AES-CFB with 128-bit feedback and an all-zero IV.
fn cfb128_decrypt(cipher: &Aes128, ciphertext: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ciphertext.len());
    let mut feedback = [0u8; BLOCK];
    for segment in ciphertext.chunks(BLOCK) {
        let mut stream = AesBlock::from(feedback);
        cipher.encrypt_block(&mut stream);
        out.extend(segment.iter().zip(stream.iter()).map(|(c, k)| c ^ k));
        if segment.len() == BLOCK {
            feedback.copy_from_slice(segment);
        }
    }
    out
}
