//! In-place decryption of downloaded files that carry a per-file key.
//!
//! Files are split into 4096-byte blocks, each AES-CBC encrypted under the
//! file key with its own IV. The IV for block `i` is obtained by encrypting
//! an LFSR expansion of the block's byte offset under `SHA1(key)[..16]`.
//!
//! Older backups carry no decrypted size in the listing; instead a 28-byte
//! trailer follows the ciphertext: the big-endian plaintext size and the
//! SHA-1 of the plaintext.

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes256, Block as AesBlock};
use sha1::{Digest, Sha1};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{DecodeFailure, Result};
use crate::util::hash_forward::HashingForward;

pub const BLOCK_SIZE: usize = 4096;
pub const TRAILER_LEN: u64 = 28;
pub const ENCRYPTED_SUFFIX: &str = ".encrypted";
const AES_BLOCK: usize = 16;
const IV_POLY: u32 = 0x8000_0061;

enum FileCipher {
    Aes128(Aes128),
    Aes256(Aes256),
}

impl FileCipher {
    fn new(key: &[u8]) -> std::result::Result<Self, DecodeFailure> {
        match key.len() {
            16 => Aes128::new_from_slice(key).map(FileCipher::Aes128),
            32 => Aes256::new_from_slice(key).map(FileCipher::Aes256),
            n => return Err(DecodeFailure::BadKeyLength(n)),
        }
        .map_err(|_| DecodeFailure::BadKeyLength(key.len()))
    }

    fn decrypt_block(&self, block: &mut AesBlock) {
        match self {
            FileCipher::Aes128(c) => c.decrypt_block(block),
            FileCipher::Aes256(c) => c.decrypt_block(block),
        }
    }

    /// CBC over a block-aligned buffer, in place.
    fn decrypt_cbc(&self, iv: [u8; AES_BLOCK], buf: &mut [u8]) {
        let mut prev = iv;
        for blk in buf.chunks_exact_mut(AES_BLOCK) {
            let mut ct = [0u8; AES_BLOCK];
            ct.copy_from_slice(blk);
            let mut b = AesBlock::from(ct);
            self.decrypt_block(&mut b);
            for ((out, p), v) in blk.iter_mut().zip(b.iter()).zip(prev.iter()) {
                *out = p ^ v;
            }
            prev = ct;
        }
    }
}

/// Per-block IV derivation for one file key.
pub struct BlockIvs {
    cipher: Aes128,
}

impl BlockIvs {
    pub fn new(file_key: &[u8]) -> Self {
        let digest = Sha1::digest(file_key);
        let mut iv_key = [0u8; 16];
        iv_key.copy_from_slice(&digest[..16]);
        Self {
            cipher: Aes128::new(&iv_key.into()),
        }
    }

    pub fn iv(&self, block_index: u64) -> [u8; AES_BLOCK] {
        // Low 32 bits of the byte offset seed the generator.
        let offset = block_index.wrapping_mul(BLOCK_SIZE as u64) as u32;
        let mut b = AesBlock::from(lfsr_seed(offset));
        self.cipher.encrypt_block(&mut b);
        b.into()
    }
}

fn lfsr_seed(mut lba: u32) -> [u8; AES_BLOCK] {
    let mut out = [0u8; AES_BLOCK];
    for word in out.chunks_exact_mut(4) {
        lba = if lba & 1 != 0 {
            IV_POLY ^ (lba >> 1)
        } else {
            lba >> 1
        };
        word.copy_from_slice(&lba.to_le_bytes());
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecryptReport {
    /// Plaintext bytes left in the file.
    pub written: u64,
    /// Size the plaintext was declared to have.
    pub expected: u64,
    /// Trailer digest check; `None` when the listing supplied the size.
    pub verified: Option<bool>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FileDecrypter;

impl FileDecrypter {
    pub fn new() -> Self {
        Self
    }

    /// Rewrite `path` as plaintext. `decrypted_size == 0` selects the trailer format.
    pub fn decrypt(&self, path: &Path, key: &[u8], decrypted_size: u64) -> Result<DecryptReport> {
        let len = fs::metadata(path)?.len();
        if len == 0 {
            return Ok(DecryptReport {
                written: 0,
                expected: decrypted_size,
                verified: None,
            });
        }
        let cipher = FileCipher::new(key)?;
        let ivs = BlockIvs::new(key);

        let (ct_len, size, trailer) = if decrypted_size == 0 {
            let (size, digest) = read_trailer(path, len)?;
            (len - TRAILER_LEN, size, Some(digest))
        } else {
            (len, decrypted_size, None)
        };
        if ct_len % AES_BLOCK as u64 != 0 {
            return Err(DecodeFailure::Misaligned(ct_len).into());
        }

        let aside = encrypted_path(path);
        fs::rename(path, &aside)?;
        let streamed = stream_blocks(&aside, path, &cipher, &ivs, ct_len, size);
        let (written, digest) = match streamed {
            Ok(v) => v,
            Err(e) => {
                // Keep the ciphertext; a half-written plaintext is worse than none.
                let _ = fs::remove_file(path);
                return Err(e);
            }
        };
        if let Err(e) = fs::remove_file(&aside) {
            warn!(path = %aside.display(), error = %e, "could not remove ciphertext");
        }

        if written < size {
            warn!(path = %path.display(), written, expected = size, "decrypted output is short");
        }
        let verified = trailer.map(|t| t == digest);
        if verified == Some(false) {
            warn!(path = %path.display(), "trailer digest does not match plaintext");
            return Err(DecodeFailure::TrailerMismatch.into());
        }
        debug!(path = %path.display(), written, "file decrypted");
        Ok(DecryptReport {
            written,
            expected: size,
            verified,
        })
    }
}

/// Where ciphertext is parked while `path` is being decrypted.
pub fn encrypted_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(ENCRYPTED_SUFFIX);
    PathBuf::from(name)
}

fn read_trailer(path: &Path, len: u64) -> Result<(u64, [u8; 20])> {
    if len < TRAILER_LEN {
        return Err(DecodeFailure::TrailerMissing(len).into());
    }
    let mut f = File::open(path)?;
    f.seek(SeekFrom::Start(len - TRAILER_LEN))?;
    let mut size = [0u8; 8];
    let mut digest = [0u8; 20];
    f.read_exact(&mut size)?;
    f.read_exact(&mut digest)?;
    Ok((u64::from_be_bytes(size), digest))
}

fn stream_blocks(
    src: &Path,
    dst: &Path,
    cipher: &FileCipher,
    ivs: &BlockIvs,
    ct_len: u64,
    size: u64,
) -> Result<(u64, [u8; 20])> {
    let mut input = File::open(src)?;
    let output = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(dst)?;
    let mut hasher = Sha1::new();
    let mut out = HashingForward::new(BufWriter::new(output), &mut hasher);

    let mut buf = vec![0u8; BLOCK_SIZE];
    let mut left = ct_len;
    let mut keep = size;
    let mut index = 0u64;
    while left > 0 {
        let n = left.min(BLOCK_SIZE as u64) as usize;
        input.read_exact(&mut buf[..n])?;
        cipher.decrypt_cbc(ivs.iv(index), &mut buf[..n]);
        let k = keep.min(n as u64) as usize;
        out.write_all(&buf[..k])?;
        keep -= k as u64;
        left -= n as u64;
        index += 1;
    }
    out.flush()?;
    let written = out.counted;
    out.into_inner()
        .into_inner()
        .map_err(|e| e.into_error())?
        .sync_all()?;

    let mut digest = [0u8; 20];
    digest.copy_from_slice(&hasher.finalize());
    Ok((written, digest))
}
