use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::{Mutex, PoisonError};

use crate::config::DownloadOptions;
use crate::domain::ChunkReference;
use crate::error::{DecodeFailure, Result, SalvageError};

/// Decrypted containers of one file group. Each container is put once, then
/// read by any number of reference lists.
pub trait ChunkStore: Send {
    /// Record the plaintext chunks of `container`, in declaration order.
    fn put(&mut self, container: usize, chunks: Vec<Vec<u8>>) -> Result<()>;

    fn contains(&self, container: usize) -> bool;

    /// Concatenate the referenced slices into `out`; returns bytes written.
    fn write_refs(&self, refs: &[ChunkReference], out: &mut dyn Write) -> Result<u64>;
}

/// Pick a backing for a group expected to decode to `expected_bytes`.
pub fn for_group(expected_bytes: u64, opts: &DownloadOptions) -> Result<Box<dyn ChunkStore>> {
    if expected_bytes > opts.spill_threshold {
        Ok(Box::new(SpillChunkStore::new(opts)?))
    } else {
        Ok(Box::new(MemChunkStore::default()))
    }
}

fn missing(container: usize) -> SalvageError {
    SalvageError::Format(format!("container {container} not decoded"))
}

/// Fails unless `r` lies within a container of `have` bytes.
fn check_range(r: &ChunkReference, have: u64) -> Result<()> {
    match r.offset.checked_add(r.length) {
        Some(end) if end <= have => Ok(()),
        end => Err(DecodeFailure::Truncated {
            need: end.unwrap_or(u64::MAX),
            have,
        }
        .into()),
    }
}

#[derive(Default)]
pub struct MemChunkStore {
    containers: HashMap<usize, Vec<Vec<u8>>>,
}

impl MemChunkStore {
    fn container_len(chunks: &[Vec<u8>]) -> u64 {
        chunks.iter().map(|c| c.len() as u64).sum()
    }
}

impl ChunkStore for MemChunkStore {
    fn put(&mut self, container: usize, chunks: Vec<Vec<u8>>) -> Result<()> {
        self.containers.insert(container, chunks);
        Ok(())
    }

    fn contains(&self, container: usize) -> bool {
        self.containers.contains_key(&container)
    }

    fn write_refs(&self, refs: &[ChunkReference], out: &mut dyn Write) -> Result<u64> {
        let mut total = 0u64;
        for r in refs {
            let chunks = self
                .containers
                .get(&r.container)
                .ok_or_else(|| missing(r.container))?;
            check_range(r, Self::container_len(chunks))?;

            // Walk the chunk list until the slice is covered.
            let mut skip = r.offset;
            let mut left = r.length;
            for c in chunks {
                if left == 0 {
                    break;
                }
                let len = c.len() as u64;
                if skip >= len {
                    skip -= len;
                    continue;
                }
                let take = (len - skip).min(left);
                out.write_all(&c[skip as usize..(skip + take) as usize])?;
                left -= take;
                skip = 0;
            }
            total += r.length;
        }
        Ok(total)
    }
}

/// Containers appended to an unnamed temp file, one frame each.
pub struct SpillChunkStore {
    f: Mutex<File>,
    frames: HashMap<usize, (u64, u64)>,
    next_off: u64,
}

impl SpillChunkStore {
    pub fn new(opts: &DownloadOptions) -> Result<Self> {
        let f = match &opts.spill_dir {
            Some(dir) => tempfile::tempfile_in(dir)?,
            None => tempfile::tempfile()?,
        };
        Ok(Self {
            f: Mutex::new(f),
            frames: HashMap::new(),
            next_off: 0,
        })
    }
}

impl ChunkStore for SpillChunkStore {
    fn put(&mut self, container: usize, chunks: Vec<Vec<u8>>) -> Result<()> {
        let f = self.f.get_mut().unwrap_or_else(PoisonError::into_inner);
        f.seek(SeekFrom::Start(self.next_off))?;
        let mut len = 0u64;
        for c in &chunks {
            f.write_all(c)?;
            len += c.len() as u64;
        }
        self.frames.insert(container, (self.next_off, len));
        self.next_off += len;
        Ok(())
    }

    fn contains(&self, container: usize) -> bool {
        self.frames.contains_key(&container)
    }

    fn write_refs(&self, refs: &[ChunkReference], out: &mut dyn Write) -> Result<u64> {
        let mut f = self.f.lock().unwrap_or_else(PoisonError::into_inner);
        let mut total = 0u64;
        for r in refs {
            let &(off, have) = self
                .frames
                .get(&r.container)
                .ok_or_else(|| missing(r.container))?;
            check_range(r, have)?;
            f.seek(SeekFrom::Start(off + r.offset))?;
            let copied = std::io::copy(&mut (&mut *f).take(r.length), out)?;
            if copied != r.length {
                return Err(DecodeFailure::Truncated {
                    need: r.length,
                    have: copied,
                }
                .into());
            }
            total += copied;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(container: usize, offset: u64, length: u64) -> ChunkReference {
        ChunkReference {
            container,
            offset,
            length,
        }
    }

    fn stores() -> Vec<Box<dyn ChunkStore>> {
        let opts = DownloadOptions::default();
        vec![
            Box::new(MemChunkStore::default()),
            Box::new(SpillChunkStore::new(&opts).unwrap()),
        ]
    }

    fn fill(store: &mut dyn ChunkStore) {
        // container 0: "hello" + "world"; container 1: "0123456789"
        store
            .put(1, vec![b"0123".to_vec(), b"456789".to_vec()])
            .unwrap();
        store
            .put(0, vec![b"hello".to_vec(), b"world".to_vec()])
            .unwrap();
    }

    fn read(store: &dyn ChunkStore, refs: &[ChunkReference]) -> Vec<u8> {
        let mut out = Vec::new();
        let n = store.write_refs(refs, &mut out).unwrap();
        assert_eq!(n, out.len() as u64);
        out
    }

    #[test]
    fn single_chunk_slice() {
        for mut s in stores() {
            fill(s.as_mut());
            assert_eq!(read(s.as_ref(), &[r(0, 0, 5)]), b"hello");
        }
    }

    #[test]
    fn slice_across_chunk_boundary() {
        for mut s in stores() {
            fill(s.as_mut());
            assert_eq!(read(s.as_ref(), &[r(0, 3, 5)]), b"lowor");
            assert_eq!(read(s.as_ref(), &[r(1, 2, 6)]), b"234567");
        }
    }

    #[test]
    fn file_spanning_two_containers() {
        for mut s in stores() {
            fill(s.as_mut());
            let refs = [r(0, 5, 5), r(1, 0, 4), r(0, 0, 1)];
            assert_eq!(read(s.as_ref(), &refs), b"world0123h");
            // Same list read again by a second destination.
            assert_eq!(read(s.as_ref(), &refs), b"world0123h");
        }
    }

    #[test]
    fn missing_or_short_container_is_an_error() {
        for mut s in stores() {
            fill(s.as_mut());
            let mut out = Vec::new();
            assert!(s.write_refs(&[r(2, 0, 1)], &mut out).is_err());
            assert!(s.write_refs(&[r(0, 8, 5)], &mut out).is_err());
            assert!(s.contains(1));
            assert!(!s.contains(2));
        }
    }

    #[test]
    fn overflowing_reference_is_truncated() {
        for mut s in stores() {
            fill(s.as_mut());
            let mut out = Vec::new();
            let err = s.write_refs(&[r(0, u64::MAX, 2)], &mut out).unwrap_err();
            assert!(matches!(
                err,
                SalvageError::Decode(DecodeFailure::Truncated { need: u64::MAX, have: 10 })
            ));
            assert!(out.is_empty());
        }
    }

    #[test]
    fn large_groups_spill() {
        let opts = DownloadOptions {
            spill_threshold: 10,
            ..Default::default()
        };
        let mut s = for_group(11, &opts).unwrap();
        fill(s.as_mut());
        assert_eq!(read(s.as_ref(), &[r(1, 9, 1)]), b"9");
    }
}
