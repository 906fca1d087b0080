use dashmap::DashMap;
use std::sync::Arc;

use crate::domain::{FileDescriptor, Signature};

/// Files that share one signature, claimed together.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignatureGroup {
    pub signature: Signature,
    pub files: Vec<FileDescriptor>,
}

impl SignatureGroup {
    /// Content bytes behind the signature (identical for every file).
    pub fn content_len(&self) -> u64 {
        self.files.first().map(|f| f.size).unwrap_or(0)
    }
}

/// Work unit handed to a worker.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Batch {
    pub groups: Vec<SignatureGroup>,
    pub bytes: u64,
    /// Times this batch went back on the queue.
    pub attempt: u32,
}

impl Batch {
    pub fn push(&mut self, group: SignatureGroup) {
        self.bytes += group.content_len();
        self.groups.push(group);
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn signatures(&self) -> impl Iterator<Item = &Signature> {
        self.groups.iter().map(|g| &g.signature)
    }

    /// One descriptor per signature; enough to authorize the content.
    pub fn representatives(&self) -> Vec<FileDescriptor> {
        self.groups
            .iter()
            .filter_map(|g| g.files.first().cloned())
            .collect()
    }
}

/// Signature → files, shared by every claimant of a round.
#[derive(Debug, Default)]
pub struct SignatureMap {
    inner: DashMap<Signature, Vec<FileDescriptor>>,
}

impl SignatureMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Group files by signature; files without one are skipped.
    pub fn from_files(files: impl IntoIterator<Item = FileDescriptor>) -> Self {
        let map = Self::new();
        for f in files.into_iter().filter(FileDescriptor::has_signature) {
            map.inner.entry(f.signature.clone()).or_default().push(f);
        }
        map
    }

    /// Remove and return the entry; `None` means someone else holds it.
    pub fn take(&self, signature: &Signature) -> Option<Vec<FileDescriptor>> {
        self.inner.remove(signature).map(|(_, files)| files)
    }

    /// Put files back, merging with whatever is already present.
    pub fn merge(&self, signature: Signature, files: Vec<FileDescriptor>) {
        let mut e = self.inner.entry(signature).or_default();
        for f in files {
            if !e.contains(&f) {
                e.push(f);
            }
        }
    }

    pub fn keys(&self) -> Vec<Signature> {
        self.inner.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Draining iterator over a shared [`SignatureMap`].
///
/// Walks a snapshot of the keys taken at construction, claiming each entry
/// that is still present, and closes a batch once it grows past
/// `min_bytes`. Any number of bundlers may drain the same map; each entry
/// lands in exactly one of their batches.
pub struct Bundler {
    map: Arc<SignatureMap>,
    keys: Vec<Signature>,
    cursor: usize,
    min_bytes: u64,
}

impl Bundler {
    pub fn new(map: Arc<SignatureMap>, min_bytes: u64) -> Self {
        let mut keys = map.keys();
        keys.sort();
        Self::with_order(map, keys, min_bytes)
    }

    /// Claim in a caller-chosen key order.
    pub fn with_order(map: Arc<SignatureMap>, keys: Vec<Signature>, min_bytes: u64) -> Self {
        Self {
            map,
            keys,
            cursor: 0,
            min_bytes,
        }
    }
}

impl Iterator for Bundler {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        let mut batch = Batch::default();
        while let Some(signature) = self.keys.get(self.cursor) {
            self.cursor += 1;
            let Some(files) = self.map.take(signature) else {
                continue;
            };
            batch.push(SignatureGroup {
                signature: signature.clone(),
                files,
            });
            if batch.bytes > self.min_bytes {
                return Some(batch);
            }
        }
        (!batch.is_empty()).then_some(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn file(sig: u8, size: u64, path: &str) -> FileDescriptor {
        FileDescriptor {
            signature: Signature(vec![sig]),
            size,
            relative_path: path.into(),
            domain: "HomeDomain".into(),
            mode: 0o644,
            encryption_key: None,
            decrypted_size: 0,
            last_modified: 0,
        }
    }

    #[test]
    fn groups_by_signature_and_skips_unsigned() {
        let mut unsigned = file(0, 0, "empty");
        unsigned.signature = Signature::default();
        let map = SignatureMap::from_files(vec![
            file(1, 10, "a"),
            file(1, 10, "b"),
            file(2, 5, "c"),
            unsigned,
        ]);
        assert_eq!(map.len(), 2);
        assert_eq!(map.take(&Signature(vec![1])).unwrap().len(), 2);
        assert!(map.take(&Signature(vec![1])).is_none());
    }

    #[test]
    fn batches_close_past_threshold_and_emit_tail() {
        let files = (0..5u8).map(|i| file(i, 10, &format!("f{i}")));
        let map = Arc::new(SignatureMap::from_files(files));
        let batches: Vec<Batch> = Bundler::new(map.clone(), 15).collect();
        let sizes: Vec<usize> = batches.iter().map(Batch::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert!(map.is_empty());
    }

    #[test]
    fn merge_restores_claimed_entry() {
        let map = SignatureMap::from_files(vec![file(1, 10, "a")]);
        let files = map.take(&Signature(vec![1])).unwrap();
        map.merge(Signature(vec![1]), files.clone());
        map.merge(Signature(vec![1]), files);
        assert_eq!(map.take(&Signature(vec![1])).unwrap().len(), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn concurrent_bundlers_claim_each_signature_once(
            sizes in proptest::collection::vec(0u64..2_000, 1..200),
            workers in 1usize..8,
            threshold in 0u64..5_000,
        ) {
            let files: Vec<FileDescriptor> = sizes
                .iter()
                .enumerate()
                .map(|(i, &s)| FileDescriptor {
                    signature: Signature((i as u32).to_be_bytes().to_vec()),
                    ..file(0, s, &format!("p{i}"))
                })
                .collect();
            let expected: HashSet<Signature> = files.iter().map(|f| f.signature.clone()).collect();
            let map = Arc::new(SignatureMap::from_files(files));

            let claimed: Vec<Vec<Signature>> = std::thread::scope(|s| {
                let handles: Vec<_> = (0..workers)
                    .map(|w| {
                        let map = map.clone();
                        s.spawn(move || {
                            let mut keys = map.keys();
                            let len = keys.len();
                            keys.rotate_left(w * len / workers);
                            Bundler::with_order(map, keys, threshold)
                                .flat_map(|b| b.groups.into_iter().map(|g| g.signature))
                                .collect::<Vec<_>>()
                        })
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().unwrap()).collect()
            });

            let all: Vec<Signature> = claimed.into_iter().flatten().collect();
            let unique: HashSet<Signature> = all.iter().cloned().collect();
            prop_assert_eq!(all.len(), unique.len());
            prop_assert_eq!(unique, expected);
            prop_assert!(map.is_empty());
        }
    }
}
