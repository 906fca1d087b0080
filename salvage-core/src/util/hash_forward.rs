use sha1::Digest;
use std::io::{Result, Write};

/// Forwards writes to `inner`, feeding every accepted byte into `hasher`.
pub struct HashingForward<'a, W: Write, D: Digest> {
    inner: W,
    hasher: &'a mut D,
    pub counted: u64,
}

impl<'a, W: Write, D: Digest> HashingForward<'a, W, D> {
    pub fn new(inner: W, hasher: &'a mut D) -> Self {
        Self {
            inner,
            hasher,
            counted: 0,
        }
    }
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<'a, W: Write, D: Digest> Write for HashingForward<'a, W, D> {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.counted += n as u64;
        Ok(n)
    }
    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }
}
