//! Fixed-capacity byte chunk passed from the capture side to the recognizer.

/// A fixed-capacity byte buffer plus a logical length.
///
/// The capacity is set at allocation and never grows; writes beyond it are
/// truncated. Chunks are recycled by the channel, so the backing allocation
/// outlives any single use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    buf: Box<[u8]>,
    len: usize,
}

impl AudioChunk {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    /// Chunk holding a copy of `bytes`, sized exactly to fit.
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self {
            buf: bytes.to_vec().into_boxed_slice(),
            len: bytes.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.buf.len()
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.len
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Append as many bytes as fit; returns how many were taken.
    pub fn fill_from(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.remaining());
        self.buf[self.len..self.len + n].copy_from_slice(&bytes[..n]);
        self.len += n;
        n
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_truncates_at_capacity() {
        let mut chunk = AudioChunk::with_capacity(4);
        assert_eq!(chunk.fill_from(&[1, 2, 3]), 3);
        assert_eq!(chunk.fill_from(&[4, 5, 6]), 1);
        assert!(chunk.is_full());
        assert_eq!(chunk.as_bytes(), &[1, 2, 3, 4]);
    }

    #[test]
    fn clear_keeps_capacity() {
        let mut chunk = AudioChunk::from_slice(&[9; 8]);
        chunk.clear();
        assert!(chunk.is_empty());
        assert_eq!(chunk.capacity(), 8);
    }
}
