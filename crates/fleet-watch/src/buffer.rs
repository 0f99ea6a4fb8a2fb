//! Line splitting for watch bodies.

use zeroize::Zeroize;

/// Accumulates body chunks and yields complete `\n` terminated lines.
///
/// Watch bodies can carry secrets, so no copy of a byte outlives its use:
/// consumed lines are overwritten when the buffer is compacted, a storage
/// that is outgrown is zeroed before it is freed, and the storage is zeroed
/// on drop.
#[derive(Debug, Default)]
pub struct LineBuffer {
    /// Always fully initialised; only `..filled` holds data.
    storage: Vec<u8>,
    filled: usize,
}

impl LineBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk.
    pub fn push(&mut self, chunk: &[u8]) {
        let needed = self.filled + chunk.len();
        if needed > self.storage.len() {
            let mut grown = vec![0; needed.max(self.storage.len() * 2)];
            grown[..self.filled].copy_from_slice(&self.storage[..self.filled]);
            let mut old = std::mem::replace(&mut self.storage, grown);
            old.zeroize();
        }
        self.storage[self.filled..needed].copy_from_slice(chunk);
        self.filled = needed;
    }

    /// Bytes waiting for a line terminator.
    pub fn pending(&self) -> usize {
        self.filled
    }

    /// Call `f` for every complete, non-empty line. Returns the number of lines seen.
    pub fn drain_lines(&mut self, mut f: impl FnMut(&[u8])) -> usize {
        let data = &self.storage[..self.filled];
        let mut start = 0;
        let mut lines = 0;
        while let Some(pos) = data[start..].iter().position(|b| *b == b'\n') {
            let mut line = &data[start..start + pos];
            if let Some(stripped) = line.strip_suffix(b"\r") {
                line = stripped;
            }
            if !line.is_empty() {
                f(line);
                lines += 1;
            }
            start += pos + 1;
        }

        if start > 0 {
            let remaining = self.filled - start;
            self.storage.copy_within(start..self.filled, 0);
            self.storage[remaining..self.filled].zeroize();
            self.filled = remaining;
        }
        lines
    }
}

impl Drop for LineBuffer {
    fn drop(&mut self) {
        self.storage.zeroize();
    }
}
