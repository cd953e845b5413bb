use std::collections::VecDeque;

/// Append-only byte queue that hands out exact sized chunks, coalescing across
/// the chunks it was fed.
#[derive(Debug, Default)]
pub struct BufferList {
    chunks: VecDeque<Vec<u8>>,
    len: usize,
}

impl BufferList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a copy of the bytes to the queue.
    pub fn append(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.len += bytes.len();
        self.chunks.push_back(bytes.to_vec());
    }

    /// Takes exactly `n` bytes from the front of the queue.
    ///
    /// # Arguments
    /// * `n` - Number of bytes to take.
    ///
    /// # Returns
    /// * `Some(Vec<u8>)` - The first `n` bytes.
    /// * `None` - Fewer than `n` bytes are queued, nothing is taken.
    pub fn take(&mut self, n: usize) -> Option<Vec<u8>> {
        if n > self.len {
            return None;
        }

        // single chunk of the exact size, hand it over as is
        if self.chunks.front().is_some_and(|c| c.len() == n) {
            self.len -= n;
            return self.chunks.pop_front();
        }

        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            let Some(mut chunk) = self.chunks.pop_front() else {
                break;
            };
            let wanted = n - out.len();
            if chunk.len() > wanted {
                let rest = chunk.split_off(wanted);
                self.chunks.push_front(rest);
            }
            out.extend_from_slice(&chunk);
        }
        self.len -= out.len();
        Some(out)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.len = 0;
    }
}
