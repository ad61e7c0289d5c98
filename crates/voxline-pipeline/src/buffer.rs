//! Bounded accumulation buffer for inbound audio.

/// Raised when a push would take the buffer past its cap. The chunk is not
/// appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overflow {
    pub buffered: usize,
    pub cap: usize,
}

/// Byte buffer with a hard cap. Slices are flushed from the front.
#[derive(Debug)]
pub struct AudioBuffer {
    data: Vec<u8>,
    cap: usize,
}

impl AudioBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            data: Vec::new(),
            cap,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<(), Overflow> {
        let buffered = self.data.len() + chunk.len();
        if buffered > self.cap {
            return Err(Overflow {
                buffered,
                cap: self.cap,
            });
        }
        self.data.extend_from_slice(chunk);
        Ok(())
    }

    /// The first `n` bytes, if at least that many are buffered.
    pub fn front(&self, n: usize) -> Option<&[u8]> {
        (n > 0 && self.data.len() >= n).then(|| &self.data[..n])
    }

    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.data.len());
        self.data.drain(..n);
    }
}
