use std::collections::VecDeque;

/// Append-only, byte-bounded buffer of guest output.
///
/// The supervisor is the only writer; the classifier and status readers see
/// snapshots. When the cap is reached the oldest bytes are evicted first, so
/// a runaway guest flooding its own stdout cannot grow memory unbounded.
#[derive(Debug)]
pub struct OutputBuffer {
    bytes: VecDeque<u8>,
    cap: usize,
    total_written: u64,
}

impl OutputBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            bytes: VecDeque::with_capacity(cap.min(4096)),
            cap,
            total_written: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.total_written += chunk.len() as u64;

        if self.cap == 0 {
            return;
        }

        // A chunk larger than the cap reduces to its tail
        let chunk = if chunk.len() > self.cap {
            &chunk[chunk.len() - self.cap..]
        } else {
            chunk
        };

        let overflow = (self.bytes.len() + chunk.len()).saturating_sub(self.cap);
        if overflow > 0 {
            self.bytes.drain(..overflow);
        }
        self.bytes.extend(chunk);
    }

    pub fn push_line(&mut self, line: &str) {
        self.push(line.as_bytes());
        self.push(b"\n");
    }

    /// Most-recent retained output as a lossy string, for classification
    /// and diagnostics only. Never surfaced verbatim to the end user.
    pub fn tail(&self) -> String {
        String::from_utf8_lossy(&self.bytes.iter().copied().collect::<Vec<u8>>()).into_owned()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Total bytes ever written, including evicted ones.
    pub fn total_written(&self) -> u64 {
        self.total_written
    }
}
