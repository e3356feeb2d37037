use std::collections::VecDeque;

pub const OUTPUT_CAPACITY: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedLine {
    pub seq: u64,
    pub stream: OutputStream,
    pub text: String,
}

/// Fixed-capacity FIFO of the agent's most recent output lines.
///
/// Sequence numbers keep increasing across `reset`, so a cursor taken before a
/// reset still selects exactly the lines captured after it.
#[derive(Debug)]
pub struct OutputRing {
    lines: VecDeque<CapturedLine>,
    capacity: usize,
    next_seq: u64,
}

impl Default for OutputRing {
    fn default() -> Self {
        Self::with_capacity(OUTPUT_CAPACITY)
    }
}

impl OutputRing {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
            next_seq: 0,
        }
    }

    pub fn push(&mut self, stream: OutputStream, text: impl Into<String>) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(CapturedLine {
            seq,
            stream,
            text: text.into(),
        });
        seq
    }

    /// Sequence number the next captured line will get.
    pub fn cursor(&self) -> u64 {
        self.next_seq
    }

    pub fn lines_since(&self, cursor: u64) -> Vec<String> {
        self.lines
            .iter()
            .filter(|line| line.seq >= cursor)
            .map(|line| line.text.clone())
            .collect()
    }

    pub fn snapshot(&self) -> Vec<CapturedLine> {
        self.lines.iter().cloned().collect()
    }

    pub fn reset(&mut self) {
        self.lines.clear();
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
