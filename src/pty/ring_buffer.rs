use std::collections::VecDeque;

/// Fixed-capacity circular log of terminal output lines.
///
/// Pushing past capacity silently drops the oldest line; it never blocks and
/// never errors. Raw byte chunks are split on newlines, with the trailing
/// unterminated fragment held back until the next chunk or [`flush`].
///
/// [`flush`]: RingBuffer::flush
#[derive(Debug, Clone)]
pub struct RingBuffer {
    lines: VecDeque<String>,
    capacity: usize,
    partial: String,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            partial: String::new(),
        }
    }

    /// Push a complete line, overwriting the oldest once at capacity.
    pub fn push(&mut self, line: impl Into<String>) {
        if self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    /// Push a raw chunk, splitting on newlines.
    ///
    /// The final fragment without a trailing newline is buffered and
    /// prepended to the next chunk.
    pub fn push_raw(&mut self, data: &str) {
        let combined = format!("{}{}", self.partial, data);
        let mut parts: Vec<&str> = combined.split('\n').collect();

        // Last element is the unterminated remainder (empty if the chunk
        // ended in a newline)
        self.partial = parts.pop().unwrap_or("").to_string();

        for line in parts {
            self.push(line);
        }
    }

    /// Force any buffered fragment out as a final line.
    pub fn flush(&mut self) {
        if !self.partial.is_empty() {
            let line = std::mem::take(&mut self.partial);
            self.push(line);
        }
    }

    /// All lines, oldest first.
    pub fn get_all(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    /// The last `n` lines, oldest first. Returns everything if `n` exceeds
    /// the current size.
    pub fn get_last(&self, n: usize) -> Vec<String> {
        let skip = self.lines.len().saturating_sub(n);
        self.lines.iter().skip(skip).cloned().collect()
    }

    /// Number of complete lines currently held.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// All lines joined with newlines, for replaying to an attaching viewer.
    pub fn raw_content(&self) -> String {
        self.lines
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn clear(&mut self) {
        self.lines.clear();
        self.partial.clear();
    }
}
