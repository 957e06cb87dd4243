use std::collections::VecDeque;

/// Append-only output log with a hard upper bound on retained characters.
///
/// Trim-on-append: once the bound is exceeded the oldest characters are
/// discarded until the buffer is back at the bound, so the retained content
/// is always the exact suffix of the full stream. Escape codes are kept
/// verbatim; the plain-text view is derived at snapshot time.
#[derive(Debug)]
pub struct OutputBuffer {
    data: VecDeque<char>,
    max_chars: usize,
    dropped_chars_total: u64,
}

impl OutputBuffer {
    pub fn new(max_chars: usize) -> Self {
        Self {
            data: VecDeque::new(),
            max_chars: max_chars.max(1),
            dropped_chars_total: 0,
        }
    }

    /// Appends text and returns how many characters were evicted.
    pub fn append(&mut self, text: &str) -> u64 {
        for ch in text.chars() {
            self.data.push_back(ch);
        }
        let mut dropped = 0u64;
        while self.data.len() > self.max_chars {
            self.data.pop_front();
            dropped += 1;
        }
        if dropped > 0 {
            self.dropped_chars_total = self.dropped_chars_total.saturating_add(dropped);
        }
        dropped
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.max_chars
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_chars_total
    }

    /// Full retained content, escape codes intact.
    pub fn contents(&self) -> String {
        self.data.iter().collect()
    }

    /// The last `max_lines` lines of the raw content.
    pub fn tail_lines(&self, max_lines: usize) -> String {
        if max_lines == 0 || self.data.is_empty() {
            return String::new();
        }
        let mut newlines = 0usize;
        let mut start = 0usize;
        for (idx, &ch) in self.data.iter().enumerate().rev() {
            if ch == '\n' {
                // A trailing newline does not start a new visible line.
                if idx == self.data.len() - 1 {
                    continue;
                }
                newlines += 1;
                if newlines >= max_lines {
                    start = idx + 1;
                    break;
                }
            }
        }
        self.data.iter().skip(start).collect()
    }
}
