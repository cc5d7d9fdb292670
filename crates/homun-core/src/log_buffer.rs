//! Bounded scrollback for container output.

use crate::types::OutputLine;
use std::collections::VecDeque;

/// Maximum number of lines retained in the scrollback.
///
/// Older lines are evicted first once the cap is reached, so a long agent
/// run cannot grow memory without bound.
pub const MAX_LOG_LINES: usize = 1000;

/// Ordered output lines, oldest first, capped at [`MAX_LOG_LINES`].
#[derive(Debug, Clone, Default)]
pub struct LogBuffer {
    lines: VecDeque<OutputLine>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self {
            lines: VecDeque::with_capacity(MAX_LOG_LINES),
        }
    }

    /// Append a line, evicting from the front when over capacity.
    pub fn push(&mut self, line: OutputLine) {
        self.lines.push_back(line);
        while self.lines.len() > MAX_LOG_LINES {
            self.lines.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &OutputLine> + ExactSizeIterator {
        self.lines.iter()
    }

    /// The most recent `n` lines in arrival order.
    pub fn tail(&self, n: usize) -> impl Iterator<Item = &OutputLine> {
        let start = self.lines.len().saturating_sub(n);
        self.lines.iter().skip(start)
    }
}
