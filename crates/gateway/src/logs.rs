//! Bounded in-memory log ring served by `logs.tail`.

use std::{
    collections::VecDeque,
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

const DEFAULT_CAPACITY: usize = 512;

pub struct LogRing {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl Default for LogRing {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append a line, evicting the oldest at capacity.
    pub fn push(&self, line: impl Into<String>) {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let Ok(mut lines) = self.lines.lock() else {
            return;
        };
        if lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(format!("{ts} {}", line.into()));
    }

    /// The last `n` lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let Ok(lines) = self.lines.lock() else {
            return vec![];
        };
        let start = lines.len().saturating_sub(n);
        lines.iter().skip(start).cloned().collect()
    }
}
