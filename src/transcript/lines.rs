//! Line assembly for terminal output
//!
//! PTY reads split output at arbitrary points, and a secret cut in two by a read
//! boundary matches no redaction rule. The pump therefore hands the store whole
//! lines only. A trailing partial line is held back until its newline arrives,
//! the buffer reaches `limit`, or the caller flushes it (idle timeout or end of
//! session).

/// Held-back output waiting for the rest of its line
#[derive(Debug)]
pub struct LineBuffer {
    pending: String,
    limit: usize,
}

/// Upper bound on a held-back partial line
pub const DEFAULT_LINE_LIMIT: usize = 4096;

impl LineBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            pending: String::new(),
            limit: limit.max(1),
        }
    }

    /// Add `text`. Returns everything up to and including the last newline, or
    /// the whole buffer once it has grown past the limit.
    pub fn push(&mut self, text: &str) -> Option<String> {
        self.pending.push_str(text);
        if self.pending.len() >= self.limit {
            return self.take();
        }
        let end = self.pending.rfind('\n')? + 1;
        let rest = self.pending.split_off(end);
        Some(std::mem::replace(&mut self.pending, rest))
    }

    /// Release the held-back partial line, if any
    pub fn take(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_LINE_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_line_held_until_newline() {
        let mut lines = LineBuffer::default();
        assert_eq!(lines.push("token: ghp_0123"), None);
        assert_eq!(lines.push("4567\r\nnext"), Some("token: ghp_01234567\r\n".to_string()));
        assert_eq!(lines.take(), Some("next".to_string()));
        assert!(lines.is_empty());
    }

    #[test]
    fn test_several_lines_released_together() {
        let mut lines = LineBuffer::default();
        assert_eq!(lines.push("a\nb\nc"), Some("a\nb\n".to_string()));
        assert_eq!(lines.push("\n"), Some("c\n".to_string()));
        assert_eq!(lines.take(), None);
    }

    #[test]
    fn test_limit_forces_release() {
        let mut lines = LineBuffer::new(8);
        assert_eq!(lines.push("abcd"), None);
        assert_eq!(lines.push("efghij"), Some("abcdefghij".to_string()));
        assert!(lines.is_empty());
    }
}
