use std::collections::VecDeque;

/// Bounded history of raw console lines, addressable by sequence number.
#[derive(Debug)]
pub struct ConsoleBuffer {
    next_seq: u64,
    max_lines: usize,
    lines: VecDeque<(u64, String)>,
}

impl ConsoleBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            next_seq: 1,
            max_lines: max_lines.max(1),
            lines: VecDeque::new(),
        }
    }

    pub fn push_line(&mut self, line: impl Into<String>) -> u64 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        self.lines.push_back((seq, line.into()));
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
        seq
    }

    pub fn last_seq(&self) -> u64 {
        self.next_seq.saturating_sub(1)
    }

    /// Lines with a sequence number greater than `cursor`, plus the cursor to
    /// pass next time. A cursor of 0 returns the most recent `limit` lines.
    pub fn tail_after(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        if cursor == 0 {
            let start = self.lines.len().saturating_sub(limit);
            let mut out = Vec::new();
            let mut last = 0;
            for (seq, line) in self.lines.iter().skip(start) {
                out.push(line.clone());
                last = *seq;
            }
            return (out, last);
        }

        let mut out = Vec::new();
        let mut last = cursor;
        for (seq, line) in self.lines.iter() {
            if *seq > cursor {
                out.push(line.clone());
                last = *seq;
                if out.len() >= limit {
                    break;
                }
            }
        }
        (out, last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_oldest_past_capacity() {
        let mut b = ConsoleBuffer::new(2);
        b.push_line("a");
        b.push_line("b");
        b.push_line("c");
        let (lines, last) = b.tail_after(0, 10);
        assert_eq!(lines, vec!["b", "c"]);
        assert_eq!(last, 3);
    }

    #[test]
    fn cursor_pages_forward() {
        let mut b = ConsoleBuffer::new(100);
        for i in 0..5 {
            b.push_line(format!("line {i}"));
        }
        let (first, cur) = b.tail_after(1, 2);
        assert_eq!(first, vec!["line 1", "line 2"]);
        let (rest, cur) = b.tail_after(cur, 10);
        assert_eq!(rest, vec!["line 3", "line 4"]);
        let (none, same) = b.tail_after(cur, 10);
        assert!(none.is_empty());
        assert_eq!(same, cur);
        assert_eq!(b.last_seq(), 5);
    }
}
