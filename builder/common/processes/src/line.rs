/// Maximum number of bytes delivered for a single line; longer lines are cut
/// and the truncated part is marked with an ellipsis.
pub const MAX_LINE_LENGTH: usize = 10000;

/// Maps untrusted subprocess output to printable ASCII: every byte outside
/// `[0x20..0x7E]` becomes `.`.
pub fn sanitize_line(untrusted_line: &[u8]) -> String {
    untrusted_line
        .iter()
        .map(|&c| if (0x20..=0x7e).contains(&c) { c as char } else { '.' })
        .collect()
}

/// Splits a byte stream read in arbitrary chunks into sanitized lines.
///
/// Carries the unterminated tail between chunks; a tail that outgrows
/// [`MAX_LINE_LENGTH`] is flushed early with a `…` marker so a runaway
/// writer cannot buffer unbounded memory.
pub struct LineAssembler {
    remaining: Vec<u8>,
    max_length: usize,
}

impl Default for LineAssembler {
    fn default() -> Self {
        Self {
            remaining: Vec::new(),
            max_length: MAX_LINE_LENGTH,
        }
    }
}

impl LineAssembler {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut out = Vec::new();

        let mut parts = chunk.split(|&b| b == b'\n');
        // The first part continues whatever the previous chunk left behind.
        let first = parts.next().unwrap_or_default();
        let mut current = std::mem::take(&mut self.remaining);
        current.extend_from_slice(first);

        for part in parts {
            out.push(sanitize_line(&current).trim_end().to_string());
            current = part.to_vec();
        }

        while current.len() > self.max_length {
            let head: Vec<u8> = current.drain(..self.max_length).collect();
            out.push(format!("{}\u{2026}", sanitize_line(&head).trim_end()));
        }
        self.remaining = current;
        out
    }

    /// Flushes the unterminated tail at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.remaining.is_empty() {
            return None;
        }
        let tail = std::mem::take(&mut self.remaining);
        Some(sanitize_line(&tail).trim_end().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn sanitizes_non_printable_bytes() {
        assert_eq!(sanitize_line(b"ok\x80\x01end"), "ok..end");
    }

    #[test]
    fn joins_lines_across_chunks() {
        let mut assembler = LineAssembler::default();
        assert_eq!(assembler.push(b"hel"), Vec::<String>::new());
        assert_eq!(assembler.push(b"lo\nwor"), vec!["hello".to_string()]);
        assert_eq!(assembler.finish(), Some("wor".to_string()));
    }

    #[test]
    fn long_line_is_split_with_ellipsis() {
        let mut assembler = LineAssembler::default();
        let mut lines = Vec::new();
        // 20000 bytes without a newline arrive across several reads.
        let payload = vec![b'a'; 20000];
        for chunk in payload.chunks(4096) {
            lines.extend(assembler.push(chunk));
        }
        lines.extend(assembler.finish());

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].len(), MAX_LINE_LENGTH + '\u{2026}'.len_utf8());
        assert!(lines[0].ends_with('\u{2026}'));
        assert_eq!(lines[1], "a".repeat(10000));
    }

    #[test]
    fn trailing_whitespace_is_trimmed() {
        let mut assembler = LineAssembler::default();
        assert_eq!(assembler.push(b"data  \r\n"), vec!["data".to_string()]);
    }
}
