//! Split text into platform-sized chunks.
//!
//! Greedy, three levels: whole lines, then words for lines that are too long,
//! then a hard cut at `max_len` characters for words that still do not fit.
//! Lengths are counted in chars, so a cut never lands inside a UTF-8 sequence.

/// One deliverable fragment of a larger text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Position in split order, starting at 0.
    pub index: usize,
    pub text: String,
}

impl Chunk {
    /// The first chunk is delivered as a reply; the rest as continuations.
    pub fn is_first(&self) -> bool {
        self.index == 0
    }
}

/// Split `text` and number the pieces.
pub fn chunk_text(text: &str, max_len: usize) -> Vec<Chunk> {
    split_message(text, max_len)
        .into_iter()
        .enumerate()
        .map(|(index, text)| Chunk { index, text })
        .collect()
}

/// Accumulates pieces into the chunk under construction and flushes full chunks.
struct Splitter {
    max_len: usize,
    chunks: Vec<String>,
    current: String,
    current_len: usize,
}

impl Splitter {
    fn new(max_len: usize) -> Self {
        Self {
            max_len,
            chunks: Vec::new(),
            current: String::new(),
            current_len: 0,
        }
    }

    /// Append `piece` with `sep` if it fits, otherwise flush first. Returns false when
    /// `piece` alone is longer than a chunk and was not consumed.
    fn push(&mut self, piece: &str, sep: char) -> bool {
        let len = piece.chars().count();
        if self.current_len + len + 1 <= self.max_len {
            if !self.current.is_empty() {
                self.current.push(sep);
                self.current_len += 1;
            }
            self.current.push_str(piece);
            self.current_len += len;
            return true;
        }
        self.flush();
        if len <= self.max_len {
            self.current.push_str(piece);
            self.current_len = len;
            true
        } else {
            false
        }
    }

    fn flush(&mut self) {
        let trimmed = self.current.trim();
        if !trimmed.is_empty() {
            self.chunks.push(trimmed.to_string());
        }
        self.current.clear();
        self.current_len = 0;
    }

    /// Cut `piece` every `max_len` chars. Full segments are emitted as-is; the tail
    /// stays open so following text can join it.
    fn hard_split(&mut self, piece: &str) {
        self.flush();
        let chars: Vec<char> = piece.chars().collect();
        let mut segments = chars.chunks(self.max_len).peekable();
        while let Some(segment) = segments.next() {
            let segment: String = segment.iter().collect();
            if segments.peek().is_some() {
                if !segment.trim().is_empty() {
                    self.chunks.push(segment);
                }
            } else {
                self.current_len = segment.chars().count();
                self.current = segment;
            }
        }
    }

    fn push_line(&mut self, line: &str) {
        if self.push(line, '\n') {
            return;
        }
        if line.contains(' ') {
            for word in line.split(' ') {
                if !self.push(word, ' ') {
                    self.hard_split(word);
                }
            }
        } else {
            self.hard_split(line);
        }
    }

    fn finish(mut self) -> Vec<String> {
        self.flush();
        self.chunks
    }
}

/// Split `text` into chunks of at most `max_len` chars, preferring line and then word
/// boundaries. Text that already fits is returned unchanged; blank text yields no chunks.
/// A `max_len` of 0 is treated as 1.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    let max_len = max_len.max(1);
    if text.trim().is_empty() {
        return Vec::new();
    }
    if text.chars().count() <= max_len {
        return vec![text.to_string()];
    }

    let mut splitter = Splitter::new(max_len);
    for line in text.lines() {
        splitter.push_line(line);
    }
    splitter.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_within(chunks: &[String], max_len: usize) {
        for c in chunks {
            assert!(
                c.chars().count() <= max_len,
                "chunk of {} chars exceeds {}: {:?}",
                c.chars().count(),
                max_len,
                c
            );
        }
    }

    fn non_whitespace(s: &str) -> String {
        s.chars().filter(|c| !c.is_whitespace()).collect()
    }

    #[test]
    fn short_text_is_returned_unchanged() {
        assert_eq!(split_message("hello", 2000), vec!["hello"]);
        assert_eq!(split_message("  padded \n", 20), vec!["  padded \n"]);
        let exact = "x".repeat(10);
        assert_eq!(split_message(&exact, 10), vec![exact.clone()]);
    }

    #[test]
    fn blank_text_yields_nothing() {
        assert!(split_message("", 10).is_empty());
        assert!(split_message("\n\n\n", 10).is_empty());
        assert!(split_message(&"\n".repeat(50), 10).is_empty());
        assert!(split_message("   \t ", 3).is_empty());
    }

    #[test]
    fn long_run_without_breaks_is_hard_split() {
        let text = "a".repeat(3000);
        let chunks = split_message(&text, 2000);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 2000);
        assert_eq!(chunks[1].len(), 1000);
    }

    #[test]
    fn lines_are_packed_greedily() {
        let text = "line1\nline2\nline3\nline4";
        let chunks = split_message(text, 12);
        assert_eq!(chunks, vec!["line1\nline2", "line3\nline4"]);
    }

    #[test]
    fn long_line_falls_back_to_words() {
        let text = "alpha beta gamma delta epsilon";
        let chunks = split_message(text, 12);
        assert_within(&chunks, 12);
        assert_eq!(chunks, vec!["alpha beta", "gamma delta", "epsilon"]);
    }

    #[test]
    fn oversized_word_inside_sentence_is_cut() {
        let text = format!("short {} tail", "x".repeat(25));
        let chunks = split_message(&text, 10);
        assert_within(&chunks, 10);
        assert_eq!(chunks[0], "short");
        assert_eq!(chunks[1], "x".repeat(10));
        assert_eq!(chunks[2], "x".repeat(10));
        assert_eq!(chunks[3], "xxxxx tail");
    }

    #[test]
    fn blank_lines_inside_a_chunk_are_kept() {
        let text = format!("para one\n\npara two\n{}", "z".repeat(30));
        let chunks = split_message(&text, 20);
        assert_eq!(chunks[0], "para one\n\npara two");
    }

    #[test]
    fn multibyte_text_is_cut_on_char_boundaries() {
        let text = "é".repeat(25);
        let chunks = split_message(&text, 10);
        assert_eq!(chunks.len(), 3);
        assert_within(&chunks, 10);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn zero_limit_is_treated_as_one() {
        let chunks = split_message("abc", 0);
        assert_eq!(chunks, vec!["a", "b", "c"]);
    }

    #[test]
    fn every_chunk_fits_and_content_survives() {
        let text = "The quick brown fox jumps over the lazy dog.\n\
                    Pack my box with five dozen liquor jugs.\n\
                    \n\
                    Sphinx of black quartz, judge my vow! ";
        let long = format!("{}{}\n{}", text, "w".repeat(37), text);
        for max_len in 1..60 {
            let chunks = split_message(&long, max_len);
            assert_within(&chunks, max_len);
            assert!(chunks.iter().all(|c| !c.trim().is_empty()));
            assert_eq!(non_whitespace(&chunks.concat()), non_whitespace(&long));
        }
    }

    #[test]
    fn chunks_are_numbered_from_zero() {
        let chunks = chunk_text(&"b".repeat(25), 10);
        assert_eq!(chunks.len(), 3);
        assert!(chunks[0].is_first());
        assert!(!chunks[1].is_first());
        assert_eq!(chunks[2].index, 2);
    }
}
