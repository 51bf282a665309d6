//! Line-structured text buffer shared by the inklet server and client.
//!
//! A [`Document`] is an ordered sequence of lines where every line except
//! possibly the last ends with `'\n'`, plus a cursor addressing a character
//! position inside one of those lines. All mutation is positional: callers
//! place the cursor first (remote positions must pass [`Document::set_cursor`],
//! which bounds-checks), then write or erase at it.
//!
//! Columns are character indices, not byte offsets, so multi-byte UTF-8
//! never gets split by an edit.

/// A cursor address into a [`Document`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

impl Position {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

/// In-memory document with a cursor and a remembered preferred column.
///
/// The preferred column keeps vertical cursor motion visually stable:
/// moving up through a short line and back down returns to the original
/// column when the target line permits it. Horizontal moves and edits
/// refresh it.
#[derive(Debug, Clone)]
pub struct Document {
    lines: Vec<String>,
    cursor: Position,
    preferred: usize,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    /// An empty document: a single empty line, cursor at the origin.
    pub fn new() -> Self {
        Self {
            lines: vec![String::new()],
            cursor: Position::default(),
            preferred: 0,
        }
    }

    /// Build a document from a text blob, keeping line terminators.
    ///
    /// A trailing `'\n'` (or empty input) yields a trailing empty line,
    /// matching what writing that text character by character produces.
    pub fn from_text(text: &str) -> Self {
        let mut lines: Vec<String> = text.split_inclusive('\n').map(String::from).collect();
        if text.is_empty() || text.ends_with('\n') {
            lines.push(String::new());
        }
        Self {
            lines,
            cursor: Position::default(),
            preferred: 0,
        }
    }

    /// Full document text, line terminators included.
    pub fn text(&self) -> String {
        self.lines.concat()
    }

    pub fn line(&self, index: usize) -> Option<&str> {
        self.lines.get(index).map(String::as_str)
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn cursor(&self) -> Position {
        self.cursor
    }

    /// Reposition the cursor, bounds-checked.
    ///
    /// Succeeds only when `pos.line` indexes an existing line and
    /// `pos.column` is at most that line's character length. On failure
    /// nothing changes. Every remote edit goes through this gate before
    /// write/erase, since the position arrives off the wire and may be
    /// stale.
    pub fn set_cursor(&mut self, pos: Position) -> bool {
        match self.lines.get(pos.line) {
            Some(line) if pos.column <= char_len(line) => {
                self.cursor = pos;
                self.preferred = pos.column;
                true
            }
            _ => false,
        }
    }

    /// Insert text at the cursor, one character at a time.
    ///
    /// At end of line characters append; mid-line they shift the remainder
    /// right. A newline splits the current line at the cursor: the suffix
    /// becomes a new line directly below and the cursor lands on its
    /// column 0.
    pub fn write(&mut self, text: &str) -> Position {
        for ch in text.chars() {
            self.put(ch);
        }
        self.preferred = self.cursor.column;
        self.cursor
    }

    fn put(&mut self, ch: char) {
        // Guard against a stale line index; invariants make this unreachable.
        let Some(line) = self.lines.get_mut(self.cursor.line) else {
            return;
        };
        if self.cursor.column >= char_len(line) {
            line.push(ch);
            self.cursor.column += 1;
            if ch == '\n' {
                self.lines.insert(self.cursor.line + 1, String::new());
                self.cursor.line += 1;
                self.cursor.column = 0;
            }
        } else {
            let at = byte_of(line, self.cursor.column);
            line.insert(at, ch);
            self.cursor.column += 1;
            if ch == '\n' {
                let split = byte_of(line, self.cursor.column);
                let suffix = line.split_off(split);
                self.lines.insert(self.cursor.line + 1, suffix);
                self.cursor.line += 1;
                self.cursor.column = 0;
            }
        }
    }

    /// Delete `count` characters left of the cursor.
    ///
    /// At column 0 the current line merges onto the end of the previous
    /// line (consuming its `'\n'`) and the cursor moves to the join point.
    /// A no-op once the cursor reaches the document start.
    pub fn erase(&mut self, count: usize) -> Position {
        for _ in 0..count {
            if self.cursor.column > 0 {
                let line = &mut self.lines[self.cursor.line];
                let at = byte_of(line, self.cursor.column - 1);
                line.remove(at);
                self.cursor.column -= 1;
            } else if self.cursor.line > 0 {
                let current = self.lines.remove(self.cursor.line);
                self.cursor.line -= 1;
                let prev = &mut self.lines[self.cursor.line];
                prev.pop();
                self.cursor.column = char_len(prev);
                prev.push_str(&current);
            } else {
                break;
            }
        }
        self.preferred = self.cursor.column;
        self.cursor
    }

    /// One character left, wrapping to the end of the previous line.
    pub fn move_left(&mut self) -> Position {
        if self.cursor.column > 0 {
            self.cursor.column -= 1;
        } else if self.cursor.line > 0 {
            self.cursor.line -= 1;
            // Land on the previous line's terminator.
            self.cursor.column = char_len(&self.lines[self.cursor.line]).saturating_sub(1);
        }
        self.preferred = self.cursor.column;
        self.cursor
    }

    /// One character right, wrapping past a line terminator to column 0
    /// of the next line.
    pub fn move_right(&mut self) -> Position {
        let line = &self.lines[self.cursor.line];
        let len = char_len(line);
        let last = self.cursor.line == self.lines.len() - 1;
        if last && self.cursor.column >= len {
            return self.cursor;
        }
        let terminated = line.ends_with('\n') as usize;
        if self.cursor.column < len - terminated {
            self.cursor.column += 1;
        } else {
            self.cursor.line += 1;
            self.cursor.column = 0;
        }
        self.preferred = self.cursor.column;
        self.cursor
    }

    /// Move to the equivalent visual row one above, with lines wrapped at
    /// `width` columns. Uses the preferred column so the horizontal
    /// position survives crossing shorter lines.
    pub fn move_up(&mut self, width: usize) -> Position {
        if width == 0 {
            return self.cursor;
        }
        self.preferred %= width;
        if self.cursor.column >= width {
            // Previous visual row of the same line.
            self.cursor.column = (self.cursor.column / width - 1) * width + self.preferred;
            return self.cursor;
        }
        if self.cursor.line == 0 {
            return self.cursor;
        }
        self.cursor.line -= 1;
        let len = char_len(&self.lines[self.cursor.line]);
        let target = len / width * width + self.preferred;
        self.cursor.column = target.min(len.saturating_sub(1));
        self.cursor
    }

    /// Move to the equivalent visual row one below; see [`Self::move_up`].
    pub fn move_down(&mut self, width: usize) -> Position {
        if width == 0 {
            return self.cursor;
        }
        self.preferred %= width;
        let line = &self.lines[self.cursor.line];
        let len = char_len(line);
        if len > (self.cursor.column / width + 1) * width {
            // Next visual row of the same line.
            let terminated = line.ends_with('\n') as usize;
            self.cursor.column = (self.cursor.column + width).min(len - terminated);
            return self.cursor;
        }
        if self.cursor.line == self.lines.len() - 1 {
            return self.cursor;
        }
        self.cursor.line += 1;
        let line = &self.lines[self.cursor.line];
        let len = char_len(line);
        let terminated = line.ends_with('\n') as usize;
        self.cursor.column = self.preferred.min(len.saturating_sub(terminated));
        self.cursor
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Byte offset of the `col`-th character, or the string's end.
fn byte_of(s: &str, col: usize) -> usize {
    s.char_indices().nth(col).map_or(s.len(), |(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_has_one_line() {
        let doc = Document::new();
        assert_eq!(doc.line_count(), 1);
        assert_eq!(doc.line(0), Some(""));
        assert_eq!(doc.cursor(), Position::new(0, 0));
    }

    #[test]
    fn write_splits_lines_on_newline() {
        let mut doc = Document::new();
        let cursor = doc.write("ab\ncd");
        assert_eq!(doc.lines(), &["ab\n".to_string(), "cd".to_string()]);
        assert_eq!(cursor, Position::new(1, 2));
    }

    #[test]
    fn write_inserts_mid_line() {
        let mut doc = Document::from_text("hd");
        assert!(doc.set_cursor(Position::new(0, 1)));
        doc.write("ea");
        assert_eq!(doc.text(), "head");
        assert_eq!(doc.cursor(), Position::new(0, 3));
    }

    #[test]
    fn newline_mid_line_moves_suffix_below() {
        let mut doc = Document::from_text("headtail");
        assert!(doc.set_cursor(Position::new(0, 4)));
        doc.write("\n");
        assert_eq!(doc.lines(), &["head\n".to_string(), "tail".to_string()]);
        assert_eq!(doc.cursor(), Position::new(1, 0));
    }

    #[test]
    fn from_text_round_trips() {
        for text in ["", "one line", "a\nb\nc", "trailing\n"] {
            assert_eq!(Document::from_text(text).text(), text);
        }
    }

    #[test]
    fn from_text_trailing_newline_yields_empty_last_line() {
        let doc = Document::from_text("ab\n");
        assert_eq!(doc.lines(), &["ab\n".to_string(), String::new()]);
    }

    #[test]
    fn erase_removes_left_of_cursor() {
        let mut doc = Document::from_text("abcd");
        assert!(doc.set_cursor(Position::new(0, 3)));
        let cursor = doc.erase(2);
        assert_eq!(doc.text(), "ad");
        assert_eq!(cursor, Position::new(0, 1));
    }

    #[test]
    fn erase_at_column_zero_merges_lines() {
        let mut doc = Document::from_text("ab\ncd");
        assert!(doc.set_cursor(Position::new(1, 0)));
        let cursor = doc.erase(1);
        assert_eq!(doc.text(), "abcd");
        assert_eq!(cursor, Position::new(0, 2));
    }

    #[test]
    fn erase_at_origin_is_idempotent() {
        let mut doc = Document::from_text("ab");
        assert!(doc.set_cursor(Position::new(0, 2)));
        doc.erase(2);
        assert_eq!(doc.cursor(), Position::new(0, 0));
        let cursor = doc.erase(5);
        assert_eq!(cursor, Position::new(0, 0));
        assert_eq!(doc.text(), "");
        assert_eq!(doc.line_count(), 1);
    }

    #[test]
    fn erase_spanning_lines() {
        let mut doc = Document::from_text("ab\ncd");
        assert!(doc.set_cursor(Position::new(1, 1)));
        doc.erase(3);
        assert_eq!(doc.text(), "ad");
        assert_eq!(doc.cursor(), Position::new(0, 1));
    }

    #[test]
    fn set_cursor_rejects_out_of_range() {
        let mut doc = Document::from_text("ab\ncd");
        assert!(!doc.set_cursor(Position::new(2, 0)));
        assert!(!doc.set_cursor(Position::new(1, 3)));
        assert_eq!(doc.cursor(), Position::new(0, 0));
        assert!(doc.set_cursor(Position::new(1, 2)));
    }

    #[test]
    fn set_cursor_allows_line_end() {
        let mut doc = Document::from_text("ab\ncd");
        // "ab\n" has three characters; column 3 sits after the terminator.
        assert!(doc.set_cursor(Position::new(0, 3)));
    }

    #[test]
    fn write_is_char_indexed_not_byte_indexed() {
        let mut doc = Document::from_text("héllo");
        assert!(doc.set_cursor(Position::new(0, 2)));
        doc.write("x");
        assert_eq!(doc.text(), "héxllo");
    }

    #[test]
    fn move_left_wraps_to_previous_line() {
        let mut doc = Document::from_text("ab\ncd");
        assert!(doc.set_cursor(Position::new(1, 0)));
        assert_eq!(doc.move_left(), Position::new(0, 2));
        assert_eq!(doc.move_left(), Position::new(0, 1));
    }

    #[test]
    fn move_left_stops_at_origin() {
        let mut doc = Document::from_text("ab");
        assert_eq!(doc.move_left(), Position::new(0, 0));
    }

    #[test]
    fn move_right_wraps_to_next_line() {
        let mut doc = Document::from_text("ab\ncd");
        assert!(doc.set_cursor(Position::new(0, 2)));
        assert_eq!(doc.move_right(), Position::new(1, 0));
    }

    #[test]
    fn move_right_stops_at_document_end() {
        let mut doc = Document::from_text("ab");
        assert!(doc.set_cursor(Position::new(0, 2)));
        assert_eq!(doc.move_right(), Position::new(0, 2));
    }

    #[test]
    fn vertical_moves_keep_preferred_column() {
        let mut doc = Document::from_text("long line here\nhi\nanother long one");
        assert!(doc.set_cursor(Position::new(2, 7)));
        let up = doc.move_up(80);
        // "hi\n" is short; the cursor clamps onto it.
        assert_eq!(up.line, 1);
        assert!(up.column <= 2);
        let down = doc.move_down(80);
        assert_eq!(down, Position::new(2, 7));
    }

    #[test]
    fn vertical_moves_respect_wrap_width() {
        // One long line wrapped at width 4 spans three visual rows.
        let mut doc = Document::from_text("abcdefghij");
        assert!(doc.set_cursor(Position::new(0, 9)));
        let up = doc.move_up(4);
        assert_eq!(up, Position::new(0, 5));
        let down = doc.move_down(4);
        assert_eq!(down, Position::new(0, 9));
    }

    #[test]
    fn moves_are_total_on_empty_document() {
        let mut doc = Document::new();
        doc.move_left();
        doc.move_right();
        doc.move_up(10);
        doc.move_down(10);
        assert_eq!(doc.cursor(), Position::new(0, 0));
    }
}
