//! Offset / line-column conversion for a document's text

use codemap::{CodeMap, File};
use serde::Serialize;
use std::sync::Arc;

/// A position in editor coordinates: 0-based line, 0-based character within the line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Position {
    pub line: usize,
    pub character: usize,
}

impl Position {
    pub fn new(line: usize, character: usize) -> Position {
        Position { line, character }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl Range {
    pub fn new(start: Position, end: Position) -> Range {
        Range { start, end }
    }

    pub fn point(p: Position) -> Range {
        Range { start: p, end: p }
    }
}

#[derive(Clone)]
pub struct TextIndex {
    file: Arc<File>,
}

impl TextIndex {
    pub fn new(name: &str, text: String) -> TextIndex {
        let mut map = CodeMap::new();
        TextIndex {
            file: map.add_file(name.to_string(), text),
        }
    }

    pub fn text(&self) -> &str {
        self.file.source()
    }

    pub fn name(&self) -> &str {
        self.file.name()
    }

    /// The underlying `codemap` file, for rendering diagnostics against spans
    pub fn file(&self) -> &Arc<File> {
        &self.file
    }

    pub fn len(&self) -> usize {
        self.text().len()
    }

    pub fn is_empty(&self) -> bool {
        self.text().is_empty()
    }

    pub fn line_count(&self) -> usize {
        self.file.num_lines()
    }

    /// Clamps `offset` into the text and back onto a character boundary
    pub fn clamp(&self, offset: usize) -> usize {
        let text = self.text();
        let mut offset = offset.min(text.len());
        while !text.is_char_boundary(offset) {
            offset -= 1;
        }
        offset
    }

    pub fn position(&self, offset: usize) -> Position {
        let pos = self.file.span.low() + self.clamp(offset) as u64;
        let lc = self.file.find_line_col(pos);
        Position::new(lc.line, lc.column)
    }

    pub fn line_start(&self, line: usize) -> usize {
        if line >= self.line_count() {
            return self.len();
        }
        (self.file.line_span(line).low() - self.file.span.low()) as usize
    }

    /// The text of `line` without its line terminator
    pub fn line_text(&self, line: usize) -> &str {
        if line >= self.line_count() {
            return "";
        }
        self.file.source_line(line)
    }

    /// The byte offset of a position; characters past the end of the line clamp to its end
    pub fn offset_at(&self, line: usize, character: usize) -> usize {
        let start = self.line_start(line);
        let text = self.line_text(line);
        start
            + text
                .char_indices()
                .nth(character)
                .map(|(i, _)| i)
                .unwrap_or_else(|| text.len())
    }

    pub fn range(&self, start: usize, end: usize) -> Range {
        Range::new(self.position(start), self.position(end))
    }
}
