use std::{fmt::Display, path::PathBuf, sync::Arc};

/// Byte offsets of every newline in a source file, for offset -> line/column
/// translation when rendering error positions.
#[derive(Clone, Debug)]
pub struct FileInfo {
    newlines: Vec<usize>,
    path: Option<Arc<PathBuf>>,
}

impl FileInfo {
    pub fn new(src: &str, path: Option<Arc<PathBuf>>) -> Self {
        let mut newlines = vec![0];
        for (i, c) in src.char_indices() {
            if c == '\n' {
                newlines.push(i);
            }
        }
        newlines.push(src.len());
        FileInfo { newlines, path }
    }
    pub fn cursor(&self, offset: usize) -> Cursor {
        let idx = self.newlines.partition_point(|&nl| nl < offset.max(1));
        let line_start = if idx > 0 { self.newlines[idx - 1] } else { 0 };
        Cursor { line: idx.max(1), column: offset.saturating_sub(line_start) }
    }
    pub fn path(&self) -> PathBuf {
        self.path.as_ref().map(|p| p.to_path_buf()).unwrap_or_default()
    }
}

/// A line/column pair, 1-based line.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Cursor {
    pub line: usize,
    pub column: usize,
}

impl Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// A half-open byte range into a source buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Span { start, end }
    }
    pub fn dummy() -> Self {
        Span { start: 0, end: 0 }
    }
    pub fn is_dummy(&self) -> bool {
        self.start == 0 && self.end == 0
    }
}

impl Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn cursor_translation() {
        let info = FileInfo::new("ab\ncd\nef", None);
        assert_eq!(info.cursor(4), Cursor { line: 2, column: 2 });
        assert_eq!(info.cursor(7), Cursor { line: 3, column: 2 });
    }
}
