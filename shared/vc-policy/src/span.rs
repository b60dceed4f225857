//! Source locations.

use std::fmt;

/// A position in policy source text.
///
/// `offset` is a byte offset; `line` and `column` are 1-based and count
/// characters, which is what diagnostics show to humans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Location {
    pub offset: usize,
    pub line: u32,
    pub column: u32,
}

impl Location {
    #[must_use]
    pub const fn new(offset: usize, line: u32, column: u32) -> Self {
        Self {
            offset,
            line,
            column,
        }
    }

    /// Start of a file.
    #[must_use]
    pub const fn origin() -> Self {
        Self::new(0, 1, 1)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Half-open source range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Range {
    pub start: Location,
    pub end: Location,
}

impl Range {
    #[must_use]
    pub const fn new(start: Location, end: Location) -> Self {
        Self { start, end }
    }

    /// Zero-width range at `location`.
    #[must_use]
    pub const fn point(location: Location) -> Self {
        Self::new(location, location)
    }

    /// Smallest range covering both `self` and `other`.
    #[must_use]
    pub fn to(self, other: Self) -> Self {
        let start = if other.start.offset < self.start.offset {
            other.start
        } else {
            self.start
        };
        let end = if other.end.offset > self.end.offset {
            other.end
        } else {
            self.end
        };
        Self::new(start, end)
    }

    #[must_use]
    pub const fn is_multiline(&self) -> bool {
        self.end.line > self.start.line
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_union_covers_both() {
        let a = Range::new(Location::new(4, 1, 5), Location::new(8, 1, 9));
        let b = Range::new(Location::new(10, 2, 1), Location::new(12, 2, 3));

        let joined = a.to(b);
        assert_eq!(joined.start, a.start);
        assert_eq!(joined.end, b.end);
        assert!(joined.is_multiline());
        assert_eq!(b.to(a), joined);
    }

    #[test]
    fn test_point_is_single_line() {
        let point = Range::point(Location::origin());
        assert!(!point.is_multiline());
        assert_eq!(point.to_string(), "1:1-1:1");
    }
}
