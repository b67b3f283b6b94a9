/// Incremental bracket counter for a JSON value arriving one character at a time.
///
/// Delimiters inside string literals do not count, and a backslash inside a
/// string escapes the next character (so `\"` does not end the string).
#[derive(Debug, Clone, Default)]
pub struct DepthTracker {
    depth: usize,
    in_string: bool,
    escape_next: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepthStatus {
    /// Still inside the value (or nothing opened yet).
    Open,
    /// The outermost object/array just closed.
    Balanced,
    /// A closing delimiter with nothing open.
    Unbalanced,
}

impl DepthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn in_string(&self) -> bool {
        self.in_string
    }

    pub fn feed(&mut self, ch: char) -> DepthStatus {
        if self.in_string {
            if self.escape_next {
                self.escape_next = false;
            } else if ch == '\\' {
                self.escape_next = true;
            } else if ch == '"' {
                self.in_string = false;
            }
            return DepthStatus::Open;
        }

        match ch {
            '"' => self.in_string = true,
            '{' | '[' => self.depth += 1,
            '}' | ']' => {
                if self.depth == 0 {
                    return DepthStatus::Unbalanced;
                }
                self.depth -= 1;
                if self.depth == 0 {
                    return DepthStatus::Balanced;
                }
            }
            _ => {}
        }
        DepthStatus::Open
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// True when `text` holds exactly one balanced object or array, ignoring
/// surrounding whitespace.
pub fn is_json_complete(text: &str) -> bool {
    let trimmed = text.trim();
    if !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
        return false;
    }

    let mut tracker = DepthTracker::new();
    for (i, ch) in trimmed.char_indices() {
        match tracker.feed(ch) {
            DepthStatus::Open => {}
            DepthStatus::Unbalanced => return false,
            DepthStatus::Balanced => return i + ch.len_utf8() == trimmed.len(),
        }
    }
    false
}
