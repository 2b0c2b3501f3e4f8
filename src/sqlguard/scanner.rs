//! Quote- and comment-aware SQL scanning.
//!
//! A single pass over the statement that the validator uses to split
//! statements, measure comment density, and locate named `:param` tokens.
//! String literals, quoted identifiers and comments are opaque to all three.

/// A named parameter occurrence: byte span of the whole `:name` token plus
/// the bare name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSite {
    pub start: usize,
    pub end: usize,
    pub name: String,
}

/// Result of scanning one SQL body.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Byte spans of statements with real content (comments and whitespace
    /// do not count as content).
    pub statements: Vec<(usize, usize)>,

    /// Named parameter sites in order of appearance.
    pub params: Vec<ParamSite>,

    /// Bytes inside comments, for the density heuristic.
    pub comment_bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Normal,
    SingleQuote,
    DoubleQuote,
    Backtick,
    Bracket,
    LineComment,
    BlockComment,
}

/// Scans `sql`, honoring single/double quotes, backticks, brackets, `--`
/// and `#` line comments, and `/* */` block comments. A `::` cast is not a
/// parameter.
pub fn scan(sql: &str) -> ScanOutcome {
    let bytes = sql.as_bytes();
    let mut outcome = ScanOutcome::default();
    let mut state = State::Normal;

    let mut stmt_start = 0usize;
    let mut stmt_has_content = false;
    let mut i = 0usize;

    while i < bytes.len() {
        let c = bytes[i];
        let next = bytes.get(i + 1).copied();

        match state {
            State::Normal => match c {
                b'\'' => {
                    state = State::SingleQuote;
                    stmt_has_content = true;
                    i += 1;
                }
                b'"' => {
                    state = State::DoubleQuote;
                    stmt_has_content = true;
                    i += 1;
                }
                b'`' => {
                    state = State::Backtick;
                    stmt_has_content = true;
                    i += 1;
                }
                b'[' => {
                    state = State::Bracket;
                    stmt_has_content = true;
                    i += 1;
                }
                b'-' if next == Some(b'-') => {
                    state = State::LineComment;
                    outcome.comment_bytes += 2;
                    i += 2;
                }
                b'#' => {
                    state = State::LineComment;
                    outcome.comment_bytes += 1;
                    i += 1;
                }
                b'/' if next == Some(b'*') => {
                    state = State::BlockComment;
                    outcome.comment_bytes += 2;
                    i += 2;
                }
                b';' => {
                    if stmt_has_content {
                        outcome.statements.push((stmt_start, i));
                    }
                    stmt_start = i + 1;
                    stmt_has_content = false;
                    i += 1;
                }
                b':' => {
                    if next == Some(b':') {
                        // Cast operator, not a parameter.
                        stmt_has_content = true;
                        i += 2;
                    } else if next.map(is_ident_start).unwrap_or(false) {
                        let name_start = i + 1;
                        let mut j = name_start;
                        while j < bytes.len() && is_ident_char(bytes[j]) {
                            j += 1;
                        }
                        outcome.params.push(ParamSite {
                            start: i,
                            end: j,
                            name: sql[name_start..j].to_string(),
                        });
                        stmt_has_content = true;
                        i = j;
                    } else {
                        stmt_has_content = true;
                        i += 1;
                    }
                }
                _ => {
                    if !c.is_ascii_whitespace() {
                        stmt_has_content = true;
                    }
                    i += 1;
                }
            },
            State::SingleQuote => {
                if c == b'\'' {
                    // A doubled quote re-enters the literal on the next pass.
                    state = State::Normal;
                }
                i += 1;
            }
            State::DoubleQuote => {
                if c == b'"' {
                    state = State::Normal;
                }
                i += 1;
            }
            State::Backtick => {
                if c == b'`' {
                    state = State::Normal;
                }
                i += 1;
            }
            State::Bracket => {
                if c == b']' {
                    state = State::Normal;
                }
                i += 1;
            }
            State::LineComment => {
                if c == b'\n' {
                    state = State::Normal;
                } else {
                    outcome.comment_bytes += 1;
                }
                i += 1;
            }
            State::BlockComment => {
                if c == b'*' && next == Some(b'/') {
                    state = State::Normal;
                    outcome.comment_bytes += 2;
                    i += 2;
                } else {
                    outcome.comment_bytes += 1;
                    i += 1;
                }
            }
        }
    }

    if stmt_has_content {
        outcome.statements.push((stmt_start, bytes.len()));
    }

    outcome
}

fn is_ident_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

fn is_ident_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}
