//! Minimal JSON-path evaluator for grouping expressions.
//!
//! Supports the subset used by pacing policies: dot field access
//! (`.metadata.namespace`), bracketed field access for keys containing
//! dots or slashes (`.metadata.labels['app.kubernetes.io/name']`), array
//! indexing (`.spec.containers[0].image`), wildcards (`[*]` / `.*`) and
//! simple equality filters (`.spec.containers[?(@.name == 'app')].image`).
//! An optional leading `$` is accepted.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExprError {
    #[error("empty expression")]
    Empty,
    #[error("unexpected character {found:?} at offset {offset}")]
    Unexpected { found: char, offset: usize },
    #[error("unterminated bracket segment at offset {offset}")]
    Unterminated { offset: usize },
    #[error("invalid array index at offset {offset}")]
    BadIndex { offset: usize },
    #[error("invalid filter at offset {offset}")]
    BadFilter { offset: usize },
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Field(String),
    Index(usize),
    Wildcard,
    /// `[?(@.path == 'literal')]`, equality only.
    Filter {
        path: Vec<String>,
        expected: String,
    },
}

/// A compiled grouping expression.
#[derive(Debug, Clone)]
pub struct Expr {
    source: String,
    segments: Vec<Segment>,
}

impl Expr {
    pub fn parse(input: &str) -> Result<Self, ExprError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ExprError::Empty);
        }
        let chars: Vec<char> = trimmed.chars().collect();
        let mut pos = 0;
        if chars[pos] == '$' {
            pos += 1;
        }

        let mut segments = Vec::new();
        while pos < chars.len() {
            match chars[pos] {
                '.' => {
                    pos += 1;
                    if pos < chars.len() && chars[pos] == '*' {
                        segments.push(Segment::Wildcard);
                        pos += 1;
                        continue;
                    }
                    let start = pos;
                    while pos < chars.len() && is_ident_char(chars[pos]) {
                        pos += 1;
                    }
                    if pos == start {
                        return Err(ExprError::Unexpected {
                            found: *chars.get(pos).unwrap_or(&'.'),
                            offset: pos,
                        });
                    }
                    segments
                        .push(Segment::Field(chars[start..pos].iter().collect()));
                }
                '[' => {
                    let (segment, next) = parse_bracket(&chars, pos)?;
                    segments.push(segment);
                    pos = next;
                }
                other => {
                    return Err(ExprError::Unexpected {
                        found: other,
                        offset: pos,
                    });
                }
            }
        }
        if segments.is_empty() {
            return Err(ExprError::Empty);
        }

        Ok(Self {
            source: trimmed.to_string(),
            segments,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against a document, returning every matching value.
    pub fn eval<'a>(&self, root: &'a Value) -> Vec<&'a Value> {
        let mut frontier = vec![root];
        for segment in &self.segments {
            let mut next = Vec::new();
            for value in frontier {
                match segment {
                    Segment::Field(name) => {
                        if let Some(v) = value.get(name.as_str()) {
                            next.push(v);
                        }
                    }
                    Segment::Index(i) => {
                        if let Some(v) = value.get(i) {
                            next.push(v);
                        }
                    }
                    Segment::Wildcard => match value {
                        Value::Array(items) => next.extend(items.iter()),
                        Value::Object(map) => next.extend(map.values()),
                        _ => {}
                    },
                    Segment::Filter { path, expected } => {
                        if let Value::Array(items) = value {
                            for item in items {
                                let mut cursor = Some(item);
                                for p in path {
                                    cursor =
                                        cursor.and_then(|c| c.get(p.as_str()));
                                }
                                if let Some(found) = cursor {
                                    if &value_to_string(found) == expected {
                                        next.push(item);
                                    }
                                }
                            }
                        }
                    }
                }
            }
            frontier = next;
            if frontier.is_empty() {
                break;
            }
        }
        frontier
    }
}

/// String form of a matched value, used to build grouping keys.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

fn parse_bracket(
    chars: &[char],
    open: usize,
) -> Result<(Segment, usize), ExprError> {
    let mut pos = open + 1;
    if pos >= chars.len() {
        return Err(ExprError::Unterminated { offset: open });
    }
    match chars[pos] {
        '*' => {
            pos += 1;
            expect_close(chars, pos, open)?;
            Ok((Segment::Wildcard, pos + 1))
        }
        '\'' | '"' => {
            let quote = chars[pos];
            pos += 1;
            let start = pos;
            while pos < chars.len() && chars[pos] != quote {
                pos += 1;
            }
            if pos >= chars.len() {
                return Err(ExprError::Unterminated { offset: open });
            }
            let field: String = chars[start..pos].iter().collect();
            pos += 1;
            expect_close(chars, pos, open)?;
            Ok((Segment::Field(field), pos + 1))
        }
        '?' => parse_filter(chars, open),
        c if c.is_ascii_digit() => {
            let start = pos;
            while pos < chars.len() && chars[pos].is_ascii_digit() {
                pos += 1;
            }
            let digits: String = chars[start..pos].iter().collect();
            let index = digits
                .parse::<usize>()
                .map_err(|_| ExprError::BadIndex { offset: start })?;
            expect_close(chars, pos, open)?;
            Ok((Segment::Index(index), pos + 1))
        }
        _ => Err(ExprError::Unexpected {
            found: chars[pos],
            offset: pos,
        }),
    }
}

fn parse_filter(
    chars: &[char],
    open: usize,
) -> Result<(Segment, usize), ExprError> {
    // shape: ?(@.a.b == 'value')]
    let mut pos = open + 1;
    if chars.get(pos + 1) != Some(&'(') || chars.get(pos + 2) != Some(&'@') {
        return Err(ExprError::BadFilter { offset: open });
    }
    pos += 3;
    let mut path = Vec::new();
    while chars.get(pos) == Some(&'.') {
        pos += 1;
        let start = pos;
        while pos < chars.len() && is_ident_char(chars[pos]) {
            pos += 1;
        }
        if pos == start {
            return Err(ExprError::BadFilter { offset: pos });
        }
        path.push(chars[start..pos].iter().collect());
    }
    if path.is_empty() {
        return Err(ExprError::BadFilter { offset: pos });
    }
    while chars.get(pos) == Some(&' ') {
        pos += 1;
    }
    if chars.get(pos) != Some(&'=') || chars.get(pos + 1) != Some(&'=') {
        return Err(ExprError::BadFilter { offset: pos });
    }
    pos += 2;
    while chars.get(pos) == Some(&' ') {
        pos += 1;
    }
    let quote = match chars.get(pos) {
        Some(&q @ ('\'' | '"')) => q,
        _ => return Err(ExprError::BadFilter { offset: pos }),
    };
    pos += 1;
    let start = pos;
    while pos < chars.len() && chars[pos] != quote {
        pos += 1;
    }
    if pos >= chars.len() {
        return Err(ExprError::Unterminated { offset: open });
    }
    let expected: String = chars[start..pos].iter().collect();
    pos += 1;
    if chars.get(pos) != Some(&')') {
        return Err(ExprError::BadFilter { offset: pos });
    }
    pos += 1;
    expect_close(chars, pos, open)?;
    Ok((Segment::Filter { path, expected }, pos + 1))
}

fn expect_close(
    chars: &[char],
    pos: usize,
    open: usize,
) -> Result<(), ExprError> {
    if chars.get(pos) != Some(&']') {
        return Err(ExprError::Unterminated { offset: open });
    }
    Ok(())
}
