//! Glob patterns used by permission rules.
//!
//! Syntax: `*` matches any run of characters including `/`, `?` matches one
//! character, `[abc]`, `[a-z]` and `[!x]` are character classes and `{a,b}` is
//! alternation (nestable). `\` escapes the next character. Matching is anchored
//! and case-sensitive. Patterns are compiled once, when a profile is loaded
//! or saved, so evaluation never fails.

use std::fmt;

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("pattern '{pattern}': unclosed '[' at byte {offset}")]
    UnclosedClass { pattern: String, offset: usize },
    #[error("pattern '{pattern}': empty character class at byte {offset}")]
    EmptyClass { pattern: String, offset: usize },
    #[error("pattern '{pattern}': unclosed '{{'")]
    UnclosedBrace { pattern: String },
    #[error("pattern '{pattern}': unmatched '}}' at byte {offset}")]
    UnmatchedBrace { pattern: String, offset: usize },
    #[error("pattern '{pattern}': {message}")]
    Regex { pattern: String, message: String },
}

/// A compiled, anchored glob.
#[derive(Clone)]
pub struct Pattern {
    source: String,
    regex: Regex,
}

impl Pattern {
    pub fn compile(source: &str) -> Result<Self, PatternError> {
        let translated = translate(source)?;
        let regex = Regex::new(&translated).map_err(|err| PatternError::Regex {
            pattern: source.to_string(),
            message: err.to_string(),
        })?;
        Ok(Self {
            source: source.to_string(),
            regex,
        })
    }

    pub fn matches(&self, candidate: &str) -> bool {
        self.regex.is_match(candidate)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pattern").field(&self.source).finish()
    }
}

fn translate(source: &str) -> Result<String, PatternError> {
    let mut out = String::with_capacity(source.len() * 2 + 8);
    out.push_str("^(?:");
    let mut depth = 0usize;
    let mut chars = source.char_indices().peekable();

    while let Some((offset, ch)) = chars.next() {
        match ch {
            '*' => {
                while chars.next_if(|(_, next)| *next == '*').is_some() {}
                out.push_str(".*");
            }
            '?' => out.push('.'),
            '[' => {
                let mut negated = false;
                if chars.next_if(|(_, next)| *next == '!' || *next == '^').is_some() {
                    negated = true;
                }
                let mut body = String::new();
                let mut closed = false;
                for (_, inner) in chars.by_ref() {
                    if inner == ']' {
                        closed = true;
                        break;
                    }
                    if matches!(inner, '\\' | '[' | '^' | '&' | '~') {
                        body.push('\\');
                    }
                    body.push(inner);
                }
                if !closed {
                    return Err(PatternError::UnclosedClass {
                        pattern: source.to_string(),
                        offset,
                    });
                }
                if body.is_empty() {
                    return Err(PatternError::EmptyClass {
                        pattern: source.to_string(),
                        offset,
                    });
                }
                out.push('[');
                if negated {
                    out.push('^');
                }
                out.push_str(&body);
                out.push(']');
            }
            '{' => {
                depth += 1;
                out.push_str("(?:");
            }
            ',' if depth > 0 => out.push('|'),
            '}' => {
                if depth == 0 {
                    return Err(PatternError::UnmatchedBrace {
                        pattern: source.to_string(),
                        offset,
                    });
                }
                depth -= 1;
                out.push(')');
            }
            '\\' => match chars.next() {
                Some((_, escaped)) => push_literal(&mut out, escaped),
                None => push_literal(&mut out, '\\'),
            },
            other => push_literal(&mut out, other),
        }
    }

    if depth > 0 {
        return Err(PatternError::UnclosedBrace {
            pattern: source.to_string(),
        });
    }
    out.push_str(")$");
    Ok(out)
}

fn push_literal(out: &mut String, ch: char) {
    let mut buf = [0u8; 4];
    out.push_str(&regex::escape(ch.encode_utf8(&mut buf)));
}
