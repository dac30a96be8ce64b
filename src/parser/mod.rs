// SPDX-License-Identifier: Apache-2.0

//! Log line parsing.
//!
//! A [`LineParser`] drives an ordered list of [`ColumnReader`]s (with `None`
//! entries skipping a token) across the whitespace-delimited tokens of one
//! line. Quoted groups (`"GET / HTTP/1.1"`) and bracket groups
//! (`[17/Dec/2025:10:15:32 +0000]`) each form a single token. Parsing is
//! atomic per line: any reader failure rejects the whole line and no metric
//! is updated.

pub mod column;
mod error;

use std::collections::BTreeMap;
use std::sync::Arc;

pub use column::ColumnReader;
pub use error::{ParseError, Result};

use crate::metrics::LabelSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TokenKind {
    Plain,
    Quoted,
    Bracketed,
}

/// One token of a log line. Quoted and bracketed tokens carry the group
/// content without the delimiters.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Token<'a> {
    pub(crate) kind: TokenKind,
    pub(crate) text: &'a str,
}

/// Successful parse of one line: the assembled label map plus the metric
/// samples to apply.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ParsedLine {
    pub labels: LabelSet,
    pub samples: Vec<(String, f64)>,
}

/// Parser for one target, combining the shared column schema with the
/// worker's base labels. Base labels are merged last so that parser output
/// can never overwrite `environment` or `host`.
#[derive(Clone)]
pub struct LineParser {
    columns: Arc<Vec<Option<ColumnReader>>>,
    base_labels: LabelSet,
}

impl LineParser {
    pub fn new(columns: Arc<Vec<Option<ColumnReader>>>, base_labels: LabelSet) -> Self {
        Self {
            columns,
            base_labels,
        }
    }

    /// Parse one log line. Extra tokens after the last column are ignored;
    /// a short line or any reader failure rejects the line as a whole.
    pub fn parse(&self, line: &str) -> Result<ParsedLine> {
        let tokens = tokenize(line)?;
        if tokens.len() < self.columns.len() {
            return Err(ParseError::TooFewTokens {
                expected: self.columns.len(),
                actual: tokens.len(),
            });
        }

        let mut out = ParsedLine::default();
        for (reader, token) in self.columns.iter().zip(tokens.iter()) {
            if let Some(reader) = reader {
                reader.read(token, &mut out)?;
            }
        }

        for (name, value) in &self.base_labels {
            out.labels.insert(name.clone(), value.clone());
        }

        Ok(out)
    }
}

/// Split a line into tokens on runs of ASCII whitespace. A token opening
/// with `"` consumes input until the next unescaped `"`; a token opening
/// with `[` consumes input until the next `]`.
fn tokenize(line: &str) -> Result<Vec<Token<'_>>> {
    let bytes = line.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        if bytes[pos].is_ascii_whitespace() {
            pos += 1;
            continue;
        }

        match bytes[pos] {
            b'"' => {
                let end = find_closing_quote(bytes, pos + 1)
                    .ok_or(ParseError::UnterminatedQuote)?;
                tokens.push(Token {
                    kind: TokenKind::Quoted,
                    text: &line[pos + 1..end],
                });
                pos = end + 1;
            }
            b'[' => {
                let end = bytes[pos + 1..]
                    .iter()
                    .position(|b| *b == b']')
                    .map(|off| pos + 1 + off)
                    .ok_or(ParseError::UnterminatedBracket)?;
                tokens.push(Token {
                    kind: TokenKind::Bracketed,
                    text: &line[pos + 1..end],
                });
                pos = end + 1;
            }
            _ => {
                let end = bytes[pos..]
                    .iter()
                    .position(|b| b.is_ascii_whitespace())
                    .map(|off| pos + off)
                    .unwrap_or(bytes.len());
                tokens.push(Token {
                    kind: TokenKind::Plain,
                    text: &line[pos..end],
                });
                pos = end;
            }
        }
    }

    Ok(tokens)
}

fn find_closing_quote(bytes: &[u8], mut pos: usize) -> Option<usize> {
    while pos < bytes.len() {
        match bytes[pos] {
            b'\\' => pos += 2,
            b'"' => return Some(pos),
            _ => pos += 1,
        }
    }
    None
}

/// Base labels shared by every series a worker emits.
pub fn base_labels(environment: &str, host: &str) -> LabelSet {
    let mut labels = BTreeMap::new();
    labels.insert("environment".to_string(), environment.to_string());
    labels.insert("host".to_string(), host.to_string());
    labels
}
