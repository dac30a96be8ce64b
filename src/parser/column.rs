// SPDX-License-Identifier: Apache-2.0

//! Typed column readers.
//!
//! Each reader consumes one token of a log line and contributes either a
//! label or a metric sample to the parsed result. The kind set is closed,
//! so readers are a tagged enum rather than a trait object.

use chrono::DateTime;

use super::error::{ParseError, Result};
use super::{ParsedLine, Token, TokenKind};

/// CLF timestamp layout, e.g. `17/Dec/2025:10:15:32 +0000`.
pub const CLF_DATE_FORMAT: &str = "%d/%b/%Y:%H:%M:%S %z";

/// One typed column of the log format.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnReader {
    /// Parse the token as an f64 sample for `metric`. `monotonic` marks
    /// columns feeding a counter family, which reject negative values.
    Number { metric: String, monotonic: bool },
    /// Common Log Format number: the literal `-` means zero.
    ClfNumber { metric: String, monotonic: bool },
    /// Record the token as the value of label `name`.
    Label { name: String },
    /// Quoted `"METHOD PATH PROTO"` group, emitted as the labels
    /// `request_method`, `request_path` and `request_protocol`.
    Request,
    /// Same emission as [`ColumnReader::Request`]; the schema keeps both
    /// spellings for compatibility.
    RequestHeader,
    /// `[dd/Mon/YYYY:HH:MM:SS +0000]` group; validated and discarded.
    ClfDate,
}

impl ColumnReader {
    /// Apply this reader to one token, updating the parse result.
    pub(super) fn read(&self, token: &Token<'_>, out: &mut ParsedLine) -> Result<()> {
        match self {
            ColumnReader::Number { metric, monotonic } => {
                let value = parse_number(metric, token.text)?;
                push_sample(out, metric, value, *monotonic)
            }
            ColumnReader::ClfNumber { metric, monotonic } => {
                let value = if token.text == "-" {
                    0.0
                } else {
                    parse_number(metric, token.text)?
                };
                push_sample(out, metric, value, *monotonic)
            }
            ColumnReader::Label { name } => {
                out.labels.insert(name.clone(), token.text.to_string());
                Ok(())
            }
            ColumnReader::Request | ColumnReader::RequestHeader => {
                if token.kind != TokenKind::Quoted {
                    return Err(ParseError::MalformedRequest(token.text.to_string()));
                }
                let mut parts = token.text.split_ascii_whitespace();
                match (parts.next(), parts.next(), parts.next(), parts.next()) {
                    (Some(method), Some(path), Some(proto), None) => {
                        out.labels
                            .insert("request_method".to_string(), method.to_string());
                        out.labels
                            .insert("request_path".to_string(), path.to_string());
                        out.labels
                            .insert("request_protocol".to_string(), proto.to_string());
                        Ok(())
                    }
                    _ => Err(ParseError::MalformedRequest(token.text.to_string())),
                }
            }
            ColumnReader::ClfDate => {
                if token.kind != TokenKind::Bracketed {
                    return Err(ParseError::InvalidTimestamp(token.text.to_string()));
                }
                DateTime::parse_from_str(token.text, CLF_DATE_FORMAT)
                    .map_err(|_| ParseError::InvalidTimestamp(token.text.to_string()))?;
                Ok(())
            }
        }
    }
}

fn parse_number(metric: &str, token: &str) -> Result<f64> {
    let value: f64 = token.parse().map_err(|_| ParseError::InvalidNumber {
        metric: metric.to_string(),
        token: token.to_string(),
    })?;
    if !value.is_finite() {
        return Err(ParseError::InvalidNumber {
            metric: metric.to_string(),
            token: token.to_string(),
        });
    }
    Ok(value)
}

fn push_sample(out: &mut ParsedLine, metric: &str, value: f64, monotonic: bool) -> Result<()> {
    if monotonic && value < 0.0 {
        return Err(ParseError::NegativeCounter {
            metric: metric.to_string(),
            value,
        });
    }
    out.samples.push((metric.to_string(), value));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(text: &str) -> Token<'_> {
        Token {
            kind: TokenKind::Plain,
            text,
        }
    }

    fn quoted(text: &str) -> Token<'_> {
        Token {
            kind: TokenKind::Quoted,
            text,
        }
    }

    fn bracketed(text: &str) -> Token<'_> {
        Token {
            kind: TokenKind::Bracketed,
            text,
        }
    }

    fn number(metric: &str) -> ColumnReader {
        ColumnReader::Number {
            metric: metric.to_string(),
            monotonic: true,
        }
    }

    #[test]
    fn number_reads_float_tokens() {
        let mut out = ParsedLine::default();
        number("bytes").read(&plain("512"), &mut out).unwrap();
        number("bytes").read(&plain("0.25"), &mut out).unwrap();

        assert_eq!(
            out.samples,
            vec![("bytes".to_string(), 512.0), ("bytes".to_string(), 0.25)]
        );
    }

    #[test]
    fn number_rejects_garbage_and_non_finite() {
        let mut out = ParsedLine::default();
        for token in ["notanumber", "NaN", "inf", "-inf"] {
            let err = number("bytes").read(&plain(token), &mut out).unwrap_err();
            assert!(matches!(err, ParseError::InvalidNumber { .. }), "{token}");
        }
        assert!(out.samples.is_empty());
    }

    #[test]
    fn monotonic_number_rejects_negative() {
        let mut out = ParsedLine::default();
        let err = number("bytes").read(&plain("-3"), &mut out).unwrap_err();
        assert!(matches!(err, ParseError::NegativeCounter { .. }));

        // A histogram-fed column is not monotonic and accepts negatives.
        let reader = ColumnReader::Number {
            metric: "delta".to_string(),
            monotonic: false,
        };
        reader.read(&plain("-3"), &mut out).unwrap();
        assert_eq!(out.samples, vec![("delta".to_string(), -3.0)]);
    }

    #[test]
    fn clf_number_maps_dash_to_zero() {
        let reader = ColumnReader::ClfNumber {
            metric: "bytes".to_string(),
            monotonic: true,
        };

        let mut out = ParsedLine::default();
        reader.read(&plain("-"), &mut out).unwrap();
        reader.read(&plain("42"), &mut out).unwrap();
        assert_eq!(
            out.samples,
            vec![("bytes".to_string(), 0.0), ("bytes".to_string(), 42.0)]
        );
    }

    #[test]
    fn label_records_token() {
        let reader = ColumnReader::Label {
            name: "ip".to_string(),
        };
        let mut out = ParsedLine::default();
        reader.read(&plain("10.0.0.1"), &mut out).unwrap();
        assert_eq!(out.labels.get("ip").map(String::as_str), Some("10.0.0.1"));
    }

    #[test]
    fn request_emits_method_path_protocol() {
        let mut out = ParsedLine::default();
        ColumnReader::Request
            .read(&quoted("GET /api/users HTTP/1.1"), &mut out)
            .unwrap();

        assert_eq!(out.labels.get("request_method").unwrap(), "GET");
        assert_eq!(out.labels.get("request_path").unwrap(), "/api/users");
        assert_eq!(out.labels.get("request_protocol").unwrap(), "HTTP/1.1");
    }

    #[test]
    fn request_requires_quoted_three_part_group() {
        let mut out = ParsedLine::default();

        let err = ColumnReader::Request
            .read(&plain("GET"), &mut out)
            .unwrap_err();
        assert!(matches!(err, ParseError::MalformedRequest(_)));

        let err = ColumnReader::RequestHeader
            .read(&quoted("GET /api"), &mut out)
            .unwrap_err();
        assert!(matches!(err, ParseError::MalformedRequest(_)));

        let err = ColumnReader::Request
            .read(&quoted("GET /api HTTP/1.1 extra"), &mut out)
            .unwrap_err();
        assert!(matches!(err, ParseError::MalformedRequest(_)));
    }

    #[test]
    fn clf_date_validates_and_emits_nothing() {
        let mut out = ParsedLine::default();
        ColumnReader::ClfDate
            .read(&bracketed("17/Dec/2025:10:15:32 +0000"), &mut out)
            .unwrap();
        assert!(out.labels.is_empty());
        assert!(out.samples.is_empty());

        let err = ColumnReader::ClfDate
            .read(&bracketed("yesterday"), &mut out)
            .unwrap_err();
        assert!(matches!(err, ParseError::InvalidTimestamp(_)));
    }
}
