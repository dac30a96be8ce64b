// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Per-line parse failure. These are recovered: the line is dropped
/// atomically and counted in the `parser_errors` series.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("expected {expected} columns, line has {actual} tokens")]
    TooFewTokens { expected: usize, actual: usize },

    #[error("invalid number {token:?} for metric {metric:?}")]
    InvalidNumber { metric: String, token: String },

    #[error("negative value {value} for counter {metric:?}")]
    NegativeCounter { metric: String, value: f64 },

    #[error("unterminated quoted group")]
    UnterminatedQuote,

    #[error("unterminated bracket group")]
    UnterminatedBracket,

    #[error("malformed request group {0:?}")]
    MalformedRequest(String),

    #[error("invalid CLF timestamp {0:?}")]
    InvalidTimestamp(String),
}

pub type Result<T> = std::result::Result<T, ParseError>;
