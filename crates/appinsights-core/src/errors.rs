// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types.
//!
//! None of these ever escape into application code: parsers recover locally and
//! log them. They exist so the recovery sites can match on what went wrong.

use thiserror::Error;

/// Malformed input encountered while reading a request or a metric observation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("unrecognized duration {0:?}, expected milliseconds or [d.]hh:mm:ss[.fff]")]
    Duration(String),
    #[error("cookie {name:?} holds a malformed percent-encoding")]
    CookieEncoding { name: String },
    #[error("cookie {name:?} does not decode to UTF-8")]
    CookieUtf8 { name: String },
}

/// Failure building a component from its configuration.
#[derive(Debug, Error)]
pub enum CreationError {
    #[error("invalid correlation header exclusion pattern {pattern:?}: {source}")]
    ExclusionPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}
