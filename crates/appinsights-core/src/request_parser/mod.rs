// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Conversion of raw HTTP exchanges into telemetry records.
//!
//! A parser is created when the request starts and captures everything it
//! needs from the request up front. It is then consumed by exactly one of
//! `on_response` or `on_error`, which produces the finished record, so a
//! request cannot be reported twice.

use std::fmt;

use crate::constants::MAX_PROPERTY_VALUE_LENGTH;
use crate::envelope::Properties;
use crate::util::truncate_chars;

pub mod dependency;
pub mod incoming;

pub use dependency::{DependencyRecord, HttpDependencyParser, OutgoingRequest, RequestOptions, RequestTarget};
pub use incoming::{HttpRequestParser, IncomingRequest, RemoteAddresses, RequestRecord};

/// Property under which a failure's message is recorded.
pub const ERROR_PROPERTY: &str = "error";

/// Why an exchange failed without producing a response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorDetails {
    pub type_name: String,
    pub message: String,
    pub stack: Option<String>,
}

impl ErrorDetails {
    #[must_use]
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            stack: None,
        }
    }

    /// Captures an error value, using its full source chain as the stack.
    #[must_use]
    pub fn from_error<E: std::error::Error + ?Sized>(error: &E) -> Self {
        let mut chain = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }
        Self {
            type_name: std::any::type_name::<E>()
                .rsplit("::")
                .next()
                .unwrap_or("Error")
                .to_string(),
            message: error.to_string(),
            stack: (!chain.is_empty()).then(|| chain.join("\n")),
        }
    }
}

impl fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

/// An exchange succeeded when it produced a status below 400.
#[must_use]
pub fn is_success(status: Option<u16>) -> bool {
    matches!(status, Some(code) if code > 0 && code < 400)
}

/// Result code as reported on the wire, `"0"` when no status was observed.
#[must_use]
pub fn result_code(status: Option<u16>) -> String {
    status.map_or_else(|| "0".to_string(), |code| code.to_string())
}

/// Inserts a property, capping the value length.
pub fn set_property(properties: &mut Properties, key: impl Into<String>, value: &str) {
    properties.insert(
        key.into(),
        truncate_chars(value, MAX_PROPERTY_VALUE_LENGTH).to_string(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("connect failed")]
    struct ConnectError {
        #[source]
        source: std::io::Error,
    }

    #[test]
    fn success_rule() {
        assert!(is_success(Some(200)));
        assert!(is_success(Some(399)));
        assert!(!is_success(Some(400)));
        assert!(!is_success(Some(0)));
        assert!(!is_success(None));
    }

    #[test]
    fn missing_status_reports_zero() {
        assert_eq!(result_code(None), "0");
        assert_eq!(result_code(Some(503)), "503");
    }

    #[test]
    fn property_values_are_capped() {
        let mut properties = Properties::new();
        set_property(&mut properties, "long", &"x".repeat(MAX_PROPERTY_VALUE_LENGTH + 10));

        assert_eq!(properties["long"].len(), MAX_PROPERTY_VALUE_LENGTH);
    }

    #[test]
    fn error_details_capture_source_chain() {
        let error = ConnectError {
            source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
        };

        let details = ErrorDetails::from_error(&error);

        assert_eq!(details.type_name, "ConnectError");
        assert_eq!(details.message, "connect failed");
        assert_eq!(details.stack.as_deref(), Some("refused"));
        assert_eq!(details.to_string(), "ConnectError: connect failed");
    }
}
