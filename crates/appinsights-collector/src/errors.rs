// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use appinsights_core::errors::CreationError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error(transparent)]
    Exclusion(#[from] CreationError),
    #[error("failed to build http client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Outcome of a failed correlation-id lookup. Shared by every caller waiting
/// on the same lookup, hence `Clone`.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LookupError {
    #[error("correlation id lookup timed out")]
    Timeout,
    #[error("correlation id lookup rejected with status {0}")]
    Permanent(u16),
    #[error("correlation id lookup failed: {0}")]
    Transient(String),
    #[error("correlation id lookups are disabled")]
    Disabled,
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("failed to serialize batch: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to send batch: {0}")]
    Request(#[from] reqwest::Error),
    #[error("ingestion answered with status {0}")]
    Status(u16),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("a collector is already running")]
    AlreadyStarted,
    #[error("collector must be started from within a tokio runtime")]
    NoRuntime,
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_errors_display() {
        assert_eq!(
            LookupError::Permanent(404).to_string(),
            "correlation id lookup rejected with status 404"
        );
        assert_eq!(
            LookupError::Timeout.to_string(),
            "correlation id lookup timed out"
        );
    }

    #[test]
    fn config_errors_convert_into_registry_errors() {
        let error: RegistryError = ConfigError::Invalid("missing key".to_string()).into();
        assert_eq!(error.to_string(), "invalid configuration: missing key");
    }
}
