// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use anyhow::anyhow;
use appinsights_core::batch_processor::{
    BatchConfig, DEFAULT_MAX_BATCH_INTERVAL, DEFAULT_MAX_BATCH_SIZE,
};

use crate::errors::ConfigError;

pub const DEFAULT_INGESTION_ENDPOINT: &str = "https://dc.services.visualstudio.com";
const DEFAULT_CORRELATION_ID_RETRY_INTERVAL_MS: u64 = 30_000;
const DEFAULT_CORRELATION_ID_MAX_RETRIES: u32 = 3;
const DEFAULT_METRICS_COLLECTION_INTERVAL_MS: u64 = 60_000;
const DEFAULT_STATSBEAT_SHORT_INTERVAL_MS: u64 = 900_000;
const DEFAULT_STATSBEAT_LONG_INTERVAL_MS: u64 = 86_400_000;
const DEFAULT_HTTP_TIMEOUT_MS: u64 = 10_000;

/// Azure storage endpoints never receive correlation headers.
pub const DEFAULT_EXCLUDED_DOMAINS: [&str; 6] = [
    "*.core.windows.net",
    "*.core.chinacloudapi.cn",
    "*.core.cloudapi.de",
    "*.core.usgovcloudapi.net",
    "*.core.microsoft.scloud",
    "*.core.eaglex.ic.gov",
];

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub instrumentation_key: String,
    pub ingestion_endpoint: String,
    pub profile_query_endpoint: String,
    pub correlation_id_retry_interval_ms: u64,
    pub correlation_id_max_retries: u32,
    pub correlation_header_excluded_domains: Vec<String>,
    pub w3c_enabled: bool,
    pub metrics_collection_interval_ms: u64,
    pub statsbeat_short_interval_ms: u64,
    pub statsbeat_long_interval_ms: u64,
    pub max_batch_size: usize,
    pub max_batch_interval_ms: u64,
    pub http_timeout_ms: u64,
    pub cloud_role_name: Option<String>,
    pub cloud_role_instance: Option<String>,
    pub disable_statsbeat: bool,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            instrumentation_key: String::new(),
            ingestion_endpoint: DEFAULT_INGESTION_ENDPOINT.to_string(),
            profile_query_endpoint: DEFAULT_INGESTION_ENDPOINT.to_string(),
            correlation_id_retry_interval_ms: DEFAULT_CORRELATION_ID_RETRY_INTERVAL_MS,
            correlation_id_max_retries: DEFAULT_CORRELATION_ID_MAX_RETRIES,
            correlation_header_excluded_domains: DEFAULT_EXCLUDED_DOMAINS
                .iter()
                .map(|d| (*d).to_string())
                .collect(),
            w3c_enabled: true,
            metrics_collection_interval_ms: DEFAULT_METRICS_COLLECTION_INTERVAL_MS,
            statsbeat_short_interval_ms: DEFAULT_STATSBEAT_SHORT_INTERVAL_MS,
            statsbeat_long_interval_ms: DEFAULT_STATSBEAT_LONG_INTERVAL_MS,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            #[allow(clippy::cast_possible_truncation)]
            max_batch_interval_ms: DEFAULT_MAX_BATCH_INTERVAL.as_millis() as u64,
            http_timeout_ms: DEFAULT_HTTP_TIMEOUT_MS,
            cloud_role_name: None,
            cloud_role_instance: None,
            disable_statsbeat: false,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Reads the configuration from the process environment.
    ///
    /// Fails only when no instrumentation key can be found.
    pub fn from_env() -> Result<Config, ConfigError> {
        Self::load().map_err(|e| ConfigError::Invalid(format!("{e:#}")))
    }

    fn load() -> anyhow::Result<Config> {
        let defaults = Config::default();
        let connection_string = env::var("APPLICATIONINSIGHTS_CONNECTION_STRING")
            .map(|value| parse_connection_string(&value))
            .unwrap_or_default();

        let instrumentation_key = connection_string
            .get("instrumentationkey")
            .cloned()
            .or_else(|| env::var("APPINSIGHTS_INSTRUMENTATIONKEY").ok())
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
            .ok_or_else(|| {
                anyhow!(
                    "no instrumentation key, set APPLICATIONINSIGHTS_CONNECTION_STRING or APPINSIGHTS_INSTRUMENTATIONKEY"
                )
            })?;

        let ingestion_endpoint = connection_string
            .get("ingestionendpoint")
            .map(|endpoint| normalize_endpoint(endpoint))
            .unwrap_or(defaults.ingestion_endpoint);
        let profile_query_endpoint = env::var("APPINSIGHTS_PROFILE_QUERY_ENDPOINT")
            .ok()
            .map(|endpoint| normalize_endpoint(&endpoint))
            .filter(|endpoint| !endpoint.is_empty())
            .unwrap_or_else(|| ingestion_endpoint.clone());

        let cloud_role_instance = env::var("WEBSITE_INSTANCE_ID")
            .or_else(|_| env::var("HOSTNAME"))
            .ok()
            .filter(|value| !value.is_empty());

        Ok(Config {
            instrumentation_key,
            ingestion_endpoint,
            profile_query_endpoint,
            w3c_enabled: !env_flag("APPLICATIONINSIGHTS_DISABLE_W3C"),
            max_batch_size: env_number("APPLICATIONINSIGHTS_MAX_BATCH_SIZE")
                .filter(|size| *size > 0)
                .unwrap_or(defaults.max_batch_size),
            max_batch_interval_ms: env_number("APPLICATIONINSIGHTS_MAX_BATCH_INTERVAL_MS")
                .unwrap_or(defaults.max_batch_interval_ms),
            http_timeout_ms: env_number("APPLICATIONINSIGHTS_HTTP_TIMEOUT_MS")
                .unwrap_or(defaults.http_timeout_ms),
            cloud_role_name: env::var("WEBSITE_SITE_NAME")
                .ok()
                .filter(|value| !value.is_empty()),
            cloud_role_instance,
            disable_statsbeat: env_flag("APPLICATIONINSIGHTS_STATSBEAT_DISABLED"),
            log_level: env::var("APPLICATIONINSIGHTS_LOG_LEVEL")
                .map(|level| level.to_lowercase())
                .unwrap_or(defaults.log_level),
            ..defaults
        })
    }

    #[must_use]
    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            max_batch_size: self.max_batch_size,
            max_batch_interval: Duration::from_millis(self.max_batch_interval_ms),
        }
    }

    #[must_use]
    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}

/// Splits `Key=Value;Key=Value` into a map keyed by lowercased key.
///
/// Pairs without `=` are skipped. Values keep their case.
#[must_use]
pub fn parse_connection_string(value: &str) -> HashMap<String, String> {
    value
        .split(';')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let key = key.trim().to_lowercase();
            if key.is_empty() {
                return None;
            }
            Some((key, value.trim().to_string()))
        })
        .collect()
}

fn normalize_endpoint(endpoint: &str) -> String {
    endpoint.trim().trim_end_matches('/').to_string()
}

fn env_flag(name: &str) -> bool {
    env::var(name)
        .map(|value| value.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn env_number<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|value| value.trim().parse::<T>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 12] = [
        "APPLICATIONINSIGHTS_CONNECTION_STRING",
        "APPINSIGHTS_INSTRUMENTATIONKEY",
        "APPINSIGHTS_PROFILE_QUERY_ENDPOINT",
        "APPLICATIONINSIGHTS_DISABLE_W3C",
        "APPLICATIONINSIGHTS_MAX_BATCH_SIZE",
        "APPLICATIONINSIGHTS_MAX_BATCH_INTERVAL_MS",
        "APPLICATIONINSIGHTS_HTTP_TIMEOUT_MS",
        "WEBSITE_SITE_NAME",
        "WEBSITE_INSTANCE_ID",
        "HOSTNAME",
        "APPLICATIONINSIGHTS_STATSBEAT_DISABLED",
        "APPLICATIONINSIGHTS_LOG_LEVEL",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn connection_string_keys_are_case_insensitive() {
        let parsed = parse_connection_string(
            " InstrumentationKey = abc-123 ;INGESTIONENDPOINT=https://westus-0.in.applicationinsights.azure.com/;junk;",
        );

        assert_eq!(parsed["instrumentationkey"], "abc-123");
        assert_eq!(
            parsed["ingestionendpoint"],
            "https://westus-0.in.applicationinsights.azure.com/"
        );
        assert_eq!(parsed.len(), 2);
    }

    #[test]
    #[serial]
    fn error_if_no_instrumentation_key() {
        clear_env();

        let config = Config::from_env();

        assert!(config.is_err());
        assert!(config
            .unwrap_err()
            .to_string()
            .contains("no instrumentation key"));
    }

    #[test]
    #[serial]
    fn defaults_with_legacy_key() {
        clear_env();
        env::set_var("APPINSIGHTS_INSTRUMENTATIONKEY", "legacy-key");

        let config = Config::from_env().unwrap();

        assert_eq!(config.instrumentation_key, "legacy-key");
        assert_eq!(config.ingestion_endpoint, DEFAULT_INGESTION_ENDPOINT);
        assert_eq!(config.profile_query_endpoint, DEFAULT_INGESTION_ENDPOINT);
        assert!(config.w3c_enabled);
        assert_eq!(config.max_batch_size, 250);
        assert_eq!(config.max_batch_interval_ms, 15_000);
        assert_eq!(config.correlation_header_excluded_domains.len(), 6);
        clear_env();
    }

    #[test]
    #[serial]
    fn connection_string_wins_over_legacy_key() {
        clear_env();
        env::set_var("APPINSIGHTS_INSTRUMENTATIONKEY", "legacy-key");
        env::set_var(
            "APPLICATIONINSIGHTS_CONNECTION_STRING",
            "InstrumentationKey=new-key;IngestionEndpoint=https://westus-0.in.applicationinsights.azure.com/",
        );

        let config = Config::from_env().unwrap();

        assert_eq!(config.instrumentation_key, "new-key");
        assert_eq!(
            config.ingestion_endpoint,
            "https://westus-0.in.applicationinsights.azure.com"
        );
        assert_eq!(config.profile_query_endpoint, config.ingestion_endpoint);
        clear_env();
    }

    #[test]
    #[serial]
    fn overrides_from_env() {
        clear_env();
        env::set_var("APPINSIGHTS_INSTRUMENTATIONKEY", "key");
        env::set_var("APPINSIGHTS_PROFILE_QUERY_ENDPOINT", "https://profiles.example.com/");
        env::set_var("APPLICATIONINSIGHTS_DISABLE_W3C", "TRUE");
        env::set_var("APPLICATIONINSIGHTS_MAX_BATCH_SIZE", "10");
        env::set_var("APPLICATIONINSIGHTS_HTTP_TIMEOUT_MS", "2500");
        env::set_var("WEBSITE_SITE_NAME", "checkout");
        env::set_var("HOSTNAME", "host-1");
        env::set_var("APPLICATIONINSIGHTS_STATSBEAT_DISABLED", "true");
        env::set_var("APPLICATIONINSIGHTS_LOG_LEVEL", "DEBUG");

        let config = Config::from_env().unwrap();

        assert_eq!(config.profile_query_endpoint, "https://profiles.example.com");
        assert!(!config.w3c_enabled);
        assert_eq!(config.max_batch_size, 10);
        assert_eq!(config.http_timeout(), Duration::from_millis(2500));
        assert_eq!(config.cloud_role_name.as_deref(), Some("checkout"));
        assert_eq!(config.cloud_role_instance.as_deref(), Some("host-1"));
        assert!(config.disable_statsbeat);
        assert_eq!(config.log_level, "debug");
        clear_env();
    }

    #[test]
    #[serial]
    fn unparseable_numbers_fall_back_to_defaults() {
        clear_env();
        env::set_var("APPINSIGHTS_INSTRUMENTATIONKEY", "key");
        env::set_var("APPLICATIONINSIGHTS_MAX_BATCH_SIZE", "lots");
        env::set_var("APPLICATIONINSIGHTS_MAX_BATCH_INTERVAL_MS", "-5");

        let config = Config::from_env().unwrap();

        assert_eq!(config.batch_config(), BatchConfig::default());
        clear_env();
    }
}
