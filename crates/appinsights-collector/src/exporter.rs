// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::{Duration, Instant};

use appinsights_core::batch_processor::{ExportResult, Exporter};
use appinsights_core::envelope::Envelope;
use appinsights_core::statsbeat::{short_host, StatsbeatNetworkCounters, BREEZE_ENDPOINT};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, error};

use crate::errors::{ConfigError, ExportError};

pub const TRACK_PATH: &str = "/v2.1/track";

const THROTTLE_STATUS_CODES: [u16; 2] = [429, 439];
const RETRIABLE_STATUS_CODES: [u16; 5] = [408, 500, 502, 503, 504];

/// POSTs batches to the ingestion endpoint as a JSON array.
///
/// Delivery outcomes feed the network statsbeat when one is attached. The
/// exporter shipping statsbeat itself runs without one.
pub struct HttpExporter {
    client: reqwest::Client,
    url: String,
    host: String,
    statsbeat: Option<Arc<StatsbeatNetworkCounters>>,
}

impl HttpExporter {
    pub fn new(
        ingestion_endpoint: &str,
        timeout: Duration,
        statsbeat: Option<Arc<StatsbeatNetworkCounters>>,
    ) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let endpoint = ingestion_endpoint.trim_end_matches('/');
        Ok(Self {
            client,
            url: format!("{endpoint}{TRACK_PATH}"),
            host: short_host(endpoint),
            statsbeat,
        })
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    async fn ship(&self, batch: &[Envelope]) -> Result<u16, ExportError> {
        let body = serde_json::to_vec(batch)?;
        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;
        let status = response.status().as_u16();
        if response.status().is_success() {
            return Ok(status);
        }
        let body = response.text().await.unwrap_or_default();
        error!("Ingestion rejected batch with status {status}: {body}");
        Err(ExportError::Status(status))
    }

    fn record(&self, outcome: &Result<u16, ExportError>, elapsed: Duration) {
        let Some(statsbeat) = self.statsbeat.as_ref() else {
            return;
        };
        let duration_ms = elapsed.as_secs_f64() * 1000.0;
        match outcome {
            Ok(status) => {
                statsbeat.count_request(BREEZE_ENDPOINT, &self.host, duration_ms, true, Some(*status));
            }
            Err(ExportError::Status(status)) => {
                statsbeat.count_request(BREEZE_ENDPOINT, &self.host, duration_ms, false, Some(*status));
                if THROTTLE_STATUS_CODES.contains(status) {
                    statsbeat.count_throttle(BREEZE_ENDPOINT, &self.host, *status);
                } else if RETRIABLE_STATUS_CODES.contains(status) {
                    statsbeat.count_retry(BREEZE_ENDPOINT, &self.host, *status);
                }
            }
            Err(e) => {
                statsbeat.count_request(BREEZE_ENDPOINT, &self.host, duration_ms, false, None);
                statsbeat.count_exception(BREEZE_ENDPOINT, &self.host, exception_type(e));
            }
        }
    }
}

fn exception_type(error: &ExportError) -> &'static str {
    match error {
        ExportError::Request(e) if e.is_timeout() => "Timeout",
        ExportError::Request(e) if e.is_connect() => "ConnectionError",
        ExportError::Request(_) => "NetworkError",
        ExportError::Serialize(_) => "SerializationError",
        ExportError::Status(_) => "HttpError",
    }
}

#[async_trait]
impl Exporter for HttpExporter {
    async fn export(&self, batch: Vec<Envelope>) -> ExportResult {
        let start = Instant::now();
        let outcome = self.ship(&batch).await;
        self.record(&outcome, start.elapsed());

        match outcome {
            Ok(status) => {
                debug!(
                    "Sent {} envelopes in {} ms, status {status}",
                    batch.len(),
                    start.elapsed().as_millis()
                );
                ExportResult::Success
            }
            Err(e) => {
                error!("Failed to send {} envelopes to {}: {e}", batch.len(), self.url);
                ExportResult::Failed
            }
        }
    }
}
