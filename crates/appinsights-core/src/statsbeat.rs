// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Statsbeat: telemetry about the SDK's own delivery health.
//!
//! Every export attempt is counted against its `(endpoint, host)` pair. The
//! short interval tick reports success, failure, retry, throttle and exception
//! counts plus the average request duration, then resets the counts. The long
//! interval tick reports that the SDK is attached and which features are on.
//!
//! Cardinality is tiny (a couple of endpoints, a handful of status codes), so
//! the counters are plain vectors searched linearly.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use lazy_static::lazy_static;
use regex::Regex;
use tracing::debug;

use crate::envelope::{DataPoint, Envelope, MetricData, Properties, TelemetryData};
use crate::util::now_ms;

/// Instrumentation key statsbeat is reported under.
pub const STATSBEAT_INSTRUMENTATION_KEY: &str = "c4a29126-a7cb-47e5-b348-11414998b11e";

/// Endpoint label of the telemetry ingestion service.
pub const BREEZE_ENDPOINT: &str = "breeze";

pub const REQUEST_SUCCESS_COUNT: &str = "Request Success Count";
pub const REQUEST_FAILURE_COUNT: &str = "Request Failure Count";
pub const REQUEST_DURATION: &str = "Request Duration";
pub const RETRY_COUNT: &str = "Retry Count";
pub const THROTTLE_COUNT: &str = "Throttle Count";
pub const EXCEPTION_COUNT: &str = "Exception Count";
pub const ATTACH: &str = "Attach";
pub const FEATURE: &str = "Feature";

lazy_static! {
    static ref SHORT_HOST_REGEX: Regex =
        Regex::new(r"^https?://(?:www\.)?([^/.\-]+)").expect("failed creating regex");
}

/// First label of the ingestion host, e.g. `westus` for
/// `https://westus-0.in.applicationinsights.azure.com/`.
#[must_use]
pub fn short_host(url: &str) -> String {
    SHORT_HOST_REGEX
        .captures(url)
        .and_then(|captures| captures.get(1))
        .map_or_else(|| url.to_string(), |m| m.as_str().to_string())
}

/// Properties shared by every statsbeat metric.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatsbeatResource {
    /// Resource provider: `appsvc`, `functions`, `aks`, `vm` or `unknown`.
    pub resource_provider: String,
    pub resource_provider_id: String,
    /// `Manual` or `IntegratedAuto`.
    pub attach: String,
    /// Customer instrumentation key.
    pub customer_ikey: String,
    pub runtime_version: String,
    pub os: String,
    pub language: String,
    pub version: String,
    /// Bitmask of enabled features.
    pub features: u64,
    /// Bitmask of enabled instrumentations.
    pub instrumentations: u64,
}

impl StatsbeatResource {
    fn common_properties(&self) -> Properties {
        [
            ("rp", &self.resource_provider),
            ("attach", &self.attach),
            ("cikey", &self.customer_ikey),
            ("runtimeVersion", &self.runtime_version),
            ("os", &self.os),
            ("language", &self.language),
            ("version", &self.version),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct StatusCount {
    status_code: u16,
    count: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct ExceptionCount {
    exception_type: String,
    count: u64,
}

fn bump_status(list: &mut Vec<StatusCount>, status_code: u16) {
    match list.iter_mut().find(|entry| entry.status_code == status_code) {
        Some(entry) => entry.count += 1,
        None => list.push(StatusCount {
            status_code,
            count: 1,
        }),
    }
}

/// Delivery counters of one `(endpoint, host)` pair.
#[derive(Clone, Debug, PartialEq)]
struct NetworkStatsbeat {
    endpoint: String,
    host: String,
    total_request_count: u64,
    last_request_count: u64,
    success_count: u64,
    failures: Vec<StatusCount>,
    retries: Vec<StatusCount>,
    throttles: Vec<StatusCount>,
    exceptions: Vec<ExceptionCount>,
    interval_request_execution_time: f64,
    last_interval_request_execution_time: f64,
    time: u64,
    last_time: u64,
}

impl NetworkStatsbeat {
    fn new(endpoint: &str, host: &str, now_ms: u64) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            host: host.to_string(),
            total_request_count: 0,
            last_request_count: 0,
            success_count: 0,
            failures: Vec::new(),
            retries: Vec::new(),
            throttles: Vec::new(),
            exceptions: Vec::new(),
            interval_request_execution_time: 0.0,
            last_interval_request_execution_time: 0.0,
            time: now_ms,
            last_time: now_ms,
        }
    }

    fn properties(&self, common: &Properties) -> Properties {
        let mut properties = common.clone();
        properties.insert("endpoint".to_string(), self.endpoint.clone());
        properties.insert("host".to_string(), self.host.clone());
        properties
    }

    #[allow(clippy::cast_precision_loss)]
    fn drain(&mut self, now_ms: u64, common: &Properties, points: &mut Vec<StatsbeatPoint>) {
        let properties = self.properties(common);

        self.time = now_ms;
        let interval_requests = self.total_request_count.saturating_sub(self.last_request_count);
        let elapsed_ms = self.time.saturating_sub(self.last_time);
        if elapsed_ms > 0 && interval_requests > 0 {
            let interval_time =
                self.interval_request_execution_time - self.last_interval_request_execution_time;
            points.push(StatsbeatPoint::new(
                REQUEST_DURATION,
                interval_time / interval_requests as f64,
                properties.clone(),
            ));
        }
        self.last_interval_request_execution_time = self.interval_request_execution_time;
        self.last_request_count = self.total_request_count;
        self.last_time = self.time;

        if self.success_count > 0 {
            points.push(StatsbeatPoint::new(
                REQUEST_SUCCESS_COUNT,
                self.success_count as f64,
                properties.clone(),
            ));
            self.success_count = 0;
        }

        for (name, list) in [
            (REQUEST_FAILURE_COUNT, &mut self.failures),
            (RETRY_COUNT, &mut self.retries),
            (THROTTLE_COUNT, &mut self.throttles),
        ] {
            for entry in list.drain(..) {
                let mut properties = properties.clone();
                properties.insert("statusCode".to_string(), entry.status_code.to_string());
                points.push(StatsbeatPoint::new(name, entry.count as f64, properties));
            }
        }

        for entry in self.exceptions.drain(..) {
            let mut properties = properties.clone();
            properties.insert("exceptionType".to_string(), entry.exception_type);
            points.push(StatsbeatPoint::new(EXCEPTION_COUNT, entry.count as f64, properties));
        }
    }
}

/// One statsbeat metric value.
#[derive(Clone, Debug, PartialEq)]
pub struct StatsbeatPoint {
    pub name: &'static str,
    pub value: f64,
    pub properties: Properties,
}

impl StatsbeatPoint {
    fn new(name: &'static str, value: f64, properties: Properties) -> Self {
        Self {
            name,
            value,
            properties,
        }
    }

    #[must_use]
    pub fn to_envelope(&self, time_ms: u64) -> Envelope {
        Envelope::new(
            STATSBEAT_INSTRUMENTATION_KEY,
            time_ms,
            BTreeMap::new(),
            TelemetryData::Metric(MetricData::single(
                DataPoint::measurement(self.name, self.value),
                self.properties.clone(),
            )),
        )
    }
}

/// Delivery health counters for every endpoint the SDK talks to.
#[derive(Debug)]
pub struct StatsbeatNetworkCounters {
    resource: StatsbeatResource,
    counters: Mutex<Vec<NetworkStatsbeat>>,
}

impl StatsbeatNetworkCounters {
    #[must_use]
    pub fn new(resource: StatsbeatResource) -> Self {
        Self {
            resource,
            counters: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn resource(&self) -> &StatsbeatResource {
        &self.resource
    }

    fn with_counter(&self, endpoint: &str, host: &str, now_ms: u64, f: impl FnOnce(&mut NetworkStatsbeat)) {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        let index = match counters
            .iter()
            .position(|c| c.endpoint == endpoint && c.host == host)
        {
            Some(index) => index,
            None => {
                counters.push(NetworkStatsbeat::new(endpoint, host, now_ms));
                counters.len() - 1
            }
        };
        if let Some(counter) = counters.get_mut(index) {
            f(counter);
        }
    }

    /// Counts one completed export request.
    ///
    /// A failure without a status (the request never got an answer) only counts
    /// toward the duration.
    pub fn count_request(
        &self,
        endpoint: &str,
        host: &str,
        duration_ms: f64,
        success: bool,
        status_code: Option<u16>,
    ) {
        self.with_counter(endpoint, host, now_ms(), |counter| {
            counter.total_request_count += 1;
            counter.interval_request_execution_time += duration_ms.max(0.0);
            if success {
                counter.success_count += 1;
            } else if let Some(status_code) = status_code {
                bump_status(&mut counter.failures, status_code);
            }
        });
    }

    pub fn count_retry(&self, endpoint: &str, host: &str, status_code: u16) {
        self.with_counter(endpoint, host, now_ms(), |counter| {
            bump_status(&mut counter.retries, status_code);
        });
    }

    pub fn count_throttle(&self, endpoint: &str, host: &str, status_code: u16) {
        self.with_counter(endpoint, host, now_ms(), |counter| {
            bump_status(&mut counter.throttles, status_code);
        });
    }

    pub fn count_exception(&self, endpoint: &str, host: &str, exception_type: &str) {
        self.with_counter(endpoint, host, now_ms(), |counter| {
            match counter
                .exceptions
                .iter_mut()
                .find(|entry| entry.exception_type == exception_type)
            {
                Some(entry) => entry.count += 1,
                None => counter.exceptions.push(ExceptionCount {
                    exception_type: exception_type.to_string(),
                    count: 1,
                }),
            }
        });
    }

    /// Short interval tick: network metrics for every pair, counts reset.
    pub fn collect_network(&self, now_ms: u64) -> Vec<StatsbeatPoint> {
        let common = self.resource.common_properties();
        let mut points = Vec::new();
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        for counter in counters.iter_mut() {
            counter.drain(now_ms, &common, &mut points);
        }
        debug!("Collected {} network statsbeat points", points.len());
        points
    }

    /// Long interval tick: attach and feature metrics.
    #[must_use]
    pub fn collect_attach(&self) -> Vec<StatsbeatPoint> {
        let common = self.resource.common_properties();

        let mut attach = common.clone();
        attach.insert("rpId".to_string(), self.resource.resource_provider_id.clone());
        let mut points = vec![StatsbeatPoint::new(ATTACH, 1.0, attach)];

        for (mask, kind) in [(self.resource.features, "0"), (self.resource.instrumentations, "1")] {
            if mask == 0 {
                continue;
            }
            let mut properties = common.clone();
            properties.insert("feature".to_string(), mask.to_string());
            properties.insert("type".to_string(), kind.to_string());
            points.push(StatsbeatPoint::new(FEATURE, 1.0, properties));
        }
        points
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: &str = "westus";

    fn counters() -> StatsbeatNetworkCounters {
        StatsbeatNetworkCounters::new(StatsbeatResource {
            resource_provider: "unknown".to_string(),
            attach: "Manual".to_string(),
            customer_ikey: "ikey".to_string(),
            language: "rust".to_string(),
            features: 1,
            ..StatsbeatResource::default()
        })
    }

    fn find<'a>(points: &'a [StatsbeatPoint], name: &str) -> Vec<&'a StatsbeatPoint> {
        points.iter().filter(|p| p.name == name).collect()
    }

    #[test]
    fn short_host_takes_first_label() {
        assert_eq!(short_host("https://westus-0.in.applicationinsights.azure.com/"), "westus");
        assert_eq!(short_host("https://www.example.com"), "example");
        assert_eq!(short_host("not a url"), "not a url");
    }

    #[test]
    fn network_metrics_per_endpoint_and_host() {
        let counters = counters();
        counters.count_request(BREEZE_ENDPOINT, HOST, 100.0, true, Some(200));
        counters.count_request(BREEZE_ENDPOINT, HOST, 300.0, false, Some(500));
        counters.count_request(BREEZE_ENDPOINT, HOST, 0.0, false, Some(500));
        counters.count_retry(BREEZE_ENDPOINT, HOST, 503);
        counters.count_throttle(BREEZE_ENDPOINT, HOST, 429);
        counters.count_exception(BREEZE_ENDPOINT, HOST, "TimeoutError");
        counters.count_exception(BREEZE_ENDPOINT, HOST, "TimeoutError");

        let points = counters.collect_network(now_ms() + 1_000);

        let duration = find(&points, REQUEST_DURATION);
        assert_eq!(duration.len(), 1);
        assert!((duration[0].value - 400.0 / 3.0).abs() < f64::EPSILON * 1_000.0);
        assert_eq!(duration[0].properties["endpoint"], BREEZE_ENDPOINT);
        assert_eq!(duration[0].properties["host"], HOST);
        assert_eq!(duration[0].properties["cikey"], "ikey");

        assert_eq!(find(&points, REQUEST_SUCCESS_COUNT)[0].value, 1.0);
        let failures = find(&points, REQUEST_FAILURE_COUNT);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].value, 2.0);
        assert_eq!(failures[0].properties["statusCode"], "500");
        assert_eq!(find(&points, RETRY_COUNT)[0].properties["statusCode"], "503");
        assert_eq!(find(&points, THROTTLE_COUNT)[0].properties["statusCode"], "429");
        let exceptions = find(&points, EXCEPTION_COUNT);
        assert_eq!(exceptions[0].value, 2.0);
        assert_eq!(exceptions[0].properties["exceptionType"], "TimeoutError");
    }

    #[test]
    fn counts_reset_after_collection() {
        let counters = counters();
        counters.count_request(BREEZE_ENDPOINT, HOST, 10.0, true, Some(200));
        counters.count_retry(BREEZE_ENDPOINT, HOST, 503);

        let tick = now_ms() + 1_000;
        assert!(!counters.collect_network(tick).is_empty());
        assert!(counters.collect_network(tick + 1_000).is_empty());
    }

    #[test]
    fn separate_hosts_are_separate_counters() {
        let counters = counters();
        counters.count_request(BREEZE_ENDPOINT, "westus", 10.0, true, Some(200));
        counters.count_request(BREEZE_ENDPOINT, "eastus", 10.0, true, Some(200));

        let points = counters.collect_network(now_ms() + 1_000);
        assert_eq!(find(&points, REQUEST_SUCCESS_COUNT).len(), 2);
    }

    #[test]
    fn attach_and_feature() {
        let points = counters().collect_attach();

        assert_eq!(points.len(), 2);
        assert_eq!(points[0].name, ATTACH);
        assert!(points[0].properties.contains_key("rpId"));
        assert_eq!(points[1].name, FEATURE);
        assert_eq!(points[1].properties["feature"], "1");
        assert_eq!(points[1].properties["type"], "0");

        let envelope = points[0].to_envelope(0);
        assert_eq!(envelope.ikey, STATSBEAT_INSTRUMENTATION_KEY);
    }
}
