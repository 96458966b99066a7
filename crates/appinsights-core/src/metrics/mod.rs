// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pre-aggregated standard metrics.
//!
//! Requests, dependencies, exceptions and traces are counted SDK side into
//! per-dimension-set counters. Each collection tick turns the counters into
//! one aggregated metric point per counter that saw traffic since the last
//! tick.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::warn;

use crate::envelope::{DataPoint, DataPointType, Envelope, MetricData, Properties, TelemetryData};
use crate::util::parse_duration_ms;

pub mod dimensions;
pub mod pre_aggregated;

pub use dimensions::{CommonDimensions, DependencyDimensions, DimensionSet, RequestDimensions};
pub use pre_aggregated::{AggregatedMetricCounter, PreAggregatedMetrics};

pub const METRIC_ID_PROPERTY: &str = "_MS.MetricId";
pub const AGGREGATION_INTERVAL_PROPERTY: &str = "_MS.AggregationIntervalMs";
pub const IS_AUTOCOLLECTED_PROPERTY: &str = "_MS.IsAutocollected";
/// Set on telemetry already counted here so the backend does not count it again.
pub const PROCESSED_BY_METRIC_EXTRACTORS_PROPERTY: &str = "_MS.ProcessedByMetricExtractors";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MetricKind {
    Request,
    Dependency,
    Exception,
    Trace,
}

impl MetricKind {
    pub const ALL: [MetricKind; 4] = [
        MetricKind::Request,
        MetricKind::Dependency,
        MetricKind::Exception,
        MetricKind::Trace,
    ];

    #[must_use]
    pub fn metric_name(&self) -> &'static str {
        match self {
            MetricKind::Request => "Server response time",
            MetricKind::Dependency => "Dependency duration",
            MetricKind::Exception => "Exceptions",
            MetricKind::Trace => "Traces",
        }
    }

    #[must_use]
    pub fn metric_id(&self) -> &'static str {
        match self {
            MetricKind::Request => "requests/duration",
            MetricKind::Dependency => "dependencies/duration",
            MetricKind::Exception => "exceptions/count",
            MetricKind::Trace => "traces/count",
        }
    }

    /// Whether points report an average duration rather than a count.
    #[must_use]
    pub fn has_duration(&self) -> bool {
        matches!(self, MetricKind::Request | MetricKind::Dependency)
    }
}

/// A duration observation as handed over by the caller: milliseconds or a
/// `[d.]hh:mm:ss[.fff]` string.
#[derive(Clone, Debug, PartialEq)]
pub enum MetricDuration {
    Millis(f64),
    TimeSpan(String),
}

impl MetricDuration {
    /// The duration in milliseconds, `None` when it cannot be understood.
    #[must_use]
    pub fn as_millis(&self) -> Option<f64> {
        match self {
            MetricDuration::Millis(ms) if ms.is_finite() && *ms >= 0.0 => Some(*ms),
            MetricDuration::Millis(ms) => {
                warn!("Dropping metric observation with invalid duration {ms}");
                None
            }
            MetricDuration::TimeSpan(raw) => match parse_duration_ms(raw) {
                Ok(ms) => Some(ms),
                Err(e) => {
                    warn!("Dropping metric observation: {e}");
                    None
                }
            },
        }
    }
}

impl From<f64> for MetricDuration {
    fn from(ms: f64) -> Self {
        MetricDuration::Millis(ms)
    }
}

impl From<Duration> for MetricDuration {
    fn from(duration: Duration) -> Self {
        MetricDuration::Millis(duration.as_secs_f64() * 1000.0)
    }
}

impl From<&str> for MetricDuration {
    fn from(raw: &str) -> Self {
        MetricDuration::TimeSpan(raw.to_string())
    }
}

impl From<String> for MetricDuration {
    fn from(raw: String) -> Self {
        MetricDuration::TimeSpan(raw)
    }
}

/// One aggregated point produced by a collection tick.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricPoint {
    pub kind: MetricKind,
    /// Average duration in ms for duration kinds, the interval count otherwise.
    pub value: f64,
    pub count: u64,
    pub interval_ms: u64,
    pub dimensions: DimensionSet,
}

impl MetricPoint {
    #[must_use]
    pub fn properties(&self) -> Properties {
        let mut properties: Properties = self
            .dimensions
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        properties.insert(METRIC_ID_PROPERTY.to_string(), self.kind.metric_id().to_string());
        properties.insert(
            AGGREGATION_INTERVAL_PROPERTY.to_string(),
            self.interval_ms.to_string(),
        );
        properties.insert(IS_AUTOCOLLECTED_PROPERTY.to_string(), "True".to_string());
        properties
    }

    #[must_use]
    pub fn to_envelope(
        &self,
        ikey: &str,
        time_ms: u64,
        common_tags: &BTreeMap<String, String>,
    ) -> Envelope {
        let point = DataPoint {
            name: self.kind.metric_name().to_string(),
            kind: DataPointType::Aggregation,
            value: self.value,
            count: Some(self.count),
            min: None,
            max: None,
            std_dev: None,
        };
        Envelope::new(
            ikey,
            time_ms,
            common_tags.clone(),
            TelemetryData::Metric(MetricData::single(point, self.properties())),
        )
    }
}
