// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tracing::debug;

use crate::metrics::{DimensionSet, MetricDuration, MetricKind, MetricPoint};
use crate::util::now_ms;

/// Running totals for one dimension set.
///
/// `time` is the timestamp of the latest tick; the `last_*` fields hold the
/// values seen at the previous tick, so the difference is the interval.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AggregatedMetricCounter {
    pub total_count: u64,
    pub last_total_count: u64,
    pub interval_execution_time: f64,
    pub last_interval_execution_time: f64,
    pub time: u64,
    pub last_time: u64,
}

impl AggregatedMetricCounter {
    #[must_use]
    pub fn new(now_ms: u64) -> Self {
        Self {
            time: now_ms,
            last_time: now_ms,
            ..Self::default()
        }
    }

    pub fn record(&mut self, duration_ms: Option<f64>) {
        self.total_count += 1;
        if let Some(duration_ms) = duration_ms {
            self.interval_execution_time += duration_ms;
        }
    }

    /// Closes the interval ending at `now_ms` and returns `(count, elapsed_ms,
    /// average_duration_ms)`, or `None` when nothing worth reporting happened.
    ///
    /// The counter rolls forward either way.
    pub fn roll(&mut self, now_ms: u64) -> Option<(u64, u64, f64)> {
        self.time = now_ms;
        let interval_count = self.total_count.saturating_sub(self.last_total_count);
        let elapsed_ms = self.time.saturating_sub(self.last_time);
        let interval_time = self.interval_execution_time - self.last_interval_execution_time;
        #[allow(clippy::cast_precision_loss)]
        let average_ms = if interval_count == 0 {
            0.0
        } else {
            interval_time / interval_count as f64
        };

        self.last_total_count = self.total_count;
        self.last_interval_execution_time = self.interval_execution_time;
        self.last_time = self.time;

        (elapsed_ms > 0 && interval_count > 0).then_some((interval_count, elapsed_ms, average_ms))
    }
}

/// Counters of one metric kind keyed by dimension set.
#[derive(Debug, Default)]
struct CounterCollection {
    counters: Mutex<HashMap<DimensionSet, AggregatedMetricCounter>>,
}

impl CounterCollection {
    fn record(&self, dimensions: DimensionSet, duration_ms: Option<f64>, now_ms: u64) {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters
            .entry(dimensions)
            .or_insert_with(|| AggregatedMetricCounter::new(now_ms))
            .record(duration_ms);
    }

    fn collect(&self, kind: MetricKind, now_ms: u64, points: &mut Vec<MetricPoint>) {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        for (dimensions, counter) in counters.iter_mut() {
            let Some((count, interval_ms, average_ms)) = counter.roll(now_ms) else {
                continue;
            };
            #[allow(clippy::cast_precision_loss)]
            let value = if kind.has_duration() {
                average_ms
            } else {
                count as f64
            };
            points.push(MetricPoint {
                kind,
                value,
                count,
                interval_ms,
                dimensions: dimensions.clone(),
            });
        }
    }
}

/// Standard metrics aggregated in process.
///
/// Counters live for the life of the process. Observations and ticks may come
/// from any thread.
#[derive(Debug, Default)]
pub struct PreAggregatedMetrics {
    requests: CounterCollection,
    dependencies: CounterCollection,
    exceptions: CounterCollection,
    traces: CounterCollection,
}

impl PreAggregatedMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn collection(&self, kind: MetricKind) -> &CounterCollection {
        match kind {
            MetricKind::Request => &self.requests,
            MetricKind::Dependency => &self.dependencies,
            MetricKind::Exception => &self.exceptions,
            MetricKind::Trace => &self.traces,
        }
    }

    pub fn count_request(&self, duration: impl Into<MetricDuration>, dimensions: impl Into<DimensionSet>) {
        self.count_timed(MetricKind::Request, duration.into(), dimensions.into());
    }

    pub fn count_dependency(
        &self,
        duration: impl Into<MetricDuration>,
        dimensions: impl Into<DimensionSet>,
    ) {
        self.count_timed(MetricKind::Dependency, duration.into(), dimensions.into());
    }

    pub fn count_exception(&self, dimensions: impl Into<DimensionSet>) {
        self.collection(MetricKind::Exception)
            .record(dimensions.into(), None, now_ms());
    }

    pub fn count_trace(&self, dimensions: impl Into<DimensionSet>) {
        self.collection(MetricKind::Trace)
            .record(dimensions.into(), None, now_ms());
    }

    fn count_timed(&self, kind: MetricKind, duration: MetricDuration, dimensions: DimensionSet) {
        let Some(duration_ms) = duration.as_millis() else {
            return;
        };
        self.collection(kind)
            .record(dimensions, Some(duration_ms), now_ms());
    }

    /// Runs one collection tick at `now_ms`.
    ///
    /// Every counter of every kind is rolled forward exactly once, including
    /// those that produce no point.
    pub fn collect(&self, now_ms: u64) -> Vec<MetricPoint> {
        let mut points = Vec::new();
        for kind in MetricKind::ALL {
            self.collection(kind).collect(kind, now_ms, &mut points);
        }
        debug!("Collected {} pre-aggregated metric points", points.len());
        points
    }

    /// A snapshot of one counter.
    #[must_use]
    pub fn counter(&self, kind: MetricKind, dimensions: &DimensionSet) -> Option<AggregatedMetricCounter> {
        let counters = self
            .collection(kind)
            .counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        counters.get(dimensions).cloned()
    }

    /// Number of distinct dimension sets seen for `kind`.
    #[must_use]
    pub fn counter_count(&self, kind: MetricKind) -> usize {
        let counters = self
            .collection(kind)
            .counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        counters.len()
    }
}
