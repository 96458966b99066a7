// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The telemetry client every tracker and loop sends through.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use appinsights_core::batch_processor::BatchProcessor;
use appinsights_core::correlation_headers::CorrelationHeaderInjector;
use appinsights_core::envelope::{
    tags, Envelope, EventData, ExceptionData, ExceptionDetails, Measurements, MessageData,
    Properties, SeverityLevel, TelemetryData,
};
use appinsights_core::metrics::{
    CommonDimensions, DependencyDimensions, MetricPoint, PreAggregatedMetrics, RequestDimensions,
    PROCESSED_BY_METRIC_EXTRACTORS_PROPERTY,
};
use appinsights_core::request_parser::{DependencyRecord, ErrorDetails, RequestRecord};
use appinsights_core::trace_context::{TraceContextResolver, TraceIdentity};
use appinsights_core::util::now_ms;
use tracing::debug;

use crate::config::Config;
use crate::errors::ConfigError;
use crate::processors::{ProcessorChain, ProcessorContext, TelemetryProcessor};

const SDK_VERSION: &str = concat!("rust:", env!("CARGO_PKG_VERSION"));

const REQUESTS_EXTRACTOR: &str = "(Name:'Requests', Ver:'1.1')";
const DEPENDENCIES_EXTRACTOR: &str = "(Name:'Dependencies', Ver:'1.1')";
const EXCEPTIONS_EXTRACTOR: &str = "(Name:'Exceptions', Ver:'1.1')";
const TRACES_EXTRACTOR: &str = "(Name:'Traces', Ver:'1.1')";

pub struct TelemetryClient {
    instrumentation_key: String,
    cloud_role_name: Option<String>,
    cloud_role_instance: Option<String>,
    common_tags: RwLock<BTreeMap<String, String>>,
    processors: RwLock<ProcessorChain>,
    resolver: Arc<TraceContextResolver>,
    /// Swapped whole once the correlation id is known.
    injector: RwLock<Arc<CorrelationHeaderInjector>>,
    metrics: Arc<PreAggregatedMetrics>,
    batch_processor: BatchProcessor,
}

impl TelemetryClient {
    pub fn new(config: &Config, batch_processor: BatchProcessor) -> Result<Self, ConfigError> {
        let resolver = Arc::new(TraceContextResolver::new(config.w3c_enabled));
        let injector = CorrelationHeaderInjector::new(
            None,
            &config.correlation_header_excluded_domains,
            Arc::clone(&resolver),
        )?;

        let mut common_tags = BTreeMap::new();
        common_tags.insert(tags::INTERNAL_SDK_VERSION.to_string(), SDK_VERSION.to_string());
        if let Some(role) = config.cloud_role_name.as_ref() {
            common_tags.insert(tags::CLOUD_ROLE.to_string(), role.clone());
        }
        if let Some(instance) = config.cloud_role_instance.as_ref() {
            common_tags.insert(tags::CLOUD_ROLE_INSTANCE.to_string(), instance.clone());
        }

        Ok(Self {
            instrumentation_key: config.instrumentation_key.clone(),
            cloud_role_name: config.cloud_role_name.clone(),
            cloud_role_instance: config.cloud_role_instance.clone(),
            common_tags: RwLock::new(common_tags),
            processors: RwLock::new(ProcessorChain::new()),
            resolver,
            injector: RwLock::new(Arc::new(injector)),
            metrics: Arc::new(PreAggregatedMetrics::new()),
            batch_processor,
        })
    }

    #[must_use]
    pub fn instrumentation_key(&self) -> &str {
        &self.instrumentation_key
    }

    #[must_use]
    pub fn resolver(&self) -> &Arc<TraceContextResolver> {
        &self.resolver
    }

    #[must_use]
    pub fn injector(&self) -> Arc<CorrelationHeaderInjector> {
        Arc::clone(&self.injector.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Starts advertising `correlation_id` on outgoing calls and responses.
    pub fn set_correlation_id(&self, correlation_id: String) {
        let mut injector = self.injector.write().unwrap_or_else(PoisonError::into_inner);
        *injector = Arc::new(injector.with_correlation_id(correlation_id));
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<PreAggregatedMetrics> {
        &self.metrics
    }

    #[must_use]
    pub fn batch_processor(&self) -> &BatchProcessor {
        &self.batch_processor
    }

    #[must_use]
    pub fn common_tags(&self) -> BTreeMap<String, String> {
        self.common_tags
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_common_tag(&self, key: impl Into<String>, value: impl Into<String>) {
        self.common_tags
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value.into());
    }

    pub fn add_processor(&self, processor: impl TelemetryProcessor + 'static) {
        self.processors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(processor));
    }

    pub fn clear_processors(&self) {
        self.processors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Runs the processors and hands the envelope to the batch processor.
    pub fn track(&self, mut envelope: Envelope, context: &ProcessorContext<'_>) {
        let keep = self
            .processors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .run(&mut envelope, context);
        if keep {
            self.batch_processor.send(envelope);
        }
    }

    pub fn track_request(&self, record: &RequestRecord) {
        let mut envelope = record.to_envelope(&self.instrumentation_key, &self.common_tags());
        let synthetic = envelope.tags.contains_key(tags::OPERATION_SYNTHETIC_SOURCE);
        self.metrics.count_request(
            record.duration_ms,
            RequestDimensions {
                success: record.success,
                result_code: record.result_code(),
                cloud_role_name: self.cloud_role_name.clone(),
                cloud_role_instance: self.cloud_role_instance.clone(),
                synthetic,
            },
        );
        mark_extracted(&mut envelope, REQUESTS_EXTRACTOR);
        self.track(
            envelope,
            &ProcessorContext {
                request: Some(record),
                dependency: None,
            },
        );
    }

    pub fn track_dependency(&self, record: &DependencyRecord) {
        let mut envelope = record.to_envelope(&self.instrumentation_key, &self.common_tags());
        self.metrics.count_dependency(
            record.duration_ms,
            DependencyDimensions {
                dependency_type: record.dependency_type_name.clone(),
                success: record.success,
                target: record.target.clone(),
                result_code: record.result_code(),
                cloud_role_name: self.cloud_role_name.clone(),
                cloud_role_instance: self.cloud_role_instance.clone(),
            },
        );
        mark_extracted(&mut envelope, DEPENDENCIES_EXTRACTOR);
        self.track(
            envelope,
            &ProcessorContext {
                request: None,
                dependency: Some(record),
            },
        );
    }

    /// Tracks a handled error, attached to `operation` when given.
    pub fn track_exception(&self, error: &ErrorDetails, operation: Option<&TraceIdentity>) {
        self.metrics.count_exception(CommonDimensions {
            cloud_role_name: self.cloud_role_name.clone(),
            cloud_role_instance: self.cloud_role_instance.clone(),
            severity_level: None,
        });
        let data = TelemetryData::Exception(ExceptionData {
            ver: 2,
            exceptions: vec![ExceptionDetails {
                type_name: error.type_name.clone(),
                message: error.message.clone(),
                has_full_stack: error.stack.is_some(),
                stack: error.stack.clone(),
            }],
            severity_level: Some(SeverityLevel::Error),
            properties: Properties::new(),
            measurements: Measurements::new(),
        });
        let mut envelope = self.envelope(data, operation);
        mark_extracted(&mut envelope, EXCEPTIONS_EXTRACTOR);
        self.track(envelope, &ProcessorContext::default());
    }

    pub fn track_trace(
        &self,
        message: impl Into<String>,
        severity: SeverityLevel,
        operation: Option<&TraceIdentity>,
    ) {
        self.metrics.count_trace(CommonDimensions {
            cloud_role_name: self.cloud_role_name.clone(),
            cloud_role_instance: self.cloud_role_instance.clone(),
            severity_level: Some(severity.as_str().to_string()),
        });
        let data = TelemetryData::Trace(MessageData {
            ver: 2,
            message: message.into(),
            severity_level: Some(severity),
            properties: Properties::new(),
        });
        let mut envelope = self.envelope(data, operation);
        mark_extracted(&mut envelope, TRACES_EXTRACTOR);
        self.track(envelope, &ProcessorContext::default());
    }

    pub fn track_event(&self, name: impl Into<String>, properties: Properties) {
        let data = TelemetryData::Event(EventData {
            ver: 2,
            name: name.into(),
            properties,
            measurements: Measurements::new(),
        });
        let envelope = self.envelope(data, None);
        self.track(envelope, &ProcessorContext::default());
    }

    /// Sends the points of one pre-aggregation tick.
    pub fn track_metric_points(&self, points: &[MetricPoint]) {
        if points.is_empty() {
            return;
        }
        debug!("Tracking {} pre-aggregated metric points", points.len());
        let common_tags = self.common_tags();
        let time_ms = now_ms();
        for point in points {
            let envelope = point.to_envelope(&self.instrumentation_key, time_ms, &common_tags);
            self.track(envelope, &ProcessorContext::default());
        }
    }

    pub async fn flush(&self) {
        self.batch_processor.flush().await;
    }

    fn envelope(&self, data: TelemetryData, operation: Option<&TraceIdentity>) -> Envelope {
        let mut context = self.common_tags();
        if let Some(operation) = operation {
            context.insert(tags::OPERATION_ID.to_string(), operation.operation_id.clone());
            context.insert(
                tags::OPERATION_PARENT_ID.to_string(),
                operation.request_id.clone(),
            );
        }
        Envelope::new(&self.instrumentation_key, now_ms(), context, data)
    }
}

fn mark_extracted(envelope: &mut Envelope, extractor: &str) {
    envelope.data.properties_mut().insert(
        PROCESSED_BY_METRIC_EXTRACTORS_PROPERTY.to_string(),
        extractor.to_string(),
    );
}
