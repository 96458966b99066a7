// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use appinsights_core::{
    batch_processor::{BatchConfig, BatchProcessor, ExportResult, Exporter, TelemetrySink},
    carrier::Extractor,
    correlation_headers::CorrelationHeaderInjector,
    envelope::{Envelope, TelemetryData},
    metrics::{MetricKind, PreAggregatedMetrics, RequestDimensions},
    request_parser::{
        HttpDependencyParser, HttpRequestParser, IncomingRequest, OutgoingRequest, RequestTarget,
    },
    trace_context::TraceContextResolver,
    util::now_ms,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct CapturingExporter {
    envelopes: Mutex<Vec<Envelope>>,
}

#[async_trait]
impl Exporter for CapturingExporter {
    async fn export(&self, batch: Vec<Envelope>) -> ExportResult {
        self.envelopes.lock().expect("lock").extend(batch);
        ExportResult::Success
    }
}

#[tokio::test]
async fn incoming_request_with_outgoing_call_is_correlated_end_to_end() {
    let resolver = Arc::new(TraceContextResolver::new(true));
    let injector = CorrelationHeaderInjector::new(
        Some("cid-v1:app".to_string()),
        &["*.core.windows.net".to_string()],
        Arc::clone(&resolver),
    )
    .expect("valid exclusions");
    let exporter = Arc::new(CapturingExporter::default());
    let processor = BatchProcessor::new(
        BatchConfig {
            max_batch_size: 10,
            max_batch_interval: Duration::from_secs(15),
        },
        exporter.clone(),
    );
    let metrics = PreAggregatedMetrics::new();
    let common_tags = BTreeMap::new();

    let incoming_headers: HashMap<String, String> = [
        ("host", "bing.com"),
        ("traceparent", "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    let request = IncomingRequest::new("GET", "/search?q=test", Some(&incoming_headers));
    let parser = HttpRequestParser::new(&request, &resolver, None);

    let mut outgoing = OutgoingRequest::new(
        "GET",
        RequestTarget::Url("https://api.example.com/lookup".to_string()),
    );
    let dependency_identity = resolver.child_of(Some(parser.identity()));
    let url = outgoing.url();
    assert!(injector.inject_outgoing(&url, &dependency_identity, &mut outgoing.headers));
    assert_eq!(
        Extractor::get(&outgoing.headers, "request-context"),
        Some("source-ikey=cid-v1:app")
    );
    let traceparent = Extractor::get(&outgoing.headers, "traceparent").expect("traceparent");
    assert!(traceparent.starts_with("00-4bf92f3577b34da6a3ce929d0e0e4736-"));

    let dependency = HttpDependencyParser::new(&outgoing, dependency_identity)
        .on_response(200, None, Some(5.0));
    let record = parser.on_response(200, Some(20.0));

    metrics.count_request(
        record.duration_ms,
        RequestDimensions {
            success: record.success,
            result_code: record.result_code(),
            ..RequestDimensions::default()
        },
    );
    processor.send(dependency.to_envelope("ikey", &common_tags));
    processor.send(record.to_envelope("ikey", &common_tags));
    processor.flush().await;

    let envelopes = exporter.envelopes.lock().expect("lock").clone();
    assert_eq!(envelopes.len(), 2);
    let request_id = match &envelopes[1].data {
        TelemetryData::Request(data) => data.id.clone(),
        other => panic!("expected a request, got {other:?}"),
    };
    assert_eq!(
        envelopes[0].tags["ai.operation.parentId"],
        request_id,
        "the dependency hangs off the request that made it"
    );
    assert_eq!(
        envelopes[0].tags["ai.operation.id"],
        envelopes[1].tags["ai.operation.id"]
    );

    let points = metrics.collect(now_ms() + 1_000);
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].kind, MetricKind::Request);
    assert_eq!(points[0].value, 20.0);
}

#[tokio::test]
async fn excluded_storage_call_gets_no_headers() {
    let resolver = Arc::new(TraceContextResolver::new(true));
    let injector = CorrelationHeaderInjector::new(
        Some("cid-v1:app".to_string()),
        &["*.core.windows.net".to_string()],
        Arc::clone(&resolver),
    )
    .expect("valid exclusions");

    let mut outgoing = OutgoingRequest::new(
        "PUT",
        RequestTarget::Url("https://account.blob.core.windows.net/container/blob".to_string()),
    );
    let identity = resolver.child_of(None);
    let url = outgoing.url();

    assert!(!injector.inject_outgoing(&url, &identity, &mut outgoing.headers));
    assert!(outgoing.headers.is_empty());
}

#[tokio::test]
async fn sink_trait_object_buffers_envelopes() {
    let exporter = Arc::new(CapturingExporter::default());
    let processor = BatchProcessor::new(BatchConfig::default(), exporter.clone());
    let sink: &dyn TelemetrySink = &processor;

    let resolver = TraceContextResolver::new(false);
    let request = IncomingRequest::new("GET", "/", None);
    let record = HttpRequestParser::new(&request, &resolver, None).on_response(200, None);
    sink.send(record.to_envelope("ikey", &BTreeMap::new()));

    assert_eq!(processor.buffered_len(), 1);
    processor.shutdown().await;
    assert_eq!(exporter.envelopes.lock().expect("lock").len(), 1);
}
