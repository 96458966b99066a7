// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Hook points for HTTP servers and clients.
//!
//! A server calls [`IncomingRequestTracker::start`] when a request arrives and
//! finishes the returned [`TrackedRequest`] with `end` or `fail`. A client
//! calls [`OutgoingRequestTracker::start`] before sending, which writes the
//! correlation headers, and finishes the [`TrackedDependency`] the same way.
//! Finishing consumes the tracker, so an exchange is reported once.

use std::sync::Arc;

use appinsights_core::carrier::{Carrier, Extractor};
use appinsights_core::correlation_headers::CorrelationHeaderInjector;
use appinsights_core::request_parser::{
    DependencyRecord, ErrorDetails, HttpDependencyParser, HttpRequestParser, IncomingRequest,
    OutgoingRequest, RequestRecord, RequestTarget,
};
use appinsights_core::trace_context::TraceIdentity;
use tracing::debug;

use crate::client::TelemetryClient;

#[derive(Clone)]
pub struct IncomingRequestTracker {
    client: Arc<TelemetryClient>,
}

impl IncomingRequestTracker {
    #[must_use]
    pub fn new(client: Arc<TelemetryClient>) -> Self {
        Self { client }
    }

    #[must_use]
    pub fn start(&self, request: &IncomingRequest<'_>) -> TrackedRequest {
        self.start_with_id(request, None)
    }

    /// Like [`start`](Self::start) with an id the application already chose
    /// for this request.
    #[must_use]
    pub fn start_with_id(
        &self,
        request: &IncomingRequest<'_>,
        request_id: Option<&str>,
    ) -> TrackedRequest {
        TrackedRequest {
            parser: HttpRequestParser::new(request, self.client.resolver(), request_id),
            injector: self.client.injector(),
            client: Arc::clone(&self.client),
        }
    }

    /// Tracks an [`http::Request`] as received by the server.
    #[must_use]
    pub fn start_http<B>(&self, request: &http::Request<B>) -> TrackedRequest {
        let url = request.uri().to_string();
        let mut incoming = IncomingRequest::new(
            request.method().as_str(),
            &url,
            Some(request.headers() as &dyn Extractor),
        );
        incoming.encrypted = request.uri().scheme() == Some(&http::uri::Scheme::HTTPS);
        self.start(&incoming)
    }
}

/// An incoming request in progress.
pub struct TrackedRequest {
    client: Arc<TelemetryClient>,
    injector: Arc<CorrelationHeaderInjector>,
    parser: HttpRequestParser,
}

impl TrackedRequest {
    /// Identity of the request; outgoing calls made while serving it hang off
    /// this.
    #[must_use]
    pub fn identity(&self) -> &TraceIdentity {
        self.parser.identity()
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: &str) {
        self.parser.set_property(key, value);
    }

    /// Finishes the request with the status it answered. `response_headers`
    /// receive `target-ikey` so a tracked caller can recognise this component.
    pub fn end(self, status_code: u16, response_headers: Option<&mut dyn Carrier>) -> RequestRecord {
        if let Some(headers) = response_headers {
            self.injector.inject_response(headers);
        }
        let record = self.parser.on_response(status_code, None);
        self.client.track_request(&record);
        record
    }

    /// Finishes a request that failed before a response was written.
    pub fn fail(self, error: ErrorDetails) -> RequestRecord {
        debug!("Incoming request failed: {error}");
        let record = self.parser.on_error(error, None);
        self.client.track_request(&record);
        record
    }
}

#[derive(Clone)]
pub struct OutgoingRequestTracker {
    client: Arc<TelemetryClient>,
}

impl OutgoingRequestTracker {
    #[must_use]
    pub fn new(client: Arc<TelemetryClient>) -> Self {
        Self { client }
    }

    /// Derives the call's identity from `parent`, writes the correlation
    /// headers into `request.headers` unless the target is excluded and starts
    /// timing the call.
    #[must_use]
    pub fn start(
        &self,
        request: &mut OutgoingRequest,
        parent: Option<&TraceIdentity>,
    ) -> TrackedDependency {
        let identity = self.client.resolver().child_of(parent);
        let parser = HttpDependencyParser::new(request, identity);
        self.client
            .injector()
            .inject_outgoing(parser.url(), parser.identity(), &mut request.headers);
        TrackedDependency {
            client: Arc::clone(&self.client),
            parser,
        }
    }

    /// Tracks an [`http::Request`] about to be sent, writing the correlation
    /// headers into its header map.
    #[must_use]
    pub fn start_http<B>(
        &self,
        request: &mut http::Request<B>,
        parent: Option<&TraceIdentity>,
    ) -> TrackedDependency {
        let outgoing = OutgoingRequest::new(
            request.method().as_str(),
            RequestTarget::Url(request.uri().to_string()),
        );
        let identity = self.client.resolver().child_of(parent);
        let parser = HttpDependencyParser::new(&outgoing, identity);
        self.client
            .injector()
            .inject_outgoing(parser.url(), parser.identity(), request.headers_mut());
        TrackedDependency {
            client: Arc::clone(&self.client),
            parser,
        }
    }
}

/// An outgoing call in progress.
pub struct TrackedDependency {
    client: Arc<TelemetryClient>,
    parser: HttpDependencyParser,
}

impl TrackedDependency {
    #[must_use]
    pub fn identity(&self) -> &TraceIdentity {
        self.parser.identity()
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: &str) {
        self.parser.set_property(key, value);
    }

    /// Finishes the call with the callee's response.
    pub fn end(
        self,
        status_code: u16,
        response_headers: Option<&dyn Extractor>,
    ) -> DependencyRecord {
        let record = self.parser.on_response(status_code, response_headers, None);
        self.client.track_dependency(&record);
        record
    }

    /// Finishes a call that never got a response.
    pub fn fail(self, error: ErrorDetails) -> DependencyRecord {
        debug!("Outgoing request failed: {error}");
        let record = self.parser.on_error(error, None);
        self.client.track_dependency(&record);
        record
    }
}
