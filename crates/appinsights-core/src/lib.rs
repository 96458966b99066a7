// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Request correlation and telemetry aggregation engine.
//!
//! The crate turns raw HTTP request/response pairs into canonical telemetry
//! records, resolves the distributed trace identity of each operation across the
//! W3C (`traceparent`/`tracestate`) and legacy (`request-id`,
//! `x-ms-request-root-id`) header schemes, decorates outgoing calls with
//! correlation headers, pre-aggregates counters into periodic metrics and
//! buffers envelopes for an external exporter.
//!
//! ```text
//! IncomingRequest ─► HttpRequestParser ─► TraceContextResolver ─► RequestRecord
//!                                                                    │
//!                      ┌─────────────────────────────────────────────┤
//!                      ▼                                             ▼
//!            PreAggregatedMetrics                              BatchProcessor ─► Exporter
//! ```

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod batch_processor;
pub mod carrier;
pub mod constants;
pub mod correlation_headers;
pub mod envelope;
pub mod errors;
pub mod metrics;
pub mod request_parser;
pub mod statsbeat;
pub mod trace_context;
pub mod util;
