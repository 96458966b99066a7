// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Runtime around `appinsights-core`.
//!
//! A [`registry::Registry`] hands out one [`registry::Collector`] at a time.
//! The collector owns the [`client::TelemetryClient`], the periodic metric and
//! statsbeat loops and the correlation-id lookup; the trackers in
//! [`interceptor`] are the hook points an HTTP server or client wires in.
//! [`logger::init_subscriber`] turns on the SDK's own diagnostics at the
//! level named in the same [`config::Config`].

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod client;
pub mod config;
pub mod correlation_id;
pub mod errors;
pub mod exporter;
pub mod interceptor;
pub mod logger;
pub mod processors;
pub mod registry;
