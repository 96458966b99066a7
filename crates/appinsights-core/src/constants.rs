// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Header names, request-context keys and limits shared across the crate.

/// W3C trace context header: `00-<32 hex trace id>-<16 hex span id>-<2 hex flags>`.
pub const TRACEPARENT_HEADER: &str = "traceparent";
/// W3C vendor state, only honoured alongside a `traceparent`.
pub const TRACESTATE_HEADER: &str = "tracestate";
/// Legacy hierarchical id, `|<root>.<span>.` or a bare token.
pub const REQUEST_ID_HEADER: &str = "request-id";
/// Oldest legacy scheme: the caller's id.
pub const PARENT_ID_HEADER: &str = "x-ms-request-id";
/// Oldest legacy scheme: the operation root.
pub const ROOT_ID_HEADER: &str = "x-ms-request-root-id";
/// Comma separated `key=value` pairs identifying the application on each side.
pub const REQUEST_CONTEXT_HEADER: &str = "request-context";
/// Opaque baggage passed through untouched.
pub const CORRELATION_CONTEXT_HEADER: &str = "correlation-context";

/// `request-context` key carrying the caller's correlation id.
pub const REQUEST_CONTEXT_SOURCE_KEY: &str = "source-ikey";
/// `request-context` key carrying the callee's correlation id.
pub const REQUEST_CONTEXT_TARGET_KEY: &str = "target-ikey";

pub const HOST_HEADER: &str = "host";
pub const USER_AGENT_HEADER: &str = "user-agent";
pub const COOKIE_HEADER: &str = "cookie";
pub const FORWARDED_PROTO_HEADER: &str = "x-forwarded-proto";
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
pub const CLIENT_IP_HEADER: &str = "x-client-ip";
pub const REAL_IP_HEADER: &str = "x-real-ip";

/// Cookies planted by the browser SDK.
pub const USER_COOKIE: &str = "ai_user";
pub const SESSION_COOKIE: &str = "ai_session";
pub const AUTH_USER_COOKIE: &str = "ai_authUser";

/// Prefix of every application correlation id.
pub const CORRELATION_ID_PREFIX: &str = "cid-v1:";

/// Longest value kept for a single custom property.
pub const MAX_PROPERTY_VALUE_LENGTH: usize = 8192;

/// Longest legacy hierarchical request id before it is truncated.
pub const REQUEST_ID_MAX_LENGTH: usize = 1024;

pub const DEPENDENCY_TYPE_HTTP: &str = "Http";
pub const DEPENDENCY_TYPE_TRACKED_COMPONENT: &str = "Http (tracked component)";
