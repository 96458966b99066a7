// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::time::Instant;

use http::Uri;
use lazy_static::lazy_static;
use percent_encoding::percent_decode_str;
use regex::Regex;
use tracing::{debug, warn};

use crate::carrier::Extractor;
use crate::constants::{
    AUTH_USER_COOKIE, CLIENT_IP_HEADER, COOKIE_HEADER, FORWARDED_FOR_HEADER,
    FORWARDED_PROTO_HEADER, HOST_HEADER, REAL_IP_HEADER, REQUEST_CONTEXT_HEADER,
    REQUEST_CONTEXT_SOURCE_KEY, SESSION_COOKIE, USER_AGENT_HEADER, USER_COOKIE,
};
use crate::correlation_headers::request_context_value;
use crate::envelope::{tags, Envelope, Measurements, Properties, RequestData, TelemetryData};
use crate::errors::ParseError;
use crate::request_parser::{is_success, result_code, set_property, ErrorDetails, ERROR_PROPERTY};
use crate::trace_context::{TraceContextResolver, TraceIdentity};
use crate::util::{ms_to_time_span, now_ms};

lazy_static! {
    static ref IPV4_REGEX: Regex =
        Regex::new(r"[0-9]{1,3}\.[0-9]{1,3}\.[0-9]{1,3}\.[0-9]{1,3}").expect("failed creating regex");
    static ref ABSOLUTE_URL_REGEX: Regex =
        Regex::new(r"^[A-Za-z][A-Za-z0-9+.\-]*://").expect("failed creating regex");
}

/// Remote address as reported at each layer of the server stack. Older
/// runtimes only fill the deeper ones.
#[derive(Clone, Copy, Debug, Default)]
pub struct RemoteAddresses<'a> {
    pub connection: Option<&'a str>,
    pub socket: Option<&'a str>,
    pub legacy_socket: Option<&'a str>,
}

/// A request received by the application.
pub struct IncomingRequest<'a> {
    pub method: &'a str,
    /// As received: usually a path and query, sometimes absolute.
    pub url: &'a str,
    /// `None` when the server exposes no headers at all.
    pub headers: Option<&'a dyn Extractor>,
    /// Whether the connection is TLS.
    pub encrypted: bool,
    pub remote_addresses: RemoteAddresses<'a>,
}

impl<'a> IncomingRequest<'a> {
    #[must_use]
    pub fn new(method: &'a str, url: &'a str, headers: Option<&'a dyn Extractor>) -> Self {
        Self {
            method,
            url,
            headers,
            encrypted: false,
            remote_addresses: RemoteAddresses::default(),
        }
    }

    fn header(&self, key: &str) -> Option<&'a str> {
        self.headers?.get(key)
    }

    /// The fully qualified request URL.
    ///
    /// Absolute URLs are returned as is. Relative ones are resolved against the
    /// `Host` header, with `https` when the connection is encrypted or a proxy
    /// says so through `x-forwarded-proto`. Without headers or a host the raw
    /// URL comes back unchanged.
    #[must_use]
    pub fn absolute_url(&self) -> String {
        if ABSOLUTE_URL_REGEX.is_match(self.url) {
            return self.url.to_string();
        }

        let Some(host) = self.header(HOST_HEADER).filter(|h| !h.is_empty()) else {
            return self.url.to_string();
        };

        let forwarded_https = self
            .header(FORWARDED_PROTO_HEADER)
            .is_some_and(|proto| proto.trim().eq_ignore_ascii_case("https"));
        let scheme = if self.encrypted || forwarded_https {
            "https"
        } else {
            "http"
        };

        let path = self.url.split('#').next().unwrap_or_default();
        if path.starts_with('/') {
            format!("{scheme}://{host}{path}")
        } else {
            format!("{scheme}://{host}/{path}")
        }
    }

    /// The client IPv4 address, first match along the proxy headers and the
    /// transport layers.
    #[must_use]
    pub fn client_ip(&self) -> Option<String> {
        let candidates = [
            self.header(FORWARDED_FOR_HEADER),
            self.header(CLIENT_IP_HEADER),
            self.header(REAL_IP_HEADER),
            self.remote_addresses.connection,
            self.remote_addresses.socket,
            self.remote_addresses.legacy_socket,
        ];

        let matched = candidates
            .iter()
            .flatten()
            .find_map(|candidate| IPV4_REGEX.find(candidate))
            .map(|m| m.as_str().to_string());
        if matched.is_some() {
            return matched;
        }

        let remote = self
            .remote_addresses
            .connection
            .or(self.remote_addresses.socket)
            .or(self.remote_addresses.legacy_socket);
        match remote {
            Some(address) if address.starts_with("::") => Some("127.0.0.1".to_string()),
            _ => None,
        }
    }

    /// The id planted in cookie `name` by the browser SDK: the part before the
    /// first `|`, or an empty string.
    #[must_use]
    pub fn cookie_id(&self, name: &str) -> String {
        let Some(header) = self.header(COOKIE_HEADER) else {
            return String::new();
        };

        match find_cookie(header, name) {
            Ok(Some(value)) => value.split('|').next().unwrap_or_default().to_string(),
            Ok(None) => String::new(),
            Err(e) => {
                warn!("Ignoring cookie: {e}");
                String::new()
            }
        }
    }

    fn operation_name(&self) -> String {
        let path = self
            .url
            .parse::<Uri>()
            .map(|uri| uri.path().to_string())
            .unwrap_or_else(|_| {
                let path = self.url.split(['?', '#']).next().unwrap_or_default();
                path.to_string()
            });
        format!("{} {}", self.method.to_uppercase(), path)
    }
}

/// Finds cookie `name` and percent-decodes its value.
///
/// Only the requested cookie is decoded, so a malformed sibling never gets in
/// the way.
fn find_cookie(header: &str, name: &str) -> Result<Option<String>, ParseError> {
    for pair in header.split(';') {
        let Some((key, value)) = pair.trim().split_once('=') else {
            continue;
        };
        if key.trim() != name {
            continue;
        }

        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value);
        return decode_cookie_value(name, value).map(Some);
    }
    Ok(None)
}

fn decode_cookie_value(name: &str, raw: &str) -> Result<String, ParseError> {
    let bytes = raw.as_bytes();
    for (index, byte) in bytes.iter().enumerate() {
        if *byte != b'%' {
            continue;
        }
        let well_formed = bytes
            .get(index + 1..index + 3)
            .is_some_and(|hex| hex.iter().all(u8::is_ascii_hexdigit));
        if !well_formed {
            return Err(ParseError::CookieEncoding {
                name: name.to_string(),
            });
        }
    }

    percent_decode_str(raw)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|_| ParseError::CookieUtf8 {
            name: name.to_string(),
        })
}

/// A finished incoming request.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestRecord {
    pub method: String,
    pub url: String,
    /// `METHOD /path`
    pub name: String,
    pub start_time_ms: u64,
    pub duration_ms: f64,
    pub status_code: Option<u16>,
    pub success: bool,
    pub properties: Properties,
    pub identity: TraceIdentity,
    /// Correlation id of the caller, from its `request-context`.
    pub source_correlation_id: Option<String>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub user_id: String,
    pub session_id: String,
    pub auth_user_id: String,
    pub error: Option<ErrorDetails>,
}

impl RequestRecord {
    #[must_use]
    pub fn result_code(&self) -> String {
        result_code(self.status_code)
    }

    /// Context tags describing this request's operation and caller.
    #[must_use]
    pub fn tags(&self) -> BTreeMap<String, String> {
        let mut context = BTreeMap::new();
        context.insert(tags::OPERATION_ID.to_string(), self.identity.operation_id.clone());
        context.insert(tags::OPERATION_NAME.to_string(), self.name.clone());
        if let Some(parent_id) = self.identity.parent_id.as_ref() {
            context.insert(tags::OPERATION_PARENT_ID.to_string(), parent_id.clone());
        }
        if let Some(legacy_root_id) = self.identity.legacy_root_id.as_ref() {
            context.insert(tags::LEGACY_ROOT_ID.to_string(), legacy_root_id.clone());
        }
        if let Some(ip) = self.client_ip.as_ref() {
            context.insert(tags::LOCATION_IP.to_string(), ip.clone());
        }
        if let Some(user_agent) = self.user_agent.as_ref() {
            context.insert(tags::USER_AGENT.to_string(), user_agent.clone());
        }
        for (key, value) in [
            (tags::USER_ID, &self.user_id),
            (tags::SESSION_ID, &self.session_id),
            (tags::USER_AUTH_USER_ID, &self.auth_user_id),
        ] {
            if !value.is_empty() {
                context.insert(key.to_string(), value.clone());
            }
        }
        context
    }

    #[must_use]
    pub fn to_telemetry_data(&self) -> TelemetryData {
        TelemetryData::Request(RequestData {
            ver: 2,
            id: self.identity.request_id.clone(),
            name: self.name.clone(),
            duration: ms_to_time_span(self.duration_ms),
            response_code: self.result_code(),
            success: self.success,
            url: Some(self.url.clone()),
            source: self.source_correlation_id.clone(),
            properties: self.properties.clone(),
            measurements: Measurements::new(),
        })
    }

    /// The envelope for this request, with `common_tags` under the request's
    /// own tags.
    #[must_use]
    pub fn to_envelope(&self, ikey: &str, common_tags: &BTreeMap<String, String>) -> Envelope {
        let mut tags = common_tags.clone();
        tags.extend(self.tags());
        Envelope::new(ikey, self.start_time_ms, tags, self.to_telemetry_data())
    }
}

/// Captures an incoming request until its outcome is known.
#[derive(Debug)]
pub struct HttpRequestParser {
    method: String,
    url: String,
    name: String,
    start_time_ms: u64,
    started: Instant,
    identity: TraceIdentity,
    source_correlation_id: Option<String>,
    client_ip: Option<String>,
    user_agent: Option<String>,
    user_id: String,
    session_id: String,
    auth_user_id: String,
    properties: Properties,
}

impl HttpRequestParser {
    /// Reads `request` and resolves its trace identity.
    ///
    /// `explicit_request_id` is an id already chosen for this request, as with
    /// manually tracked requests; it takes precedence over the headers.
    #[must_use]
    pub fn new(
        request: &IncomingRequest<'_>,
        resolver: &TraceContextResolver,
        explicit_request_id: Option<&str>,
    ) -> Self {
        if request.headers.is_none() {
            debug!("Incoming request has no headers, correlation falls back to a new trace");
        }
        let identity = resolver.resolve(request.headers, explicit_request_id);

        Self {
            method: request.method.to_uppercase(),
            url: request.absolute_url(),
            name: request.operation_name(),
            start_time_ms: now_ms(),
            started: Instant::now(),
            identity,
            source_correlation_id: request_context_value(
                request.header(REQUEST_CONTEXT_HEADER),
                REQUEST_CONTEXT_SOURCE_KEY,
            ),
            client_ip: request.client_ip(),
            user_agent: request.header(USER_AGENT_HEADER).map(str::to_string),
            user_id: request.cookie_id(USER_COOKIE),
            session_id: request.cookie_id(SESSION_COOKIE),
            auth_user_id: request.cookie_id(AUTH_USER_COOKIE),
            properties: Properties::new(),
        }
    }

    #[must_use]
    pub fn identity(&self) -> &TraceIdentity {
        &self.identity
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn start_time_ms(&self) -> u64 {
        self.start_time_ms
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: &str) {
        set_property(&mut self.properties, key, value);
    }

    /// Completes the request with the status it answered.
    ///
    /// `duration_ms` overrides the measured duration.
    #[must_use]
    pub fn on_response(self, status_code: u16, duration_ms: Option<f64>) -> RequestRecord {
        self.finish(Some(status_code), None, duration_ms)
    }

    /// Completes a request that failed before a response was written.
    #[must_use]
    pub fn on_error(self, error: ErrorDetails, duration_ms: Option<f64>) -> RequestRecord {
        self.finish(None, Some(error), duration_ms)
    }

    fn finish(
        mut self,
        status_code: Option<u16>,
        error: Option<ErrorDetails>,
        duration_ms: Option<f64>,
    ) -> RequestRecord {
        let duration_ms = duration_ms
            .filter(|d| d.is_finite() && *d >= 0.0)
            .unwrap_or_else(|| self.started.elapsed().as_secs_f64() * 1000.0);

        if let Some(error) = error.as_ref() {
            set_property(&mut self.properties, ERROR_PROPERTY, &error.message);
        }

        RequestRecord {
            method: self.method,
            url: self.url,
            name: self.name,
            start_time_ms: self.start_time_ms,
            duration_ms,
            status_code,
            success: error.is_none() && is_success(status_code),
            properties: self.properties,
            identity: self.identity,
            source_correlation_id: self.source_correlation_id,
            client_ip: self.client_ip,
            user_agent: self.user_agent,
            user_id: self.user_id,
            session_id: self.session_id,
            auth_user_id: self.auth_user_id,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tracing_test::traced_test;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn relative_url_over_plain_connection() {
        let carrier = headers(&[("host", "bing.com")]);
        let request = IncomingRequest::new("GET", "/search?q=test", Some(&carrier));

        assert_eq!(request.absolute_url(), "http://bing.com/search?q=test");
    }

    #[test]
    fn relative_url_over_encrypted_connection() {
        let carrier = headers(&[("host", "bing.com")]);
        let mut request = IncomingRequest::new("GET", "/search?q=test", Some(&carrier));
        request.encrypted = true;

        assert_eq!(request.absolute_url(), "https://bing.com/search?q=test");
    }

    #[test]
    fn forwarded_proto_upgrades_scheme() {
        let carrier = headers(&[("host", "bing.com"), ("x-forwarded-proto", "https")]);
        let request = IncomingRequest::new("GET", "/search?q=test", Some(&carrier));

        assert_eq!(request.absolute_url(), "https://bing.com/search?q=test");
    }

    #[test]
    fn absolute_url_is_kept() {
        let carrier = headers(&[("host", "bing.com")]);
        let request = IncomingRequest::new("GET", "http://other.com:8080/a?b=c", Some(&carrier));

        assert_eq!(request.absolute_url(), "http://other.com:8080/a?b=c");
    }

    #[test]
    fn absolute_url_with_unencoded_characters_is_kept() {
        let carrier = headers(&[("host", "proxy.local")]);
        let request = IncomingRequest::new("GET", "http://bing.com/a b?q=a", Some(&carrier));

        assert_eq!(request.absolute_url(), "http://bing.com/a b?q=a");
    }

    #[test]
    fn missing_headers_returns_raw_url() {
        let request = IncomingRequest::new("GET", "/search?q=test", None);
        assert_eq!(request.absolute_url(), "/search?q=test");

        let carrier = headers(&[]);
        let request = IncomingRequest::new("GET", "/search?q=test", Some(&carrier));
        assert_eq!(request.absolute_url(), "/search?q=test");
    }

    #[test]
    fn client_ip_precedence() {
        let carrier = headers(&[
            ("x-forwarded-for", "10.0.0.1:3000, 10.0.0.2"),
            ("x-client-ip", "10.0.0.3"),
        ]);
        let mut request = IncomingRequest::new("GET", "/", Some(&carrier));
        request.remote_addresses.connection = Some("10.0.0.4");
        assert_eq!(request.client_ip().as_deref(), Some("10.0.0.1"));

        let carrier = headers(&[("x-real-ip", "garbage"), ("x-client-ip", "not-an-ip")]);
        let mut request = IncomingRequest::new("GET", "/", Some(&carrier));
        request.remote_addresses.socket = Some("::ffff:192.168.1.5");
        assert_eq!(request.client_ip().as_deref(), Some("192.168.1.5"));
    }

    #[test]
    fn ipv6_loopback_maps_to_ipv4() {
        let mut request = IncomingRequest::new("GET", "/", None);
        request.remote_addresses.connection = Some("::1");

        assert_eq!(request.client_ip().as_deref(), Some("127.0.0.1"));

        let request = IncomingRequest::new("GET", "/", None);
        assert_eq!(request.client_ip(), None);
    }

    #[test]
    #[traced_test]
    fn malformed_sibling_cookie_does_not_hide_valid_one() {
        let carrier = headers(&[(
            "cookie",
            "ai_authUser=user%40example.com; invalid%cookie%format=value%bad%encoding; other=normal",
        )]);
        let request = IncomingRequest::new("GET", "/", Some(&carrier));

        assert_eq!(request.cookie_id(AUTH_USER_COOKIE), "user@example.com");
        assert_eq!(request.cookie_id(USER_COOKIE), "");
    }

    #[test]
    #[traced_test]
    fn malformed_cookie_is_treated_as_absent() {
        let carrier = headers(&[("cookie", "ai_user=abc%zz|123; ai_session=s1|2024")]);
        let request = IncomingRequest::new("GET", "/", Some(&carrier));

        assert_eq!(request.cookie_id(USER_COOKIE), "");
        assert_eq!(request.cookie_id(SESSION_COOKIE), "s1");
        assert!(logs_contain("Ignoring cookie"));
    }

    #[test]
    fn cookie_id_keeps_part_before_pipe() {
        let carrier = headers(&[("cookie", "ai_user=u1|2024-01-01T00:00:00.000Z")]);
        let request = IncomingRequest::new("GET", "/", Some(&carrier));

        assert_eq!(request.cookie_id(USER_COOKIE), "u1");
    }

    #[test]
    fn parser_builds_record_on_response() {
        let resolver = TraceContextResolver::new(true);
        let carrier = headers(&[
            ("host", "bing.com"),
            ("traceparent", "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"),
            ("request-context", "source-ikey=cid-v1:caller"),
            ("user-agent", "test-agent"),
        ]);
        let request = IncomingRequest::new("get", "/search?q=test", Some(&carrier));

        let mut parser = HttpRequestParser::new(&request, &resolver, None);
        parser.set_property("custom", "value");
        let record = parser.on_response(200, Some(25.0));

        assert_eq!(record.method, "GET");
        assert_eq!(record.name, "GET /search");
        assert_eq!(record.url, "http://bing.com/search?q=test");
        assert_eq!(record.duration_ms, 25.0);
        assert!(record.success);
        assert_eq!(record.result_code(), "200");
        assert_eq!(record.identity.operation_id, "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(record.source_correlation_id.as_deref(), Some("cid-v1:caller"));
        assert_eq!(record.user_agent.as_deref(), Some("test-agent"));
        assert_eq!(record.properties["custom"], "value");
    }

    #[test]
    fn parser_builds_failed_record_on_error() {
        let resolver = TraceContextResolver::new(true);
        let request = IncomingRequest::new("POST", "/upload", None);

        let parser = HttpRequestParser::new(&request, &resolver, None);
        let record = parser.on_error(ErrorDetails::new("TimeoutError", "socket hang up"), None);

        assert!(!record.success);
        assert_eq!(record.result_code(), "0");
        assert_eq!(record.properties[ERROR_PROPERTY], "socket hang up");
        assert!(record.duration_ms >= 0.0);
        assert_eq!(record.identity.operation_id.len(), 32);
    }

    #[test]
    fn error_status_is_not_success() {
        let resolver = TraceContextResolver::new(true);
        let request = IncomingRequest::new("GET", "/", None);

        let record = HttpRequestParser::new(&request, &resolver, None).on_response(404, None);
        assert!(!record.success);
    }

    #[test]
    fn envelope_carries_identity_tags() {
        let resolver = TraceContextResolver::new(true);
        let carrier = headers(&[
            ("host", "bing.com"),
            ("traceparent", "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"),
            ("cookie", "ai_session=sess|1"),
        ]);
        let request = IncomingRequest::new("GET", "/", Some(&carrier));
        let record = HttpRequestParser::new(&request, &resolver, None).on_response(200, Some(1.0));

        let mut common = BTreeMap::new();
        common.insert(tags::CLOUD_ROLE.to_string(), "web".to_string());
        let envelope = record.to_envelope("ikey", &common);

        assert_eq!(envelope.tags[tags::OPERATION_ID], "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(
            envelope.tags[tags::OPERATION_PARENT_ID],
            "|4bf92f3577b34da6a3ce929d0e0e4736.00f067aa0ba902b7."
        );
        assert_eq!(envelope.tags[tags::SESSION_ID], "sess");
        assert_eq!(envelope.tags[tags::CLOUD_ROLE], "web");
        match envelope.data {
            TelemetryData::Request(data) => {
                assert_eq!(data.id, record.identity.request_id);
                assert_eq!(data.duration, "00:00:00.001");
            }
            other => panic!("unexpected telemetry {other:?}"),
        }
    }
}
