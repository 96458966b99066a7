// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Correlation headers on outgoing calls and responses.
//!
//! Before a request leaves the process the [`CorrelationHeaderInjector`]
//! decides whether the target may see correlation headers at all (an exclusion
//! list of glob patterns over host names, typically storage endpoints that
//! reject unknown headers) and, if so, writes the outgoing trace identity plus
//! this application's correlation id into `request-context`.
//!
//! `request-context` is shared with other layers, so entries are only ever
//! appended: a key that is already present keeps its value.

use std::sync::Arc;

use http::Uri;
use regex::{Regex, RegexBuilder};
use tracing::debug;

use crate::carrier::{Carrier, Extractor};
use crate::constants::{
    REQUEST_CONTEXT_HEADER, REQUEST_CONTEXT_SOURCE_KEY, REQUEST_CONTEXT_TARGET_KEY,
};
use crate::errors::CreationError;
use crate::trace_context::{TraceContextResolver, TraceIdentity};

/// Value stored under `key` in a `request-context` header value.
///
/// ```
/// use appinsights_core::correlation_headers::request_context_value;
///
/// let header = "appId=cid-v1:abc, source-ikey=cid-v1:def";
/// assert_eq!(request_context_value(Some(header), "source-ikey"), Some("cid-v1:def".to_string()));
/// assert_eq!(request_context_value(Some(header), "target-ikey"), None);
/// ```
#[must_use]
pub fn request_context_value(header: Option<&str>, key: &str) -> Option<String> {
    header?
        .split(',')
        .filter_map(|entry| entry.split_once('='))
        .find(|(k, _)| k.trim() == key)
        .map(|(_, v)| v.trim().to_string())
}

/// Compiles a host glob: `*` matches anything, every other character is literal.
pub fn compile_exclusion(pattern: &str) -> Result<Regex, CreationError> {
    let expression = format!("^{}$", regex::escape(pattern.trim()).replace(r"\*", ".*"));
    RegexBuilder::new(&expression)
        .case_insensitive(true)
        .build()
        .map_err(|source| CreationError::ExclusionPattern {
            pattern: pattern.to_string(),
            source,
        })
}

fn host_of(url: &str) -> Option<String> {
    let uri = url.parse::<Uri>().ok()?;
    uri.host().map(str::to_string)
}

pub struct CorrelationHeaderInjector {
    /// `cid-v1:<app id>`, unknown until the lookup completes.
    correlation_id: Option<String>,
    excluded_domains: Vec<Regex>,
    resolver: Arc<TraceContextResolver>,
}

impl CorrelationHeaderInjector {
    pub fn new(
        correlation_id: Option<String>,
        excluded_domains: &[String],
        resolver: Arc<TraceContextResolver>,
    ) -> Result<Self, CreationError> {
        let excluded_domains = excluded_domains
            .iter()
            .map(|pattern| compile_exclusion(pattern))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            correlation_id: correlation_id.filter(|id| !id.is_empty()),
            excluded_domains,
            resolver,
        })
    }

    /// A copy of this injector that advertises `correlation_id`.
    #[must_use]
    pub fn with_correlation_id(&self, correlation_id: String) -> Self {
        Self {
            correlation_id: Some(correlation_id).filter(|id| !id.is_empty()),
            excluded_domains: self.excluded_domains.clone(),
            resolver: Arc::clone(&self.resolver),
        }
    }

    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    #[must_use]
    pub fn resolver(&self) -> &TraceContextResolver {
        &self.resolver
    }

    /// Whether a call to `url` may carry correlation headers.
    ///
    /// Urls without a recognizable host are allowed.
    #[must_use]
    pub fn can_include_correlation_header(&self, url: &str) -> bool {
        if self.excluded_domains.is_empty() {
            return true;
        }
        let Some(host) = host_of(url) else {
            debug!("Could not determine host of {url:?}, allowing correlation headers");
            return true;
        };
        !self
            .excluded_domains
            .iter()
            .any(|pattern| pattern.is_match(&host))
    }

    /// Writes the identity of an outgoing call and `source-ikey`.
    ///
    /// Returns `false` without touching `carrier` when `url` is excluded.
    pub fn inject_outgoing(
        &self,
        url: &str,
        identity: &TraceIdentity,
        carrier: &mut dyn Carrier,
    ) -> bool {
        if !self.can_include_correlation_header(url) {
            debug!("Correlation headers suppressed for excluded target {url:?}");
            return false;
        }
        self.add_request_context(carrier, REQUEST_CONTEXT_SOURCE_KEY);
        self.resolver.inject(identity, carrier);
        true
    }

    /// Writes `target-ikey` onto the response of a tracked incoming request,
    /// letting the caller recognise a tracked component.
    pub fn inject_response(&self, carrier: &mut dyn Carrier) {
        self.add_request_context(carrier, REQUEST_CONTEXT_TARGET_KEY);
    }

    fn add_request_context(&self, carrier: &mut dyn Carrier, key: &str) {
        let Some(correlation_id) = self.correlation_id.as_deref() else {
            return;
        };

        let entry = format!("{key}={correlation_id}");
        let value = match carrier.get(REQUEST_CONTEXT_HEADER).map(str::trim) {
            Some(current) if !current.is_empty() => {
                if request_context_value(Some(current), key).is_some() {
                    return;
                }
                format!("{current},{entry}")
            }
            _ => entry,
        };
        carrier.set(REQUEST_CONTEXT_HEADER, value);
    }
}

/// Reads the callee's correlation id off a response.
#[must_use]
pub fn target_correlation_id(response_headers: &dyn Extractor) -> Option<String> {
    request_context_value(
        response_headers.get(REQUEST_CONTEXT_HEADER),
        REQUEST_CONTEXT_TARGET_KEY,
    )
    .filter(|id| !id.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const CID: &str = "cid-v1:1234";

    fn injector(excluded: &[&str]) -> CorrelationHeaderInjector {
        let excluded: Vec<String> = excluded.iter().map(|s| (*s).to_string()).collect();
        CorrelationHeaderInjector::new(
            Some(CID.to_string()),
            &excluded,
            Arc::new(TraceContextResolver::new(true)),
        )
        .expect("valid patterns")
    }

    #[test]
    fn wildcard_pattern_excludes_subdomains() {
        let injector = injector(&["*.domain.com"]);

        assert!(!injector.can_include_correlation_header("https://excluded.domain.com/path"));
        assert!(injector.can_include_correlation_header("https://bing.com/search?q=test"));
        assert!(injector.can_include_correlation_header("https://domain.com.evil.net/"));
    }

    #[test]
    fn dots_are_literal() {
        let injector = injector(&["*.core.windows.net"]);

        assert!(!injector.can_include_correlation_header("https://account.blob.core.windows.net/"));
        assert!(injector.can_include_correlation_header("https://account.blob.corexwindows.net/"));
    }

    #[test]
    fn unparseable_url_is_allowed() {
        let injector = injector(&["*"]);
        assert!(injector.can_include_correlation_header("not a url"));
        assert!(!injector.can_include_correlation_header("http://anything/"));
    }

    #[test]
    fn creates_request_context_when_absent() {
        let injector = injector(&[]);
        let identity = injector.resolver().child_of(None);
        let mut headers = HashMap::new();

        assert!(injector.inject_outgoing("http://bing.com/", &identity, &mut headers));

        assert_eq!(
            Extractor::get(&headers, "request-context"),
            Some("source-ikey=cid-v1:1234")
        );
        assert!(Extractor::get(&headers, "traceparent").is_some());
        assert!(Extractor::get(&headers, "request-id").is_some());
    }

    #[test]
    fn appends_to_existing_request_context() {
        let injector = injector(&[]);
        let mut headers = HashMap::new();
        headers.insert("request-context".to_string(), "appId=other".to_string());

        injector.inject_response(&mut headers);
        injector.inject_response(&mut headers);

        assert_eq!(
            Extractor::get(&headers, "request-context"),
            Some("appId=other,target-ikey=cid-v1:1234")
        );
    }

    #[test]
    fn never_overwrites_existing_source_entry() {
        let injector = injector(&[]);
        let identity = injector.resolver().child_of(None);
        let mut headers = HashMap::new();
        headers.insert(
            "request-context".to_string(),
            "source-ikey=cid-v1:someone-else".to_string(),
        );

        injector.inject_outgoing("http://bing.com/", &identity, &mut headers);

        assert_eq!(
            Extractor::get(&headers, "request-context"),
            Some("source-ikey=cid-v1:someone-else")
        );
    }

    #[test]
    fn excluded_target_gets_no_headers() {
        let injector = injector(&["*.domain.com"]);
        let identity = injector.resolver().child_of(None);
        let mut headers = HashMap::new();

        assert!(!injector.inject_outgoing("http://excluded.domain.com/", &identity, &mut headers));
        assert!(headers.is_empty());
    }

    #[test]
    fn unknown_correlation_id_skips_request_context() {
        let injector = CorrelationHeaderInjector::new(
            None,
            &[],
            Arc::new(TraceContextResolver::new(true)),
        )
        .expect("valid");
        let identity = injector.resolver().child_of(None);
        let mut headers = HashMap::new();

        injector.inject_outgoing("http://bing.com/", &identity, &mut headers);

        assert!(Extractor::get(&headers, "request-context").is_none());
        assert!(Extractor::get(&headers, "traceparent").is_some());

        let injector = injector.with_correlation_id(CID.to_string());
        assert_eq!(injector.correlation_id(), Some(CID));
    }

    #[test]
    fn reads_target_from_response() {
        let mut headers = HashMap::new();
        headers.insert(
            "request-context".to_string(),
            "target-ikey=cid-v1:callee, appId=x".to_string(),
        );

        assert_eq!(target_correlation_id(&headers), Some("cid-v1:callee".to_string()));
        assert_eq!(target_correlation_id(&HashMap::<String, String>::new()), None);
    }
}
