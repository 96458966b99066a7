// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Carrier traits for reading and writing correlation headers.
//!
//! The parsers and the header injector never touch a concrete request type.
//! They go through [`Extractor`] to read headers and [`Injector`] to write them,
//! so any HTTP stack can be plugged in by implementing the two traits for its
//! header container. Implementations are provided for `HashMap<String, String>`
//! and `http::HeaderMap`.
//!
//! All lookups are case-insensitive. Keys are lowercased on write; maps
//! filled elsewhere may hold any casing and are still matched.

use std::collections::HashMap;

use http::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::debug;

/// Write access to a header container.
pub trait Injector {
    /// Sets `key` to `value`, replacing any previous value.
    fn set(&mut self, key: &str, value: String);
}

/// Read access to a header container.
pub trait Extractor {
    /// Returns the value of `key`, if present and textual.
    fn get(&self, key: &str) -> Option<&str>;

    /// All header names present, as stored.
    fn keys(&self) -> Vec<&str>;
}

/// A container that can be both read and written, such as the headers of an
/// outgoing request that is about to be sent.
pub trait Carrier: Extractor + Injector {}

impl<T: Extractor + Injector + ?Sized> Carrier for T {}

impl<S: std::hash::BuildHasher> Injector for HashMap<String, String, S> {
    fn set(&mut self, key: &str, value: String) {
        self.retain(|existing, _| !existing.eq_ignore_ascii_case(key));
        self.insert(key.to_lowercase(), value);
    }
}

impl<S: std::hash::BuildHasher> Extractor for HashMap<String, String, S> {
    fn get(&self, key: &str) -> Option<&str> {
        HashMap::get(self, &key.to_lowercase())
            .or_else(|| {
                self.iter()
                    .find(|(existing, _)| existing.eq_ignore_ascii_case(key))
                    .map(|(_, value)| value)
            })
            .map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        HashMap::keys(self).map(String::as_str).collect()
    }
}

impl Injector for HeaderMap {
    fn set(&mut self, key: &str, value: String) {
        let name = match HeaderName::from_bytes(key.to_lowercase().as_bytes()) {
            Ok(name) => name,
            Err(e) => {
                debug!("Skipping header with invalid name {key:?}: {e}");
                return;
            }
        };
        match HeaderValue::from_str(&value) {
            Ok(value) => {
                self.insert(name, value);
            }
            Err(e) => debug!("Skipping header {key:?} with invalid value: {e}"),
        }
    }
}

impl Extractor for HeaderMap {
    fn get(&self, key: &str) -> Option<&str> {
        HeaderMap::get(self, key.to_lowercase().as_str()).and_then(|v| v.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        HeaderMap::keys(self).map(HeaderName::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_map_get_is_case_insensitive() {
        let mut carrier = HashMap::new();
        carrier.set("Request-Id", "|abc.def.".to_string());

        assert_eq!(Extractor::get(&carrier, "REQUEST-ID"), Some("|abc.def."));
        assert_eq!(Extractor::get(&carrier, "request-id"), Some("|abc.def."));
    }

    #[test]
    fn hash_map_filled_with_mixed_case_keys() {
        let mut carrier = HashMap::new();
        carrier.insert("Host".to_string(), "bing.com".to_string());
        carrier.insert("X-Forwarded-Proto".to_string(), "https".to_string());

        assert_eq!(Extractor::get(&carrier, "host"), Some("bing.com"));
        assert_eq!(Extractor::get(&carrier, "x-forwarded-proto"), Some("https"));

        carrier.set("host", "example.com".to_string());
        assert_eq!(carrier.len(), 2);
        assert_eq!(Extractor::get(&carrier, "HOST"), Some("example.com"));
    }

    #[test]
    fn hash_map_keys() {
        let mut carrier = HashMap::new();
        carrier.set("traceparent", "a".to_string());
        carrier.set("TraceState", "b".to_string());

        let got = Extractor::keys(&carrier);
        assert_eq!(got.len(), 2);
        assert!(got.contains(&"traceparent"));
        assert!(got.contains(&"tracestate"));
    }

    #[test]
    fn header_map_round_trip() {
        let mut carrier = HeaderMap::new();
        carrier.set("Request-Context", "source-ikey=cid-v1:abc".to_string());

        assert_eq!(
            Extractor::get(&carrier, "request-context"),
            Some("source-ikey=cid-v1:abc")
        );
        assert_eq!(Extractor::keys(&carrier), vec!["request-context"]);
    }

    #[test]
    fn header_map_skips_invalid_values() {
        let mut carrier = HeaderMap::new();
        carrier.set("request-id", "bad\nvalue".to_string());
        carrier.set("bad header", "value".to_string());

        assert!(carrier.is_empty());
    }
}
