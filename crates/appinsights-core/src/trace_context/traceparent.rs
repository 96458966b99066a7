// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! W3C `traceparent` value.
//!
//! Parsing never fails. Pieces of an incoming header that do not validate are
//! replaced by freshly generated ones, so a caller sending garbage still gets a
//! well-formed trace instead of no trace at all:
//!
//! | input problem                              | repair                          |
//! |--------------------------------------------|---------------------------------|
//! | several comma-joined values, < 4 parts     | fresh trace and span ids        |
//! | version not 2 hex chars                    | version `00`, fresh trace id    |
//! | version `00` with trailing parts           | fresh trace and span ids        |
//! | version `ff`                               | fresh trace and span ids        |
//! | flags not 2 hex chars                      | flags `01`, fresh trace id      |
//! | trace id invalid or all zeros              | fresh trace id                  |
//! | span id invalid or all zeros               | fresh trace and span ids        |

use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;
use tracing::debug;

use crate::trace_context::request_id::root_id;
use crate::util::{is_lower_hex_id, new_span_id, new_trace_id};

pub const DEFAULT_VERSION: &str = "00";
pub const DEFAULT_TRACE_FLAGS: &str = "01";

lazy_static! {
    static ref TWO_HEX_REGEX: Regex = Regex::new(r"^[0-9a-f]{2}$").expect("failed creating regex");
    static ref KNOWN_VERSION_REGEX: Regex =
        Regex::new(r"^0[0-9a-f]$").expect("failed creating regex");
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Traceparent {
    pub version: String,
    pub trace_id: String,
    pub span_id: String,
    pub trace_flags: String,
    /// Back-compatible id of the hop this value was received from.
    pub parent_id: Option<String>,
    /// An upstream legacy root that could not serve as a W3C trace id.
    pub legacy_root_id: Option<String>,
}

impl Default for Traceparent {
    fn default() -> Self {
        Self::new_root()
    }
}

impl Traceparent {
    /// A brand new trace with no parent.
    #[must_use]
    pub fn new_root() -> Self {
        Self {
            version: DEFAULT_VERSION.to_string(),
            trace_id: new_trace_id(),
            span_id: new_span_id(),
            trace_flags: DEFAULT_TRACE_FLAGS.to_string(),
            parent_id: None,
            legacy_root_id: None,
        }
    }

    /// Parses an incoming `traceparent` header, repairing invalid pieces.
    #[must_use]
    pub fn parse(header: &str) -> Self {
        if header.split(',').count() > 1 {
            debug!("Multiple traceparent values received, starting a new trace");
            return Self::new_root();
        }

        let parts: Vec<&str> = header.trim().split('-').collect();
        if parts.len() < 4 {
            debug!("Malformed traceparent {header:?}, starting a new trace");
            return Self::new_root();
        }

        let mut traceparent = Self {
            version: parts[0].to_string(),
            trace_id: parts[1].to_string(),
            span_id: parts[2].to_string(),
            trace_flags: parts[3].to_string(),
            parent_id: None,
            legacy_root_id: None,
        };

        if !TWO_HEX_REGEX.is_match(&traceparent.version) {
            traceparent.version = DEFAULT_VERSION.to_string();
            traceparent.trace_id = new_trace_id();
        }
        if traceparent.version == DEFAULT_VERSION && parts.len() != 4 {
            traceparent.trace_id = new_trace_id();
            traceparent.span_id = new_span_id();
        }
        if traceparent.version == "ff" {
            traceparent.trace_id = new_trace_id();
            traceparent.span_id = new_span_id();
        }
        if !KNOWN_VERSION_REGEX.is_match(&traceparent.version) {
            traceparent.version = DEFAULT_VERSION.to_string();
        }
        if !TWO_HEX_REGEX.is_match(&traceparent.trace_flags) {
            traceparent.trace_flags = DEFAULT_TRACE_FLAGS.to_string();
            traceparent.trace_id = new_trace_id();
        }
        if !Self::is_valid_trace_id(&traceparent.trace_id) {
            traceparent.trace_id = new_trace_id();
        }
        if !Self::is_valid_span_id(&traceparent.span_id) {
            traceparent.span_id = new_span_id();
            traceparent.trace_id = new_trace_id();
        }

        traceparent.parent_id = Some(traceparent.back_compat_request_id());
        traceparent
    }

    /// Synthesizes a W3C context from a legacy `request-id`.
    ///
    /// When the legacy root is a valid 32 hex id it becomes the trace id.
    /// Otherwise a fresh trace id is minted and the old root is kept as
    /// [`Traceparent::legacy_root_id`] so both generations of ids still line up.
    #[must_use]
    pub fn from_legacy_request_id(request_id: &str) -> Self {
        let root = root_id(request_id);
        let (trace_id, legacy_root_id) = if Self::is_valid_trace_id(root) {
            (root.to_string(), None)
        } else {
            (new_trace_id(), Some(root.to_string()))
        };

        let span_id = last_segment(request_id)
            .filter(|segment| Self::is_valid_span_id(segment))
            .map_or_else(new_span_id, str::to_string);

        Self {
            version: DEFAULT_VERSION.to_string(),
            trace_id,
            span_id,
            trace_flags: DEFAULT_TRACE_FLAGS.to_string(),
            parent_id: Some(request_id.to_string()),
            legacy_root_id,
        }
    }

    /// A context for the next hop of the same trace, with a fresh span id.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            version: self.version.clone(),
            trace_id: self.trace_id.clone(),
            span_id: new_span_id(),
            trace_flags: self.trace_flags.clone(),
            parent_id: Some(self.back_compat_request_id()),
            legacy_root_id: self.legacy_root_id.clone(),
        }
    }

    pub fn update_span_id(&mut self) {
        self.span_id = new_span_id();
    }

    /// The same identity in legacy `request-id` shape, `|trace.span.`.
    #[must_use]
    pub fn back_compat_request_id(&self) -> String {
        format!("|{}.{}.", self.trace_id, self.span_id)
    }

    #[must_use]
    pub fn is_valid_trace_id(id: &str) -> bool {
        is_lower_hex_id(id, 32)
    }

    #[must_use]
    pub fn is_valid_span_id(id: &str) -> bool {
        is_lower_hex_id(id, 16)
    }
}

impl fmt::Display for Traceparent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}",
            self.version, self.trace_id, self.span_id, self.trace_flags
        )
    }
}

/// `|root.a.b.` -> `b`; bare tokens have no segment.
fn last_segment(request_id: &str) -> Option<&str> {
    if !request_id.starts_with('|') {
        return None;
    }
    let body = request_id.trim_end_matches('.');
    body.rfind('.').map(|dot| &body[dot + 1..])
}
