// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Distributed trace identity resolution.
//!
//! Three header schemes can carry the identity of an operation into a process:
//!
//! - **W3C**: `traceparent` + `tracestate`
//! - **Legacy request id**: `request-id`, hierarchical `|root.span.` or a bare token
//! - **Oldest legacy**: `x-ms-request-root-id` + `x-ms-request-id`
//!
//! Exactly one scheme is used per request, chosen by strict precedence
//! (W3C > request id > oldest legacy > nothing). Each scheme is a
//! [`Propagator`]; the [`TraceContextResolver`] holds them in precedence order
//! and stops at the first one that extracts a context. The oldest-legacy
//! propagator always answers, falling back to a freshly generated identity, so
//! resolution itself never fails.
//!
//! # Identity derivation
//!
//! ```text
//! W3C enabled, traceparent or tracestate present
//!     operation_id = traceId
//!     parent_id    = |traceId.incomingSpanId.
//!     request_id   = |traceId.newSpanId.
//! request-id present
//!     W3C enabled:  traceparent synthesized from the legacy id (see Traceparent::from_legacy_request_id)
//!     W3C disabled: request_id = child of request-id, operation_id = its root
//! otherwise
//!     x-ms-request-root-id / x-ms-request-id, or a generated root
//! ```
//!
//! A caller-supplied request id overrides the derived one last.

use tracing::debug;

use crate::carrier::{Carrier, Extractor};
use crate::constants::{
    CORRELATION_CONTEXT_HEADER, PARENT_ID_HEADER, REQUEST_ID_HEADER, ROOT_ID_HEADER,
    TRACEPARENT_HEADER, TRACESTATE_HEADER,
};

pub mod request_id;
pub mod traceparent;
pub mod tracestate;

use request_id::{generate_request_id, root_id};
use traceparent::Traceparent;
use tracestate::Tracestate;

/// Which header scheme produced an identity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResolutionScheme {
    W3c,
    LegacyRequestId,
    LegacyRootParent,
    #[default]
    Generated,
}

/// The resolved identity of one operation hop.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TraceIdentity {
    pub scheme: ResolutionScheme,
    /// Trace-wide id shared by every hop.
    pub operation_id: String,
    /// Id of the immediate caller, if any.
    pub parent_id: Option<String>,
    /// Id of this hop.
    pub request_id: String,
    /// Upstream legacy root kept for backward compatible correlation.
    pub legacy_root_id: Option<String>,
    pub traceparent: Option<Traceparent>,
    pub tracestate: Option<Tracestate>,
    pub correlation_context: Option<String>,
}

impl TraceIdentity {
    /// Adopts a W3C context: the trace id becomes the operation id and a new
    /// span id is minted for this hop.
    fn from_traceparent(
        mut traceparent: Traceparent,
        tracestate: Option<Tracestate>,
        scheme: ResolutionScheme,
    ) -> Self {
        let operation_id = traceparent.trace_id.clone();
        let legacy_root_id = traceparent.legacy_root_id.clone();
        let parent_id = traceparent.parent_id.clone();
        traceparent.update_span_id();
        let request_id = traceparent.back_compat_request_id();

        Self {
            scheme,
            operation_id,
            parent_id,
            request_id,
            legacy_root_id,
            traceparent: Some(traceparent),
            tracestate,
            correlation_context: None,
        }
    }

    fn from_legacy_request_id(request_id: String, parent_id: Option<String>, scheme: ResolutionScheme) -> Self {
        Self {
            scheme,
            operation_id: root_id(&request_id).to_string(),
            parent_id,
            request_id,
            ..Self::default()
        }
    }
}

/// Reads an identity from, and writes an identity to, a header carrier.
pub trait Propagator {
    /// Returns an identity when this scheme's headers are present.
    fn extract(&self, carrier: &dyn Extractor) -> Option<TraceIdentity>;

    /// Writes this scheme's headers for `identity`, leaving headers that are
    /// already set untouched.
    fn inject(&self, identity: &TraceIdentity, carrier: &mut dyn Carrier);
}

fn header<'a>(carrier: &'a dyn Extractor, key: &str) -> Option<&'a str> {
    carrier.get(key).filter(|value| !value.trim().is_empty())
}

fn set_if_absent(carrier: &mut dyn Carrier, key: &str, value: String) {
    if carrier.get(key).filter(|v| !v.trim().is_empty()).is_none() {
        carrier.set(key, value);
    }
}

/// `traceparent` / `tracestate`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TraceContextPropagator;

impl Propagator for TraceContextPropagator {
    fn extract(&self, carrier: &dyn Extractor) -> Option<TraceIdentity> {
        let traceparent_header = header(carrier, TRACEPARENT_HEADER);
        let tracestate_header = header(carrier, TRACESTATE_HEADER);
        if traceparent_header.is_none() && tracestate_header.is_none() {
            return None;
        }

        let (traceparent, tracestate) = match traceparent_header {
            Some(value) => (
                Traceparent::parse(value),
                tracestate_header.and_then(Tracestate::parse),
            ),
            None => {
                debug!("tracestate received without traceparent, discarding it");
                (Traceparent::new_root(), None)
            }
        };

        Some(TraceIdentity::from_traceparent(
            traceparent,
            tracestate,
            ResolutionScheme::W3c,
        ))
    }

    fn inject(&self, identity: &TraceIdentity, carrier: &mut dyn Carrier) {
        let Some(traceparent) = identity.traceparent.as_ref() else {
            return;
        };
        set_if_absent(carrier, TRACEPARENT_HEADER, traceparent.to_string());
        if let Some(tracestate) = identity.tracestate.as_ref() {
            set_if_absent(carrier, TRACESTATE_HEADER, tracestate.to_string());
        }
    }
}

/// Legacy `request-id`.
#[derive(Clone, Copy, Debug)]
pub struct RequestIdPropagator {
    pub w3c_enabled: bool,
}

impl Propagator for RequestIdPropagator {
    fn extract(&self, carrier: &dyn Extractor) -> Option<TraceIdentity> {
        let incoming = header(carrier, REQUEST_ID_HEADER)?.trim();

        if self.w3c_enabled {
            return Some(TraceIdentity::from_traceparent(
                Traceparent::from_legacy_request_id(incoming),
                None,
                ResolutionScheme::LegacyRequestId,
            ));
        }

        Some(TraceIdentity::from_legacy_request_id(
            generate_request_id(Some(incoming)),
            Some(incoming.to_string()),
            ResolutionScheme::LegacyRequestId,
        ))
    }

    fn inject(&self, identity: &TraceIdentity, carrier: &mut dyn Carrier) {
        if !identity.request_id.is_empty() {
            set_if_absent(carrier, REQUEST_ID_HEADER, identity.request_id.clone());
        }
    }
}

/// `x-ms-request-root-id` / `x-ms-request-id`, with a generated fallback.
#[derive(Clone, Copy, Debug)]
pub struct LegacyHeaderPropagator {
    pub w3c_enabled: bool,
}

impl Propagator for LegacyHeaderPropagator {
    fn extract(&self, carrier: &dyn Extractor) -> Option<TraceIdentity> {
        let parent_id = header(carrier, PARENT_ID_HEADER).map(str::to_string);
        let root = header(carrier, ROOT_ID_HEADER).map(str::to_string);
        let scheme = if parent_id.is_some() || root.is_some() {
            ResolutionScheme::LegacyRootParent
        } else {
            ResolutionScheme::Generated
        };

        if self.w3c_enabled {
            let mut traceparent = Traceparent::new_root();
            traceparent.legacy_root_id = root.or_else(|| parent_id.clone());
            traceparent.parent_id = parent_id;
            return Some(TraceIdentity::from_traceparent(traceparent, None, scheme));
        }

        let request_id = generate_request_id(root.as_deref().or(parent_id.as_deref()));
        Some(TraceIdentity::from_legacy_request_id(request_id, parent_id, scheme))
    }

    fn inject(&self, identity: &TraceIdentity, carrier: &mut dyn Carrier) {
        if self.w3c_enabled || identity.request_id.is_empty() {
            return;
        }
        set_if_absent(carrier, PARENT_ID_HEADER, identity.request_id.clone());
        set_if_absent(carrier, ROOT_ID_HEADER, identity.operation_id.clone());
    }
}

/// Resolves the identity of incoming requests and derives the identity of
/// outgoing calls.
pub struct TraceContextResolver {
    w3c_enabled: bool,
    /// Precedence order; the first propagator to extract wins.
    propagators: Vec<Box<dyn Propagator + Send + Sync>>,
}

impl TraceContextResolver {
    #[must_use]
    pub fn new(w3c_enabled: bool) -> Self {
        let mut propagators: Vec<Box<dyn Propagator + Send + Sync>> = Vec::with_capacity(3);
        if w3c_enabled {
            propagators.push(Box::new(TraceContextPropagator));
        }
        propagators.push(Box::new(RequestIdPropagator { w3c_enabled }));
        propagators.push(Box::new(LegacyHeaderPropagator { w3c_enabled }));

        Self {
            w3c_enabled,
            propagators,
        }
    }

    #[must_use]
    pub fn w3c_enabled(&self) -> bool {
        self.w3c_enabled
    }

    /// Resolves the identity of an incoming request.
    ///
    /// `carrier` is `None` when the request exposes no headers at all, which
    /// yields a generated identity. `explicit_request_id` is an id the caller
    /// already chose for this request; it overrides the derived request id and
    /// its root becomes the operation id.
    #[must_use]
    pub fn resolve(
        &self,
        carrier: Option<&dyn Extractor>,
        explicit_request_id: Option<&str>,
    ) -> TraceIdentity {
        let mut identity = match carrier {
            Some(carrier) => self.extract(carrier),
            None => self.generated(),
        };

        if let Some(request_id) = explicit_request_id.filter(|id| !id.is_empty()) {
            self.apply_explicit_request_id(&mut identity, request_id);
        }

        identity
    }

    fn extract(&self, carrier: &dyn Extractor) -> TraceIdentity {
        let mut identity = self
            .propagators
            .iter()
            .find_map(|propagator| propagator.extract(carrier))
            .unwrap_or_else(|| self.generated());

        // the oldest scheme predates correlation-context
        if identity.scheme != ResolutionScheme::LegacyRootParent || self.w3c_enabled {
            identity.correlation_context =
                header(carrier, CORRELATION_CONTEXT_HEADER).map(str::to_string);
        }
        identity
    }

    fn generated(&self) -> TraceIdentity {
        if self.w3c_enabled {
            TraceIdentity::from_traceparent(
                Traceparent::new_root(),
                None,
                ResolutionScheme::Generated,
            )
        } else {
            TraceIdentity::from_legacy_request_id(
                generate_request_id(None),
                None,
                ResolutionScheme::Generated,
            )
        }
    }

    fn apply_explicit_request_id(&self, identity: &mut TraceIdentity, request_id: &str) {
        let root = root_id(request_id);
        identity.request_id = request_id.to_string();

        if !self.w3c_enabled || Traceparent::is_valid_trace_id(root) {
            identity.operation_id = root.to_string();
            if let Some(traceparent) = identity.traceparent.as_mut() {
                traceparent.trace_id = root.to_string();
            }
        } else if identity.legacy_root_id.is_none() && !root.is_empty() {
            // the operation id must stay W3C shaped, keep the root for correlation
            identity.legacy_root_id = Some(root.to_string());
        }
    }

    /// The identity of an outgoing call made on behalf of `parent`.
    ///
    /// The child shares the parent's operation id, points at the parent's
    /// request id and carries its own fresh id.
    #[must_use]
    pub fn child_of(&self, parent: Option<&TraceIdentity>) -> TraceIdentity {
        let Some(parent) = parent else {
            return self.generated();
        };

        if self.w3c_enabled {
            let traceparent = match parent.traceparent.as_ref() {
                Some(traceparent) => traceparent.child(),
                None => {
                    let mut traceparent = Traceparent::new_root();
                    if Traceparent::is_valid_trace_id(&parent.operation_id) {
                        traceparent.trace_id = parent.operation_id.clone();
                    }
                    traceparent
                }
            };
            return TraceIdentity {
                scheme: parent.scheme,
                operation_id: traceparent.trace_id.clone(),
                parent_id: Some(parent.request_id.clone()),
                request_id: traceparent.back_compat_request_id(),
                legacy_root_id: parent.legacy_root_id.clone(),
                traceparent: Some(traceparent),
                tracestate: parent.tracestate.clone(),
                correlation_context: parent.correlation_context.clone(),
            };
        }

        let request_id = generate_request_id(Some(&parent.request_id));
        TraceIdentity {
            scheme: parent.scheme,
            operation_id: root_id(&request_id).to_string(),
            parent_id: Some(parent.request_id.clone()),
            request_id,
            legacy_root_id: parent.legacy_root_id.clone(),
            traceparent: None,
            tracestate: None,
            correlation_context: parent.correlation_context.clone(),
        }
    }

    /// Writes every enabled scheme's headers for `identity` into `carrier`.
    pub fn inject(&self, identity: &TraceIdentity, carrier: &mut dyn Carrier) {
        for propagator in &self.propagators {
            propagator.inject(identity, carrier);
        }
        if let Some(correlation_context) = identity.correlation_context.as_ref() {
            set_if_absent(carrier, CORRELATION_CONTEXT_HEADER, correlation_context.clone());
        }
    }
}
