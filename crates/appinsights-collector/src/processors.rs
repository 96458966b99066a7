// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::panic::{catch_unwind, AssertUnwindSafe};

use appinsights_core::envelope::Envelope;
use appinsights_core::request_parser::{DependencyRecord, RequestRecord};
use tracing::{debug, error};

/// What produced the envelope, when it came from a tracked request or call.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessorContext<'a> {
    pub request: Option<&'a RequestRecord>,
    pub dependency: Option<&'a DependencyRecord>,
}

/// Inspects or rewrites telemetry before it is sent. Returning `false` drops
/// the envelope.
pub trait TelemetryProcessor: Send + Sync {
    fn process(&self, envelope: &mut Envelope, context: &ProcessorContext<'_>) -> bool;
}

impl<F> TelemetryProcessor for F
where
    F: Fn(&mut Envelope, &ProcessorContext<'_>) -> bool + Send + Sync,
{
    fn process(&self, envelope: &mut Envelope, context: &ProcessorContext<'_>) -> bool {
        self(envelope, context)
    }
}

#[derive(Default)]
pub struct ProcessorChain {
    processors: Vec<Box<dyn TelemetryProcessor>>,
}

impl ProcessorChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, processor: Box<dyn TelemetryProcessor>) {
        self.processors.push(processor);
    }

    pub fn clear(&mut self) {
        self.processors.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.processors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// Runs every processor in order and reports whether the envelope should
    /// be sent. A processor that panics is logged and skipped.
    pub fn run(&self, envelope: &mut Envelope, context: &ProcessorContext<'_>) -> bool {
        for (index, processor) in self.processors.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| processor.process(envelope, context))) {
                Ok(true) => {}
                Ok(false) => {
                    debug!("Telemetry processor {index} dropped {}", envelope.name);
                    return false;
                }
                Err(_) => error!("Telemetry processor {index} panicked, skipping it"),
            }
        }
        true
    }
}
