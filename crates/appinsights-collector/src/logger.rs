// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log formatting for the SDK's own diagnostics.
//!
//! Every line names the SDK, the cloud role when one is configured, and the
//! module that logged it, so it can be told apart from the host application's
//! output:
//!
//! ```text
//! APPLICATIONINSIGHTS(checkout) | WARN | incoming | Ignoring cookie "ai_user": malformed percent-encoding
//! APPLICATIONINSIGHTS | ERROR | batch_processor | export{batch=12} > ship: Failed to export 12 envelopes
//! ```

use std::fmt;

use anyhow::{anyhow, Context};
use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

pub const LOG_PREFIX: &str = "APPLICATIONINSIGHTS";

#[derive(Debug, Clone, Default)]
pub struct Formatter {
    cloud_role: Option<String>,
}

impl Formatter {
    #[must_use]
    pub fn new(cloud_role: Option<String>) -> Self {
        Self {
            cloud_role: cloud_role.filter(|role| !role.is_empty()),
        }
    }

    /// `APPLICATIONINSIGHTS` or `APPLICATIONINSIGHTS(<role>)`.
    #[must_use]
    pub fn prefix(&self) -> String {
        match &self.cloud_role {
            Some(role) => format!("{LOG_PREFIX}({role})"),
            None => LOG_PREFIX.to_string(),
        }
    }
}

/// Last path segment of an event target, `exporter` for
/// `appinsights_collector::exporter`.
fn component(target: &str) -> &str {
    target.rsplit("::").next().unwrap_or(target)
}

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        write!(
            writer,
            "{} | {} | {} | ",
            self.prefix(),
            metadata.level(),
            component(metadata.target())
        )?;

        if let Some(scope) = ctx.event_scope() {
            let mut separator = "";
            for span in scope.from_root() {
                write!(writer, "{separator}{}", span.name())?;
                if let Some(fields) = span.extensions().get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                separator = " > ";
            }
            if !separator.is_empty() {
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// The filter directive for `log_level`; the HTTP stack stays quiet.
#[must_use]
pub fn env_filter_directive(log_level: &str) -> String {
    format!("h2=off,hyper=off,reqwest=off,rustls=off,{log_level}")
}

/// Installs the global subscriber writing prefixed lines to stdout, at
/// `config.log_level` and labelled with the cloud role.
///
/// Fails when the level is not a valid filter or when the process already has
/// a global subscriber.
pub fn init_subscriber(config: &Config) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(env_filter_directive(&config.log_level))
        .with_context(|| format!("could not parse log level {:?}", config.log_level))?;

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .event_format(Formatter::new(config.cloud_role_name.clone()))
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow!("setting default subscriber failed: {e}"))
}
