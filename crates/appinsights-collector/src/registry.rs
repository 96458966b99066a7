// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Collector lifecycle.
//!
//! A [`Registry`] allows one running [`Collector`] at a time. The collector is
//! an explicit handle: servers, clients and application code receive the
//! `Arc<Collector>` (or its [`TelemetryClient`]) instead of reaching for a
//! global.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use appinsights_core::batch_processor::{BatchProcessor, Exporter};
use appinsights_core::statsbeat::{StatsbeatNetworkCounters, StatsbeatResource};
use appinsights_core::util::now_ms;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::client::TelemetryClient;
use crate::config::Config;
use crate::correlation_id::CorrelationIdManager;
use crate::errors::RegistryError;
use crate::exporter::HttpExporter;
use crate::interceptor::{IncomingRequestTracker, OutgoingRequestTracker};

#[derive(Debug, Default)]
pub struct Registry {
    active: AtomicBool,
}

impl Registry {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Starts a collector exporting to the configured ingestion endpoint.
    pub fn start(self: &Arc<Self>, config: Config) -> Result<Arc<Collector>, RegistryError> {
        let statsbeat = network_counters(&config);
        let exporter = Arc::new(HttpExporter::new(
            &config.ingestion_endpoint,
            config.http_timeout(),
            statsbeat.clone(),
        )?);
        self.launch(config, exporter, statsbeat)
    }

    /// Starts a collector shipping application telemetry and statsbeat
    /// through `exporter`.
    ///
    /// Fails with [`RegistryError::AlreadyStarted`] while another collector
    /// from this registry is running. Must be called from within a tokio
    /// runtime.
    pub fn start_with_exporter(
        self: &Arc<Self>,
        config: Config,
        exporter: Arc<dyn Exporter>,
    ) -> Result<Arc<Collector>, RegistryError> {
        let statsbeat = network_counters(&config);
        self.launch(config, exporter, statsbeat)
    }

    fn launch(
        self: &Arc<Self>,
        config: Config,
        exporter: Arc<dyn Exporter>,
        statsbeat: Option<Arc<StatsbeatNetworkCounters>>,
    ) -> Result<Arc<Collector>, RegistryError> {
        let runtime = Handle::try_current().map_err(|_| RegistryError::NoRuntime)?;
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RegistryError::AlreadyStarted);
        }

        match Collector::build(Arc::clone(self), config, exporter, statsbeat) {
            Ok(collector) => {
                let collector = Arc::new(collector);
                collector.spawn_loops(&runtime);
                info!("Collector started");
                Ok(collector)
            }
            Err(e) => {
                self.release();
                Err(e)
            }
        }
    }

    fn release(&self) {
        self.active.store(false, Ordering::Release);
    }
}

/// A running collector.
pub struct Collector {
    registry: Arc<Registry>,
    config: Config,
    client: Arc<TelemetryClient>,
    statsbeat: Option<Arc<StatsbeatNetworkCounters>>,
    statsbeat_sink: Option<BatchProcessor>,
    correlation_ids: Arc<CorrelationIdManager>,
    cancel_token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shut_down: AtomicBool,
    released: AtomicBool,
}

impl Collector {
    fn build(
        registry: Arc<Registry>,
        config: Config,
        exporter: Arc<dyn Exporter>,
        statsbeat: Option<Arc<StatsbeatNetworkCounters>>,
    ) -> Result<Self, RegistryError> {
        let client = Arc::new(TelemetryClient::new(
            &config,
            BatchProcessor::new(config.batch_config(), Arc::clone(&exporter)),
        )?);
        let statsbeat_sink = statsbeat
            .is_some()
            .then(|| BatchProcessor::new(config.batch_config(), exporter));

        Ok(Self {
            correlation_ids: Arc::new(CorrelationIdManager::from_config(&config)?),
            registry,
            config,
            client,
            statsbeat,
            statsbeat_sink,
            cancel_token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
            released: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn client(&self) -> &Arc<TelemetryClient> {
        &self.client
    }

    /// Network counters for an exporter built outside the collector.
    #[must_use]
    pub fn statsbeat(&self) -> Option<&Arc<StatsbeatNetworkCounters>> {
        self.statsbeat.as_ref()
    }

    #[must_use]
    pub fn correlation_ids(&self) -> &Arc<CorrelationIdManager> {
        &self.correlation_ids
    }

    #[must_use]
    pub fn incoming_tracker(&self) -> IncomingRequestTracker {
        IncomingRequestTracker::new(Arc::clone(&self.client))
    }

    #[must_use]
    pub fn outgoing_tracker(&self) -> OutgoingRequestTracker {
        OutgoingRequestTracker::new(Arc::clone(&self.client))
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.shut_down.load(Ordering::Acquire)
    }

    fn spawn_loops(&self, runtime: &Handle) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);

        tasks.push(runtime.spawn(resolve_correlation_id(
            Arc::clone(&self.client),
            Arc::clone(&self.correlation_ids),
            self.cancel_token.clone(),
        )));

        let client = Arc::clone(&self.client);
        tasks.push(runtime.spawn(every(
            Duration::from_millis(self.config.metrics_collection_interval_ms),
            false,
            self.cancel_token.clone(),
            move || {
                let points = client.metrics().collect(now_ms());
                client.track_metric_points(&points);
            },
        )));

        if let (Some(statsbeat), Some(sink)) = (self.statsbeat.as_ref(), self.statsbeat_sink.as_ref()) {
            let (counters, short_sink) = (Arc::clone(statsbeat), sink.clone());
            tasks.push(runtime.spawn(every(
                Duration::from_millis(self.config.statsbeat_short_interval_ms),
                false,
                self.cancel_token.clone(),
                move || {
                    let time_ms = now_ms();
                    for point in counters.collect_network(time_ms) {
                        short_sink.send(point.to_envelope(time_ms));
                    }
                },
            )));

            let (counters, long_sink) = (Arc::clone(statsbeat), sink.clone());
            tasks.push(runtime.spawn(every(
                Duration::from_millis(self.config.statsbeat_long_interval_ms),
                true,
                self.cancel_token.clone(),
                move || {
                    let time_ms = now_ms();
                    for point in counters.collect_attach() {
                        long_sink.send(point.to_envelope(time_ms));
                    }
                },
            )));
        }
    }

    /// Stops every loop, then flushes whatever is buffered. Only the first
    /// call does anything; afterwards the registry accepts a new collector.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("Shutting down collector");
        self.cancel_token.cancel();
        self.correlation_ids.shutdown();

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                error!("Collector task failed: {e}");
            }
        }

        let points = self.client.metrics().collect(now_ms());
        self.client.track_metric_points(&points);
        self.client.batch_processor().shutdown().await;
        if let Some(sink) = self.statsbeat_sink.as_ref() {
            sink.shutdown().await;
        }
        self.release();
        info!("Collector stopped");
    }

    fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.registry.release();
        }
    }
}

impl Drop for Collector {
    /// A collector dropped without `shutdown` stops its loops and frees the
    /// registry. Buffered telemetry is not flushed.
    fn drop(&mut self) {
        if !self.released.load(Ordering::Acquire) {
            debug!("Collector dropped without shutdown");
        }
        self.cancel_token.cancel();
        self.correlation_ids.shutdown();
        self.release();
    }
}

/// Runs `tick` every `period` until cancelled. The first run happens
/// immediately when `run_now` is set, after one period otherwise.
async fn every(
    period: Duration,
    run_now: bool,
    cancel_token: CancellationToken,
    mut tick: impl FnMut() + Send + 'static,
) {
    let period = period.max(Duration::from_millis(1));
    let start = if run_now {
        Instant::now()
    } else {
        Instant::now() + period
    };
    let mut ticker = interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => tick(),
            () = cancel_token.cancelled() => break,
        }
    }
}

async fn resolve_correlation_id(
    client: Arc<TelemetryClient>,
    correlation_ids: Arc<CorrelationIdManager>,
    cancel_token: CancellationToken,
) {
    let ikey = client.instrumentation_key().to_string();
    tokio::select! {
        outcome = correlation_ids.query(&ikey) => match outcome {
            Ok(correlation_id) => {
                debug!("Advertising correlation id {correlation_id}");
                client.set_correlation_id(correlation_id);
            }
            Err(e) => error!("Correlation headers will not carry a correlation id: {e}"),
        },
        () = cancel_token.cancelled() => {}
    }
}

fn network_counters(config: &Config) -> Option<Arc<StatsbeatNetworkCounters>> {
    if config.disable_statsbeat {
        return None;
    }
    let resource = StatsbeatResource {
        resource_provider: resource_provider().to_string(),
        resource_provider_id: config.cloud_role_name.clone().unwrap_or_default(),
        attach: "Manual".to_string(),
        customer_ikey: config.instrumentation_key.clone(),
        runtime_version: option_env!("CARGO_PKG_RUST_VERSION")
            .unwrap_or_default()
            .to_string(),
        os: std::env::consts::OS.to_string(),
        language: "rust".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        features: 0,
        instrumentations: 0,
    };
    Some(Arc::new(StatsbeatNetworkCounters::new(resource)))
}

/// Where the process runs, as reported in statsbeat.
fn resource_provider() -> &'static str {
    let set = |name: &str| std::env::var(name).is_ok_and(|v| !v.is_empty());
    if set("FUNCTIONS_WORKER_RUNTIME") {
        "functions"
    } else if set("WEBSITE_SITE_NAME") {
        "appsvc"
    } else if set("AKS_ARM_NAMESPACE_ID") {
        "aks"
    } else {
        "unknown"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use appinsights_core::batch_processor::ExportResult;
    use appinsights_core::envelope::{Envelope, TelemetryData};
    use appinsights_core::metrics::RequestDimensions;
    use async_trait::async_trait;

    #[derive(Default)]
    struct CapturingExporter {
        envelopes: Mutex<Vec<Envelope>>,
    }

    #[async_trait]
    impl Exporter for CapturingExporter {
        async fn export(&self, batch: Vec<Envelope>) -> ExportResult {
            self.envelopes.lock().unwrap().extend(batch);
            ExportResult::Success
        }
    }

    fn config() -> Config {
        Config {
            instrumentation_key: "ikey".to_string(),
            profile_query_endpoint: "http://127.0.0.1:9".to_string(),
            correlation_id_max_retries: 0,
            disable_statsbeat: true,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn second_start_is_rejected_until_shutdown() {
        let registry = Registry::new();
        let exporter = Arc::new(CapturingExporter::default());

        let collector = registry
            .start_with_exporter(config(), exporter.clone())
            .expect("first start");
        assert!(registry.is_active());
        assert!(matches!(
            registry.start_with_exporter(config(), exporter.clone()),
            Err(RegistryError::AlreadyStarted)
        ));

        collector.shutdown().await;
        assert!(!registry.is_active());
        assert!(!collector.is_running());

        let again = registry
            .start_with_exporter(config(), exporter)
            .expect("start after shutdown");
        again.shutdown().await;
    }

    #[tokio::test]
    async fn dropped_collector_frees_the_registry() {
        let registry = Registry::new();
        let exporter = Arc::new(CapturingExporter::default());

        let collector = registry
            .start_with_exporter(config(), exporter.clone())
            .expect("first start");
        drop(collector);

        assert!(!registry.is_active());
        let again = registry
            .start_with_exporter(config(), exporter)
            .expect("start after drop");
        again.shutdown().await;
        drop(again);
        assert!(!registry.is_active());
    }

    #[tokio::test]
    async fn drop_after_shutdown_does_not_release_a_newer_collector() {
        let registry = Registry::new();
        let exporter = Arc::new(CapturingExporter::default());

        let first = registry
            .start_with_exporter(config(), exporter.clone())
            .expect("first start");
        first.shutdown().await;
        let second = registry
            .start_with_exporter(config(), exporter)
            .expect("second start");

        drop(first);

        assert!(registry.is_active());
        second.shutdown().await;
    }

    #[test]
    fn start_outside_runtime_fails() {
        let registry = Registry::new();
        let exporter = Arc::new(CapturingExporter::default());

        assert!(matches!(
            registry.start_with_exporter(config(), exporter),
            Err(RegistryError::NoRuntime)
        ));
        assert!(!registry.is_active());
    }

    #[tokio::test]
    async fn metrics_loop_emits_on_interval() {
        let registry = Registry::new();
        let exporter = Arc::new(CapturingExporter::default());
        let config = Config {
            metrics_collection_interval_ms: 50,
            ..config()
        };
        let collector = registry
            .start_with_exporter(config, exporter.clone())
            .expect("start");

        collector.client().metrics().count_request(
            15.0,
            RequestDimensions {
                success: true,
                result_code: "200".to_string(),
                ..RequestDimensions::default()
            },
        );
        tokio::time::sleep(Duration::from_millis(120)).await;
        collector.client().flush().await;

        let metrics = exporter
            .envelopes
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e.data, TelemetryData::Metric(_)))
            .count();
        assert_eq!(metrics, 1);
        collector.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_flushes_buffered_telemetry() {
        let registry = Registry::new();
        let exporter = Arc::new(CapturingExporter::default());
        let collector = registry
            .start_with_exporter(config(), exporter.clone())
            .expect("start");

        collector
            .client()
            .track_event("started", Default::default());
        collector.shutdown().await;

        assert_eq!(exporter.envelopes.lock().unwrap().len(), 1);
    }
}
