// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory batching in front of an [`Exporter`].
//!
//! `send` never blocks and never awaits. When the buffer reaches the batch size
//! it is swapped for an empty one under the lock and shipped from a spawned
//! task; otherwise a one-shot timer is armed so a partial batch still leaves
//! within the batch interval. Items sent while an export is in flight land in
//! the fresh buffer. Failed exports are logged and not retried here.

use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, warn};

use crate::envelope::Envelope;

pub const DEFAULT_MAX_BATCH_SIZE: usize = 250;
pub const DEFAULT_MAX_BATCH_INTERVAL: Duration = Duration::from_millis(15_000);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportResult {
    Success,
    Failed,
}

/// Ships a batch of envelopes somewhere.
#[async_trait]
pub trait Exporter: Send + Sync {
    async fn export(&self, batch: Vec<Envelope>) -> ExportResult;
}

/// Accepts finished telemetry. Delivery problems are only ever logged.
pub trait TelemetrySink: Send + Sync {
    fn send(&self, envelope: Envelope);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    pub max_batch_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_batch_interval: DEFAULT_MAX_BATCH_INTERVAL,
        }
    }
}

#[derive(Default)]
struct State {
    buffer: Vec<Envelope>,
    /// The armed timer and its generation.
    timer: Option<(u64, AbortHandle)>,
    timer_generation: u64,
    in_flight: Vec<JoinHandle<()>>,
}

struct Inner {
    config: BatchConfig,
    exporter: Arc<dyn Exporter>,
    state: Mutex<State>,
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hands the whole buffer to the exporter. Must be called with the lock
    /// held so the swap is atomic with respect to `send`.
    fn trigger_send(&self, state: &mut State, runtime: &Handle) {
        if let Some((_, timer)) = state.timer.take() {
            timer.abort();
        }
        let batch = std::mem::take(&mut state.buffer);
        if batch.is_empty() {
            return;
        }

        debug!("Exporting batch of {} envelopes", batch.len());
        let exporter = Arc::clone(&self.exporter);
        state.in_flight.retain(|task| !task.is_finished());
        state.in_flight.push(runtime.spawn(async move {
            export(exporter.as_ref(), batch).await;
        }));
    }

    /// A timer that lost the race against a flush or a newer timer does
    /// nothing.
    fn timer_fired(&self, generation: u64) {
        let Ok(runtime) = Handle::try_current() else {
            return;
        };
        let mut state = self.lock();
        if !matches!(state.timer, Some((armed, _)) if armed == generation) {
            debug!("Ignoring stale batch timer {generation}");
            return;
        }
        state.timer = None;
        self.trigger_send(&mut state, &runtime);
    }
}

async fn export(exporter: &dyn Exporter, batch: Vec<Envelope>) {
    let size = batch.len();
    match exporter.export(batch).await {
        ExportResult::Success => debug!("Exported {size} envelopes"),
        ExportResult::Failed => error!("Failed to export {size} envelopes"),
    }
}

/// Buffers envelopes and exports them in batches.
#[derive(Clone)]
pub struct BatchProcessor {
    inner: Arc<Inner>,
}

impl BatchProcessor {
    #[must_use]
    pub fn new(config: BatchConfig, exporter: Arc<dyn Exporter>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config: BatchConfig {
                    max_batch_size: config.max_batch_size.max(1),
                    ..config
                },
                exporter,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Enqueues one envelope.
    ///
    /// Reaching the batch size exports immediately; otherwise the flush timer
    /// is armed if it is not already. Outside a tokio runtime the envelope
    /// stays buffered until the next [`flush`](Self::flush), keeping at most
    /// one batch worth of the newest items.
    pub fn send(&self, envelope: Envelope) {
        let mut state = self.inner.lock();
        state.buffer.push(envelope);

        let Ok(runtime) = Handle::try_current() else {
            let max = self.inner.config.max_batch_size;
            if state.buffer.len() > max {
                let excess = state.buffer.len() - max;
                state.buffer.drain(..excess);
                warn!("No async runtime available, dropped {excess} oldest buffered envelopes");
            } else {
                debug!("No async runtime available, telemetry stays buffered");
            }
            return;
        };

        if state.buffer.len() >= self.inner.config.max_batch_size {
            self.inner.trigger_send(&mut state, &runtime);
        } else if state.timer.is_none() {
            state.timer_generation += 1;
            let generation = state.timer_generation;
            let weak: Weak<Inner> = Arc::downgrade(&self.inner);
            let interval = self.inner.config.max_batch_interval;
            let timer = runtime.spawn(async move {
                tokio::time::sleep(interval).await;
                if let Some(inner) = weak.upgrade() {
                    inner.timer_fired(generation);
                }
            });
            state.timer = Some((generation, timer.abort_handle()));
        }
    }

    /// Exports whatever is buffered and waits for every export started so far.
    pub async fn flush(&self) {
        let (batch, in_flight) = {
            let mut state = self.inner.lock();
            if let Some((_, timer)) = state.timer.take() {
                timer.abort();
            }
            (
                std::mem::take(&mut state.buffer),
                std::mem::take(&mut state.in_flight),
            )
        };

        if !batch.is_empty() {
            export(self.inner.exporter.as_ref(), batch).await;
        }
        for task in in_flight {
            if let Err(e) = task.await {
                error!("Export task failed: {e}");
            }
        }
    }

    /// Stops the timer and flushes best effort.
    pub async fn shutdown(&self) {
        debug!("Shutting down batch processor");
        self.flush().await;
    }

    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.inner.lock().buffer.len()
    }

    #[must_use]
    pub fn timer_armed(&self) -> bool {
        self.inner.lock().timer.is_some()
    }

    #[must_use]
    pub fn config(&self) -> BatchConfig {
        self.inner.config
    }
}

impl TelemetrySink for BatchProcessor {
    fn send(&self, envelope: Envelope) {
        BatchProcessor::send(self, envelope);
    }
}
