// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Correlation id lookup.
//!
//! The correlation id of an application is `cid-v1:<app id>`, where the app id
//! comes from the profile endpoint. Every caller asking for the same key while
//! a lookup is in flight waits on that one lookup. Successful ids and
//! rejections (4xx) are remembered for the life of the manager; timeouts and
//! exhausted transient failures are not, so a later query tries again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use appinsights_core::constants::CORRELATION_ID_PREFIX;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::errors::{ConfigError, LookupError};

type Outcome = Result<String, LookupError>;

#[derive(Default)]
struct LookupState {
    completed: HashMap<String, Outcome>,
    pending: HashMap<String, Vec<oneshot::Sender<Outcome>>>,
    disabled: bool,
}

pub struct CorrelationIdManager {
    client: reqwest::Client,
    profile_endpoint: String,
    retry_interval: Duration,
    max_retries: u32,
    state: Mutex<LookupState>,
}

impl CorrelationIdManager {
    pub fn new(
        profile_endpoint: &str,
        timeout: Duration,
        retry_interval: Duration,
        max_retries: u32,
    ) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            profile_endpoint: profile_endpoint.trim_end_matches('/').to_string(),
            retry_interval,
            max_retries,
            state: Mutex::new(LookupState::default()),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Self::new(
            &config.profile_query_endpoint,
            config.http_timeout(),
            Duration::from_millis(config.correlation_id_retry_interval_ms),
            config.correlation_id_max_retries,
        )
    }

    fn lock(&self) -> MutexGuard<'_, LookupState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn lookup_url(&self, ikey: &str) -> String {
        format!("{}/api/profiles/{ikey}/appId", self.profile_endpoint)
    }

    /// The correlation id of `ikey`.
    ///
    /// Must be called from within a tokio runtime; the lookup itself runs on a
    /// spawned task so it completes even if this caller goes away.
    pub async fn query(self: &Arc<Self>, ikey: &str) -> Result<String, LookupError> {
        let url = self.lookup_url(ikey);
        let receiver = {
            let mut state = self.lock();
            if state.disabled {
                return Err(LookupError::Disabled);
            }
            if let Some(outcome) = state.completed.get(&url) {
                return outcome.clone();
            }

            let (sender, receiver) = oneshot::channel();
            match state.pending.get_mut(&url) {
                Some(waiters) => {
                    debug!("Joining in-flight correlation id lookup for {url}");
                    waiters.push(sender);
                }
                None => {
                    state.pending.insert(url.clone(), vec![sender]);
                    let manager = Arc::clone(self);
                    tokio::spawn(async move { manager.run_lookup(url).await });
                }
            }
            receiver
        };

        receiver.await.unwrap_or(Err(LookupError::Disabled))
    }

    /// The cached outcome for `ikey`, if any.
    #[must_use]
    pub fn cached(&self, ikey: &str) -> Option<Result<String, LookupError>> {
        self.lock().completed.get(&self.lookup_url(ikey)).cloned()
    }

    /// Forgets the outcome for `ikey`, so a rejected key can be looked up again.
    pub fn forget(&self, ikey: &str) {
        let url = self.lookup_url(ikey);
        self.lock().completed.remove(&url);
    }

    /// Fails every waiter and every future query with [`LookupError::Disabled`].
    pub fn shutdown(&self) {
        let waiters: Vec<_> = {
            let mut state = self.lock();
            state.disabled = true;
            state.pending.drain().flat_map(|(_, waiters)| waiters).collect()
        };
        for waiter in waiters {
            let _ = waiter.send(Err(LookupError::Disabled));
        }
    }

    async fn run_lookup(self: Arc<Self>, url: String) {
        let mut attempts = 0;
        let outcome = loop {
            attempts += 1;
            match self.fetch(&url).await {
                Err(LookupError::Transient(e)) if attempts <= self.max_retries => {
                    warn!("Correlation id lookup failed (attempt {attempts}): {e}, retrying");
                    tokio::time::sleep(self.retry_interval).await;
                }
                outcome => break outcome,
            }
        };

        match &outcome {
            Ok(correlation_id) => debug!("Resolved correlation id {correlation_id}"),
            Err(e) => error!("Failed to resolve correlation id from {url}: {e}"),
        }

        let waiters = {
            let mut state = self.lock();
            if matches!(outcome, Ok(_) | Err(LookupError::Permanent(_))) && !state.disabled {
                state.completed.insert(url.clone(), outcome.clone());
            }
            state.pending.remove(&url).unwrap_or_default()
        };
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    async fn fetch(&self, url: &str) -> Outcome {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                LookupError::Timeout
            } else {
                LookupError::Transient(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_client_error() {
            return Err(LookupError::Permanent(status.as_u16()));
        }
        if !status.is_success() {
            return Err(LookupError::Transient(format!("status {status}")));
        }

        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                LookupError::Timeout
            } else {
                LookupError::Transient(e.to_string())
            }
        })?;
        let app_id = body.trim().trim_matches('"');
        if app_id.is_empty() {
            return Err(LookupError::Transient("empty app id".to_string()));
        }
        Ok(format!("{CORRELATION_ID_PREFIX}{app_id}"))
    }
}
