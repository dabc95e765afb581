use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{EdgeConnectionState, EdgeReconnector};
use crate::{
    executor::Executor,
    models::{parsed_only, FeatureState, SseResultState, TryParse},
    repository::FeatureRepository,
    Result,
};

/// Key of a `CONFIG` frame telling the client its connection is stale and must not reconnect.
const EDGE_STALE: &str = "edge.stale";

/// Timeouts and backoff settings for edge connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeRetryerConfig {
    pub server_connect_timeout: Duration,
    pub server_sse_read_timeout: Duration,
    pub server_rest_read_timeout: Duration,
    pub server_disconnect_retry: Duration,
    pub server_bye_reconnect: Duration,
    /// Starting backoff multiplier, in milliseconds.
    pub backoff_multiplier: u64,
    pub maximum_backoff: Duration,
}

impl Default for EdgeRetryerConfig {
    fn default() -> Self {
        EdgeRetryerConfig {
            server_connect_timeout: Duration::from_millis(5_000),
            server_sse_read_timeout: Duration::from_millis(1_800_000),
            server_rest_read_timeout: Duration::from_millis(150_000),
            server_disconnect_retry: Duration::ZERO,
            server_bye_reconnect: Duration::ZERO,
            backoff_multiplier: 10,
            maximum_backoff: Duration::from_millis(30_000),
        }
    }
}

impl EdgeRetryerConfig {
    /// Defaults overridden by environment variables, in milliseconds. Each setting is read from
    /// `FEATUREHUB_EDGE_<NAME>`, then `featurehub.edge.<name>`, then `featurehub_edge_<name>`, for
    /// example `featurehub.edge.server-connect-timeout-ms`.
    pub fn from_env() -> EdgeRetryerConfig {
        let mut config = EdgeRetryerConfig::default();
        let millis = |setting: &str, target: &mut Duration| {
            if let Some(ms) = edge_setting(setting) {
                *target = Duration::from_millis(ms);
            }
        };

        millis(
            "server-connect-timeout-ms",
            &mut config.server_connect_timeout,
        );
        millis(
            "server-sse-read-timeout-ms",
            &mut config.server_sse_read_timeout,
        );
        millis(
            "server-rest-read-timeout-ms",
            &mut config.server_rest_read_timeout,
        );
        millis(
            "server-disconnect-retry-ms",
            &mut config.server_disconnect_retry,
        );
        millis("server-by-reconnect-ms", &mut config.server_bye_reconnect);
        millis("maximum-backoff-ms", &mut config.maximum_backoff);
        if let Some(multiplier) = edge_setting("backoff-multiplier") {
            config.backoff_multiplier = multiplier;
        }

        config
    }

    pub fn server_connect_timeout(mut self, timeout: Duration) -> Self {
        self.server_connect_timeout = timeout;
        self
    }

    pub fn server_sse_read_timeout(mut self, timeout: Duration) -> Self {
        self.server_sse_read_timeout = timeout;
        self
    }

    pub fn server_rest_read_timeout(mut self, timeout: Duration) -> Self {
        self.server_rest_read_timeout = timeout;
        self
    }

    pub fn server_disconnect_retry(mut self, delay: Duration) -> Self {
        self.server_disconnect_retry = delay;
        self
    }

    pub fn server_bye_reconnect(mut self, delay: Duration) -> Self {
        self.server_bye_reconnect = delay;
        self
    }

    pub fn backoff_multiplier(mut self, multiplier: u64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn maximum_backoff(mut self, maximum: Duration) -> Self {
        self.maximum_backoff = maximum;
        self
    }
}

fn edge_setting(setting: &str) -> Option<u64> {
    let dotted = format!("featurehub.edge.{setting}");
    let underscored = dotted.replace(['.', '-'], "_");
    [underscored.to_uppercase(), dotted, underscored]
        .iter()
        .find_map(|name| env_u64(name))
}

fn env_u64(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(err) => {
            log::warn!(target: "featurehub", variable = name, value = raw.as_str(); "ignoring unparsable edge setting: {err}");
            None
        }
    }
}

/// Classifies connection outcomes into backoff or terminal decisions and drives reconnection.
///
/// Once stopped (unknown API key, terminal failure, or a stale edge), every later outcome is
/// ignored and nothing reconnects. Backoff waits run on a dedicated single worker so reporting an
/// outcome never blocks the caller; closing the retryer interrupts them.
pub struct EdgeRetryer {
    config: EdgeRetryerConfig,
    current_backoff_multiplier: AtomicU64,
    not_found: AtomicBool,
    stopped: AtomicBool,
    executor: Executor,
}

impl EdgeRetryer {
    pub fn new(config: EdgeRetryerConfig) -> Result<EdgeRetryer> {
        Ok(EdgeRetryer {
            current_backoff_multiplier: AtomicU64::new(config.backoff_multiplier),
            config,
            not_found: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            executor: Executor::new("featurehub-edge-retry", 1)?,
        })
    }

    pub fn config(&self) -> &EdgeRetryerConfig {
        &self.config
    }

    pub fn current_backoff_multiplier(&self) -> u64 {
        self.current_backoff_multiplier.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn is_not_found(&self) -> bool {
        self.not_found.load(Ordering::SeqCst)
    }

    /// Act on the outcome of a connection attempt.
    pub fn edge_result(&self, state: EdgeConnectionState, reconnector: Arc<dyn EdgeReconnector>) {
        log::trace!(target: "featurehub", state:?; "retryer triggered");

        if self.is_not_found() || self.is_stopped() || self.executor.is_shutdown() {
            log::trace!(target: "featurehub", state:?; "retryer stopped, ignoring outcome");
            return;
        }

        match state {
            EdgeConnectionState::Success => {
                self.current_backoff_multiplier
                    .store(self.config.backoff_multiplier, Ordering::SeqCst);
            }
            EdgeConnectionState::ApiKeyNotFound => {
                log::warn!(target: "featurehub", "terminal failure connecting to edge: API key does not exist");
                self.not_found.store(true, Ordering::SeqCst);
                self.stopped.store(true, Ordering::SeqCst);
            }
            EdgeConnectionState::Failure => {
                log::warn!(target: "featurehub", "terminal failure connecting to edge");
                self.stopped.store(true, Ordering::SeqCst);
            }
            EdgeConnectionState::ServerSaidBye => {
                self.reconnect_after(self.config.server_bye_reconnect, reconnector);
            }
            EdgeConnectionState::ServerWasDisconnected => {
                let delay = self.backoff(self.config.server_disconnect_retry);
                self.reconnect_after(delay, reconnector);
            }
            EdgeConnectionState::ServerReadTimeout => {
                let delay = self.backoff(self.config.server_sse_read_timeout);
                self.reconnect_after(delay, reconnector);
            }
            EdgeConnectionState::ConnectionFailure => {
                let delay = self.backoff(self.config.server_connect_timeout);
                self.reconnect_after(delay, reconnector);
            }
        }
    }

    /// Delay for the next attempt from `base`, growing the multiplier for the attempt after.
    fn backoff(&self, base: Duration) -> Duration {
        let current = self.current_backoff_multiplier();
        let delay = self.calculate_backoff(base, current);
        self.current_backoff_multiplier
            .store(new_backoff(current), Ordering::SeqCst);
        delay
    }

    fn reconnect_after(&self, delay: Duration, reconnector: Arc<dyn EdgeReconnector>) {
        log::trace!(target: "featurehub", delay_ms = delay.as_millis() as u64; "scheduling reconnect");
        self.executor.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            reconnector.reconnect();
        });
    }

    /// `base + (1 + random) * multiplier` milliseconds, capped at the maximum backoff.
    pub fn calculate_backoff(&self, base: Duration, multiplier: u64) -> Duration {
        let jitter = ((1.0 + rand::thread_rng().gen::<f64>()) * multiplier as f64) as u64;
        let delay = base
            .saturating_add(Duration::from_millis(jitter))
            .min(self.config.maximum_backoff);
        log::trace!(target: "featurehub", backoff_ms = delay.as_millis() as u64; "backing off");
        delay
    }

    /// Handle a `CONFIG` frame.
    pub fn edge_config_info(&self, data: &str) {
        match serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(data) {
            Ok(config) if config.contains_key(EDGE_STALE) => {
                log::warn!(target: "featurehub", "edge reports this connection is stale, no longer reconnecting");
                self.stopped.store(true, Ordering::SeqCst);
            }
            Ok(_) => {}
            Err(err) => {
                log::debug!(target: "featurehub", data; "ignoring unreadable config frame: {err}");
            }
        }
    }

    /// Apply a data frame to `repository`.
    pub fn process_frame(
        &self,
        state: SseResultState,
        data: &str,
        repository: &FeatureRepository,
    ) -> Result<()> {
        match state {
            SseResultState::Features => {
                let features: Vec<TryParse<FeatureState>> = serde_json::from_str(data)?;
                repository.update_features(parsed_only(features), false);
            }
            SseResultState::Feature => {
                repository.update_feature(serde_json::from_str(data)?, false);
            }
            SseResultState::DeleteFeature => {
                repository.delete_feature(serde_json::from_str(data)?);
            }
            SseResultState::Failure => repository.notify(state),
            SseResultState::Ack | SseResultState::Bye | SseResultState::Config => {}
        }
        Ok(())
    }

    /// Stop reconnecting and interrupt any pending backoff.
    pub fn close(&self) {
        self.executor.shutdown();
    }
}

/// Randomised multiplicative growth with a floor of 3.
pub fn new_backoff(current: u64) -> u64 {
    let grown = ((1.0 + rand::thread_rng().gen::<f64>()) * current as f64) as u64;
    grown.max(3)
}
