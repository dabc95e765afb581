//! Transports that keep the repository in sync with the edge service.
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::readiness::PendingReadiness;

mod polling;
mod rest;
mod retryer;
mod sse;

pub use polling::PollingGovernor;
pub use rest::RestEdgeService;
pub use retryer::{EdgeRetryer, EdgeRetryerConfig};
pub use sse::SseEdgeService;

/// Outcome of a single connection attempt, reported to the [`EdgeRetryer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeConnectionState {
    Success,
    ServerSaidBye,
    ServerWasDisconnected,
    ServerReadTimeout,
    ConnectionFailure,
    ApiKeyNotFound,
    Failure,
}

/// A connection to the edge service.
///
/// Every returned [`PendingReadiness`] completes, either with the readiness observed after the next
/// meaningful edge event or with the current readiness if no request was made.
pub trait EdgeService: Send + Sync {
    /// Make sure a connection attempt is underway.
    fn poll(&self) -> PendingReadiness;

    /// The server-evaluated context changed. `header` is the new `x-featurehub` value and
    /// `context_sha` a cache-breaking hash of it.
    fn context_change(&self, header: Option<&str>, context_sha: &str) -> PendingReadiness;

    /// Whether a header change tears down and recreates the connection.
    fn requires_replacement_on_header_change(&self) -> bool;

    /// A feature was read through a context. Transports may use this to refresh a stale view.
    fn feature_used(&self) {
        let _ = self.poll();
    }

    /// Polling interval, [`Duration::ZERO`] for transports that do not poll.
    fn current_interval(&self) -> Duration;

    /// Whether the transport has permanently stopped making requests.
    fn is_stopped(&self) -> bool;

    /// Release all connection resources. Safe to call more than once.
    fn close(&self);
}

/// Restarts a connection after a backoff.
pub trait EdgeReconnector: Send + Sync {
    fn reconnect(&self);
}

/// Protocol version of the edge API spoken by this SDK.
const EDGE_PROTOCOL_VERSION: &str = "1.1.2";

/// Value of the `X-SDK` header: variant, SDK version and protocol version.
pub(crate) fn sdk_header(variant: &str) -> String {
    format!(
        "{variant},{},{EDGE_PROTOCOL_VERSION}",
        env!("CARGO_PKG_VERSION")
    )
}
