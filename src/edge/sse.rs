use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, PoisonError, Weak,
    },
    time::Duration,
};

use eventsource_stream::{Event, Eventsource};
use futures::StreamExt;
use reqwest::header::ACCEPT;
use tokio::task::JoinHandle;

use super::{sdk_header, EdgeConnectionState, EdgeReconnector, EdgeRetryer, EdgeService};
use crate::{
    executor::Executor,
    models::SseResultState,
    readiness::{PendingReadiness, Readiness, Waiters},
    repository::FeatureRepository,
    Result,
};

const SDK_VARIANT: &str = "Rust-Reqwest-SSE";

/// Streaming transport: holds a server-sent events connection open and applies each frame to
/// the repository as it arrives.
///
/// Every way a connection can end is classified into an [`EdgeConnectionState`] and handed to the
/// [`EdgeRetryer`], which decides whether and when [`EdgeReconnector::reconnect`] runs.
pub struct SseEdgeService {
    this: Weak<SseEdgeService>,
    repository: Arc<FeatureRepository>,
    realtime_url: String,
    server_evaluation: bool,
    retryer: Arc<EdgeRetryer>,
    client: reqwest::Client,
    header: Mutex<Option<String>>,
    connection: Mutex<Option<Connection>>,
    generation: AtomicU64,
    waiters: Waiters,
    closed: AtomicBool,
    executor: Executor,
}

struct Connection {
    generation: u64,
    task: JoinHandle<()>,
}

impl SseEdgeService {
    pub fn new(
        repository: Arc<FeatureRepository>,
        realtime_url: String,
        server_evaluation: bool,
        retryer: Arc<EdgeRetryer>,
    ) -> Result<Arc<SseEdgeService>> {
        let client = reqwest::Client::builder()
            .connect_timeout(retryer.config().server_connect_timeout)
            .build()?;
        let executor = Executor::new("featurehub-sse", 1)?;

        Ok(Arc::new_cyclic(|this| SseEdgeService {
            this: this.clone(),
            repository,
            realtime_url,
            server_evaluation,
            retryer,
            client,
            header: Mutex::new(None),
            connection: Mutex::new(None),
            generation: AtomicU64::new(0),
            waiters: Waiters::new(),
            closed: AtomicBool::new(false),
            executor,
        }))
    }

    pub fn retryer(&self) -> &EdgeRetryer {
        &self.retryer
    }

    fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Open a connection unless one is already running. Returns whether a new one was started.
    fn connect(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) || self.retryer.is_stopped() {
            return false;
        }

        let mut connection = self.connection.lock().unwrap_or_else(PoisonError::into_inner);
        if connection.is_some() {
            return false;
        }
        let Some(this) = self.this.upgrade() else {
            return false;
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let header = self
            .header
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match self.executor.spawn(this.run(generation, header)) {
            Some(task) => {
                *connection = Some(Connection { generation, task });
                true
            }
            None => false,
        }
    }

    fn disconnect(&self) {
        let connection = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(connection) = connection {
            log::info!(target: "featurehub", "closing stream connection");
            connection.task.abort();
        }
    }

    async fn run(self: Arc<Self>, generation: u64, header: Option<String>) {
        let outcome = self.stream(header).await;
        log::trace!(target: "featurehub", outcome:?; "stream connection ended");

        {
            let mut connection = self.connection.lock().unwrap_or_else(PoisonError::into_inner);
            if connection.as_ref().is_some_and(|c| c.generation == generation) {
                *connection = None;
            }
        }

        if self.repository.readiness() == Readiness::NotReady {
            self.repository.notify(SseResultState::Failure);
        }
        self.waiters.complete_all(self.repository.readiness());

        let reconnector: Arc<dyn EdgeReconnector> = self.clone();
        self.retryer.edge_result(outcome, reconnector);
    }

    /// Read the stream until it ends and classify how it ended.
    async fn stream(&self, header: Option<String>) -> EdgeConnectionState {
        log::trace!(target: "featurehub", url = self.realtime_url.as_str(); "connecting to stream");

        let mut request = self
            .client
            .get(&self.realtime_url)
            .header("X-SDK", sdk_header(SDK_VARIANT))
            .header(ACCEPT, "text/event-stream");
        if let Some(header) = &header {
            request = request.header("x-featurehub", header);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) if err.is_connect() => {
                log::debug!(target: "featurehub", "unable to connect to stream: {err}");
                return EdgeConnectionState::ConnectionFailure;
            }
            Err(err) => {
                log::debug!(target: "featurehub", "stream request failed: {err}");
                return EdgeConnectionState::ServerWasDisconnected;
            }
        };

        let status = response.status().as_u16();
        if matches!(status, 400 | 401 | 403 | 404) {
            log::warn!(target: "featurehub", status; "edge rejected the stream request");
            return EdgeConnectionState::ApiKeyNotFound;
        }
        if !response.status().is_success() {
            log::debug!(target: "featurehub", status; "stream request was not accepted");
            return EdgeConnectionState::ServerWasDisconnected;
        }

        log::trace!(target: "featurehub", "stream connected");
        let read_timeout = self.retryer.config().server_sse_read_timeout;
        let mut events = response.bytes_stream().eventsource();
        let mut said_bye = false;

        loop {
            let event = match tokio::time::timeout(read_timeout, events.next()).await {
                Err(_) => {
                    log::debug!(target: "featurehub", "stream read timed out");
                    return EdgeConnectionState::ServerReadTimeout;
                }
                Ok(None) => {
                    return if said_bye {
                        EdgeConnectionState::ServerSaidBye
                    } else {
                        EdgeConnectionState::ServerWasDisconnected
                    };
                }
                Ok(Some(Err(err))) => {
                    log::debug!(target: "featurehub", "stream broke: {err}");
                    return EdgeConnectionState::ServerWasDisconnected;
                }
                Ok(Some(Ok(event))) => event,
            };

            match self.process_event(&event) {
                Some(SseResultState::Bye) => said_bye = true,
                Some(SseResultState::Failure) => return EdgeConnectionState::ApiKeyNotFound,
                _ => {}
            }
        }
    }

    /// Apply one frame. Returns its type, or `None` for frames we do not understand.
    fn process_event(&self, event: &Event) -> Option<SseResultState> {
        let Ok(state) = event.event.parse::<SseResultState>() else {
            log::trace!(target: "featurehub", event = event.event.as_str(); "ignoring unknown frame");
            return None;
        };
        log::trace!(target: "featurehub", state:?, data = event.data.as_str(); "decoding frame");

        if state == SseResultState::Config {
            self.retryer.edge_config_info(&event.data);
        } else if let Err(err) = self
            .retryer
            .process_frame(state, &event.data, &self.repository)
        {
            log::error!(target: "featurehub", state:?; "failed to decode frame: {err}");
        }

        if state == SseResultState::Features {
            if let Some(this) = self.this.upgrade() {
                let reconnector: Arc<dyn EdgeReconnector> = this;
                self.retryer
                    .edge_result(EdgeConnectionState::Success, reconnector);
            }
        }

        if !matches!(state, SseResultState::Ack | SseResultState::Config) {
            self.waiters.complete_all(self.repository.readiness());
        }

        Some(state)
    }
}

impl EdgeReconnector for SseEdgeService {
    fn reconnect(&self) {
        log::trace!(target: "featurehub", "reconnecting stream");
        self.connect();
    }
}

impl EdgeService for SseEdgeService {
    fn poll(&self) -> PendingReadiness {
        let readiness = self.repository.readiness();
        if readiness == Readiness::NotReady && !self.is_connected() {
            let pending = self.waiters.wait(readiness);
            if self.connect() {
                return pending;
            }
            self.waiters.complete_all(self.repository.readiness());
            return pending;
        }

        self.connect();
        PendingReadiness::ready(readiness)
    }

    fn context_change(&self, header: Option<&str>, _context_sha: &str) -> PendingReadiness {
        if self.server_evaluation {
            let mut current = self.header.lock().unwrap_or_else(PoisonError::into_inner);
            if current.as_deref() != header {
                log::warn!(target: "featurehub", "server evaluated streaming needs one client per context, reconnecting");
                *current = header.map(str::to_owned);
                drop(current);
                self.disconnect();
            }
        }

        if self.is_connected() {
            return PendingReadiness::ready(self.repository.readiness());
        }

        let pending = self.waiters.wait(self.repository.readiness());
        if !self.connect() {
            self.waiters.complete_all(self.repository.readiness());
        }
        pending
    }

    fn requires_replacement_on_header_change(&self) -> bool {
        true
    }

    fn feature_used(&self) {}

    fn current_interval(&self) -> Duration {
        Duration::ZERO
    }

    fn is_stopped(&self) -> bool {
        self.retryer.is_stopped()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.retryer.close();
        self.disconnect();
        self.executor.shutdown();
        self.waiters.complete_all(self.repository.readiness());
    }
}
