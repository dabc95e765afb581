use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError, Weak,
    },
    time::{Duration, Instant},
};

use reqwest::header::{HeaderName, CACHE_CONTROL, ETAG, IF_NONE_MATCH};

use super::{sdk_header, EdgeRetryerConfig, EdgeService};
use crate::{
    executor::Executor,
    models::{parsed_only, FeatureEnvironmentCollection, FeatureState, SseResultState},
    readiness::{PendingReadiness, Readiness, ReadinessPromise},
    repository::FeatureRepository,
    Error, Result,
};

const SDK_VARIANT: &str = "Rust-Reqwest";
/// Success status telling the client to stop polling after ingesting the body.
const STATUS_STOP_POLLING: u16 = 236;

/// Request/response transport that fetches the full feature set on demand.
///
/// At most one request is in flight. Callers arriving while a request is running wait for its
/// result instead of issuing another one. The `cache-control: max-age` directive of a response
/// overrides the polling interval.
pub struct RestEdgeService {
    this: Weak<RestEdgeService>,
    repository: Arc<FeatureRepository>,
    client: reqwest::Client,
    url: String,
    polling_delegate: bool,
    make_requests: AtomicBool,
    stopped: AtomicBool,
    state: Mutex<RestState>,
    executor: Executor,
}

struct RestState {
    header: Option<String>,
    context_sha: String,
    etag: Option<String>,
    polling_interval: Duration,
    /// `None` until the first successful response, which means expired.
    cache_expires: Option<Instant>,
    header_changed: bool,
    busy: bool,
    waiting: Vec<ReadinessPromise>,
    /// Waiters for a context that changed while a request was in flight. They are answered by the
    /// request that follows it.
    follow_up: Vec<ReadinessPromise>,
}

struct FeatureRequest {
    url: String,
    header: Option<String>,
    etag: Option<String>,
}

impl RestEdgeService {
    /// `polling_delegate` makes every poll hit the server, for use under a [`PollingGovernor`].
    ///
    /// [`PollingGovernor`]: super::PollingGovernor
    pub fn new(
        repository: Arc<FeatureRepository>,
        edge_url: &str,
        api_keys: &[String],
        config: &EdgeRetryerConfig,
        polling_interval: Duration,
        polling_delegate: bool,
    ) -> Result<Arc<RestEdgeService>> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.server_connect_timeout)
            .timeout(config.server_rest_read_timeout)
            .build()?;
        let executor = Executor::new("featurehub-rest", 1)?;

        let keys = api_keys
            .iter()
            .map(|key| format!("apiKey={key}"))
            .collect::<Vec<_>>()
            .join("&");
        let url = format!("{edge_url}/features?{keys}");

        Ok(Arc::new_cyclic(|this| RestEdgeService {
            this: this.clone(),
            repository,
            client,
            url,
            polling_delegate,
            make_requests: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            state: Mutex::new(RestState {
                header: None,
                context_sha: "0".to_owned(),
                etag: None,
                polling_interval,
                cache_expires: None,
                header_changed: false,
                busy: false,
                waiting: Vec::new(),
                follow_up: Vec::new(),
            }),
            executor,
        }))
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RestState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn can_make_requests(&self) -> bool {
        self.make_requests.load(Ordering::SeqCst) && !self.stopped.load(Ordering::SeqCst)
    }

    /// Start a request if one is due, registering `waiter` for its result.
    ///
    /// Returns the waiter back when no request was started and none is in flight.
    fn check_for_updates(&self, waiter: ReadinessPromise) -> Option<ReadinessPromise> {
        let request = {
            let mut state = self.lock_state();
            if state.busy {
                if state.header_changed {
                    state.follow_up.push(waiter);
                } else {
                    state.waiting.push(waiter);
                }
                return None;
            }

            let break_cache = self.polling_delegate
                || state.polling_interval.is_zero()
                || state.cache_expires.map_or(true, |at| Instant::now() >= at)
                || state.header_changed;
            state.header_changed = false;

            if !break_cache || !self.can_make_requests() {
                return Some(waiter);
            }

            state.busy = true;
            state.waiting.push(waiter);
            FeatureRequest {
                url: format!("{}&contextSha={}", self.url, state.context_sha),
                header: state.header.clone(),
                etag: state.etag.clone(),
            }
        };

        let spawned = self
            .this
            .upgrade()
            .and_then(|this| self.executor.spawn(this.fetch(request)));
        if spawned.is_none() {
            self.finish_request();
        }
        None
    }

    async fn fetch(self: Arc<Self>, request: FeatureRequest) {
        log::trace!(target: "featurehub", url = request.url.as_str(); "requesting features");

        let mut builder = self
            .client
            .get(&request.url)
            .header("X-SDK", sdk_header(SDK_VARIANT));
        if let Some(header) = &request.header {
            builder = builder.header("x-featurehub", header);
        }
        if let Some(etag) = &request.etag {
            builder = builder.header(IF_NONE_MATCH, etag);
        }

        let result = async {
            let response = builder.send().await?;
            let status = response.status().as_u16();
            let header = |name: HeaderName| {
                response
                    .headers()
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned)
            };
            let cache_control = header(CACHE_CONTROL);
            let etag = header(ETAG);
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>((status, cache_control, etag, body))
        }
        .await;

        match result {
            Ok((status, cache_control, etag, body)) => {
                self.process_response(status, cache_control.as_deref(), etag.as_deref(), &body)
            }
            Err(err) => self.process_failure(err.into()),
        }
    }

    fn process_response(
        &self,
        status: u16,
        cache_control: Option<&str>,
        etag: Option<&str>,
        body: &[u8],
    ) {
        log::trace!(target: "featurehub", status; "edge responded");

        {
            let mut state = self.lock_state();
            if let Some(interval) = cache_control.and_then(max_age) {
                state.polling_interval = interval;
            }
            if let Some(etag) = etag {
                state.etag = Some(etag.to_owned());
            }
        }

        if (200..300).contains(&status) {
            let environments: Vec<FeatureEnvironmentCollection> = match serde_json::from_slice(body)
            {
                Ok(environments) => environments,
                Err(err) => {
                    log::error!(target: "featurehub", status; "failed to read features from edge: {err}");
                    self.process_failure(err.into());
                    return;
                }
            };

            let features: Vec<FeatureState> = environments
                .into_iter()
                .flat_map(|environment| {
                    let environment_id = environment.id;
                    parsed_only(environment.features)
                        .into_iter()
                        .map(move |mut feature| {
                            feature.environment_id = Some(environment_id);
                            feature
                        })
                })
                .collect();
            log::debug!(target: "featurehub", count = features.len(); "updating features from edge");
            self.repository.update_features(features, false);

            if status == STATUS_STOP_POLLING {
                log::warn!(target: "featurehub", "edge asked us to stop polling");
                self.stopped.store(true, Ordering::SeqCst);
            }

            let mut state = self.lock_state();
            if !state.polling_interval.is_zero() {
                state.cache_expires = Some(Instant::now() + state.polling_interval);
            }
        } else if matches!(status, 400 | 401 | 403 | 404) {
            log::warn!(target: "featurehub", status; "edge rejected our requests, no longer polling");
            self.make_requests.store(false, Ordering::SeqCst);
            self.repository.notify(SseResultState::Failure);
        } else {
            // 304 or a transient server error
            log::debug!(target: "featurehub", status; "no feature update from edge");
        }

        self.finish_request();
    }

    fn process_failure(&self, err: Error) {
        log::error!(target: "featurehub", "unable to request features: {err}");
        if self.repository.readiness() != Readiness::Ready {
            self.repository.notify(SseResultState::Failure);
        }
        self.finish_request();
    }

    /// Clear the in-flight flag and answer everyone waiting, then start the request for a context
    /// that changed in the meantime.
    fn finish_request(&self) {
        let (waiting, follow_up) = {
            let mut state = self.lock_state();
            state.busy = false;
            (
                std::mem::take(&mut state.waiting),
                std::mem::take(&mut state.follow_up),
            )
        };
        let readiness = self.repository.readiness();
        for waiter in waiting {
            waiter.complete(readiness);
        }

        if !follow_up.is_empty() {
            log::trace!(target: "featurehub", "context changed during a request, asking again");
        }
        for waiter in follow_up {
            if let Some(waiter) = self.check_for_updates(waiter) {
                waiter.complete(self.repository.readiness());
            }
        }
    }
}

/// `max-age` of a `cache-control` header, ignored unless positive.
fn max_age(cache_control: &str) -> Option<Duration> {
    cache_control
        .split(',')
        .filter_map(|directive| directive.trim().strip_prefix("max-age="))
        .find_map(|seconds| seconds.trim().parse::<u64>().ok())
        .filter(|seconds| *seconds > 0)
        .map(Duration::from_secs)
}

impl EdgeService for RestEdgeService {
    fn poll(&self) -> PendingReadiness {
        let readiness = self.repository.readiness();
        let (waiter, pending) = PendingReadiness::channel(readiness);
        if let Some(waiter) = self.check_for_updates(waiter) {
            waiter.complete(readiness);
        }
        pending
    }

    fn context_change(&self, header: Option<&str>, context_sha: &str) -> PendingReadiness {
        {
            let mut state = self.lock_state();
            state.header_changed = header.is_some() && header != state.header.as_deref();
            state.header = header.map(str::to_owned);
            state.context_sha = context_sha.to_owned();
        }
        self.poll()
    }

    fn requires_replacement_on_header_change(&self) -> bool {
        false
    }

    fn current_interval(&self) -> Duration {
        self.lock_state().polling_interval
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn close(&self) {
        log::info!(target: "featurehub", "rest edge service closing");
        self.make_requests.store(false, Ordering::SeqCst);
        self.executor.shutdown();
        self.finish_request();
    }
}
