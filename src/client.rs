use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    time::{Duration, Instant},
};

use crate::{
    config::{EdgeType, FeatureHubConfig},
    context::ClientContext,
    edge::{EdgeRetryer, EdgeService, PollingGovernor, RestEdgeService, SseEdgeService},
    listeners::ListenerHandle,
    readiness::{PendingReadiness, Readiness},
    repository::FeatureRepository,
    Result,
};

/// A FeatureHub client: one feature repository kept fresh by one edge connection.
///
/// In order to create a client instance, first create a [`FeatureHubConfig`].
///
/// # Examples
/// ```no_run
/// # use featurehub::FeatureHubConfig;
/// # use std::time::Duration;
/// let client = FeatureHubConfig::new("https://edge.example.com", "env-id/key*secret")
///     .to_client()
///     .unwrap();
/// client.init();
/// client.wait_for_readiness(Duration::from_secs(5));
///
/// let mut context = client.new_context();
/// context.user_key("fred");
/// if context.is_enabled("new-banner") {
///     println!("showing the new banner");
/// }
/// ```
pub struct FeatureHub {
    repository: Arc<FeatureRepository>,
    edge: Arc<dyn EdgeService>,
    server_evaluation: bool,
    closed: AtomicBool,
}

impl FeatureHub {
    /// Create a client from `config`. [`FeatureHubConfig::to_client`] validates the configuration
    /// first and is usually more convenient.
    pub fn new(config: FeatureHubConfig) -> Result<FeatureHub> {
        let server_evaluation = config.server_evaluation();
        let edge_type = config.edge_type();
        let realtime_url = config.realtime_url();

        let repository = FeatureRepository::new(config.thread_pool_size)?;
        for (allow_lock_override, interceptor) in config.interceptors {
            repository.register_boxed_interceptor(allow_lock_override, interceptor);
        }

        let edge: Arc<dyn EdgeService> = match edge_type {
            EdgeType::Streaming => {
                let retryer = Arc::new(EdgeRetryer::new(config.retry_config)?);
                SseEdgeService::new(repository.clone(), realtime_url, server_evaluation, retryer)?
            }
            EdgeType::RestPassive(interval) => RestEdgeService::new(
                repository.clone(),
                &config.edge_url,
                &config.api_keys,
                &config.retry_config,
                interval,
                false,
            )?,
            EdgeType::RestActive(interval) => {
                let rest = RestEdgeService::new(
                    repository.clone(),
                    &config.edge_url,
                    &config.api_keys,
                    &config.retry_config,
                    interval,
                    true,
                )?;
                PollingGovernor::new(rest, repository.clone())?
            }
        };

        log::debug!(target: "featurehub",
                    edge_type:? = edge_type,
                    server_evaluation;
                    "created featurehub client");

        Ok(FeatureHub {
            repository,
            edge,
            server_evaluation,
            closed: AtomicBool::new(false),
        })
    }

    /// Start talking to the edge. The returned future completes with the readiness after the
    /// first answer.
    pub fn init(&self) -> PendingReadiness {
        self.edge.poll()
    }

    /// Create an evaluation context sharing this client's repository and edge connection.
    pub fn new_context(&self) -> ClientContext {
        ClientContext::new(
            self.repository.clone(),
            self.edge.clone(),
            self.server_evaluation,
        )
    }

    pub fn readiness(&self) -> Readiness {
        self.repository.readiness()
    }

    pub fn server_evaluation(&self) -> bool {
        self.server_evaluation
    }

    /// Called with the current readiness straight away and again on every change.
    pub fn add_readiness_listener(
        &self,
        callback: impl Fn(Readiness) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.repository.add_readiness_listener(callback)
    }

    pub fn repository(&self) -> &Arc<FeatureRepository> {
        &self.repository
    }

    /// Block until the repository leaves `NotReady` or `timeout` elapses, returning the last
    /// known readiness either way. A timeout too large to represent waits indefinitely.
    ///
    /// Do not call this from inside an async runtime.
    pub fn wait_for_readiness(&self, timeout: Duration) -> Readiness {
        let deadline = Instant::now().checked_add(timeout);
        let (sender, receiver) = mpsc::channel();
        let handle = self.repository.add_readiness_listener(move |readiness| {
            let _ = sender.send(readiness);
        });

        while self.readiness() == Readiness::NotReady {
            let received = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    !remaining.is_zero() && receiver.recv_timeout(remaining).is_ok()
                }
                None => receiver.recv().is_ok(),
            };
            if !received {
                break;
            }
        }
        handle.cancel();

        self.readiness()
    }

    /// Close the edge connection and the repository. Further calls do nothing.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!(target: "featurehub", "closing featurehub client");
        self.edge.close();
        self.repository.close();
    }
}

impl Drop for FeatureHub {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::{
        matchers::{method, path, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;
    use crate::edge::EdgeRetryerConfig;

    fn body() -> serde_json::Value {
        json!([{
            "id": "4b3b0b5e-6a4a-4f4e-9a57-3c1cbd1b3a01",
            "features": [
                {"id": "0d0f1c52-5bd8-4b44-9d6b-66bb2b0d4d7b", "key": "banner", "version": 1, "type": "BOOLEAN", "value": true,
                 "strategies": [{"id": "s1", "value": false, "attributes": [
                     {"fieldName": "country", "conditional": "EQUALS", "type": "STRING", "values": ["australia"]}
                 ]}]},
                {"id": "1e1f1c52-5bd8-4b44-9d6b-66bb2b0d4d7b", "key": "colour", "version": 3, "type": "STRING", "value": "blue", "l": true}
            ]
        }])
    }

    #[tokio::test]
    async fn passive_rest_client_end_to_end() {
        let _ = env_logger::builder().is_test(true).try_init();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/features"))
            .and(query_param("apiKey", "env/key*secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body()))
            .mount(&server)
            .await;

        let client = FeatureHubConfig::new(format!("{}/features/", server.uri()), "env/key*secret")
            .rest_passive(Duration::from_secs(60))
            .value_interceptor(false, |key: &str| {
                (key == "colour").then(|| json!("red"))
            })
            .to_client()
            .unwrap();
        assert!(!client.server_evaluation());

        assert_eq!(client.init().await, Readiness::Ready);

        let mut context = client.new_context();
        assert!(context.is_enabled("banner"));
        context.country("australia");
        assert!(!context.is_enabled("banner"));

        // locked features ignore interceptors without lock override
        assert_eq!(context.feature("colour").string().as_deref(), Some("blue"));

        client.close();
        assert_eq!(client.readiness(), Readiness::NotReady);
        client.close();
    }

    #[tokio::test]
    async fn active_rest_client_uses_governor() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/features"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body()))
            .mount(&server)
            .await;

        let client = FeatureHubConfig::new(server.uri(), "env/key")
            .rest_active(Duration::from_secs(60))
            .to_client()
            .unwrap();
        assert!(client.server_evaluation());

        assert_eq!(client.init().await, Readiness::Ready);
        let mut context = client.new_context();
        context.user_key("fred");
        assert_eq!(context.build().await, Readiness::Ready);

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(
            requests[1]
                .headers
                .get("x-featurehub")
                .and_then(|v| v.to_str().ok()),
            Some("userkey=fred")
        );
    }

    #[tokio::test]
    async fn context_built_during_first_poll_reaches_edge() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/features"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(body())
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&server)
            .await;

        let client = FeatureHubConfig::new(server.uri(), "env/key")
            .rest_active(Duration::from_secs(60))
            .to_client()
            .unwrap();

        let init = client.init();
        let mut context = client.new_context();
        context.user_key("fred");
        let built = context.build();

        assert_eq!(init.await, Readiness::Ready);
        assert_eq!(built.await, Readiness::Ready);

        let headers: Vec<_> = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .map(|r| {
                r.headers
                    .get("x-featurehub")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned)
            })
            .collect();
        assert_eq!(headers, vec![None, Some("userkey=fred".to_owned())]);
    }

    #[test]
    fn waiting_on_unreachable_edge_returns_failed() {
        let client = FeatureHubConfig::new("http://127.0.0.1:9", "env/key*secret")
            .rest_passive(Duration::from_secs(60))
            .retry_config(
                EdgeRetryerConfig::default().server_connect_timeout(Duration::from_millis(500)),
            )
            .to_client()
            .unwrap();

        let _ = client.init();
        assert_eq!(
            client.wait_for_readiness(Duration::from_secs(10)),
            Readiness::Failed
        );
    }

    #[test]
    fn waiting_without_init_times_out_not_ready() {
        let client = FeatureHubConfig::new("http://127.0.0.1:9", "env/key")
            .to_client()
            .unwrap();
        assert_eq!(
            client.wait_for_readiness(Duration::from_millis(100)),
            Readiness::NotReady
        );
    }

    #[test]
    fn waiting_forever_returns_once_failed() {
        let client = FeatureHubConfig::new("http://127.0.0.1:9", "env/key*secret")
            .rest_passive(Duration::from_secs(60))
            .retry_config(
                EdgeRetryerConfig::default().server_connect_timeout(Duration::from_millis(500)),
            )
            .to_client()
            .unwrap();

        let _ = client.init();
        assert_eq!(client.wait_for_readiness(Duration::MAX), Readiness::Failed);
    }

    #[test]
    fn readiness_listener_hears_current_state() {
        let client = FeatureHubConfig::new("http://127.0.0.1:9", "env/key")
            .to_client()
            .unwrap();
        let (sender, receiver) = mpsc::channel();
        let handle = client.add_readiness_listener(move |readiness| {
            let _ = sender.send(readiness);
        });
        assert_eq!(
            receiver.recv_timeout(Duration::from_secs(5)),
            Ok(Readiness::NotReady)
        );
        handle.cancel();
    }
}
