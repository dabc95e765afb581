use std::time::Duration;

use crate::{
    edge::EdgeRetryerConfig, interceptor::FeatureValueInterceptor, Error, FeatureHub, Result,
};

/// How the client talks to the edge service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeType {
    /// A long-lived server-sent events connection.
    Streaming,
    /// Request on use, at most once per `interval` (server `max-age` may override it).
    RestPassive(Duration),
    /// Request on a timer every `interval`.
    RestActive(Duration),
}

/// Configuration for [`FeatureHub`].
///
/// ```
/// # use featurehub::FeatureHubConfig;
/// let config = FeatureHubConfig::new("https://edge.example.com/", "env-id/client-key*secret")
///     .streaming()
///     .thread_pool_size(2);
/// assert!(!config.server_evaluation());
/// ```
pub struct FeatureHubConfig {
    pub(crate) edge_url: String,
    pub(crate) api_keys: Vec<String>,
    pub(crate) edge_type: Option<EdgeType>,
    pub(crate) thread_pool_size: usize,
    pub(crate) retry_config: EdgeRetryerConfig,
    pub(crate) interceptors: Vec<(bool, Box<dyn FeatureValueInterceptor>)>,
}

impl FeatureHubConfig {
    /// Default interval for polling transports.
    pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(180);

    /// Create a configuration for a single API key.
    pub fn new(edge_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        FeatureHubConfig::with_api_keys(edge_url, vec![api_key.into()])
    }

    /// Create a configuration reading several environments at once.
    pub fn with_api_keys(edge_url: impl Into<String>, api_keys: Vec<String>) -> Self {
        FeatureHubConfig {
            edge_url: normalise_edge_url(edge_url.into()),
            api_keys,
            edge_type: None,
            thread_pool_size: 1,
            retry_config: EdgeRetryerConfig::from_env(),
            interceptors: Vec::new(),
        }
    }

    /// Stream updates over server-sent events.
    pub fn streaming(mut self) -> Self {
        self.edge_type = Some(EdgeType::Streaming);
        self
    }

    /// Poll on use, no more often than `interval`.
    pub fn rest_passive(mut self, interval: Duration) -> Self {
        self.edge_type = Some(EdgeType::RestPassive(interval));
        self
    }

    /// Poll on a timer every `interval`.
    pub fn rest_active(mut self, interval: Duration) -> Self {
        self.edge_type = Some(EdgeType::RestActive(interval));
        self
    }

    /// Number of workers delivering listener callbacks.
    pub fn thread_pool_size(mut self, size: usize) -> Self {
        self.thread_pool_size = size.max(1);
        self
    }

    pub fn retry_config(mut self, retry_config: EdgeRetryerConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    /// Register a value interceptor. It only applies to locked features if `allow_lock_override`.
    pub fn value_interceptor(
        mut self,
        allow_lock_override: bool,
        interceptor: impl FeatureValueInterceptor + 'static,
    ) -> Self {
        self.interceptors
            .push((allow_lock_override, Box::new(interceptor)));
        self
    }

    pub fn edge_url(&self) -> &str {
        &self.edge_url
    }

    pub fn api_keys(&self) -> &[String] {
        &self.api_keys
    }

    /// Client-evaluated keys carry their secret after a `*`; any other key is server-evaluated.
    pub fn server_evaluation(&self) -> bool {
        !self.api_keys.iter().any(|key| key.contains('*'))
    }

    /// Streaming endpoint, named after the first API key.
    pub fn realtime_url(&self) -> String {
        let key = self.api_keys.first().map_or("", String::as_str);
        format!("{}/features/{key}", self.edge_url)
    }

    /// The configured transport, defaulting to passive polling for server-evaluated keys and to
    /// streaming otherwise.
    pub fn edge_type(&self) -> EdgeType {
        self.edge_type.unwrap_or(if self.server_evaluation() {
            EdgeType::RestPassive(Self::DEFAULT_POLLING_INTERVAL)
        } else {
            EdgeType::Streaming
        })
    }

    /// Check the configuration and create a [`FeatureHub`] client. No connection is made until
    /// [`FeatureHub::init`] or a context is built.
    pub fn to_client(self) -> Result<FeatureHub> {
        if self.api_keys.is_empty() || self.api_keys.iter().any(|key| key.trim().is_empty()) {
            return Err(Error::MissingApiKey);
        }
        url::Url::parse(&self.edge_url).map_err(Error::InvalidEdgeUrl)?;
        FeatureHub::new(self)
    }
}

fn normalise_edge_url(mut edge_url: String) -> String {
    if edge_url.ends_with('/') {
        edge_url.pop();
    }
    if let Some(stripped) = edge_url.strip_suffix("/features") {
        edge_url.truncate(stripped.len());
    }
    edge_url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_url_is_normalised() {
        for url in [
            "https://edge.example.com",
            "https://edge.example.com/",
            "https://edge.example.com/features",
            "https://edge.example.com/features/",
        ] {
            let config = FeatureHubConfig::new(url, "env/key");
            assert_eq!(config.edge_url(), "https://edge.example.com");
            assert_eq!(
                config.realtime_url(),
                "https://edge.example.com/features/env/key"
            );
        }
    }

    #[test]
    fn evaluation_mode_follows_key() {
        assert!(FeatureHubConfig::new("http://edge", "env/key").server_evaluation());
        assert!(!FeatureHubConfig::new("http://edge", "env/key*secret").server_evaluation());
    }

    #[test]
    fn default_transport_follows_evaluation_mode() {
        assert_eq!(
            FeatureHubConfig::new("http://edge", "env/key").edge_type(),
            EdgeType::RestPassive(FeatureHubConfig::DEFAULT_POLLING_INTERVAL)
        );
        assert_eq!(
            FeatureHubConfig::new("http://edge", "env/key*secret").edge_type(),
            EdgeType::Streaming
        );
        assert_eq!(
            FeatureHubConfig::new("http://edge", "env/key")
                .rest_active(Duration::from_secs(5))
                .edge_type(),
            EdgeType::RestActive(Duration::from_secs(5))
        );
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        assert!(matches!(
            FeatureHubConfig::with_api_keys("http://edge", vec![]).to_client(),
            Err(Error::MissingApiKey)
        ));
        assert!(matches!(
            FeatureHubConfig::new("not a url", "env/key").to_client(),
            Err(Error::InvalidEdgeUrl(_))
        ));
    }
}
