//! Value interceptors: local overrides consulted before the server-delivered value.
use serde_json::Value;

/// Provides an override value for a feature key.
///
/// Interceptors are consulted in registration order before any strategy evaluation. A locked
/// feature is only overridden by interceptors registered with `allow_lock_override`.
pub trait FeatureValueInterceptor: Send + Sync {
    /// Return `Some(value)` to override the feature, `None` to leave it alone.
    fn intercept(&self, key: &str) -> Option<Value>;
}

impl<F> FeatureValueInterceptor for F
where
    F: Fn(&str) -> Option<Value> + Send + Sync,
{
    fn intercept(&self, key: &str) -> Option<Value> {
        self(key)
    }
}

/// Resolves `FEATUREHUB_OVERRIDE_<KEY>` environment variables.
///
/// The key is upper-cased and every character that is not alphanumeric becomes `_`, so the
/// feature `new-banner.colour` is overridden by `FEATUREHUB_OVERRIDE_NEW_BANNER_COLOUR`. Values
/// that parse as JSON are used as such (`true`, `12.5`, `{"a":1}`), anything else is a string.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentValueInterceptor {
    _private: (),
}

const OVERRIDE_PREFIX: &str = "FEATUREHUB_OVERRIDE_";

impl EnvironmentValueInterceptor {
    pub fn new() -> EnvironmentValueInterceptor {
        EnvironmentValueInterceptor::default()
    }

    pub fn variable_name(key: &str) -> String {
        let suffix: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{OVERRIDE_PREFIX}{suffix}")
    }
}

impl FeatureValueInterceptor for EnvironmentValueInterceptor {
    fn intercept(&self, key: &str) -> Option<Value> {
        let raw = std::env::var(Self::variable_name(key)).ok()?;
        log::trace!(target: "featurehub", feature_key = key; "feature overridden from environment");
        Some(serde_json::from_str(&raw).unwrap_or(Value::String(raw)))
    }
}
