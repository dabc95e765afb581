use std::collections::BTreeMap;

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};

/// Attribute carrying the user identity.
pub const USER_KEY: &str = "userkey";
/// Attribute carrying the session identity. Preferred over [`USER_KEY`] for percentage bucketing.
pub const SESSION_KEY: &str = "session";
pub const COUNTRY_KEY: &str = "country";
pub const DEVICE_KEY: &str = "device";
pub const PLATFORM_KEY: &str = "platform";
pub const VERSION_KEY: &str = "version";

/// Multi-valued attributes of a client context, e.g. several device tags.
///
/// Keys are kept ordered so that the `x-featurehub` header is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextAttributes(BTreeMap<String, Vec<String>>);

impl ContextAttributes {
    pub fn new() -> ContextAttributes {
        ContextAttributes::default()
    }

    /// First value of the attribute.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(|v| v.first()).map(String::as_str)
    }

    /// All values of the attribute.
    pub fn get_all(&self, name: &str) -> Option<&[String]> {
        self.0.get(name).map(Vec::as_slice)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), vec![value.into()]);
    }

    pub fn set_all(&mut self, name: impl Into<String>, values: Vec<String>) {
        self.0.insert(name.into(), values);
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        self.0.remove(name)
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.0.iter()
    }

    /// Identity used for percentage bucketing: session key if present, else user key.
    pub fn percentage_key(&self) -> Option<&str> {
        self.get(SESSION_KEY).or_else(|| self.get(USER_KEY))
    }

    /// Render the attributes as the `x-featurehub` header used for server-side evaluation.
    ///
    /// Returns `None` for an empty context. Values of a multi-valued attribute are joined with
    /// `,` and form-urlencoded.
    pub fn to_header(&self) -> Option<String> {
        if self.0.is_empty() {
            return None;
        }

        let header = self
            .0
            .iter()
            .map(|(key, values)| {
                let joined = values.join(",");
                let encoded: String = url::form_urlencoded::byte_serialize(joined.as_bytes()).collect();
                format!("{key}={encoded}")
            })
            .collect::<Vec<_>>()
            .join(",");
        Some(header)
    }
}

impl<K, V> FromIterator<(K, V)> for ContextAttributes
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut attributes = ContextAttributes::new();
        for (key, value) in iter {
            attributes.set(key, value);
        }
        attributes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyAttributeDeviceName {
    #[display("browser")]
    Browser,
    #[display("mobile")]
    Mobile,
    #[display("desktop")]
    Desktop,
    #[display("server")]
    Server,
    #[display("watch")]
    Watch,
    #[display("embedded")]
    Embedded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyAttributePlatformName {
    #[display("linux")]
    Linux,
    #[display("windows")]
    Windows,
    #[display("macos")]
    Macos,
    #[display("android")]
    Android,
    #[display("ios")]
    Ios,
}

/// Country in the server's naming scheme, e.g. `new_zealand` or `united_states`.
#[derive(Debug, Clone, PartialEq, Eq, Display, From, Serialize, Deserialize)]
pub struct CountryName(String);

impl From<&str> for CountryName {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}
