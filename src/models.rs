//! Wire types delivered by the edge service.
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Type of value a feature carries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeatureValueType {
    Boolean,
    String,
    Number,
    Json,
}

/// Server-delivered state of a single feature.
///
/// Identity is `id`. `key` is the lookup name: keys are unique per environment, but `id` survives
/// key renames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FeatureState {
    pub id: Uuid,
    pub key: String,
    /// `None` (or `-1`) means the feature does not exist.
    #[serde(default)]
    pub version: Option<i64>,
    #[serde(rename = "type", default)]
    pub value_type: Option<FeatureValueType>,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(rename = "l", default)]
    pub locked: bool,
    #[serde(default)]
    pub strategies: Vec<RolloutStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_id: Option<Uuid>,
}

impl FeatureState {
    /// Version used for reconciliation. Absent versions compare as `-1`.
    pub fn effective_version(&self) -> i64 {
        self.version.unwrap_or(-1)
    }

    pub fn exists(&self) -> bool {
        self.effective_version() != -1
    }
}

/// A rule that overrides the feature's base value for matching contexts.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RolloutStrategy {
    #[serde(default)]
    pub id: Option<String>,
    /// Share of traffic in units of 1/1,000,000.
    #[serde(default)]
    pub percentage: Option<u32>,
    #[serde(default)]
    pub percentage_attributes: Vec<String>,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub attributes: Vec<RolloutStrategyAttribute>,
}

impl RolloutStrategy {
    pub(crate) fn percentage(&self) -> u32 {
        self.percentage.unwrap_or(0)
    }
}

/// A single attribute condition of a [`RolloutStrategy`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RolloutStrategyAttribute {
    pub conditional: StrategyConditional,
    pub field_name: String,
    #[serde(default)]
    pub values: Vec<serde_json::Value>,
    #[serde(rename = "type")]
    pub field_type: StrategyFieldType,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyConditional {
    Equals,
    NotEquals,
    EndsWith,
    StartsWith,
    Greater,
    GreaterEquals,
    Less,
    LessEquals,
    Includes,
    Excludes,
    Regex,
    /// A conditional this SDK does not understand. Never matches.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyFieldType {
    String,
    SemanticVersion,
    Number,
    Date,
    Datetime,
    Boolean,
    IpAddress,
    /// A field type this SDK does not understand. Never matches.
    #[serde(other)]
    Unknown,
}

/// Named event types of the edge protocol.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SseResultState {
    Ack,
    Bye,
    Failure,
    Features,
    Feature,
    DeleteFeature,
    Config,
}

impl FromStr for SseResultState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "ack" => Self::Ack,
            "bye" => Self::Bye,
            "failure" => Self::Failure,
            "features" => Self::Features,
            "feature" => Self::Feature,
            "delete_feature" => Self::DeleteFeature,
            "config" => Self::Config,
            _ => return Err(()),
        })
    }
}

/// Body of a poll response: one entry per requested environment.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureEnvironmentCollection {
    pub id: Uuid,
    #[serde(default)]
    pub features: Vec<TryParse<FeatureState>>,
}

/// `TryParse` allows the subfield to fail parsing without failing the parsing of the whole
/// structure.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TryParse<T> {
    Parsed(T),
    ParseFailed(serde_json::Value),
}

impl<T> From<TryParse<T>> for Option<T> {
    fn from(value: TryParse<T>) -> Self {
        match value {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}

/// Keep the items that parsed, logging the ones that did not.
pub(crate) fn parsed_only<T>(items: Vec<TryParse<T>>) -> Vec<T> {
    items
        .into_iter()
        .filter_map(|item| match item {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(json) => {
                log::error!(target: "featurehub", payload:serde = json; "dropping malformed feature state");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_feature_with_strategies() {
        let state: FeatureState = serde_json::from_str(
            r#"{
              "id": "0d0f1c52-5bd8-4b44-9d6b-66bb2b0d4d7b",
              "key": "banner",
              "l": true,
              "version": 3,
              "type": "STRING",
              "value": "blue",
              "strategies": [{
                "id": "s1",
                "percentage": 200000,
                "value": "red",
                "attributes": [{
                  "conditional": "EQUALS",
                  "fieldName": "country",
                  "values": ["new_zealand"],
                  "type": "STRING"
                }]
              }]
            }"#,
        )
        .unwrap();

        assert_eq!(state.key, "banner");
        assert!(state.locked);
        assert_eq!(state.effective_version(), 3);
        assert_eq!(state.value_type, Some(FeatureValueType::String));
        assert_eq!(state.strategies[0].percentage(), 200_000);
        assert_eq!(
            state.strategies[0].attributes[0].conditional,
            StrategyConditional::Equals
        );
    }

    #[test]
    fn missing_version_means_not_existing() {
        let state: FeatureState = serde_json::from_str(
            r#"{"id": "0d0f1c52-5bd8-4b44-9d6b-66bb2b0d4d7b", "key": "gone"}"#,
        )
        .unwrap();
        assert_eq!(state.effective_version(), -1);
        assert!(!state.exists());
    }

    #[test]
    fn unknown_conditional_does_not_fail_parsing() {
        let attr: RolloutStrategyAttribute = serde_json::from_str(
            r#"{"conditional": "SOUNDS_LIKE", "fieldName": "name", "values": [], "type": "GEO"}"#,
        )
        .unwrap();
        assert_eq!(attr.conditional, StrategyConditional::Unknown);
        assert_eq!(attr.field_type, StrategyFieldType::Unknown);
    }

    #[test]
    fn malformed_items_are_dropped_individually() {
        let items: Vec<TryParse<FeatureState>> = serde_json::from_str(
            r#"[
              {"id": "0d0f1c52-5bd8-4b44-9d6b-66bb2b0d4d7b", "key": "ok", "version": 1},
              {"id": "not-a-uuid", "key": "broken"}
            ]"#,
        )
        .unwrap();
        let parsed = parsed_only(items);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].key, "ok");
    }

    #[test]
    fn result_state_names() {
        assert_eq!("features".parse(), Ok(SseResultState::Features));
        assert_eq!("DELETE_FEATURE".parse(), Ok(SseResultState::DeleteFeature));
        assert_eq!("config".parse(), Ok(SseResultState::Config));
        assert_eq!("pong".parse::<SseResultState>(), Err(()));
    }
}
