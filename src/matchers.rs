//! Attribute matchers used by rollout strategies, one per [`StrategyFieldType`].
use std::{cmp::Ordering, net::IpAddr};

use ipnet::IpNet;
use regex::Regex;
use semver::Version;

use crate::models::{RolloutStrategyAttribute, StrategyConditional, StrategyFieldType};

pub trait StrategyMatcher: Send + Sync {
    /// Return `true` if the context-supplied value satisfies `attribute`.
    fn matches(&self, supplied: &str, attribute: &RolloutStrategyAttribute) -> bool;
}

/// Maps strategy field types onto matchers.
#[derive(Debug, Default, Clone, Copy)]
pub struct MatcherRegistry;

impl MatcherRegistry {
    pub fn find_matcher(&self, attribute: &RolloutStrategyAttribute) -> &'static dyn StrategyMatcher {
        match attribute.field_type {
            StrategyFieldType::String | StrategyFieldType::Date | StrategyFieldType::Datetime => {
                &StringMatcher
            }
            StrategyFieldType::SemanticVersion => &SemanticVersionMatcher,
            StrategyFieldType::Number => &NumberMatcher,
            StrategyFieldType::Boolean => &BooleanMatcher,
            StrategyFieldType::IpAddress => &IpAddressMatcher,
            StrategyFieldType::Unknown => &NeverMatcher,
        }
    }
}

/// Render condition values as strings. Non-string JSON values use their JSON text.
fn string_values(attribute: &RolloutStrategyAttribute) -> Vec<String> {
    attribute
        .values
        .iter()
        .filter_map(|v| match v {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        })
        .collect()
}

/// Apply an ordering-based conditional. `None` if the conditional is not an ordering.
fn eval_ordering<T>(
    conditional: StrategyConditional,
    supplied: &T,
    values: &[T],
    cmp: impl Fn(&T, &T) -> Ordering,
) -> Option<bool> {
    let accepts: fn(Ordering) -> bool = match conditional {
        StrategyConditional::Equals | StrategyConditional::NotEquals => Ordering::is_eq,
        StrategyConditional::Greater => Ordering::is_gt,
        StrategyConditional::GreaterEquals => Ordering::is_ge,
        StrategyConditional::Less => Ordering::is_lt,
        StrategyConditional::LessEquals => Ordering::is_le,
        _ => return None,
    };
    let any = values.iter().any(|v| accepts(cmp(supplied, v)));

    Some(if conditional == StrategyConditional::NotEquals {
        !any
    } else {
        any
    })
}

/// Apply a textual conditional. `None` if the conditional is not textual.
fn eval_text(conditional: StrategyConditional, supplied: &str, values: &[String]) -> Option<bool> {
    Some(match conditional {
        StrategyConditional::StartsWith => values.iter().any(|v| supplied.starts_with(v.as_str())),
        StrategyConditional::EndsWith => values.iter().any(|v| supplied.ends_with(v.as_str())),
        StrategyConditional::Includes => values.iter().any(|v| supplied.contains(v.as_str())),
        StrategyConditional::Excludes => !values.iter().any(|v| supplied.contains(v.as_str())),
        StrategyConditional::Regex => values.iter().any(|v| {
            Regex::new(v)
                .map(|regex| regex.is_match(supplied))
                .unwrap_or_else(|err| {
                    log::warn!(target: "featurehub", pattern = v.as_str(); "invalid strategy regex: {err}");
                    false
                })
        }),
        _ => return None,
    })
}

/// Strings, plus ISO-8601 dates and datetimes (which order lexicographically).
pub struct StringMatcher;

impl StrategyMatcher for StringMatcher {
    fn matches(&self, supplied: &str, attribute: &RolloutStrategyAttribute) -> bool {
        let values = string_values(attribute);
        eval_ordering(attribute.conditional, &supplied.to_owned(), &values, |a, b| a.cmp(b))
            .or_else(|| eval_text(attribute.conditional, supplied, &values))
            .unwrap_or(false)
    }
}

pub struct NumberMatcher;

impl StrategyMatcher for NumberMatcher {
    fn matches(&self, supplied: &str, attribute: &RolloutStrategyAttribute) -> bool {
        let text_values = string_values(attribute);
        if let Some(result) = eval_text(attribute.conditional, supplied, &text_values) {
            return result;
        }

        let Ok(number) = supplied.trim().parse::<f64>() else {
            return false;
        };
        let numbers: Vec<f64> = text_values
            .iter()
            .filter_map(|v| v.trim().parse().ok())
            .collect();

        eval_ordering(attribute.conditional, &number, &numbers, |a, b| {
            a.partial_cmp(b).unwrap_or(Ordering::Less)
        })
        .unwrap_or(false)
    }
}

/// Parse a semantic version, accepting `major` and `major.minor` shorthands.
fn parse_version(s: &str) -> Option<Version> {
    let s = s.trim().trim_start_matches('v');
    Version::parse(s).ok().or_else(|| {
        let padded = match s.matches('.').count() {
            0 => format!("{s}.0.0"),
            1 => format!("{s}.0"),
            _ => return None,
        };
        Version::parse(&padded).ok()
    })
}

pub struct SemanticVersionMatcher;

impl StrategyMatcher for SemanticVersionMatcher {
    fn matches(&self, supplied: &str, attribute: &RolloutStrategyAttribute) -> bool {
        let text_values = string_values(attribute);
        if let Some(result) = eval_text(attribute.conditional, supplied, &text_values) {
            return result;
        }

        let Some(version) = parse_version(supplied) else {
            return false;
        };
        let versions: Vec<Version> = text_values.iter().filter_map(|v| parse_version(v)).collect();

        eval_ordering(attribute.conditional, &version, &versions, |a, b| a.cmp(b)).unwrap_or(false)
    }
}

pub struct BooleanMatcher;

impl StrategyMatcher for BooleanMatcher {
    fn matches(&self, supplied: &str, attribute: &RolloutStrategyAttribute) -> bool {
        let supplied = supplied.eq_ignore_ascii_case("true");
        let Some(expected) = attribute.values.first().map(|v| match v {
            serde_json::Value::Bool(b) => *b,
            serde_json::Value::String(s) => s.eq_ignore_ascii_case("true"),
            _ => false,
        }) else {
            return false;
        };

        match attribute.conditional {
            StrategyConditional::Equals => supplied == expected,
            StrategyConditional::NotEquals => supplied != expected,
            _ => false,
        }
    }
}

pub struct IpAddressMatcher;

fn parse_net(s: &str) -> Option<IpNet> {
    let s = s.trim();
    s.parse::<IpNet>()
        .ok()
        .or_else(|| s.parse::<IpAddr>().ok().map(IpNet::from))
}

impl StrategyMatcher for IpAddressMatcher {
    fn matches(&self, supplied: &str, attribute: &RolloutStrategyAttribute) -> bool {
        let Some(supplied) = parse_net(supplied) else {
            return false;
        };
        let networks: Vec<IpNet> = string_values(attribute)
            .iter()
            .filter_map(|v| parse_net(v))
            .collect();
        let contained = networks.iter().any(|net| net.contains(&supplied));

        match attribute.conditional {
            StrategyConditional::Equals | StrategyConditional::Includes => contained,
            StrategyConditional::NotEquals | StrategyConditional::Excludes => !contained,
            _ => false,
        }
    }
}

struct NeverMatcher;

impl StrategyMatcher for NeverMatcher {
    fn matches(&self, _supplied: &str, _attribute: &RolloutStrategyAttribute) -> bool {
        false
    }
}
