//! Rollout strategy evaluation: deterministic percentage bucketing plus attribute matching.
use std::collections::HashMap;

use chrono::{SecondsFormat, Utc};

use crate::{
    attributes::ContextAttributes,
    matchers::MatcherRegistry,
    models::{RolloutStrategy, RolloutStrategyAttribute, StrategyFieldType},
    percentage::{Murmur3PercentageCalculator, PercentageCalculator},
};

/// Field name that matches against the current UTC date or datetime.
const NOW_FIELD: &str = "now";
/// Placeholder for a missing percentage attribute.
const NO_VALUE: &str = "<none>";

/// Outcome of applying a feature's strategies to a context.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub matched: bool,
    pub value: Option<serde_json::Value>,
}

impl Applied {
    fn no_match() -> Applied {
        Applied {
            matched: false,
            value: None,
        }
    }

    fn matched(strategy: &RolloutStrategy) -> Applied {
        Applied {
            matched: true,
            value: strategy.value.clone(),
        }
    }
}

pub struct RolloutStrategyEvaluator {
    calculator: Box<dyn PercentageCalculator + Send + Sync>,
    matchers: MatcherRegistry,
}

impl Default for RolloutStrategyEvaluator {
    fn default() -> Self {
        RolloutStrategyEvaluator::new(Murmur3PercentageCalculator)
    }
}

impl RolloutStrategyEvaluator {
    pub fn new(calculator: impl PercentageCalculator + Send + Sync + 'static) -> Self {
        RolloutStrategyEvaluator {
            calculator: Box::new(calculator),
            matchers: MatcherRegistry,
        }
    }

    /// Walk `strategies` in order and return the value of the first one that fully matches.
    ///
    /// Percentage ranges are cumulative: attribute-less percentage strategies that share a
    /// percentage key take consecutive slices of `[0, 1_000_000)`. A strategy that also has
    /// attributes is checked against its own slice starting from zero.
    pub fn apply(
        &self,
        strategies: &[RolloutStrategy],
        feature_key: &str,
        feature_id: &str,
        context: &ContextAttributes,
    ) -> Applied {
        // percentage key -> (bucket, consumed percentage)
        let mut buckets: HashMap<String, (u32, u32)> = HashMap::new();

        for strategy in strategies {
            let percentage = strategy.percentage();

            if percentage != 0 {
                let percentage_key = percentage_key(context, &strategy.percentage_attributes);
                let (bucket, consumed) = *buckets
                    .entry(percentage_key.clone())
                    .or_insert_with(|| (self.calculator.bucket(&percentage_key, feature_id), 0));

                let lower = if strategy.attributes.is_empty() {
                    consumed
                } else {
                    0
                };

                if (lower..lower.saturating_add(percentage)).contains(&bucket)
                    && self.match_attributes(context, &strategy.attributes)
                {
                    log::trace!(target: "featurehub",
                                feature_key,
                                strategy_id:? = strategy.id,
                                bucket;
                                "percentage strategy matched");
                    return Applied::matched(strategy);
                }

                if strategy.attributes.is_empty() {
                    if let Some(entry) = buckets.get_mut(&percentage_key) {
                        entry.1 = entry.1.saturating_add(percentage);
                    }
                }
            } else if !strategy.attributes.is_empty()
                && self.match_attributes(context, &strategy.attributes)
            {
                log::trace!(target: "featurehub",
                            feature_key,
                            strategy_id:? = strategy.id;
                            "attribute strategy matched");
                return Applied::matched(strategy);
            }
        }

        Applied::no_match()
    }

    /// All conditions must hold.
    fn match_attributes(
        &self,
        context: &ContextAttributes,
        attributes: &[RolloutStrategyAttribute],
    ) -> bool {
        attributes
            .iter()
            .all(|attribute| self.match_attribute(context, attribute))
    }

    fn match_attribute(&self, context: &ContextAttributes, attribute: &RolloutStrategyAttribute) -> bool {
        let now;
        let supplied: &[String] = if attribute.field_name.eq_ignore_ascii_case(NOW_FIELD) {
            now = [current_time(attribute.field_type)];
            &now
        } else {
            context.get_all(&attribute.field_name).unwrap_or(&[])
        };

        match (supplied.is_empty(), attribute.values.is_empty()) {
            // nothing supplied and nothing required
            (true, true) => return true,
            (true, false) | (false, true) => return false,
            (false, false) => {}
        }

        let matcher = self.matchers.find_matcher(attribute);
        supplied.iter().any(|value| matcher.matches(value, attribute))
    }
}

/// Identity to bucket on. Without a session or user key, the empty identity is used: bucketing
/// stays deterministic but cannot follow an individual.
fn percentage_key(context: &ContextAttributes, percentage_attributes: &[String]) -> String {
    if percentage_attributes.is_empty() {
        context.percentage_key().unwrap_or_default().to_owned()
    } else {
        percentage_attributes
            .iter()
            .map(|name| context.get(name).unwrap_or(NO_VALUE))
            .collect::<Vec<_>>()
            .join("$")
    }
}

fn current_time(field_type: StrategyFieldType) -> String {
    let now = Utc::now();
    match field_type {
        StrategyFieldType::Date => now.format("%Y-%m-%d").to_string(),
        _ => now.to_rfc3339_opts(SecondsFormat::Secs, true),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        attributes::{COUNTRY_KEY, USER_KEY},
        models::StrategyConditional,
        percentage::FixedPercentageCalculator,
    };

    fn country_is(country: &str) -> RolloutStrategyAttribute {
        RolloutStrategyAttribute {
            conditional: StrategyConditional::Equals,
            field_name: COUNTRY_KEY.into(),
            values: vec![json!(country)],
            field_type: StrategyFieldType::String,
        }
    }

    fn strategy(
        percentage: Option<u32>,
        attributes: Vec<RolloutStrategyAttribute>,
        value: serde_json::Value,
    ) -> RolloutStrategy {
        RolloutStrategy {
            id: None,
            percentage,
            percentage_attributes: vec![],
            value: Some(value),
            attributes,
        }
    }

    fn context(pairs: &[(&str, &str)]) -> ContextAttributes {
        pairs.iter().copied().collect()
    }

    #[test]
    fn first_match_wins() {
        let strategies = vec![
            strategy(None, vec![country_is("australia")], json!("s1")),
            strategy(None, vec![country_is("new_zealand")], json!("s2")),
            strategy(None, vec![country_is("new_zealand")], json!("s3")),
        ];
        let applied = RolloutStrategyEvaluator::default().apply(
            &strategies,
            "feature",
            "id",
            &context(&[(COUNTRY_KEY, "new_zealand")]),
        );
        assert_eq!(
            applied,
            Applied {
                matched: true,
                value: Some(json!("s2"))
            }
        );
    }

    #[test]
    fn no_match_falls_through() {
        let strategies = vec![strategy(None, vec![country_is("australia")], json!(true))];
        let applied = RolloutStrategyEvaluator::default().apply(
            &strategies,
            "feature",
            "id",
            &context(&[(COUNTRY_KEY, "new_zealand")]),
        );
        assert!(!applied.matched);
        assert_eq!(applied.value, None);
    }

    #[test]
    fn missing_attribute_does_not_match() {
        let strategies = vec![strategy(None, vec![country_is("australia")], json!(true))];
        let applied = RolloutStrategyEvaluator::default().apply(&strategies, "f", "id", &context(&[]));
        assert!(!applied.matched);
    }

    #[test]
    fn multi_valued_attribute_matches_any() {
        let strategies = vec![strategy(None, vec![country_is("australia")], json!(true))];
        let mut ctx = ContextAttributes::new();
        ctx.set_all(COUNTRY_KEY, vec!["new_zealand".into(), "australia".into()]);
        let applied = RolloutStrategyEvaluator::default().apply(&strategies, "f", "id", &ctx);
        assert!(applied.matched);
    }

    #[test]
    fn percentage_ranges_are_cumulative() {
        let strategies = vec![
            strategy(Some(200_000), vec![], json!("first")),
            strategy(Some(300_000), vec![], json!("second")),
        ];
        let ctx = context(&[(USER_KEY, "fred")]);

        let apply = |bucket| {
            RolloutStrategyEvaluator::new(FixedPercentageCalculator(bucket))
                .apply(&strategies, "f", "id", &ctx)
                .value
        };

        assert_eq!(apply(0), Some(json!("first")));
        assert_eq!(apply(199_999), Some(json!("first")));
        assert_eq!(apply(200_000), Some(json!("second")));
        assert_eq!(apply(499_999), Some(json!("second")));
        assert_eq!(apply(500_000), None);
    }

    #[test]
    fn percentage_with_attributes_needs_both() {
        let strategies = vec![strategy(
            Some(500_000),
            vec![country_is("new_zealand")],
            json!("nz-half"),
        )];
        let nz = context(&[(USER_KEY, "fred"), (COUNTRY_KEY, "new_zealand")]);
        let au = context(&[(USER_KEY, "fred"), (COUNTRY_KEY, "australia")]);

        let inside = RolloutStrategyEvaluator::new(FixedPercentageCalculator(10));
        let outside = RolloutStrategyEvaluator::new(FixedPercentageCalculator(600_000));

        assert!(inside.apply(&strategies, "f", "id", &nz).matched);
        assert!(!inside.apply(&strategies, "f", "id", &au).matched);
        assert!(!outside.apply(&strategies, "f", "id", &nz).matched);
    }

    #[test]
    fn percentage_without_identity_is_deterministic() {
        let strategies = vec![strategy(Some(500_000), vec![], json!(true))];
        let evaluator = RolloutStrategyEvaluator::default();
        let first = evaluator.apply(&strategies, "f", "feature-id", &context(&[]));
        for _ in 0..100 {
            assert_eq!(
                evaluator.apply(&strategies, "f", "feature-id", &context(&[])),
                first
            );
        }
    }

    #[test]
    fn percentage_attributes_replace_default_key() {
        let ctx = context(&[("company", "acme"), (USER_KEY, "fred")]);
        assert_eq!(percentage_key(&ctx, &["company".into()]), "acme");
        assert_eq!(
            percentage_key(&ctx, &["company".into(), "team".into()]),
            "acme$<none>"
        );
        assert_eq!(percentage_key(&ctx, &[]), "fred");
    }

    #[test]
    fn now_field_matches_current_date() {
        let strategies = vec![strategy(
            None,
            vec![RolloutStrategyAttribute {
                conditional: StrategyConditional::Greater,
                field_name: "now".into(),
                values: vec![json!("2000-01-01")],
                field_type: StrategyFieldType::Date,
            }],
            json!(true),
        )];
        let applied = RolloutStrategyEvaluator::default().apply(&strategies, "f", "id", &context(&[]));
        assert!(applied.matched);
    }
}
