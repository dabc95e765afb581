//! The Rust SDK for FeatureHub, an open-source feature flag, experimentation and remote
//! configuration platform.
//!
//! # Overview
//!
//! A [`FeatureHub`] client keeps a local [`FeatureRepository`] in sync with a FeatureHub edge
//! server, either over a server-sent events stream or by polling. Features are read through a
//! [`ClientContext`], which carries the attributes of one user or request (user key, country,
//! device, custom attributes) and resolves each feature through its rollout strategies.
//!
//! API keys containing a `*` are client-evaluated: the repository receives every strategy and
//! evaluates them locally. Other keys are server-evaluated: the edge resolves values for the
//! context, so a changed context must be [built](ClientContext::build) before its values are
//! trustworthy.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum and only returned when constructing a client or
//! decoding JSON feature values. Connectivity problems never surface as errors: they are reported
//! through [`Readiness`], and feature reads return `None` or the last known value.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging messages, all
//! under the `featurehub` target. Consider integrating a `log`-compatible logger implementation for
//! better visibility into SDK operations.

#![warn(rustdoc::missing_crate_level_docs)]

mod attributes;
mod client;
mod config;
mod context;
mod edge;
mod error;
mod executor;
mod interceptor;
mod listeners;
mod matchers;
mod models;
mod percentage;
mod readiness;
mod repository;
mod strategy;

pub use attributes::{
    ContextAttributes, CountryName, StrategyAttributeDeviceName, StrategyAttributePlatformName,
    COUNTRY_KEY, DEVICE_KEY, PLATFORM_KEY, SESSION_KEY, USER_KEY, VERSION_KEY,
};
pub use client::FeatureHub;
pub use config::{EdgeType, FeatureHubConfig};
pub use context::{ClientContext, FeatureValue};
pub use edge::{
    EdgeConnectionState, EdgeReconnector, EdgeRetryer, EdgeRetryerConfig, EdgeService,
    PollingGovernor, RestEdgeService, SseEdgeService,
};
pub use error::{Error, Result};
pub use interceptor::{EnvironmentValueInterceptor, FeatureValueInterceptor};
pub use listeners::ListenerHandle;
pub use matchers::StrategyMatcher;
pub use models::{
    FeatureEnvironmentCollection, FeatureState, FeatureValueType, RolloutStrategy,
    RolloutStrategyAttribute, SseResultState, StrategyConditional, StrategyFieldType,
};
pub use percentage::{Murmur3PercentageCalculator, PercentageCalculator};
pub use readiness::{PendingReadiness, Readiness, ReadinessPromise};
pub use repository::{FeatureEntry, FeatureRepository};
pub use strategy::{Applied, RolloutStrategyEvaluator};
