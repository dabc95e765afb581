//! Per-caller evaluation contexts and the feature values they resolve.
use std::sync::{Arc, Mutex, PoisonError};

use serde::de::DeserializeOwned;
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{
    attributes::{
        ContextAttributes, CountryName, StrategyAttributeDeviceName,
        StrategyAttributePlatformName, COUNTRY_KEY, DEVICE_KEY, PLATFORM_KEY, SESSION_KEY,
        USER_KEY, VERSION_KEY,
    },
    edge::EdgeService,
    models::FeatureValueType,
    readiness::{PendingReadiness, Readiness},
    repository::{FeatureEntry, FeatureRepository},
    Result,
};

/// What `build()` means for a given evaluation mode.
trait EvaluationMode: Send + Sync {
    fn build(
        &self,
        attributes: &ContextAttributes,
        repository: &FeatureRepository,
        edge: &dyn EdgeService,
    ) -> PendingReadiness;

    /// Whether strategies are evaluated locally against the context attributes.
    fn evaluates_locally(&self) -> bool;
}

/// The repository holds every strategy; attributes apply as soon as they are set.
struct ClientEvaluation;

impl EvaluationMode for ClientEvaluation {
    fn build(
        &self,
        _attributes: &ContextAttributes,
        _repository: &FeatureRepository,
        edge: &dyn EdgeService,
    ) -> PendingReadiness {
        edge.context_change(None, "0")
    }

    fn evaluates_locally(&self) -> bool {
        true
    }
}

/// The edge resolves values for the context, so a changed context needs a round-trip.
struct ServerEvaluation {
    last_header: Mutex<Option<String>>,
}

impl EvaluationMode for ServerEvaluation {
    fn build(
        &self,
        attributes: &ContextAttributes,
        repository: &FeatureRepository,
        edge: &dyn EdgeService,
    ) -> PendingReadiness {
        let header = attributes.to_header();
        {
            let mut last = self
                .last_header
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if *last != header {
                log::debug!(target: "featurehub", header = header.as_deref(); "context changed, waiting for the edge");
                repository.not_ready();
                *last = header.clone();
            }
        }

        let context_sha = header.as_deref().map_or_else(|| "0".to_owned(), context_sha);
        edge.context_change(header.as_deref(), &context_sha)
    }

    fn evaluates_locally(&self) -> bool {
        false
    }
}

/// Hex SHA-256 of the `x-featurehub` header, used to break edge caches.
fn context_sha(header: &str) -> String {
    hex::encode(Sha256::digest(header.as_bytes()))
}

/// Attributes describing one user or request, and the entry point for reading features.
///
/// In client-evaluated mode attribute changes take effect on the next read. In server-evaluated
/// mode call [`ClientContext::build`] after changing attributes and wait for it before trusting
/// feature values.
pub struct ClientContext {
    repository: Arc<FeatureRepository>,
    edge: Arc<dyn EdgeService>,
    attributes: ContextAttributes,
    mode: Box<dyn EvaluationMode>,
}

impl ClientContext {
    pub(crate) fn new(
        repository: Arc<FeatureRepository>,
        edge: Arc<dyn EdgeService>,
        server_evaluation: bool,
    ) -> ClientContext {
        let mode: Box<dyn EvaluationMode> = if server_evaluation {
            Box::new(ServerEvaluation {
                last_header: Mutex::new(None),
            })
        } else {
            Box::new(ClientEvaluation)
        };
        ClientContext {
            repository,
            edge,
            attributes: ContextAttributes::new(),
            mode,
        }
    }

    pub fn user_key(&mut self, key: impl Into<String>) -> &mut Self {
        self.attr(USER_KEY, key)
    }

    pub fn session_key(&mut self, key: impl Into<String>) -> &mut Self {
        self.attr(SESSION_KEY, key)
    }

    pub fn country(&mut self, country: impl Into<CountryName>) -> &mut Self {
        self.attr(COUNTRY_KEY, country.into().to_string())
    }

    pub fn device(&mut self, device: StrategyAttributeDeviceName) -> &mut Self {
        self.attr(DEVICE_KEY, device.to_string())
    }

    pub fn platform(&mut self, platform: StrategyAttributePlatformName) -> &mut Self {
        self.attr(PLATFORM_KEY, platform.to_string())
    }

    pub fn version(&mut self, version: impl Into<String>) -> &mut Self {
        self.attr(VERSION_KEY, version)
    }

    /// Set a custom attribute, replacing any previous values.
    pub fn attr(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.attributes.set(name, value);
        self
    }

    /// Set a multi-valued custom attribute.
    pub fn attrs(&mut self, name: impl Into<String>, values: Vec<String>) -> &mut Self {
        self.attributes.set_all(name, values);
        self
    }

    /// Remove every attribute.
    pub fn clear(&mut self) -> &mut Self {
        self.attributes.clear();
        self
    }

    pub fn get_attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name)
    }

    pub fn attributes(&self) -> &ContextAttributes {
        &self.attributes
    }

    /// Tell the edge about the current attributes.
    ///
    /// The returned future completes once the edge has answered for this context, or straight away
    /// with the current readiness when no round-trip is needed.
    pub fn build(&self) -> PendingReadiness {
        self.mode
            .build(&self.attributes, &self.repository, self.edge.as_ref())
    }

    pub fn readiness(&self) -> Readiness {
        self.repository.readiness()
    }

    /// Look up a feature for this context. Unknown keys resolve to an empty value.
    pub fn feature(&self, key: &str) -> FeatureValue<'_> {
        self.edge.feature_used();

        FeatureValue {
            entry: self.repository.get_feat(key),
            context: self,
        }
    }

    pub fn is_enabled(&self, key: &str) -> bool {
        self.feature(key).is_enabled()
    }

    pub fn is_set(&self, key: &str) -> bool {
        self.feature(key).is_set()
    }

    pub fn exists(&self, key: &str) -> bool {
        self.feature(key).exists()
    }

    fn resolve(&self, entry: &FeatureEntry, expected: Option<FeatureValueType>) -> Option<Value> {
        let attributes = self.mode.evaluates_locally().then_some(&self.attributes);
        self.repository.resolve(entry, expected, attributes)
    }
}

impl std::fmt::Debug for ClientContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientContext")
            .field("attributes", &self.attributes)
            .field("evaluates_locally", &self.mode.evaluates_locally())
            .finish()
    }
}

/// A feature as seen through a [`ClientContext`].
///
/// Values are resolved on every call, so a `FeatureValue` kept around follows server updates.
/// Reads of the wrong type return `None`.
pub struct FeatureValue<'a> {
    entry: Arc<FeatureEntry>,
    context: &'a ClientContext,
}

impl FeatureValue<'_> {
    pub fn key(&self) -> &str {
        self.entry.key()
    }

    pub fn id(&self) -> Option<Uuid> {
        self.entry.id()
    }

    pub fn version(&self) -> Option<i64> {
        self.entry.version()
    }

    pub fn exists(&self) -> bool {
        self.entry.exists()
    }

    pub fn is_locked(&self) -> bool {
        self.entry.is_locked()
    }

    pub fn value_type(&self) -> Option<FeatureValueType> {
        self.entry.value_type()
    }

    /// The resolved value whatever its type.
    pub fn value(&self) -> Option<Value> {
        self.context.resolve(&self.entry, None)
    }

    pub fn flag(&self) -> Option<bool> {
        match self
            .context
            .resolve(&self.entry, Some(FeatureValueType::Boolean))?
        {
            Value::Bool(flag) => Some(flag),
            Value::String(s) => Some(s.eq_ignore_ascii_case("true")),
            _ => None,
        }
    }

    /// `true` only for a boolean feature resolving to `true`.
    pub fn is_enabled(&self) -> bool {
        self.flag() == Some(true)
    }

    pub fn string(&self) -> Option<String> {
        match self
            .context
            .resolve(&self.entry, Some(FeatureValueType::String))?
        {
            Value::String(s) => Some(s),
            other => Some(other.to_string()),
        }
    }

    pub fn number(&self) -> Option<f64> {
        match self
            .context
            .resolve(&self.entry, Some(FeatureValueType::Number))?
        {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// JSON feature value as the raw string the server sent.
    pub fn raw_json(&self) -> Option<String> {
        match self
            .context
            .resolve(&self.entry, Some(FeatureValueType::Json))?
        {
            Value::String(s) => Some(s),
            other => Some(other.to_string()),
        }
    }

    /// JSON feature value decoded into `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match self.raw_json() {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Whether the feature resolves to a value at all.
    pub fn is_set(&self) -> bool {
        self.value().is_some_and(|v| !v.is_null())
    }
}

impl std::fmt::Debug for FeatureValue<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureValue")
            .field("key", &self.key())
            .field("value", &self.value())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::AtomicUsize, sync::atomic::Ordering, time::Duration};

    use serde::Deserialize;

    use super::*;
    use crate::models::FeatureState;

    /// Records context changes and answers with the repository's readiness.
    #[derive(Default)]
    struct RecordingEdge {
        changes: Mutex<Vec<(Option<String>, String)>>,
        used: AtomicUsize,
    }

    impl EdgeService for RecordingEdge {
        fn poll(&self) -> PendingReadiness {
            PendingReadiness::ready(Readiness::Ready)
        }

        fn context_change(&self, header: Option<&str>, context_sha: &str) -> PendingReadiness {
            self.changes
                .lock()
                .unwrap()
                .push((header.map(str::to_owned), context_sha.to_owned()));
            PendingReadiness::ready(Readiness::Ready)
        }

        fn requires_replacement_on_header_change(&self) -> bool {
            false
        }

        fn feature_used(&self) {
            self.used.fetch_add(1, Ordering::SeqCst);
        }

        fn current_interval(&self) -> Duration {
            Duration::ZERO
        }

        fn is_stopped(&self) -> bool {
            false
        }

        fn close(&self) {}
    }

    fn feature(json: &str) -> FeatureState {
        serde_json::from_str(json).unwrap()
    }

    fn setup(server_evaluation: bool) -> (Arc<FeatureRepository>, Arc<RecordingEdge>, ClientContext) {
        let repository = FeatureRepository::new(1).unwrap();
        let edge = Arc::new(RecordingEdge::default());
        let context = ClientContext::new(repository.clone(), edge.clone(), server_evaluation);
        (repository, edge, context)
    }

    const TARGETED: &str = r#"{
        "id": "0d0f1c52-5bd8-4b44-9d6b-66bb2b0d4d7b",
        "key": "banner",
        "version": 1,
        "type": "BOOLEAN",
        "value": false,
        "strategies": [{
            "id": "s1",
            "value": true,
            "attributes": [{"fieldName": "userkey", "conditional": "EQUALS", "type": "STRING", "values": ["fred"]}]
        }]
    }"#;

    #[test]
    fn client_evaluation_applies_attributes_immediately() {
        let (repository, _edge, mut context) = setup(false);
        repository.update_features(vec![feature(TARGETED)], false);

        assert!(!context.is_enabled("banner"));
        context.user_key("fred");
        assert!(context.is_enabled("banner"));
        context.clear();
        assert_eq!(context.feature("banner").flag(), Some(false));
    }

    #[test]
    fn client_evaluation_build_sends_no_header() {
        let (_repository, edge, mut context) = setup(false);
        context.user_key("fred");
        assert_eq!(context.build().wait(), Readiness::Ready);
        assert_eq!(*edge.changes.lock().unwrap(), vec![(None, "0".to_owned())]);
    }

    #[test]
    fn server_evaluation_sends_header_and_hash() {
        let (repository, edge, mut context) = setup(true);
        repository.update_features(vec![feature(TARGETED)], false);
        assert_eq!(repository.readiness(), Readiness::Ready);

        context.user_key("fred");
        context.build();
        // a changed context is not trustworthy until the edge answers
        assert_eq!(repository.readiness(), Readiness::NotReady);

        let changes = edge.changes.lock().unwrap().clone();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].0.as_deref(), Some("userkey=fred"));
        assert_eq!(changes[0].1, context_sha("userkey=fred"));
        assert_eq!(changes[0].1.len(), 64);

        // the server already resolved values, so local strategies are skipped
        repository.update_features(vec![feature(TARGETED)], true);
        assert_eq!(context.feature("banner").flag(), Some(false));
    }

    #[test]
    fn unchanged_server_context_keeps_readiness() {
        let (repository, edge, mut context) = setup(true);
        context.user_key("fred");
        context.build();
        repository.update_features(vec![], false);

        context.build();
        assert_eq!(repository.readiness(), Readiness::Ready);
        assert_eq!(edge.changes.lock().unwrap().len(), 2);
    }

    #[test]
    fn empty_server_context_hashes_to_zero() {
        let (_repository, edge, context) = setup(true);
        context.build();
        assert_eq!(*edge.changes.lock().unwrap(), vec![(None, "0".to_owned())]);
    }

    #[test]
    fn typed_accessors() {
        let (repository, _edge, context) = setup(false);
        repository.update_features(
            vec![
                feature(r#"{"id":"1e1f1c52-5bd8-4b44-9d6b-66bb2b0d4d01","key":"colour","version":1,"type":"STRING","value":"blue"}"#),
                feature(r#"{"id":"1e1f1c52-5bd8-4b44-9d6b-66bb2b0d4d02","key":"limit","version":1,"type":"NUMBER","value":12.5}"#),
                feature(r#"{"id":"1e1f1c52-5bd8-4b44-9d6b-66bb2b0d4d03","key":"shape","version":1,"type":"JSON","value":"{\"sides\":3}"}"#),
                feature(r#"{"id":"1e1f1c52-5bd8-4b44-9d6b-66bb2b0d4d04","key":"legacy","version":1,"type":"BOOLEAN","value":"TRUE"}"#),
            ],
            false,
        );

        assert_eq!(context.feature("colour").string().as_deref(), Some("blue"));
        assert_eq!(context.feature("colour").number(), None);
        assert_eq!(context.feature("limit").number(), Some(12.5));
        assert_eq!(context.feature("limit").flag(), None);
        assert_eq!(
            context.feature("shape").raw_json().as_deref(),
            Some(r#"{"sides":3}"#)
        );
        assert!(context.is_enabled("legacy"));

        #[derive(Deserialize, Debug, PartialEq)]
        struct Shape {
            sides: u32,
        }
        assert_eq!(
            context.feature("shape").json::<Shape>().unwrap(),
            Some(Shape { sides: 3 })
        );
        assert!(context.feature("colour").json::<Shape>().unwrap().is_none());
    }

    #[test]
    fn unknown_feature_is_unset() {
        let (_repository, _edge, context) = setup(false);
        let value = context.feature("nope");
        assert!(!value.exists());
        assert!(!value.is_set());
        assert_eq!(value.key(), "nope");
        assert_eq!(value.version(), None);
        assert!(!context.is_enabled("nope"));
    }

    #[test]
    fn reading_a_feature_tells_the_edge() {
        let (_repository, edge, context) = setup(false);
        let _ = context.feature("anything");
        assert_eq!(edge.used.load(Ordering::SeqCst), 1);
        let _ = context.is_enabled("anything");
        assert_eq!(edge.used.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn well_known_attributes() {
        let (_repository, _edge, mut context) = setup(false);
        context
            .user_key("fred")
            .session_key("s-1")
            .country("new_zealand")
            .device(StrategyAttributeDeviceName::Mobile)
            .platform(StrategyAttributePlatformName::Ios)
            .version("1.2.3")
            .attrs("tags", vec!["a".into(), "b".into()]);

        assert_eq!(context.get_attr(USER_KEY), Some("fred"));
        assert_eq!(context.get_attr(COUNTRY_KEY), Some("new_zealand"));
        assert_eq!(context.get_attr(DEVICE_KEY), Some("mobile"));
        assert_eq!(context.get_attr(PLATFORM_KEY), Some("ios"));
        assert_eq!(context.attributes().percentage_key(), Some("s-1"));
        assert_eq!(
            context.attributes().get_all("tags"),
            Some(&["a".to_owned(), "b".to_owned()][..])
        );
    }
}
