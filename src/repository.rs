//! The local feature view: version-reconciled feature states, readiness, and change listeners.
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, PoisonError, RwLock, Weak,
    },
};

use serde_json::Value;
use uuid::Uuid;

use crate::{
    attributes::ContextAttributes,
    executor::Executor,
    interceptor::FeatureValueInterceptor,
    listeners::{ListenerHandle, Listeners},
    models::{FeatureState, FeatureValueType, SseResultState},
    readiness::Readiness,
    strategy::RolloutStrategyEvaluator,
    Result,
};

/// Holder for the latest state of one feature key.
///
/// Created on first reference or first update and kept until the repository closes, so a handle
/// obtained before the feature arrives starts resolving once it does.
pub struct FeatureEntry {
    key: String,
    state: RwLock<Option<Arc<FeatureState>>>,
    listeners: Listeners<Arc<FeatureEntry>>,
}

impl FeatureEntry {
    fn new(key: &str) -> FeatureEntry {
        FeatureEntry {
            key: key.to_owned(),
            state: RwLock::new(None),
            listeners: Listeners::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Latest server-delivered state, if any.
    pub fn state(&self) -> Option<Arc<FeatureState>> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace(&self, state: Option<Arc<FeatureState>>) -> Option<Arc<FeatureState>> {
        std::mem::replace(
            &mut *self.state.write().unwrap_or_else(PoisonError::into_inner),
            state,
        )
    }

    pub fn id(&self) -> Option<Uuid> {
        self.state().map(|s| s.id)
    }

    pub fn version(&self) -> Option<i64> {
        self.state().and_then(|s| s.version)
    }

    pub fn exists(&self) -> bool {
        self.state().is_some_and(|s| s.exists())
    }

    pub fn is_locked(&self) -> bool {
        self.state().is_some_and(|s| s.locked)
    }

    pub fn value_type(&self) -> Option<FeatureValueType> {
        self.state().and_then(|s| s.value_type)
    }

    /// Base value, without interceptors or strategies.
    pub fn value(&self) -> Option<Value> {
        self.state().and_then(|s| s.value.clone())
    }

    /// Called on the shared pool whenever this feature's value changes.
    pub fn add_listener(
        &self,
        callback: impl Fn(Arc<FeatureEntry>) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.listeners.add(callback)
    }
}

impl std::fmt::Debug for FeatureEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureEntry")
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}

struct InterceptorHolder {
    allow_lock_override: bool,
    interceptor: Box<dyn FeatureValueInterceptor>,
}

/// Concurrent store of feature states fed by an edge service.
///
/// A single ingestion path writes; any number of threads read. Listener callbacks always run on
/// the repository's worker pool, never on the thread applying the update.
pub struct FeatureRepository {
    this: Weak<FeatureRepository>,
    features: RwLock<HashMap<String, Arc<FeatureEntry>>>,
    features_by_id: RwLock<HashMap<Uuid, Arc<FeatureEntry>>>,
    readiness: RwLock<Readiness>,
    has_received_initial_state: AtomicBool,
    closed: AtomicBool,
    readiness_listeners: Listeners<Readiness>,
    new_state_listeners: Listeners<Arc<FeatureRepository>>,
    feature_update_listeners: Listeners<Arc<FeatureEntry>>,
    interceptors: RwLock<Vec<InterceptorHolder>>,
    evaluator: RolloutStrategyEvaluator,
    executor: Executor,
}

impl FeatureRepository {
    /// Create a repository dispatching listener callbacks on `thread_pool_size` workers.
    pub fn new(thread_pool_size: usize) -> Result<Arc<FeatureRepository>> {
        FeatureRepository::with_evaluator(thread_pool_size, RolloutStrategyEvaluator::default())
    }

    pub fn with_evaluator(
        thread_pool_size: usize,
        evaluator: RolloutStrategyEvaluator,
    ) -> Result<Arc<FeatureRepository>> {
        let executor = Executor::new("featurehub-listeners", thread_pool_size)?;
        Ok(Arc::new_cyclic(|this| FeatureRepository {
            this: this.clone(),
            features: RwLock::new(HashMap::new()),
            features_by_id: RwLock::new(HashMap::new()),
            readiness: RwLock::new(Readiness::NotReady),
            has_received_initial_state: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            readiness_listeners: Listeners::new(),
            new_state_listeners: Listeners::new(),
            feature_update_listeners: Listeners::new(),
            interceptors: RwLock::new(Vec::new()),
            evaluator,
            executor,
        }))
    }

    pub fn readiness(&self) -> Readiness {
        *self.readiness.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_readiness(&self, readiness: Readiness) -> Readiness {
        std::mem::replace(
            &mut *self.readiness.write().unwrap_or_else(PoisonError::into_inner),
            readiness,
        )
    }

    fn broadcast_readiness(&self) {
        let readiness = self.readiness();
        log::trace!(target: "featurehub", readiness:?; "broadcasting readiness");
        self.readiness_listeners.dispatch(&self.executor, readiness);
    }

    /// Apply a full batch of feature states, then mark the repository ready.
    pub fn update_features(&self, states: Vec<FeatureState>, force: bool) {
        if self.is_closed() {
            log::debug!(target: "featurehub", "ignoring features delivered after close");
            return;
        }

        for state in states {
            self.update_feature(state, force);
        }

        let first = !self.has_received_initial_state.swap(true, Ordering::SeqCst);
        let previous = self.set_readiness(Readiness::Ready);
        if first || previous != Readiness::Ready {
            self.broadcast_readiness();
        }

        if let Some(this) = self.this.upgrade() {
            self.new_state_listeners.dispatch(&self.executor, this);
        }
    }

    /// Apply a single feature state. Returns whether it was accepted.
    ///
    /// Unless `force` is set, an update is rejected when the stored version is newer, or when the
    /// versions are equal and the value did not change. Server-evaluated values can change at the
    /// same version when the context changes.
    pub fn update_feature(&self, state: FeatureState, force: bool) -> bool {
        if self.is_closed() {
            return false;
        }

        let entry = self.entry(&state.key);
        let previous = entry.state();

        if let Some(existing) = previous.as_deref() {
            if !force {
                let existing_version = existing.effective_version();
                let new_version = state.effective_version();
                if existing_version > new_version
                    || (existing_version == new_version && existing.value == state.value)
                {
                    log::trace!(target: "featurehub",
                                feature_key = state.key.as_str(),
                                existing_version,
                                new_version;
                                "ignoring stale feature update");
                    return false;
                }
            }
        }

        self.forget_renamed(&state);

        let id = state.id;
        let state = Arc::new(state);
        entry.replace(Some(state.clone()));
        self.features_by_id
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, entry.clone());

        let changed = previous.as_deref().map_or(true, |p| {
            p.value != state.value || p.value_type != state.value_type || p.exists() != state.exists()
        });
        if changed {
            entry.listeners.dispatch(&self.executor, entry.clone());
            if self.has_received_initial_state.load(Ordering::SeqCst) {
                self.feature_update_listeners
                    .dispatch(&self.executor, entry.clone());
            }
        }

        true
    }

    /// A feature id that now arrives under a different key was renamed: the old key stops
    /// resolving.
    fn forget_renamed(&self, state: &FeatureState) {
        let renamed = self
            .features_by_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&state.id)
            .filter(|entry| entry.key != state.key)
            .cloned();
        if let Some(old) = renamed {
            log::debug!(target: "featurehub",
                        old_key = old.key.as_str(),
                        new_key = state.key.as_str();
                        "feature key renamed");
            old.replace(None);
            old.listeners.dispatch(&self.executor, old.clone());
        }
    }

    /// Remove a feature's value. The entry keeps its key so existing handles stay valid, but
    /// reports that the feature no longer exists.
    pub fn delete_feature(&self, mut state: FeatureState) {
        state.value = None;
        let id = state.id;
        let key = state.key.clone();
        if self.update_feature(state, false) {
            let entry = self.entry(&key);
            if let Some(current) = entry.state() {
                entry.replace(Some(Arc::new(FeatureState {
                    version: None,
                    ..FeatureState::clone(&current)
                })));
            }
            self.features_by_id
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            log::debug!(target: "featurehub", feature_key = key.as_str(); "feature deleted");
        }
    }

    fn entry(&self, key: &str) -> Arc<FeatureEntry> {
        self.get_or_create(key).0
    }

    fn get_or_create(&self, key: &str) -> (Arc<FeatureEntry>, bool) {
        if let Some(entry) = self
            .features
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
        {
            return (entry.clone(), false);
        }

        let mut features = self.features.write().unwrap_or_else(PoisonError::into_inner);
        let mut created = false;
        let entry = features
            .entry(key.to_owned())
            .or_insert_with(|| {
                created = true;
                Arc::new(FeatureEntry::new(key))
            })
            .clone();
        (entry, created)
    }

    /// Look up the entry for `key`, creating an empty one for keys never seen.
    ///
    /// Concurrent callers asking for the same unknown key receive the same entry.
    pub fn get_feat(&self, key: &str) -> Arc<FeatureEntry> {
        let (entry, created) = self.get_or_create(key);
        if created && self.has_received_initial_state.load(Ordering::SeqCst) {
            log::error!(target: "featurehub",
                        feature_key = key;
                        "application requested an unknown feature key after initialization");
        }
        entry
    }

    pub fn feature_by_id(&self, id: &Uuid) -> Option<Arc<FeatureEntry>> {
        self.features_by_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn feature_keys(&self) -> Vec<String> {
        self.features
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn all_features(&self) -> Vec<Arc<FeatureEntry>> {
        self.features
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Ingestion-side signal. Only `Failure` changes state here.
    pub fn notify(&self, state: SseResultState) {
        log::trace!(target: "featurehub", state:?; "received edge state");
        match state {
            SseResultState::Failure => {
                self.set_readiness(Readiness::Failed);
                self.broadcast_readiness();
            }
            SseResultState::Ack
            | SseResultState::Bye
            | SseResultState::Features
            | SseResultState::Feature
            | SseResultState::DeleteFeature
            | SseResultState::Config => {}
        }
    }

    /// The current view no longer matches the caller's context.
    pub fn not_ready(&self) {
        if self.set_readiness(Readiness::NotReady) != Readiness::NotReady {
            self.broadcast_readiness();
        }
    }

    /// The edge has nothing for us, which is still a usable view.
    pub fn repository_empty(&self) {
        self.set_readiness(Readiness::Ready);
        self.broadcast_readiness();
    }

    /// Register a readiness listener. It is sent the current readiness straight away.
    pub fn add_readiness_listener(
        &self,
        callback: impl Fn(Readiness) + Send + Sync + 'static,
    ) -> ListenerHandle {
        let callback = Arc::new(callback);
        let current = callback.clone();
        let handle = self.readiness_listeners.add(move |r| callback(r));
        Listeners::dispatch_one(&self.executor, self.readiness(), move |r| current(r));
        handle
    }

    /// Called with the changed entry whenever a feature value changes after the initial state.
    pub fn register_feature_update_available(
        &self,
        callback: impl Fn(Arc<FeatureEntry>) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.feature_update_listeners.add(callback)
    }

    /// Called after every applied batch of features.
    pub fn register_new_feature_state_available(
        &self,
        callback: impl Fn(Arc<FeatureRepository>) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.new_state_listeners.add(callback)
    }

    /// Add a value interceptor. Locked features are only intercepted if `allow_lock_override`.
    pub fn register_value_interceptor(
        &self,
        allow_lock_override: bool,
        interceptor: impl FeatureValueInterceptor + 'static,
    ) {
        self.register_boxed_interceptor(allow_lock_override, Box::new(interceptor));
    }

    pub(crate) fn register_boxed_interceptor(
        &self,
        allow_lock_override: bool,
        interceptor: Box<dyn FeatureValueInterceptor>,
    ) {
        self.interceptors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(InterceptorHolder {
                allow_lock_override,
                interceptor,
            });
    }

    /// First interceptor value for `key` that is allowed to apply.
    pub fn find_intercept(&self, locked: bool, key: &str) -> Option<Value> {
        self.interceptors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|holder| !locked || holder.allow_lock_override)
            .find_map(|holder| holder.interceptor.intercept(key))
    }

    /// Resolve the value of `entry`, optionally against a context.
    ///
    /// Interceptors come first and short-circuit everything else. When `expected` is given, a
    /// feature of another type resolves to `None`. Strategies are only evaluated when a context
    /// is supplied.
    pub fn resolve(
        &self,
        entry: &FeatureEntry,
        expected: Option<FeatureValueType>,
        context: Option<&ContextAttributes>,
    ) -> Option<Value> {
        let state = entry.state();
        let locked = state.as_deref().is_some_and(|s| s.locked);

        if let Some(value) = self.find_intercept(locked, &entry.key) {
            return Some(value);
        }

        let state = state?;
        let value_type = state.value_type?;
        if expected.is_some_and(|expected| expected != value_type) {
            return None;
        }

        if let Some(context) = context {
            if !state.strategies.is_empty() {
                let applied = self.evaluator.apply(
                    &state.strategies,
                    &entry.key,
                    &state.id.to_string(),
                    context,
                );
                if applied.matched {
                    return applied.value;
                }
            }
        }

        state.value.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Clear all state, report `NotReady` and stop the worker pool.
    ///
    /// Readiness listeners are told on the closing thread because the pool is going away. A second
    /// call does nothing.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!(target: "featurehub", "repository closing");

        self.features
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.features_by_id
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.has_received_initial_state.store(false, Ordering::SeqCst);
        self.set_readiness(Readiness::NotReady);

        self.readiness_listeners.notify_inline(Readiness::NotReady);
        self.executor.shutdown();

        self.readiness_listeners.clear();
        self.new_state_listeners.clear();
        self.feature_update_listeners.clear();

        log::info!(target: "featurehub", "repository closed");
    }
}
