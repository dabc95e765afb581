use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError, Weak,
    },
    time::Duration,
};

use tokio::task::JoinHandle;

use super::EdgeService;
use crate::{
    executor::Executor,
    readiness::{PendingReadiness, Readiness, ReadinessPromise},
    repository::FeatureRepository,
    Result,
};

/// Drives a request/response transport on a timer.
///
/// Only one poll runs at a time; a poll requested while another is running answers with the
/// current readiness instead of issuing a second request. A context change is never dropped: if a
/// poll is running, the latest header is queued and sent as soon as that poll finishes. After every
/// request the next poll is scheduled using the transport's current interval, which follows server
/// `max-age` directives.
pub struct PollingGovernor {
    this: Weak<PollingGovernor>,
    edge: Arc<dyn EdgeService>,
    repository: Arc<FeatureRepository>,
    busy: AtomicBool,
    queued_context: Mutex<Option<QueuedContext>>,
    timer: Mutex<Option<JoinHandle<()>>>,
    executor: Executor,
}

/// The most recent context change waiting for the in-flight poll, and everyone who asked for it.
struct QueuedContext {
    header: Option<String>,
    context_sha: String,
    waiters: Vec<ReadinessPromise>,
}

impl PollingGovernor {
    pub fn new(
        edge: Arc<dyn EdgeService>,
        repository: Arc<FeatureRepository>,
    ) -> Result<Arc<PollingGovernor>> {
        let executor = Executor::new("featurehub-poll-timer", 1)?;
        Ok(Arc::new_cyclic(|this| PollingGovernor {
            this: this.clone(),
            edge,
            repository,
            busy: AtomicBool::new(false),
            queued_context: Mutex::new(None),
            timer: Mutex::new(None),
            executor,
        }))
    }

    fn cancel_timer(&self) {
        let timer = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(timer) = timer {
            timer.abort();
        }
    }

    fn schedule_next(&self) {
        let interval = self.edge.current_interval();
        if self.edge.is_stopped() || interval.is_zero() {
            log::debug!(target: "featurehub", "polling stopped");
            return;
        }

        log::trace!(target: "featurehub", interval_s = interval.as_secs(); "scheduling next poll");
        let this = self.this.clone();
        let timer = self.executor.spawn(async move {
            tokio::time::sleep(interval).await;
            if let Some(governor) = this.upgrade() {
                let _ = governor.poll();
            }
        });
        *self.timer.lock().unwrap_or_else(PoisonError::into_inner) = timer;
    }

    fn try_acquire(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn take_queued_context(&self) -> Option<QueuedContext> {
        self.queued_context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn has_queued_context(&self) -> bool {
        self.queued_context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Send the queued context change if nothing is in flight. Returns whether a request started.
    fn send_queued_context(&self) -> bool {
        loop {
            if !self.try_acquire() {
                return false;
            }
            if let Some(queued) = self.take_queued_context() {
                let QueuedContext {
                    header,
                    context_sha,
                    waiters,
                } = queued;
                log::trace!(target: "featurehub", header = header.as_deref(); "sending context change");
                self.start(
                    move |edge| edge.context_change(header.as_deref(), &context_sha),
                    waiters,
                );
                return true;
            }
            self.busy.store(false, Ordering::SeqCst);
            // a change queued between the take and the release would otherwise be missed
            if !self.has_queued_context() {
                return false;
            }
        }
    }

    /// Run `request` on the timer executor and answer `waiters` with its result. The caller must
    /// hold the busy flag.
    fn start(
        &self,
        request: impl FnOnce(&dyn EdgeService) -> PendingReadiness + Send + 'static,
        waiters: Vec<ReadinessPromise>,
    ) {
        self.cancel_timer();

        let Some(this) = self.this.upgrade() else {
            self.release(waiters);
            return;
        };

        let spawned = self.executor.spawn(async move {
            let result = request(this.edge.as_ref()).await;
            this.busy.store(false, Ordering::SeqCst);
            for waiter in waiters {
                waiter.complete(result);
            }
            if !this.send_queued_context() {
                this.schedule_next();
            }
        });
        if spawned.is_none() {
            // the executor dropped the task and with it the waiters, which resolve to their fallback
            self.busy.store(false, Ordering::SeqCst);
        }
    }

    fn release(&self, waiters: Vec<ReadinessPromise>) {
        self.busy.store(false, Ordering::SeqCst);
        let readiness = self.repository.readiness();
        for waiter in waiters {
            waiter.complete(readiness);
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn readiness(&self) -> Readiness {
        self.repository.readiness()
    }
}

impl EdgeService for PollingGovernor {
    fn poll(&self) -> PendingReadiness {
        if !self.try_acquire() {
            log::trace!(target: "featurehub", "poll already in flight");
            return PendingReadiness::ready(self.repository.readiness());
        }

        let (promise, pending) = PendingReadiness::channel(self.repository.readiness());
        self.start(|edge| edge.poll(), vec![promise]);
        pending
    }

    fn context_change(&self, header: Option<&str>, context_sha: &str) -> PendingReadiness {
        let (promise, pending) = PendingReadiness::channel(self.repository.readiness());
        {
            let mut queued = self
                .queued_context
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let queued = queued.get_or_insert_with(|| QueuedContext {
                header: None,
                context_sha: String::new(),
                waiters: Vec::new(),
            });
            queued.header = header.map(str::to_owned);
            queued.context_sha = context_sha.to_owned();
            queued.waiters.push(promise);
        }

        if !self.send_queued_context() {
            log::trace!(target: "featurehub", "poll in flight, context change queued");
        }
        pending
    }

    fn requires_replacement_on_header_change(&self) -> bool {
        self.edge.requires_replacement_on_header_change()
    }

    /// The timer keeps the view fresh, reads never trigger a request.
    fn feature_used(&self) {}

    fn current_interval(&self) -> Duration {
        self.edge.current_interval()
    }

    fn is_stopped(&self) -> bool {
        self.edge.is_stopped()
    }

    fn close(&self) {
        self.cancel_timer();
        self.executor.shutdown();
        self.edge.close();
        if let Some(queued) = self.take_queued_context() {
            self.release(queued.waiters);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{atomic::AtomicUsize, mpsc};

    use super::*;

    /// Counts requests and answers each from a channel so tests control when polls finish.
    struct ScriptedEdge {
        polls: AtomicUsize,
        contexts: Mutex<Vec<(Option<String>, String)>>,
        interval: Duration,
        stopped: AtomicBool,
        release: Mutex<Option<mpsc::Receiver<()>>>,
    }

    impl ScriptedEdge {
        fn new(interval: Duration) -> ScriptedEdge {
            ScriptedEdge {
                polls: AtomicUsize::new(0),
                contexts: Mutex::new(Vec::new()),
                interval,
                stopped: AtomicBool::new(false),
                release: Mutex::new(None),
            }
        }

        fn answer(&self) -> PendingReadiness {
            self.polls.fetch_add(1, Ordering::SeqCst);
            let (promise, pending) = PendingReadiness::channel(Readiness::NotReady);
            let release = self.release.lock().unwrap().take();
            std::thread::spawn(move || {
                if let Some(release) = release {
                    let _ = release.recv_timeout(Duration::from_secs(5));
                }
                promise.complete(Readiness::Ready);
            });
            pending
        }
    }

    impl EdgeService for ScriptedEdge {
        fn poll(&self) -> PendingReadiness {
            self.answer()
        }

        fn context_change(&self, header: Option<&str>, context_sha: &str) -> PendingReadiness {
            self.contexts
                .lock()
                .unwrap()
                .push((header.map(str::to_owned), context_sha.to_owned()));
            self.answer()
        }

        fn requires_replacement_on_header_change(&self) -> bool {
            false
        }

        fn current_interval(&self) -> Duration {
            self.interval
        }

        fn is_stopped(&self) -> bool {
            self.stopped.load(Ordering::SeqCst)
        }

        fn close(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    fn governor(edge: Arc<ScriptedEdge>) -> Arc<PollingGovernor> {
        let _ = env_logger::builder().is_test(true).try_init();
        PollingGovernor::new(edge, FeatureRepository::new(1).unwrap()).unwrap()
    }

    #[test]
    fn concurrent_poll_is_skipped() {
        let edge = Arc::new(ScriptedEdge::new(Duration::ZERO));
        let (release, hold) = mpsc::channel();
        *edge.release.lock().unwrap() = Some(hold);
        let governor = governor(edge.clone());

        let first = governor.poll();
        // second poll while the first is held open
        assert_eq!(governor.poll().wait(), Readiness::NotReady);

        release.send(()).unwrap();
        assert_eq!(first.wait(), Readiness::Ready);
        assert_eq!(edge.polls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn context_change_during_poll_is_sent_afterwards() {
        let edge = Arc::new(ScriptedEdge::new(Duration::ZERO));
        let (release, hold) = mpsc::channel();
        *edge.release.lock().unwrap() = Some(hold);
        let governor = governor(edge.clone());

        let first = governor.poll();
        let changed = governor.context_change(Some("userkey=fred"), "sha");
        assert!(edge.contexts.lock().unwrap().is_empty());

        release.send(()).unwrap();
        assert_eq!(first.wait(), Readiness::Ready);
        assert_eq!(changed.wait(), Readiness::Ready);
        assert_eq!(
            *edge.contexts.lock().unwrap(),
            vec![(Some("userkey=fred".to_owned()), "sha".to_owned())]
        );
        assert_eq!(edge.polls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn only_latest_queued_context_is_sent() {
        let edge = Arc::new(ScriptedEdge::new(Duration::ZERO));
        let (release, hold) = mpsc::channel();
        *edge.release.lock().unwrap() = Some(hold);
        let governor = governor(edge.clone());

        let first = governor.poll();
        let mary = governor.context_change(Some("userkey=mary"), "sha-mary");
        let fred = governor.context_change(Some("userkey=fred"), "sha-fred");

        release.send(()).unwrap();
        assert_eq!(first.wait(), Readiness::Ready);
        assert_eq!(mary.wait(), Readiness::Ready);
        assert_eq!(fred.wait(), Readiness::Ready);
        assert_eq!(
            *edge.contexts.lock().unwrap(),
            vec![(Some("userkey=fred".to_owned()), "sha-fred".to_owned())]
        );
    }

    #[test]
    fn timer_polls_again() {
        let edge = Arc::new(ScriptedEdge::new(Duration::from_millis(50)));
        let governor = governor(edge.clone());

        assert_eq!(governor.poll().wait(), Readiness::Ready);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while edge.polls.load(Ordering::SeqCst) < 3 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(edge.polls.load(Ordering::SeqCst) >= 3);

        governor.close();
        assert!(governor.is_stopped());
    }

    #[test]
    fn context_change_is_forwarded() {
        let edge = Arc::new(ScriptedEdge::new(Duration::ZERO));
        let governor = governor(edge.clone());

        assert_eq!(
            governor.context_change(Some("userkey=fred"), "sha").wait(),
            Readiness::Ready
        );
        assert_eq!(
            *edge.contexts.lock().unwrap(),
            vec![(Some("userkey=fred".to_owned()), "sha".to_owned())]
        );
    }

    #[test]
    fn stopped_edge_is_not_rescheduled() {
        let edge = Arc::new(ScriptedEdge::new(Duration::from_millis(20)));
        edge.stopped.store(true, Ordering::SeqCst);
        let governor = governor(edge.clone());

        assert_eq!(governor.poll().wait(), Readiness::Ready);
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(edge.polls.load(Ordering::SeqCst), 1);
    }
}
