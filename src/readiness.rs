//! Readiness of the local feature view and single-completion futures that report it.
use std::{
    future::Future,
    pin::Pin,
    sync::Mutex,
    task::{Context, Poll},
};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// Whether the local feature view is usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Readiness {
    #[default]
    NotReady,
    Ready,
    Failed,
}

/// A readiness result that completes exactly once.
///
/// Await it from async code or call [`PendingReadiness::wait`] from a plain thread. If the
/// completing side goes away without answering, the future resolves to the readiness captured
/// when it was created, so it never hangs.
#[derive(Debug)]
pub struct PendingReadiness {
    state: PendingState,
}

#[derive(Debug)]
enum PendingState {
    Done(Readiness),
    Waiting {
        receiver: oneshot::Receiver<Readiness>,
        fallback: Readiness,
    },
}

/// Completing side of a [`PendingReadiness`].
#[derive(Debug)]
pub struct ReadinessPromise(oneshot::Sender<Readiness>);

impl ReadinessPromise {
    /// Complete the paired future. Consuming `self` makes a second completion impossible.
    pub fn complete(self, readiness: Readiness) {
        // Err means the waiting side was dropped and nobody cares about the answer.
        let _ = self.0.send(readiness);
    }
}

impl PendingReadiness {
    /// A future that is already complete.
    pub fn ready(readiness: Readiness) -> PendingReadiness {
        PendingReadiness {
            state: PendingState::Done(readiness),
        }
    }

    /// Create a future/promise pair. `fallback` is returned if the promise is dropped.
    pub fn channel(fallback: Readiness) -> (ReadinessPromise, PendingReadiness) {
        let (sender, receiver) = oneshot::channel();
        (
            ReadinessPromise(sender),
            PendingReadiness {
                state: PendingState::Waiting { receiver, fallback },
            },
        )
    }

    /// Block the current thread until the readiness is known.
    ///
    /// Must not be called from inside an async runtime; `.await` the future there instead.
    pub fn wait(self) -> Readiness {
        match self.state {
            PendingState::Done(readiness) => readiness,
            PendingState::Waiting { receiver, fallback } => {
                receiver.blocking_recv().unwrap_or(fallback)
            }
        }
    }
}

impl Future for PendingReadiness {
    type Output = Readiness;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Readiness> {
        match &mut self.get_mut().state {
            PendingState::Done(readiness) => Poll::Ready(*readiness),
            PendingState::Waiting { receiver, fallback } => match Pin::new(receiver).poll(cx) {
                Poll::Ready(result) => Poll::Ready(result.unwrap_or(*fallback)),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

/// Callers waiting for the next meaningful edge event.
///
/// Draining happens under the lock, so a waiter is completed at most once even when a success
/// path and a failure path race to answer.
#[derive(Debug, Default)]
pub struct Waiters(Mutex<Vec<ReadinessPromise>>);

impl Waiters {
    pub fn new() -> Waiters {
        Waiters::default()
    }

    /// Register a new waiter and return its future.
    pub fn wait(&self, fallback: Readiness) -> PendingReadiness {
        let (promise, pending) = PendingReadiness::channel(fallback);
        self.push(promise);
        pending
    }

    pub fn push(&self, promise: ReadinessPromise) {
        self.0
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(promise);
    }

    /// Complete every registered waiter with `readiness`.
    pub fn complete_all(&self, readiness: Readiness) {
        let waiting = std::mem::take(
            &mut *self
                .0
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );
        for promise in waiting {
            promise.complete(readiness);
        }
    }
}
