//! Cancellation signals.
//!
//! A signal fires at most once with an [`Interrupt`] reason. Waiters observe
//! it through [`AbortSignal::aborted`] or by polling
//! [`AbortSignal::reason`]; composition is done by deriving child signals
//! that fire when any of their sources fire.

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll, Waker},
};

use crate::error::Interrupt;

type AbortCallback = Box<dyn FnOnce(&Interrupt) + Send>;

#[derive(Default)]
struct SignalState {
    reason: Option<Interrupt>,
    wakers: Vec<Waker>,
    callbacks: Vec<AbortCallback>,
}

#[derive(Default)]
struct SignalInner {
    state: Mutex<SignalState>,
}

impl SignalInner {
    fn fire(&self, reason: Interrupt) {
        let (wakers, callbacks) = {
            let mut state = self.state.lock().expect("signal state poisoned");
            if state.reason.is_some() {
                return;
            }
            state.reason = Some(reason.clone());
            (
                std::mem::take(&mut state.wakers),
                std::mem::take(&mut state.callbacks),
            )
        };

        // Wakers and callbacks run outside the lock; callbacks may reach
        // back into structures that observe this same signal.
        for waker in wakers {
            waker.wake();
        }
        for callback in callbacks {
            callback(&reason);
        }
    }
}

/// Observer half of a cancellation signal. Cloning observes the same event.
#[derive(Clone, Default)]
pub struct AbortSignal {
    inner: Arc<SignalInner>,
}

/// Firing half of a cancellation signal.
#[derive(Clone)]
pub struct AbortHandle {
    inner: Arc<SignalInner>,
}

impl AbortSignal {
    /// Creates a connected handle/signal pair.
    pub fn new_pair() -> (AbortHandle, AbortSignal) {
        let inner = Arc::new(SignalInner::default());
        (
            AbortHandle {
                inner: Arc::clone(&inner),
            },
            AbortSignal { inner },
        )
    }

    /// A signal that never fires.
    pub fn inert() -> AbortSignal {
        AbortSignal::default()
    }

    /// The reason this signal fired with, if it has.
    pub fn reason(&self) -> Option<Interrupt> {
        self.inner
            .state
            .lock()
            .expect("signal state poisoned")
            .reason
            .clone()
    }

    pub fn is_aborted(&self) -> bool {
        self.reason().is_some()
    }

    /// Registers a callback to run once when the signal fires. Runs
    /// immediately if it already has.
    pub fn on_abort(&self, callback: impl FnOnce(&Interrupt) + Send + 'static) {
        let mut callback = Some(Box::new(callback) as AbortCallback);

        let fired = {
            let mut state = self.inner.state.lock().expect("signal state poisoned");
            match &state.reason {
                Some(reason) => Some(reason.clone()),
                None => {
                    state
                        .callbacks
                        .push(callback.take().expect("callback taken once"));
                    None
                }
            }
        };

        if let (Some(reason), Some(callback)) = (fired, callback) {
            callback(&reason);
        }
    }

    /// Derives a child pair that fires when either this signal fires or the
    /// returned handle is used, whichever happens first.
    pub fn child(&self) -> (AbortHandle, AbortSignal) {
        let (handle, signal) = AbortSignal::new_pair();
        let propagate = handle.clone();
        self.on_abort(move |reason| propagate.fire(reason.clone()));
        (handle, signal)
    }

    /// Resolves with the interrupt reason once the signal fires.
    pub fn aborted(&self) -> Aborted {
        Aborted {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl AbortHandle {
    /// Fires the signal. Later fires are ignored; the first reason wins.
    pub fn fire(&self, reason: Interrupt) {
        self.inner.fire(reason);
    }
}

/// Future resolving with the reason a signal fired with.
pub struct Aborted {
    inner: Arc<SignalInner>,
}

impl Future for Aborted {
    type Output = Interrupt;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.inner.state.lock().expect("signal state poisoned");
        if let Some(reason) = &state.reason {
            return Poll::Ready(reason.clone());
        }

        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }

        Poll::Pending
    }
}

impl fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortSignal")
            .field("reason", &self.reason())
            .finish()
    }
}

impl fmt::Debug for AbortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortHandle").finish_non_exhaustive()
    }
}

impl fmt::Debug for Aborted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aborted").finish_non_exhaustive()
    }
}
