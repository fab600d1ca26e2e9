//! Single-producer/single-consumer lazy chunk sequences.
//!
//! A [`StreamIterator`] is fed by the RPC core as stream frames arrive and
//! drained by whoever owns the call or handler. The end value (success or
//! error) is delivered exactly once; afterwards the iterator keeps yielding
//! the neutral done result. A cleanup callback runs exactly once when both
//! sides are finished with the stream, which is how the RPC core releases
//! its stream-key bookkeeping.

use std::{
    collections::VecDeque,
    fmt,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll, Waker},
};

use futures_core::Stream;

use crate::error::{Error, Result};

type Cleanup = Box<dyn FnOnce() + Send>;

struct StreamCore<T> {
    queue: VecDeque<T>,
    /// Upstream supplied its end (successfully or with `end_err`).
    finished: bool,
    end_err: Option<Error>,
    end_delivered: bool,
    waker: Option<Waker>,
    /// Consumer abandoned the sequence.
    closed: bool,
    cleanup: Option<Cleanup>,
}

impl<T> StreamCore<T> {
    /// Cleanup may run only after the upstream finished and the consumer is
    /// done (delivered the end or closed). Returned to run outside the lock.
    fn take_cleanup_if_done(&mut self) -> Option<Cleanup> {
        if self.finished && (self.closed || self.end_delivered) {
            self.cleanup.take()
        } else {
            None
        }
    }
}

/// Consumer half of a chunk sequence. Dropping it closes the sequence.
pub struct StreamIterator<T> {
    core: Arc<Mutex<StreamCore<T>>>,
}

/// Producer half, used by the RPC core to push frames in.
pub(crate) struct StreamFeeder<T> {
    core: Arc<Mutex<StreamCore<T>>>,
}

impl<T> Clone for StreamFeeder<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

/// Creates a connected feeder/iterator pair. The cleanup callback runs
/// exactly once, after the upstream has finished and the consumer has either
/// seen the end or closed the iterator.
pub(crate) fn stream_pair<T>(
    cleanup: Option<Cleanup>,
) -> (StreamFeeder<T>, StreamIterator<T>) {
    let core = Arc::new(Mutex::new(StreamCore {
        queue: VecDeque::new(),
        finished: false,
        end_err: None,
        end_delivered: false,
        waker: None,
        closed: false,
        cleanup,
    }));

    (
        StreamFeeder {
            core: Arc::clone(&core),
        },
        StreamIterator { core },
    )
}

impl<T> StreamIterator<T> {
    /// Abandons the sequence. Idempotent; queued chunks are dropped and the
    /// cleanup callback is deferred until the upstream has also finished.
    pub fn close(&mut self) {
        let cleanup = {
            let mut core = self.core.lock().expect("stream state poisoned");
            if core.closed {
                return;
            }
            core.closed = true;
            core.queue.clear();
            core.take_cleanup_if_done()
        };

        if let Some(cleanup) = cleanup {
            cleanup();
        }
    }
}

impl<T> Stream for StreamIterator<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let (item, cleanup) = {
            let mut core = self.core.lock().expect("stream state poisoned");

            if core.closed {
                (Poll::Ready(None), None)
            } else if let Some(chunk) = core.queue.pop_front() {
                (Poll::Ready(Some(Ok(chunk))), None)
            } else if core.finished {
                if core.end_delivered {
                    // Neutral done result past the end.
                    (Poll::Ready(None), None)
                } else {
                    core.end_delivered = true;
                    let item = core.end_err.take().map(Err);
                    (Poll::Ready(item), core.take_cleanup_if_done())
                }
            } else {
                core.waker = Some(cx.waker().clone());
                (Poll::Pending, None)
            }
        };

        if let Some(cleanup) = cleanup {
            cleanup();
        }

        item
    }
}

impl<T> Drop for StreamIterator<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T> StreamFeeder<T> {
    /// Queues a chunk. A no-op after the end was supplied; discarded (while
    /// still draining toward the end frame) once the consumer closed.
    pub(crate) fn supply_chunk(&self, chunk: T) {
        let waker = {
            let mut core = self.core.lock().expect("stream state poisoned");
            if core.finished || core.closed {
                return;
            }
            core.queue.push_back(chunk);
            core.waker.take()
        };

        if let Some(waker) = waker {
            waker.wake();
        }
    }

    pub(crate) fn finish_ok(&self) {
        self.finish(None);
    }

    pub(crate) fn supply_error(&self, error: Error) {
        self.finish(Some(error));
    }

    fn finish(&self, error: Option<Error>) {
        let (waker, cleanup) = {
            let mut core = self.core.lock().expect("stream state poisoned");
            if core.finished {
                return;
            }
            core.finished = true;
            core.end_err = error;
            (core.waker.take(), core.take_cleanup_if_done())
        };

        if let Some(waker) = waker {
            waker.wake();
        }
        if let Some(cleanup) = cleanup {
            cleanup();
        }
    }
}

impl<T> fmt::Debug for StreamIterator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamIterator").finish_non_exhaustive()
    }
}

impl<T> fmt::Debug for StreamFeeder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamFeeder").finish_non_exhaustive()
    }
}
