//! Time-windowed batching queue.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{trace, warn};

type BatchFn<S, I> = dyn Fn(&mut S, I) + Send + Sync;
type FlushFn<S> = dyn Fn(S) + Send + Sync;

struct Window<S> {
    generation: u64,
    state: Option<S>,
}

/// Coalesces items into a state value and flushes it once per window.
///
/// The first enqueue of a window starts a timer; when it fires, `flush`
/// receives the accumulated state exactly once and the next enqueue opens a
/// new window. An interval of zero flushes synchronously on every enqueue.
///
/// Timers run on the ambient tokio runtime. Without one, each enqueue flushes
/// synchronously.
pub struct BatchingQueue<S, I> {
    interval: Duration,
    window: Arc<Mutex<Window<S>>>,
    batch: Arc<BatchFn<S, I>>,
    flush: Arc<FlushFn<S>>,
}

impl<S, I> BatchingQueue<S, I>
where
    S: Default + Send + 'static,
    I: Send + 'static,
{
    /// Creates a queue.
    ///
    /// `batch` folds one item into the window state and is called with the
    /// queue locked, so it must not re-enter the queue. `flush` runs after
    /// the lock is released.
    pub fn new(
        interval: Duration,
        batch: impl Fn(&mut S, I) + Send + Sync + 'static,
        flush: impl Fn(S) + Send + Sync + 'static,
    ) -> Self {
        Self {
            interval,
            window: Arc::new(Mutex::new(Window {
                generation: 0,
                state: None,
            })),
            batch: Arc::new(batch),
            flush: Arc::new(flush),
        }
    }

    /// Returns the window length.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns true while a window holds unflushed items.
    pub fn is_pending(&self) -> bool {
        self.window.lock().state.is_some()
    }

    /// Folds `item` into the current window, opening one if needed.
    pub fn enqueue(&self, item: I) {
        let mut window = self.window.lock();
        let opened = window.state.is_none();
        if opened {
            window.generation += 1;
        }
        (self.batch)(window.state.get_or_insert_with(S::default), item);

        if self.interval.is_zero() {
            let state = window.state.take();
            drop(window);
            if let Some(state) = state {
                (self.flush)(state);
            }
            return;
        }

        let generation = window.generation;
        drop(window);
        if opened {
            self.schedule(generation);
        }
    }

    /// Flushes the current window immediately, if any.
    pub fn flush_now(&self) {
        let state = self.window.lock().state.take();
        if let Some(state) = state {
            (self.flush)(state);
        }
    }

    fn schedule(&self, generation: u64) {
        let Ok(handle) = Handle::try_current() else {
            warn!("no tokio runtime, flushing batch window synchronously");
            self.flush_now();
            return;
        };

        let window = Arc::clone(&self.window);
        let flush = Arc::clone(&self.flush);
        let interval = self.interval;
        handle.spawn(async move {
            tokio::time::sleep(interval).await;
            let state = {
                let mut window = window.lock();
                // a forced flush may already have closed this window
                if window.generation != generation {
                    None
                } else {
                    window.state.take()
                }
            };
            if let Some(state) = state {
                trace!(generation, "flushing batch window");
                flush(state);
            }
        });
    }
}
