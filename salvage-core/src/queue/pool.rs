//! Blocking work queue with reference-counted, poison-pill shutdown.
//!
//! Items come from a buffer of requeued work and, once that is empty, from
//! an optional lazy source (normally a [`Bundler`](super::bundler::Bundler)).
//! Every successful `acquire` must be paired with one `release`. When the
//! last outstanding item is released with no replacement and nothing is
//! left to hand out, a single sentinel is queued. Each waiter that meets it
//! puts it back and wakes the next, so every consumer sees the shutdown
//! exactly once and none blocks forever.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use tracing::warn;

enum Slot<T> {
    Item(T),
    Poison,
}

struct State<T> {
    buffer: VecDeque<Slot<T>>,
    source: Option<Box<dyn Iterator<Item = T> + Send>>,
    pending: usize,
}

impl<T> State<T> {
    fn exhausted(&self) -> bool {
        self.pending == 0 && self.buffer.is_empty() && self.source.is_none()
    }
}

pub struct WorkQueue<T> {
    state: Mutex<State<T>>,
    ready: Condvar,
}

impl<T> WorkQueue<T> {
    /// Queue over a fixed set of items.
    pub fn new(items: impl IntoIterator<Item = T>) -> Self {
        Self::build(items.into_iter().map(Slot::Item).collect(), None)
    }

    /// Queue that pulls lazily from `source` whenever its buffer is empty.
    pub fn draining(source: impl Iterator<Item = T> + Send + 'static) -> Self {
        Self::build(VecDeque::new(), Some(Box::new(source)))
    }

    fn build(buffer: VecDeque<Slot<T>>, source: Option<Box<dyn Iterator<Item = T> + Send>>) -> Self {
        Self {
            state: Mutex::new(State {
                buffer,
                source,
                pending: 0,
            }),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Next item, blocking while none is available. `None` means shut down.
    pub fn acquire(&self) -> Option<T> {
        let mut st = self.lock();
        loop {
            match st.buffer.pop_front() {
                Some(Slot::Item(item)) => {
                    st.pending += 1;
                    return Some(item);
                }
                Some(Slot::Poison) => {
                    st.buffer.push_front(Slot::Poison);
                    self.ready.notify_one();
                    return None;
                }
                None => {}
            }

            if let Some(source) = st.source.as_mut() {
                if let Some(item) = source.next() {
                    st.pending += 1;
                    return Some(item);
                }
                st.source = None;
            }

            if st.exhausted() {
                st.buffer.push_back(Slot::Poison);
                self.ready.notify_one();
                return None;
            }
            st = self.ready.wait(st).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Hand back an acquired item, optionally queueing follow-up work.
    pub fn release(&self, replacement: Option<T>) {
        let mut st = self.lock();
        match st.pending.checked_sub(1) {
            Some(n) => st.pending = n,
            None => warn!("release without matching acquire"),
        }
        match replacement {
            Some(item) => {
                st.buffer.push_back(Slot::Item(item));
                self.ready.notify_one();
            }
            None if st.exhausted() => {
                st.buffer.push_back(Slot::Poison);
                self.ready.notify_one();
            }
            None => {}
        }
    }

    /// Stop handing out work immediately; queued items stay unclaimed.
    pub fn poison(&self) {
        let mut st = self.lock();
        st.buffer.push_front(Slot::Poison);
        self.ready.notify_all();
    }

    pub fn pending(&self) -> usize {
        self.lock().pending
    }

    /// Items still queued and never handed out (excluding the source).
    pub fn queued(&self) -> usize {
        self.lock()
            .buffer
            .iter()
            .filter(|s| matches!(s, Slot::Item(_)))
            .count()
    }
}
