//! Single-flight gate for local track updates
//!
//! Requests that change what we capture or send (mute, screen share, speaker
//! state, hold) must not overlap. Each caller enters the barrier and gets
//! exclusive access to the guarded state; later callers wait in FIFO order.
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

pub struct RequestBarrier<T> {
    state: Mutex<T>,
    waiting: AtomicUsize,
}

impl<T> RequestBarrier<T> {
    pub fn new(state: T) -> Self {
        Self {
            state: Mutex::new(state),
            waiting: AtomicUsize::new(0),
        }
    }

    /// Wait for in-flight requests to finish, then hold the gate until the
    /// guard is dropped
    pub async fn enter(&self) -> MutexGuard<'_, T> {
        let queued = Queued::new(&self.waiting);
        if queued.ahead > 0 {
            debug!(ahead = queued.ahead, "Waiting for in-flight local media request");
        }
        self.state.lock().await
    }

    /// Number of callers currently queued
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }
}

/// Counts a caller as queued until it gets the gate or gives up
struct Queued<'a> {
    counter: &'a AtomicUsize,
    ahead: usize,
}

impl<'a> Queued<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        let ahead = counter.fetch_add(1, Ordering::AcqRel);
        Self { counter, ahead }
    }
}

impl Drop for Queued<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn test_second_request_waits_for_first() {
        let barrier = RequestBarrier::new(Vec::<u32>::new());
        let mut first = tokio_test::block_on(barrier.enter());
        first.push(1);

        let mut second = task::spawn(barrier.enter());
        assert_pending!(second.poll());
        assert_eq!(barrier.waiting(), 1);

        drop(first);
        assert!(second.is_woken());
        let mut guard = assert_ready!(second.poll());
        guard.push(2);
        assert_eq!(*guard, vec![1, 2]);
    }

    #[test]
    fn test_abandoned_request_leaves_the_queue() {
        let barrier = RequestBarrier::new(());
        let held = tokio_test::block_on(barrier.enter());

        let mut abandoned = task::spawn(barrier.enter());
        assert_pending!(abandoned.poll());
        assert_eq!(barrier.waiting(), 1);
        drop(abandoned);
        assert_eq!(barrier.waiting(), 0);

        drop(held);
        let _guard = tokio_test::block_on(barrier.enter());
        assert_eq!(barrier.waiting(), 0);
    }

    #[test]
    fn test_waiters_run_in_fifo_order() {
        let barrier = RequestBarrier::new(());
        let held = tokio_test::block_on(barrier.enter());

        let mut a = task::spawn(barrier.enter());
        let mut b = task::spawn(barrier.enter());
        assert_pending!(a.poll());
        assert_pending!(b.poll());

        drop(held);
        assert_pending!(b.poll());
        let guard_a = assert_ready!(a.poll());
        drop(guard_a);
        assert_ready!(b.poll());
    }
}
