use crate::context::Request;
use crate::error::{fatal, LciError, LciResult};

use crossbeam::queue::ArrayQueue;
use crossbeam::utils::Backoff;

/// A bounded multi-producer queue of completed requests.
///
/// The library pushes; the caller drains it with [pop][CompletionQueue::pop]
/// or [wait][CompletionQueue::wait]. Overflowing the queue is fatal, size it
/// for the number of operations that can be outstanding at once.
pub struct CompletionQueue {
    queue: ArrayQueue<Request>,
}

impl CompletionQueue {
    pub fn new(capacity: usize) -> CompletionQueue {
        CompletionQueue {
            queue: ArrayQueue::new(capacity.max(1)),
        }
    }

    pub(crate) fn push(&self, request: Request) {
        if let Err(request) = self.queue.push(request) {
            fatal!(
                "completion queue of capacity {} is full (rank {} tag {})",
                self.queue.capacity(),
                request.rank,
                request.tag
            );
        }
    }

    /// Takes one request, or `Retry` if none is ready.
    pub fn pop(&self) -> LciResult<Request> {
        self.queue.pop().ok_or(LciError::Retry)
    }

    /// Spins until a request is ready, calling `progress` between polls.
    pub fn wait(&self, mut progress: impl FnMut()) -> Request {
        let backoff = Backoff::new();
        loop {
            if let Some(request) = self.queue.pop() {
                return request;
            }
            progress();
            backoff.snooze();
        }
    }

    /// Takes up to `max` ready requests without waiting.
    pub fn pop_multiple(&self, max: usize) -> Vec<Request> {
        std::iter::from_fn(|| self.queue.pop()).take(max).collect()
    }

    /// Spins until `count` requests have been taken.
    pub fn wait_multiple(&self, count: usize, mut progress: impl FnMut()) -> Vec<Request> {
        let mut requests = Vec::with_capacity(count);
        while requests.len() < count {
            requests.push(self.wait(&mut progress));
        }
        requests
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

impl std::fmt::Debug for CompletionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("CompletionQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}
