//! Completion objects and the dispatch of finished operations.
//!
//! Every operation names one completion kind:
//! * [Synchronizer]: becomes ready after a fixed number of signals, waited on
//!   by spinning with progress.
//! * [CompletionQueue]: a bounded queue the caller drains by polling.
//! * a handler: a callback invoked inline on the thread that completes the
//!   operation.

pub(crate) mod queue;
pub(crate) mod synchronizer;

pub use queue::CompletionQueue;
pub use synchronizer::Synchronizer;

use crate::context::{Context, Request};
use crate::network::{Network, NetworkOps};

use std::sync::Arc;

/// A callback run inline when an operation completes.
pub type Handler = Arc<dyn Fn(Request) + Send + Sync>;

/// The completion target of an operation, its variant is the completion kind.
#[derive(Clone, Default)]
pub enum Completion {
    /// nothing is signaled
    #[default]
    None,
    Sync(Arc<Synchronizer>),
    Queue(Arc<CompletionQueue>),
    Handler(Handler),
}

impl Completion {
    pub fn handler<F>(f: F) -> Completion
    where
        F: Fn(Request) + Send + Sync + 'static,
    {
        Completion::Handler(Arc::new(f))
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Completion::None)
    }

    /// Delivers a request snapshot to the target.
    pub(crate) fn signal(&self, request: Request) {
        match self {
            Completion::None => {}
            Completion::Sync(sync) => sync.signal(request),
            Completion::Queue(queue) => queue.push(request),
            Completion::Handler(handler) => handler(request),
        }
    }
}

impl From<Arc<Synchronizer>> for Completion {
    fn from(sync: Arc<Synchronizer>) -> Completion {
        Completion::Sync(sync)
    }
}

impl From<Arc<CompletionQueue>> for Completion {
    fn from(queue: Arc<CompletionQueue>) -> Completion {
        Completion::Queue(queue)
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Completion::None => write!(f, "Completion::None"),
            Completion::Sync(sync) => write!(f, "Completion::Sync({:p})", Arc::as_ptr(sync)),
            Completion::Queue(queue) => write!(f, "Completion::Queue({:p})", Arc::as_ptr(queue)),
            Completion::Handler(_) => write!(f, "Completion::Handler"),
        }
    }
}

/// Finishes an operation: releases memory it registered on the fly, then
/// hands its request snapshot to the completion target.
///
/// Must not be called while holding any internal lock, handlers may re-enter
/// the engine.
pub(crate) fn dispatch(mut ctx: Box<Context>, network: &Network) {
    if ctx.attr.dereg() {
        for mr in ctx.mrs.drain(..) {
            network.deregister(mr);
        }
    }
    let completion = std::mem::take(&mut ctx.completion);
    tracing::trace!(
        rank = ctx.rank,
        tag = ctx.tag,
        rdv_type = ?ctx.attr.rdv_type(),
        completion = ?completion,
        "dispatch"
    );
    completion.signal(ctx.into_request());
}
