use crate::error::{LciError, LciResult};
use crate::network::{Network, NetworkOps, PutOp, Rejected, SendOp, SendsOp};
use crate::spinlock::SpinMutex;
use crate::warnings::RuntimeWarning;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A deferred network post.
#[derive(Debug)]
pub(crate) enum PostOp {
    Sends(SendsOp),
    Send(SendOp),
    Put(PutOp),
}

impl PostOp {
    fn post(self, network: &Network) -> Result<(), Rejected<PostOp>> {
        match self {
            PostOp::Sends(op) => network.post_sends(op).map_err(|r| Rejected {
                err: r.err,
                op: PostOp::Sends(r.op),
            }),
            PostOp::Send(op) => network.post_send(op).map_err(|r| Rejected {
                err: r.err,
                op: PostOp::Send(r.op),
            }),
            PostOp::Put(op) => network.post_put(op).map_err(|r| Rejected {
                err: r.err,
                op: PostOp::Put(r.op),
            }),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            PostOp::Sends(_) => "sends",
            PostOp::Send(_) => "send",
            PostOp::Put(_) => "put",
        }
    }
}

impl From<SendsOp> for PostOp {
    fn from(op: SendsOp) -> PostOp {
        PostOp::Sends(op)
    }
}

impl From<SendOp> for PostOp {
    fn from(op: SendOp) -> PostOp {
        PostOp::Send(op)
    }
}

impl From<PutOp> for PostOp {
    fn from(op: PutOp) -> PostOp {
        PostOp::Put(op)
    }
}

/// FIFO of posts the backend refused.
///
/// Once anything is queued every later post is queued behind it, so posts
/// reach the backend in submission order.
pub(crate) struct BacklogQueue {
    len: AtomicUsize,
    max_len: AtomicUsize,
    queue: SpinMutex<VecDeque<PostOp>>,
}

impl BacklogQueue {
    pub(crate) fn new() -> BacklogQueue {
        BacklogQueue {
            len: AtomicUsize::new(0),
            max_len: AtomicUsize::new(0),
            queue: SpinMutex::new(VecDeque::new()),
        }
    }

    /// lock-free emptiness check
    pub(crate) fn is_empty(&self) -> bool {
        self.len.load(Ordering::SeqCst) == 0
    }

    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::SeqCst)
    }

    /// largest number of entries queued at once
    pub(crate) fn max_len(&self) -> usize {
        self.max_len.load(Ordering::SeqCst)
    }

    /// Posts directly when nothing is waiting, otherwise (or when the backend
    /// asks for a retry) appends to the queue.
    pub(crate) fn try_or_enqueue(&self, op: impl Into<PostOp>, network: &Network) {
        let op = op.into();
        let op = if self.is_empty() {
            match op.post(network) {
                Ok(()) => return,
                Err(Rejected { err, op }) => {
                    tracing::trace!(?err, kind = op.name(), "post rejected, queued");
                    op
                }
            }
        } else {
            op
        };
        self.push(op);
    }

    fn push(&self, op: PostOp) {
        let mut queue = self.queue.lock();
        queue.push_back(op);
        let len = queue.len();
        self.len.store(len, Ordering::SeqCst);
        drop(queue);
        self.max_len.fetch_max(len, Ordering::SeqCst);
    }

    /// Attempts the head entry once.
    ///
    /// `RetryLock` if another thread is draining, `Retry` if the queue is
    /// empty, the backend's error if it refused the head again.
    pub(crate) fn progress(&self, network: &Network) -> LciResult<()> {
        let mut queue = self.queue.try_lock().ok_or(LciError::RetryLock)?;
        let op = queue.pop_front().ok_or(LciError::Retry)?;
        let result = match op.post(network) {
            Ok(()) => Ok(()),
            Err(Rejected { err, op }) => {
                queue.push_front(op);
                Err(err)
            }
        };
        self.len.store(queue.len(), Ordering::SeqCst);
        result
    }
}

impl std::fmt::Debug for BacklogQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("BacklogQueue")
            .field("len", &self.len())
            .field("max_len", &self.max_len())
            .finish()
    }
}

impl Drop for BacklogQueue {
    fn drop(&mut self) {
        let leftover = self.queue.get_mut().len();
        if leftover > 0 {
            RuntimeWarning::BacklogLeftover(leftover).print();
        }
        tracing::info!(max_len = self.max_len(), "backlog queue closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::loopback::LoopbackFabric;
    use crate::network::Opcode;
    use crate::packet::Packet;

    fn sends(tag: u32) -> SendsOp {
        SendsOp {
            rank: 0,
            data: tag.to_le_bytes().to_vec(),
            imm: tag,
        }
    }

    #[test]
    fn direct_post_when_empty() {
        let fabric = LoopbackFabric::new(1);
        let network: Network = fabric.port(0).into();
        network.post_recv(Packet::new(16)).unwrap();
        let bq = BacklogQueue::new();
        bq.try_or_enqueue(sends(1), &network);
        assert!(bq.is_empty());
        assert_eq!(bq.progress(&network), Err(LciError::Retry));
        assert_eq!(network.poll_cq().unwrap().imm, 1);
    }

    #[test]
    fn fifo_under_saturation() {
        let fabric = LoopbackFabric::new(1);
        let network: Network = fabric.port(0).into();
        for _ in 0..8 {
            network.post_recv(Packet::new(16)).unwrap();
        }
        let bq = BacklogQueue::new();
        fabric.inject_retries(0, 1);
        // the first is refused, the rest queue behind it without being tried
        for tag in 0..3 {
            bq.try_or_enqueue(sends(tag), &network);
        }
        assert_eq!(bq.len(), 3);
        assert_eq!(fabric.rejected_posts(0), 1);

        fabric.saturate(0, true);
        assert_eq!(bq.progress(&network), Err(LciError::RetryNomem));
        assert_eq!(bq.len(), 3);
        fabric.saturate(0, false);

        while bq.progress(&network).is_ok() {}
        assert!(bq.is_empty());
        assert_eq!(bq.max_len(), 3);
        let arrived: Vec<u32> = std::iter::from_fn(|| network.poll_cq())
            .filter(|event| event.opcode == Opcode::Recv)
            .map(|event| event.imm)
            .collect();
        assert_eq!(arrived, vec![0, 1, 2]);
    }
}
