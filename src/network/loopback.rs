use crate::error::{fatal, LciError};
use crate::network::*;
use crate::packet::Packet;

use crossbeam::queue::SegQueue;
use parking_lot::{Mutex, RwLock};

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

fn default_max_msg_size() -> usize {
    crate::config().max_msg_size
}

#[derive(Debug)]
struct PortState {
    recvs: Mutex<VecDeque<Box<Packet>>>,
    cq: SegQueue<CompletionEvent>,
    regions: RwLock<HashMap<u64, (usize, usize)>>,
    next_rkey: AtomicU64,
    saturated: AtomicBool,
    injected_retries: AtomicUsize,
    rejected: AtomicUsize,
    claimed: AtomicBool,
}

impl PortState {
    fn new() -> PortState {
        PortState {
            recvs: Mutex::new(VecDeque::new()),
            cq: SegQueue::new(),
            regions: RwLock::new(HashMap::new()),
            next_rkey: AtomicU64::new(1),
            saturated: AtomicBool::new(false),
            injected_retries: AtomicUsize::new(0),
            rejected: AtomicUsize::new(0),
            claimed: AtomicBool::new(false),
        }
    }

    /// decides whether this port accepts one more post
    fn admit(&self) -> Result<(), LciError> {
        let refused = self.saturated.load(Ordering::SeqCst)
            || self
                .injected_retries
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if refused {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            Err(LciError::RetryNomem)
        } else {
            Ok(())
        }
    }

    fn take_recv(&self) -> Option<Box<Packet>> {
        self.recvs.lock().pop_front()
    }
}

/// An in-process fabric connecting `nranks` ports.
///
/// Each rank attaches one device to its port. Sends copy into receive packets
/// the target has posted, writes copy into memory the target has registered,
/// and completions are queued per port until polled. Saturation can be
/// injected per port to exercise the retry paths.
#[derive(Debug)]
pub struct LoopbackFabric {
    ports: Vec<PortState>,
}

impl LoopbackFabric {
    pub fn new(nranks: usize) -> Arc<LoopbackFabric> {
        Arc::new(LoopbackFabric {
            ports: (0..nranks.max(1)).map(|_| PortState::new()).collect(),
        })
    }

    pub fn nranks(&self) -> usize {
        self.ports.len()
    }

    /// While saturated, every post issued by `rank` fails with `RetryNomem`.
    pub fn saturate(&self, rank: usize, saturated: bool) {
        self.ports[rank].saturated.store(saturated, Ordering::SeqCst);
    }

    /// The next `count` posts issued by `rank` fail with `RetryNomem`.
    pub fn inject_retries(&self, rank: usize, count: usize) {
        self.ports[rank]
            .injected_retries
            .fetch_add(count, Ordering::SeqCst);
    }

    /// number of posts by `rank` refused so far
    pub fn rejected_posts(&self, rank: usize) -> usize {
        self.ports[rank].rejected.load(Ordering::SeqCst)
    }

    /// receive packets currently posted at `rank`
    pub fn posted_recvs(&self, rank: usize) -> usize {
        self.ports[rank].recvs.lock().len()
    }

    /// memory regions currently registered at `rank`
    pub fn registered_regions(&self, rank: usize) -> usize {
        self.ports[rank].regions.read().len()
    }

    pub(crate) fn port(self: &Arc<Self>, rank: usize) -> LoopbackPort {
        LoopbackPort {
            rank,
            fabric: self.clone(),
            max_msg_size: default_max_msg_size(),
        }
    }

    /// Attaches a device to `rank`, failing if one is already attached.
    pub(crate) fn claim(self: &Arc<Self>, rank: usize) -> anyhow::Result<LoopbackPort> {
        if rank >= self.ports.len() {
            anyhow::bail!("rank {} is outside of a {} rank fabric", rank, self.ports.len());
        }
        if self.ports[rank].claimed.swap(true, Ordering::SeqCst) {
            anyhow::bail!("rank {} of the loopback fabric is already attached", rank);
        }
        Ok(self.port(rank))
    }
}

/// One rank's view of a [LoopbackFabric].
#[derive(Debug)]
pub(crate) struct LoopbackPort {
    rank: usize,
    fabric: Arc<LoopbackFabric>,
    max_msg_size: usize,
}

impl LoopbackPort {
    pub(crate) fn with_max_msg_size(mut self, max_msg_size: usize) -> LoopbackPort {
        self.max_msg_size = max_msg_size.max(1);
        self
    }

    fn me(&self) -> &PortState {
        &self.fabric.ports[self.rank]
    }

    fn peer(&self, rank: usize) -> &PortState {
        match self.fabric.ports.get(rank) {
            Some(port) => port,
            None => fatal!(
                "rank {} is outside of a {} rank fabric",
                rank,
                self.fabric.ports.len()
            ),
        }
    }

    fn deliver(&self, target: &PortState, mut packet: Box<Packet>, data: &[u8], imm: u32) {
        packet.fill(data);
        packet.header.src_rank = self.rank;
        target.cq.push(CompletionEvent {
            opcode: Opcode::Recv,
            rank: self.rank,
            length: data.len(),
            imm,
            packet: Some(packet),
            ctx: PostCtx::None,
        });
    }

    #[cfg(test)]
    pub(crate) fn registered_regions(&self) -> usize {
        self.fabric.registered_regions(self.rank)
    }
}

impl NetworkOps for LoopbackPort {
    fn rank(&self) -> usize {
        self.rank
    }

    fn nranks(&self) -> usize {
        self.fabric.ports.len()
    }

    fn max_msg_size(&self) -> usize {
        self.max_msg_size
    }

    fn register(&self, addr: usize, len: usize) -> MemRegion {
        let me = self.me();
        let rkey = me.next_rkey.fetch_add(1, Ordering::SeqCst);
        me.regions.write().insert(rkey, (addr, len));
        MemRegion {
            rkey,
            base: addr,
            len,
        }
    }

    fn deregister(&self, mr: MemRegion) {
        if self.me().regions.write().remove(&mr.rkey).is_none() {
            fatal!("deregistering unknown memory region {:?}", mr);
        }
    }

    fn post_sends(&self, op: SendsOp) -> PostResult<SendsOp> {
        if let Err(err) = self.me().admit() {
            return Err(Rejected { err, op });
        }
        let target = self.peer(op.rank);
        let packet = match target.take_recv() {
            Some(packet) => packet,
            None => {
                return Err(Rejected {
                    err: LciError::RetryNomem,
                    op,
                })
            }
        };
        self.deliver(target, packet, &op.data, op.imm);
        Ok(())
    }

    fn post_send(&self, op: SendOp) -> PostResult<SendOp> {
        if let Err(err) = self.me().admit() {
            return Err(Rejected { err, op });
        }
        let target = self.peer(op.rank);
        let packet = match target.take_recv() {
            Some(packet) => packet,
            None => {
                return Err(Rejected {
                    err: LciError::RetryNomem,
                    op,
                })
            }
        };
        self.deliver(target, packet, op.packet.payload(), op.imm);
        self.me().cq.push(CompletionEvent {
            opcode: Opcode::Send,
            rank: op.rank,
            length: op.packet.header.length,
            imm: op.imm,
            packet: Some(op.packet),
            ctx: op.ctx,
        });
        Ok(())
    }

    fn post_put(&self, op: PutOp) -> PostResult<PutOp> {
        if let Err(err) = self.me().admit() {
            return Err(Rejected { err, op });
        }
        if op.len > self.max_msg_size {
            fatal!(
                "write of {} bytes exceeds the maximum message size {}",
                op.len,
                self.max_msg_size
            );
        }
        let target = self.peer(op.rank);
        let recv_packet = match op.imm {
            Some(_) => match target.take_recv() {
                Some(packet) => Some(packet),
                None => {
                    return Err(Rejected {
                        err: LciError::RetryNomem,
                        op,
                    })
                }
            },
            None => None,
        };
        {
            let regions = target.regions.read();
            let (base, len) = match regions.get(&op.remote.rkey) {
                Some(region) => *region,
                None => fatal!("write to rank {} with unknown rkey {}", op.rank, op.remote.rkey),
            };
            let dst = (op.remote.base + op.remote.offset) as usize;
            if dst < base || dst + op.len > base + len {
                fatal!(
                    "write of {} bytes at {:#x} is outside of region {:#x}+{}",
                    op.len,
                    dst,
                    base,
                    len
                );
            }
            // Safety: the source stays alive inside the context travelling with
            // this op, and the destination range was validated against a live
            // registration
            unsafe {
                std::ptr::copy(op.src as *const u8, dst as *mut u8, op.len);
            }
        }
        if let (Some(imm), Some(mut packet)) = (op.imm, recv_packet) {
            packet.header.src_rank = self.rank;
            packet.header.length = 0;
            target.cq.push(CompletionEvent {
                opcode: Opcode::RemoteWrite,
                rank: self.rank,
                length: op.len,
                imm,
                packet: Some(packet),
                ctx: PostCtx::None,
            });
        }
        self.me().cq.push(CompletionEvent {
            opcode: Opcode::Send,
            rank: op.rank,
            length: op.len,
            imm: op.imm.unwrap_or(0),
            packet: None,
            ctx: op.ctx,
        });
        Ok(())
    }

    fn post_recv(&self, packet: Box<Packet>) -> PostResult<Box<Packet>> {
        self.me().recvs.lock().push_back(packet);
        Ok(())
    }

    fn poll_cq(&self) -> Option<CompletionEvent> {
        self.me().cq.pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{MsgKind, Proto};

    fn post_recvs(port: &LoopbackPort, count: usize) {
        for _ in 0..count {
            port.post_recv(Packet::new(64)).unwrap();
        }
    }

    #[test]
    fn sends_lands_in_posted_recv() {
        let fabric = LoopbackFabric::new(2);
        let a = fabric.port(0);
        let b = fabric.port(1);
        let imm = Proto::new(0, MsgKind::Short, 5).0;
        let op = SendsOp {
            rank: 1,
            data: vec![1, 2, 3],
            imm,
        };
        // nothing posted yet
        let rejected = a.post_sends(op).unwrap_err();
        assert_eq!(rejected.err, LciError::RetryNomem);
        post_recvs(&b, 1);
        a.post_sends(rejected.op).unwrap();
        let event = b.poll_cq().unwrap();
        assert_eq!(event.opcode, Opcode::Recv);
        assert_eq!(event.rank, 0);
        assert_eq!(event.imm, imm);
        assert_eq!(event.packet.unwrap().payload(), &[1, 2, 3]);
        assert!(a.poll_cq().is_none());
    }

    #[test]
    fn put_with_imm_copies_and_notifies() {
        let fabric = LoopbackFabric::new(2);
        let a = fabric.port(0);
        let b = fabric.port(1);
        post_recvs(&b, 1);
        let mut dst = vec![0u8; 8];
        let mr = b.register(dst.as_mut_ptr() as usize, dst.len());
        let src = vec![7u8; 4];
        a.post_put(PutOp {
            rank: 1,
            src: src.as_ptr() as usize,
            len: src.len(),
            remote: RemoteBuffer {
                rkey: mr.rkey,
                base: mr.base as u64,
                offset: 2,
            },
            imm: Some(42),
            ctx: PostCtx::None,
        })
        .unwrap();
        assert_eq!(dst, vec![0, 0, 7, 7, 7, 7, 0, 0]);
        let remote = b.poll_cq().unwrap();
        assert_eq!(remote.opcode, Opcode::RemoteWrite);
        assert_eq!(remote.imm, 42);
        let local = a.poll_cq().unwrap();
        assert_eq!(local.opcode, Opcode::Send);
        b.deregister(mr);
        assert_eq!(b.registered_regions(), 0);
    }

    #[test]
    fn injected_retries_are_consumed() {
        let fabric = LoopbackFabric::new(1);
        let port = fabric.port(0);
        post_recvs(&port, 4);
        fabric.inject_retries(0, 2);
        let op = || SendsOp {
            rank: 0,
            data: vec![0],
            imm: 0,
        };
        assert!(port.post_sends(op()).is_err());
        assert!(port.post_sends(op()).is_err());
        assert!(port.post_sends(op()).is_ok());
        assert_eq!(fabric.rejected_posts(0), 2);
        fabric.saturate(0, true);
        assert!(port.post_sends(op()).is_err());
        fabric.saturate(0, false);
        assert!(port.post_sends(op()).is_ok());
    }

    #[test]
    fn ports_are_claimed_once() {
        let fabric = LoopbackFabric::new(2);
        assert!(fabric.claim(1).is_ok());
        assert!(fabric.claim(1).is_err());
        assert!(fabric.claim(2).is_err());
    }
}
