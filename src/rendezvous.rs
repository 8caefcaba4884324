//! The RTS/RTR/FIN handshake for long and scatter transfers.
//!
//! Sender: `INIT -> RTS_SENT -> RTR_RECEIVED -> DATA_PUT_ISSUED -> DONE`.
//! Receiver: `RTS_RECEIVED -> BUFFER_READY -> RTR_SENT -> DONE`.
//!
//! The receiving device picks how it learns about the data: with
//! [RdvProtocol::WriteImm] the sender issues a single write whose immediate
//! word carries a context archive key, with [RdvProtocol::Write] the sender
//! issues plain writes and follows the last local completion with a FIN
//! carrying the receiver's context pointer. The choice travels in the RTR so
//! the sender always follows the receiver. Scatter transfers, and transfers
//! that have to be split because they exceed the fabric's maximum message
//! size, always use writes plus FIN.

use crate::completion::dispatch;
use crate::context::{Buffer, Context, IovecData, RequestData};
use crate::device::DeviceInner;
use crate::error::fatal;
use crate::network::{MemRegion, NetworkOps, PostCtx, PutOp, SendOp, SendsOp};
use crate::packet::{
    pack_fin, unpack_fin, MsgKind, Packet, Proto, RdvType, RemoteBuffer, Rtr, RtrMode, Rts,
};
use crate::Tag;

use itertools::Itertools;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// How a receiving device wants the data of a long message delivered.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RdvProtocol {
    /// writes followed by a FIN message
    Write,
    /// one write carrying an immediate word
    WriteImm,
}

/// Joins the writes of one transfer; the last completion sends the FIN and
/// dispatches the sender's context.
pub(crate) struct ScatterContext {
    signal_count: AtomicUsize,
    recv_ctx: u64,
    rank: usize,
    gid: u16,
    tag: Tag,
    ctx: Mutex<Option<Box<Context>>>,
}

/// Splits `len` bytes into `(offset, len)` pieces of at most `max` bytes,
/// always yielding at least one piece.
fn chunks(len: usize, max: usize) -> impl Iterator<Item = (usize, usize)> {
    let max = max.max(1);
    let count = std::cmp::max(1, (len + max - 1) / max);
    (0..count).map(move |i| {
        let offset = i * max;
        (offset, std::cmp::min(max, len - offset))
    })
}

/// address, length and caller registration of a buffer to write from
fn source(buffer: &Buffer) -> (usize, usize, Option<MemRegion>) {
    let data = buffer.as_slice();
    (data.as_ptr() as usize, data.len(), buffer.region())
}

fn destination(buffer: &mut Buffer) -> (usize, usize, Option<MemRegion>) {
    match buffer {
        Buffer::Owned(v) => (v.as_mut_ptr() as usize, v.len(), None),
        Buffer::Registered(r) => (r.data.as_mut_ptr() as usize, r.data.len(), Some(r.mr)),
        Buffer::Shared(_) => fatal!("rendezvous destination must be an owned buffer"),
    }
}

fn check_capacity(capacity: usize, size: usize) {
    if capacity < size {
        fatal!(
            "receive buffer of {} bytes is too small for a {} byte message",
            capacity,
            size
        );
    }
}

/// Sizes the receive buffer of a two-sided transfer: a caller buffer is
/// truncated to the incoming size, no buffer means a fresh allocation.
fn size_destination(data: RequestData, size: usize) -> Buffer {
    match data {
        RequestData::None => Buffer::Owned(vec![0u8; size]),
        RequestData::Long(Buffer::Owned(mut v)) => {
            check_capacity(v.len(), size);
            v.truncate(size);
            Buffer::Owned(v)
        }
        // truncating never moves the data, the registration stays valid
        RequestData::Long(Buffer::Registered(mut r)) => {
            check_capacity(r.len(), size);
            r.data.truncate(size);
            Buffer::Registered(r)
        }
        other => fatal!("long receive posted with {:?} data", other.data_type()),
    }
}

impl DeviceInner {
    /// Sends the RTS for `ctx`, reusing `packet` as the wire buffer.
    pub(crate) fn post_rts(
        &self,
        mut ctx: Box<Context>,
        mut packet: Box<Packet>,
        rdv_type: RdvType,
        gid: u16,
    ) {
        let (sizes, piggy_back) = match &ctx.data {
            RequestData::Long(buffer) => (vec![buffer.len() as u64], Vec::new()),
            RequestData::Iovec(iovec) => (
                iovec.buffers.iter().map(|b| b.len() as u64).collect(),
                iovec.piggy_back.clone(),
            ),
            other => fatal!("rendezvous send of {:?} data", other.data_type()),
        };
        ctx.attr.set_rdv_type(rdv_type);
        let (rank, tag) = (ctx.rank, ctx.tag);
        let rts = Rts {
            rdv_type,
            send_ctx: Context::into_wire(ctx),
            sizes,
            piggy_back,
        };
        packet.header.length = rts.pack(packet.buf_mut());
        tracing::trace!(rank, tag, ?rdv_type, "send RTS");
        self.bq.try_or_enqueue(
            SendOp {
                rank,
                packet,
                imm: Proto::new(gid, MsgKind::Rts, tag).0,
                ctx: PostCtx::None,
            },
            &self.network,
        );
    }

    /// A posted long receive met its RTS.
    pub(crate) fn handle_2sided_rts(&self, mut ctx: Box<Context>, packet: Box<Packet>, proto: Proto) {
        let rts = Rts::unpack(packet.payload());
        let size = match rts.sizes.as_slice() {
            [size] => *size as usize,
            sizes => fatal!("two-sided RTS with {} buffers", sizes.len()),
        };
        ctx.rank = packet.header.src_rank;
        let data = std::mem::replace(&mut ctx.data, RequestData::None);
        ctx.data = RequestData::Long(size_destination(data, size));
        ctx.attr.set_rdv_type(RdvType::TwoSided);
        tracing::trace!(rank = ctx.rank, tag = ctx.tag, size, "recv RTS");
        self.issue_rtr(ctx, packet, rts, proto);
    }

    /// A one-sided long put arrived: the destination is allocated here and
    /// the endpoint's default completion is signaled.
    pub(crate) fn handle_1sided_rts(&self, packet: Box<Packet>, proto: Proto) {
        let rts = Rts::unpack(packet.payload());
        let size = rts.sizes.iter().sum::<u64>() as usize;
        let endpoint = self.endpoint(proto.gid());
        let mut ctx = Context::new(
            RequestData::Long(Buffer::Owned(vec![0u8; size])),
            packet.header.src_rank,
            proto.tag(),
            endpoint.default_comp.clone(),
            0,
        );
        ctx.attr.set_rdv_type(RdvType::OneSided);
        tracing::trace!(rank = ctx.rank, tag = ctx.tag, size, "recv one-sided RTS");
        self.issue_rtr(ctx, packet, rts, proto);
    }

    /// A scatter put arrived: one destination per advertised size, the
    /// piggy-back is copied out of the RTS itself.
    pub(crate) fn handle_iovec_rts(&self, packet: Box<Packet>, proto: Proto) {
        let mut rts = Rts::unpack(packet.payload());
        let endpoint = self.endpoint(proto.gid());
        let iovec = IovecData {
            piggy_back: std::mem::take(&mut rts.piggy_back),
            buffers: rts
                .sizes
                .iter()
                .map(|size| Buffer::Owned(vec![0u8; *size as usize]))
                .collect(),
        };
        let mut ctx = Context::new(
            RequestData::Iovec(iovec),
            packet.header.src_rank,
            proto.tag(),
            endpoint.default_comp.clone(),
            0,
        );
        ctx.attr.set_rdv_type(RdvType::Iovec);
        tracing::trace!(
            rank = ctx.rank,
            tag = ctx.tag,
            count = rts.sizes.len(),
            "recv iovec RTS"
        );
        self.issue_rtr(ctx, packet, rts, proto);
    }

    /// Registers the destinations of `ctx` the caller did not register and
    /// answers with an RTR written into the RTS packet.
    fn issue_rtr(&self, mut ctx: Box<Context>, mut packet: Box<Packet>, rts: Rts, proto: Proto) {
        let rank = packet.header.src_rank;
        let destinations: Vec<(usize, usize, Option<MemRegion>)> = match &mut ctx.data {
            RequestData::Long(buffer) => vec![destination(buffer)],
            RequestData::Iovec(iovec) => iovec.buffers.iter_mut().map(destination).collect(),
            other => fatal!("RTR for a context holding {:?} data", other.data_type()),
        };
        let mut buffers = Vec::with_capacity(destinations.len());
        for (addr, len, registered) in destinations {
            let mr = match registered {
                Some(mr) => mr,
                None => {
                    let mr = self.network.register(addr, len);
                    ctx.mrs.push(mr);
                    mr
                }
            };
            buffers.push(RemoteBuffer {
                rkey: mr.rkey,
                base: mr.base as u64,
                offset: (addr - mr.base) as u64,
            });
        }
        // only what was registered here is released on completion
        ctx.attr.set_dereg(!ctx.mrs.is_empty());

        let single_write = rts.rdv_type != RdvType::Iovec
            && rts.sizes.iter().all(|s| *s as usize <= self.network.max_msg_size());
        let mode = match self.settings.rdv_protocol {
            RdvProtocol::WriteImm if single_write => RtrMode::WriteImm,
            _ => RtrMode::WriteFin,
        };
        let recv_ctx = match mode {
            RtrMode::WriteImm => self.archive_put(ctx),
            RtrMode::WriteFin => Context::into_wire(ctx),
        };
        let rtr = Rtr {
            rdv_type: rts.rdv_type,
            mode,
            send_ctx: rts.send_ctx,
            recv_ctx,
            buffers,
        };
        packet.header.length = rtr.pack(packet.buf_mut());
        // released by whichever thread completes the send
        packet.header.return_pool = None;
        tracing::trace!(rank, tag = proto.tag(), ?mode, "send RTR");
        self.bq.try_or_enqueue(
            SendOp {
                rank,
                packet,
                imm: Proto::new(proto.gid(), MsgKind::Rtr, proto.tag()).0,
                ctx: PostCtx::None,
            },
            &self.network,
        );
    }

    /// Parks `ctx` in the archive, trying every slot once before giving up.
    fn archive_put(&self, mut ctx: Box<Context>) -> u64 {
        for _ in 0..self.archive.capacity() {
            match self.archive.put(ctx) {
                Ok(key) => return key,
                Err((_, back)) => ctx = back,
            }
        }
        fatal!(
            "context archive is full ({} pending transfers), raise LCI_ARCHIVE_BITS",
            self.archive.capacity()
        );
    }

    /// The receiver is ready: write the payload into the advertised buffers.
    pub(crate) fn handle_rtr(&self, packet: Box<Packet>, proto: Proto) {
        let rtr = Rtr::unpack(packet.payload());
        let rank = packet.header.src_rank;
        self.pool.release(packet);
        // Safety: send_ctx is the word this device put in its RTS, each RTS
        // is answered by exactly one RTR
        let mut ctx = unsafe { Context::from_wire(rtr.send_ctx) };
        tracing::trace!(rank, tag = proto.tag(), mode = ?rtr.mode, "recv RTR");

        let described: Vec<(usize, usize, Option<MemRegion>)> = match &ctx.data {
            RequestData::Long(buffer) => vec![source(buffer)],
            RequestData::Iovec(iovec) => iovec.buffers.iter().map(source).collect(),
            other => fatal!("RTR for a context holding {:?} data", other.data_type()),
        };
        let mut sources = Vec::with_capacity(described.len());
        for (addr, len, registered) in described {
            if registered.is_none() {
                ctx.mrs.push(self.network.register(addr, len));
            }
            sources.push((addr, len));
        }
        ctx.attr.set_dereg(!ctx.mrs.is_empty());

        let max = self.network.max_msg_size();
        let puts: Vec<(usize, usize, RemoteBuffer)> = sources
            .into_iter()
            .zip_eq(rtr.buffers)
            .flat_map(|((addr, len), remote)| {
                chunks(len, max).map(move |(offset, n)| {
                    (
                        addr + offset,
                        n,
                        RemoteBuffer {
                            offset: remote.offset + offset as u64,
                            ..remote
                        },
                    )
                })
            })
            .collect();

        match rtr.mode {
            RtrMode::WriteImm => match puts.as_slice() {
                [(src, len, remote)] => {
                    let imm = Proto::new(proto.gid(), MsgKind::RdvData, rtr.recv_ctx as Tag).0;
                    self.bq.try_or_enqueue(
                        PutOp {
                            rank,
                            src: *src,
                            len: *len,
                            remote: *remote,
                            imm: Some(imm),
                            ctx: PostCtx::Op(ctx),
                        },
                        &self.network,
                    );
                }
                _ => fatal!(
                    "write-with-immediate transfer needs {} writes, the receiver expects one",
                    puts.len()
                ),
            },
            RtrMode::WriteFin => {
                let scatter = Arc::new(ScatterContext {
                    signal_count: AtomicUsize::new(puts.len()),
                    recv_ctx: rtr.recv_ctx,
                    rank,
                    gid: proto.gid(),
                    tag: proto.tag(),
                    ctx: Mutex::new(Some(ctx)),
                });
                for (src, len, remote) in puts {
                    self.bq.try_or_enqueue(
                        PutOp {
                            rank,
                            src,
                            len,
                            remote,
                            imm: None,
                            ctx: PostCtx::Scatter(scatter.clone()),
                        },
                        &self.network,
                    );
                }
            }
        }
    }

    /// One write of a write+FIN transfer finished locally.
    pub(crate) fn scatter_put_done(&self, scatter: Arc<ScatterContext>) {
        if scatter.signal_count.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        tracing::trace!(rank = scatter.rank, tag = scatter.tag, "send FIN");
        self.bq.try_or_enqueue(
            SendsOp {
                rank: scatter.rank,
                data: pack_fin(scatter.recv_ctx).to_vec(),
                imm: Proto::new(scatter.gid, MsgKind::Fin, scatter.tag).0,
            },
            &self.network,
        );
        let ctx = scatter.ctx.lock().take();
        match ctx {
            Some(ctx) => dispatch(ctx, &self.network),
            None => fatal!("scatter context completed twice"),
        }
    }

    /// A write-with-immediate landed; its tag field is the archive key.
    pub(crate) fn handle_remote_write(&self, packet: Box<Packet>, proto: Proto) {
        self.pool.release(packet);
        let key = proto.tag() as u64;
        match self.archive.remove(key) {
            Ok(ctx) => {
                tracing::trace!(rank = ctx.rank, tag = ctx.tag, key, "recv rendezvous data");
                dispatch(ctx, &self.network)
            }
            Err(_) => fatal!("rendezvous data for empty archive slot {}", key),
        }
    }

    pub(crate) fn handle_fin(&self, packet: Box<Packet>) {
        let recv_ctx = unpack_fin(packet.payload());
        self.pool.release(packet);
        // Safety: recv_ctx is the word this device put in its RTR, the sender
        // answers each RTR with exactly one FIN
        let ctx = unsafe { Context::from_wire(recv_ctx) };
        tracing::trace!(rank = ctx.rank, tag = ctx.tag, "recv FIN");
        dispatch(ctx, &self.network);
    }
}

impl std::fmt::Debug for ScatterContext {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ScatterContext")
            .field("pending", &self.signal_count.load(Ordering::SeqCst))
            .field("rank", &self.rank)
            .field("tag", &self.tag)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_cover_the_transfer() {
        let pieces: Vec<_> = chunks(10, 4).collect();
        assert_eq!(pieces, vec![(0, 4), (4, 4), (8, 2)]);
        assert_eq!(chunks(8, 4).count(), 2);
        assert_eq!(chunks(0, 4).collect::<Vec<_>>(), vec![(0, 0)]);
    }

    #[test]
    fn caller_buffer_is_truncated() {
        let data = RequestData::Long(Buffer::Owned(vec![1u8; 16]));
        assert_eq!(size_destination(data, 10).len(), 10);
        assert_eq!(size_destination(RequestData::None, 7).len(), 7);
    }

    #[test]
    fn registered_buffer_keeps_its_region() {
        let mr = MemRegion {
            rkey: 7,
            base: 0x1000,
            len: 16,
        };
        let data = RequestData::Long(Buffer::Registered(crate::context::RegisteredBuffer {
            data: vec![0u8; 16],
            mr,
        }));
        let mut sized = size_destination(data, 10);
        assert_eq!(sized.len(), 10);
        assert_eq!(sized.region(), Some(mr));
        let (_, len, registered) = destination(&mut sized);
        assert_eq!((len, registered), (10, Some(mr)));
    }

    #[test]
    #[should_panic(expected = "too small")]
    fn short_caller_buffer_is_fatal() {
        size_destination(RequestData::Long(Buffer::Owned(vec![0u8; 4])), 5);
    }
}
