//! The boundary to the fabric.
//!
//! The engine only needs a handful of primitives from a fabric adapter: post
//! an inline send, post a packet send, post a receive buffer, post a one-sided
//! write (optionally carrying an immediate word), register memory, and poll
//! for completions. A rejected post hands the operation back together with the
//! reason so the caller can retry it or park it in the backlog queue.

pub(crate) mod loopback;

use crate::context::Context;
use crate::error::LciError;
use crate::packet::{Packet, RemoteBuffer};
use crate::rendezvous::ScatterContext;

use enum_dispatch::enum_dispatch;
use loopback::LoopbackPort;

use std::sync::Arc;

/// The list of available fabric backends
#[derive(
    serde::Serialize, serde::Deserialize, Debug, PartialEq, Eq, Ord, PartialOrd, Hash, Clone, Copy,
)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// An in-process fabric, every rank lives in the same address space
    Loopback,
}

impl Default for Backend {
    fn default() -> Self {
        match crate::config().backend.as_str() {
            "loopback" => Backend::Loopback,
            other => {
                tracing::warn!("unknown backend {:?}, falling back to loopback", other);
                Backend::Loopback
            }
        }
    }
}

/// A registered memory region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct MemRegion {
    pub(crate) rkey: u64,
    pub(crate) base: usize,
    pub(crate) len: usize,
}

/// What the backend hands back when an operation completes locally.
pub(crate) enum PostCtx {
    None,
    Op(Box<Context>),
    Scatter(Arc<ScatterContext>),
}

impl std::fmt::Debug for PostCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            PostCtx::None => write!(f, "None"),
            PostCtx::Op(ctx) => write!(f, "Op(rank {} tag {})", ctx.rank, ctx.tag),
            PostCtx::Scatter(_) => write!(f, "Scatter"),
        }
    }
}

/// An inline send; the bytes are copied by the backend at post time.
#[derive(Debug, Clone)]
pub(crate) struct SendsOp {
    pub(crate) rank: usize,
    pub(crate) data: Vec<u8>,
    pub(crate) imm: u32,
}

/// A send of the first `header.length` bytes of a packet.
#[derive(Debug)]
pub(crate) struct SendOp {
    pub(crate) rank: usize,
    pub(crate) packet: Box<Packet>,
    pub(crate) imm: u32,
    pub(crate) ctx: PostCtx,
}

/// A one-sided write of `len` bytes at `src` into a remote registered buffer.
#[derive(Debug)]
pub(crate) struct PutOp {
    pub(crate) rank: usize,
    pub(crate) src: usize,
    pub(crate) len: usize,
    pub(crate) remote: RemoteBuffer,
    pub(crate) imm: Option<u32>,
    pub(crate) ctx: PostCtx,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Opcode {
    /// a local send or write finished
    Send,
    /// a message landed in a posted receive packet
    Recv,
    /// a remote write with immediate landed, consuming a posted receive
    RemoteWrite,
}

#[derive(Debug)]
pub(crate) struct CompletionEvent {
    pub(crate) opcode: Opcode,
    pub(crate) rank: usize,
    pub(crate) length: usize,
    pub(crate) imm: u32,
    pub(crate) packet: Option<Box<Packet>>,
    pub(crate) ctx: PostCtx,
}

/// A post the backend refused, handed back for a later retry.
#[derive(Debug)]
pub(crate) struct Rejected<T> {
    pub(crate) err: LciError,
    pub(crate) op: T,
}

pub(crate) type PostResult<T> = Result<(), Rejected<T>>;

#[enum_dispatch]
pub(crate) trait NetworkOps {
    fn rank(&self) -> usize;
    fn nranks(&self) -> usize;
    /// largest single write the fabric accepts
    fn max_msg_size(&self) -> usize;
    fn register(&self, addr: usize, len: usize) -> MemRegion;
    fn deregister(&self, mr: MemRegion);
    fn post_sends(&self, op: SendsOp) -> PostResult<SendsOp>;
    fn post_send(&self, op: SendOp) -> PostResult<SendOp>;
    fn post_put(&self, op: PutOp) -> PostResult<PutOp>;
    fn post_recv(&self, packet: Box<Packet>) -> PostResult<Box<Packet>>;
    fn poll_cq(&self) -> Option<CompletionEvent>;
}

#[enum_dispatch(NetworkOps)]
#[derive(Debug)]
pub(crate) enum Network {
    Loopback(LoopbackPort),
}
