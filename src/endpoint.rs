use crate::completion::Completion;
use crate::context::{Buffer, Context, IovecData, RequestData, ShortData, UserContext};
use crate::device::Device;
use crate::error::{fatal, LciError, LciResult};
use crate::match_table::{MatchKind, MatchType};
use crate::network::{NetworkOps, PostCtx, SendOp, SendsOp};
use crate::packet::{max_iovec_count, MsgKind, Proto, RdvType, Rts, SHORT_SIZE};
use crate::Tag;

use std::sync::Arc;

/// Selects what a one-sided operation signals at the target.
pub type CompRemote = u32;

/// Signal the target endpoint's default completion, the only remote
/// completion currently available.
pub const DEFAULT_COMP_REMOTE: CompRemote = 0;

#[derive(Debug)]
pub(crate) struct EndpointInner {
    pub(crate) gid: u16,
    pub(crate) match_type: MatchType,
    /// signaled by one-sided arrivals
    pub(crate) default_comp: Completion,
}

/// Builds an [Endpoint] on a device.
///
/// # Examples
///
///```
/// use lci::{Device, MatchType};
///
/// let device = Device::new().unwrap();
/// let cq = device.alloc_queue();
/// let ep = device
///     .endpoint_builder()
///     .with_match_type(MatchType::Tag)
///     .with_default_comp(cq.into())
///     .build()
///     .unwrap();
///```
#[derive(Debug)]
pub struct EndpointBuilder {
    device: Device,
    match_type: MatchType,
    default_comp: Completion,
}

impl EndpointBuilder {
    pub fn new(device: &Device) -> EndpointBuilder {
        EndpointBuilder {
            device: device.clone(),
            match_type: MatchType::default(),
            default_comp: Completion::None,
        }
    }

    pub fn with_match_type(mut self, match_type: MatchType) -> EndpointBuilder {
        self.match_type = match_type;
        self
    }

    /// completion signaled when one-sided data arrives at this endpoint
    pub fn with_default_comp(mut self, comp: Completion) -> EndpointBuilder {
        self.default_comp = comp;
        self
    }

    #[tracing::instrument(skip_all, level = "debug")]
    pub fn build(self) -> anyhow::Result<Endpoint> {
        let EndpointBuilder {
            device,
            match_type,
            default_comp,
        } = self;
        let inner = device.inner.add_endpoint(|gid| EndpointInner {
            gid,
            match_type,
            default_comp,
        })?;
        tracing::debug!(gid = inner.gid, ?match_type, "endpoint ready");
        Ok(Endpoint { device, inner })
    }
}

/// The handle every communication operation goes through.
///
/// The endpoint id travels in every message, so peers must create their
/// endpoints in the same order.
#[derive(Clone)]
pub struct Endpoint {
    device: Device,
    inner: Arc<EndpointInner>,
}

fn check_remote(remote: CompRemote) -> LciResult<()> {
    if remote == DEFAULT_COMP_REMOTE {
        Ok(())
    } else {
        Err(LciError::FeatureNotAvailable)
    }
}

impl Endpoint {
    pub fn gid(&self) -> u16 {
        self.inner.gid
    }

    pub fn match_type(&self) -> MatchType {
        self.inner.match_type
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    fn proto(&self, kind: MsgKind, tag: Tag) -> u32 {
        Proto::new(self.inner.gid, kind, tag).0
    }

    fn post_inline(&self, data: &[u8], rank: usize, tag: Tag, kind: MsgKind) -> LciResult<()> {
        let dev = &self.device.inner;
        if !dev.bq.is_empty() {
            return Err(LciError::Retry);
        }
        dev.network
            .post_sends(SendsOp {
                rank,
                data: data.to_vec(),
                imm: self.proto(kind, tag),
            })
            .map_err(|rejected| rejected.err)
    }

    fn post_packet(
        &self,
        data: &[u8],
        rank: usize,
        tag: Tag,
        kind: MsgKind,
        completion: Completion,
        user_context: UserContext,
        wait: bool,
    ) -> LciResult<()> {
        let dev = &self.device.inner;
        if data.len() > dev.settings.packet_size {
            fatal!(
                "medium message of {} bytes exceeds the packet size {}",
                data.len(),
                dev.settings.packet_size
            );
        }
        let mut packet = if wait {
            dev.acquire_send_packet_blocking()
        } else {
            dev.acquire_send_packet()?
        };
        packet.fill(data);
        if data.len() <= dev.settings.packet_return_threshold {
            packet.header.return_pool = None;
        }
        let ctx = if completion.is_none() {
            PostCtx::None
        } else {
            PostCtx::Op(Context::new(
                RequestData::Medium(data.to_vec()),
                rank,
                tag,
                completion,
                user_context,
            ))
        };
        dev.bq.try_or_enqueue(
            SendOp {
                rank,
                packet,
                imm: self.proto(kind, tag),
                ctx,
            },
            &dev.network,
        );
        Ok(())
    }

    fn post_long(
        &self,
        data: RequestData,
        rank: usize,
        tag: Tag,
        rdv_type: RdvType,
        completion: Completion,
        user_context: UserContext,
    ) -> LciResult<()> {
        let dev = &self.device.inner;
        let packet = dev.acquire_send_packet()?;
        let ctx = Context::new(data, rank, tag, completion, user_context);
        dev.post_rts(ctx, packet, rdv_type, self.inner.gid);
        Ok(())
    }

    /// Sends at most [SHORT_SIZE] bytes inline.
    #[tracing::instrument(skip_all, level = "debug")]
    pub fn send_short(&self, data: &[u8], rank: usize, tag: Tag) -> LciResult<()> {
        let data = ShortData::new(data);
        self.post_inline(data.as_bytes(), rank, tag, MsgKind::Short)
    }

    /// Sends up to one packet of data. `completion` fires once the packet has
    /// left, its request carries a copy of the data.
    #[tracing::instrument(skip_all, level = "debug")]
    pub fn send_medium(
        &self,
        data: &[u8],
        rank: usize,
        tag: Tag,
        completion: Completion,
        user_context: UserContext,
    ) -> LciResult<()> {
        self.post_packet(data, rank, tag, MsgKind::Medium, completion, user_context, false)
    }

    /// Like [send_medium](Self::send_medium), but never returns
    /// [LciError::Retry]: drives the device's progress until the backlog has
    /// drained and a packet is free.
    #[tracing::instrument(skip_all, level = "debug")]
    pub fn send_medium_blocking(
        &self,
        data: &[u8],
        rank: usize,
        tag: Tag,
        completion: Completion,
        user_context: UserContext,
    ) -> LciResult<()> {
        self.post_packet(data, rank, tag, MsgKind::Medium, completion, user_context, true)
    }

    /// Sends any amount of data through the rendezvous protocol.
    #[tracing::instrument(skip_all, level = "debug")]
    pub fn send_long(
        &self,
        data: impl Into<Buffer>,
        rank: usize,
        tag: Tag,
        completion: Completion,
        user_context: UserContext,
    ) -> LciResult<()> {
        self.post_long(
            RequestData::Long(data.into()),
            rank,
            tag,
            RdvType::TwoSided,
            completion,
            user_context,
        )
    }

    #[tracing::instrument(skip_all, level = "debug")]
    pub fn recv_short(
        &self,
        rank: usize,
        tag: Tag,
        completion: Completion,
        user_context: UserContext,
    ) -> LciResult<()> {
        let ctx = Context::new(RequestData::None, rank, tag, completion, user_context);
        self.device
            .inner
            .post_match(ctx, self.inner.gid, self.inner.match_type, MatchKind::Short);
        Ok(())
    }

    /// Receives a medium message into `buffer`, truncated to the message
    /// size; without a buffer one is allocated.
    #[tracing::instrument(skip_all, level = "debug")]
    pub fn recv_medium(
        &self,
        buffer: Option<Vec<u8>>,
        rank: usize,
        tag: Tag,
        completion: Completion,
        user_context: UserContext,
    ) -> LciResult<()> {
        let data = buffer.map_or(RequestData::None, RequestData::Medium);
        let ctx = Context::new(data, rank, tag, completion, user_context);
        self.device
            .inner
            .post_match(ctx, self.inner.gid, self.inner.match_type, MatchKind::Medium);
        Ok(())
    }

    /// Receives a long message into `buffer`, truncated to the message size;
    /// without a buffer one is allocated. A buffer smaller than the message is
    /// fatal, and so is a [Buffer::Shared] one. A [Buffer::Registered] buffer
    /// comes back in the request still registered.
    #[tracing::instrument(skip_all, level = "debug")]
    pub fn recv_long(
        &self,
        buffer: Option<Buffer>,
        rank: usize,
        tag: Tag,
        completion: Completion,
        user_context: UserContext,
    ) -> LciResult<()> {
        let data = buffer.map_or(RequestData::None, RequestData::Long);
        let ctx = Context::new(data, rank, tag, completion, user_context);
        self.device
            .inner
            .post_match(ctx, self.inner.gid, self.inner.match_type, MatchKind::Long);
        Ok(())
    }

    /// Writes at most [SHORT_SIZE] bytes to `rank`, where the target
    /// endpoint's default completion receives them.
    #[tracing::instrument(skip_all, level = "debug")]
    pub fn put_short(
        &self,
        data: &[u8],
        rank: usize,
        tag: Tag,
        remote: CompRemote,
    ) -> LciResult<()> {
        check_remote(remote)?;
        let data = ShortData::new(data);
        self.post_inline(data.as_bytes(), rank, tag, MsgKind::RdmaShort)
    }

    #[tracing::instrument(skip_all, level = "debug")]
    pub fn put_medium(
        &self,
        data: &[u8],
        rank: usize,
        tag: Tag,
        remote: CompRemote,
        completion: Completion,
        user_context: UserContext,
    ) -> LciResult<()> {
        check_remote(remote)?;
        if completion.is_none() && data.len() <= SHORT_SIZE {
            self.post_inline(data, rank, tag, MsgKind::RdmaMedium)
        } else {
            self.post_packet(
                data,
                rank,
                tag,
                MsgKind::RdmaMedium,
                completion,
                user_context,
                false,
            )
        }
    }

    /// Writes any amount of data to `rank`; the target allocates the
    /// destination and signals its endpoint's default completion.
    #[tracing::instrument(skip_all, level = "debug")]
    pub fn put_long(
        &self,
        data: impl Into<Buffer>,
        rank: usize,
        tag: Tag,
        remote: CompRemote,
        completion: Completion,
        user_context: UserContext,
    ) -> LciResult<()> {
        check_remote(remote)?;
        self.post_long(
            RequestData::Long(data.into()),
            rank,
            tag,
            RdvType::OneSided,
            completion,
            user_context,
        )
    }

    /// Writes several buffers plus a piggy-back to `rank` in one transfer.
    ///
    /// The buffer count is limited by what fits one packet, and the
    /// piggy-back must fit next to the size table in the RTS.
    #[tracing::instrument(skip_all, level = "debug")]
    pub fn put_iovec(
        &self,
        iovec: IovecData,
        rank: usize,
        tag: Tag,
        remote: CompRemote,
        completion: Completion,
        user_context: UserContext,
    ) -> LciResult<()> {
        check_remote(remote)?;
        let packet_size = self.device.inner.settings.packet_size;
        let count = iovec.buffers.len();
        if count == 0 || count > max_iovec_count(packet_size) {
            fatal!(
                "iovec of {} buffers, between 1 and {} are supported",
                count,
                max_iovec_count(packet_size)
            );
        }
        if iovec.piggy_back.len() > Rts::max_piggy_back(packet_size, count) {
            fatal!(
                "piggy-back of {} bytes does not fit next to {} buffers",
                iovec.piggy_back.len(),
                count
            );
        }
        self.post_long(
            RequestData::Iovec(iovec),
            rank,
            tag,
            RdvType::Iovec,
            completion,
            user_context,
        )
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("rank", &self.device.rank())
            .field("gid", &self.inner.gid)
            .field("match_type", &self.inner.match_type)
            .finish()
    }
}
