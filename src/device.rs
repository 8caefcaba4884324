//! A device is one rank's attachment to the fabric.
//!
//! It owns everything the engine shares between endpoints: the fabric port,
//! the packet pool, the matching table, the context archive, the backlog
//! queue and the pool of posted receives. [progress][Device::progress] drives
//! all of it.

use crate::backlog_queue::BacklogQueue;
use crate::completion::{dispatch, CompletionQueue, Synchronizer};
use crate::context::{Context, RegisteredBuffer, Request, RequestData, ShortData};
use crate::ctx_archive::ContextArchive;
use crate::endpoint::{EndpointBuilder, EndpointInner};
use crate::error::{fatal, LciError, LciResult};
use crate::match_table::{make_key, MatchKind, MatchOutcome, MatchSide, MatchTable, MatchType};
use crate::network::loopback::LoopbackFabric;
use crate::network::{
    Backend, CompletionEvent, Network, NetworkOps, Opcode, PostCtx, Rejected,
};
use crate::packet::{MsgKind, Packet, Proto, RdvType, Rts, MAX_ENDPOINTS, MIN_PACKET_SIZE};
use crate::rendezvous::RdvProtocol;
use crate::warnings::RuntimeWarning;
use crate::config;

use crossbeam::utils::Backoff;
use parking_lot::RwLock;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

/// What the matching table holds for a key.
#[derive(Debug)]
pub(crate) enum MatchEntry {
    /// a posted receive waiting for its message
    Recv(Box<Context>),
    /// a message that arrived before its receive
    Arrived(Box<Packet>),
}

#[derive(Debug, Clone)]
pub(crate) struct DeviceSettings {
    pub(crate) packet_size: usize,
    pub(crate) num_pkts: usize,
    pub(crate) max_recvs: usize,
    pub(crate) max_cqes: usize,
    pub(crate) max_endpoints: usize,
    pub(crate) packet_return_threshold: usize,
    pub(crate) rdv_protocol: RdvProtocol,
    pub(crate) archive_bits: u32,
    pub(crate) matchtable_bits: u32,
    pub(crate) max_packet_pools: usize,
    pub(crate) max_msg_size: usize,
    pub(crate) queue_length: usize,
    pub(crate) progress_core: Option<usize>,
}

impl DeviceSettings {
    fn from_config() -> DeviceSettings {
        let config = config();
        DeviceSettings {
            packet_size: config.packet_size,
            num_pkts: config.server_num_pkts,
            max_recvs: config.server_max_recvs,
            max_cqes: config.server_max_cqes,
            max_endpoints: config.max_endpoints,
            packet_return_threshold: config.packet_return_threshold,
            rdv_protocol: config.rdv_protocol,
            archive_bits: config.archive_bits,
            matchtable_bits: config.matchtable_bits,
            max_packet_pools: config.max_packet_pools,
            max_msg_size: config.max_msg_size,
            queue_length: config.default_queue_length(),
            progress_core: config.progress_core,
        }
    }
}

pub(crate) struct DeviceInner {
    pub(crate) network: Network,
    pub(crate) pool: crate::packet_pool::PacketPool,
    pub(crate) table: MatchTable<MatchEntry>,
    pub(crate) archive: ContextArchive<Context>,
    pub(crate) bq: BacklogQueue,
    pub(crate) settings: DeviceSettings,
    endpoints: RwLock<Vec<Arc<EndpointInner>>>,
    recvs_posted: AtomicUsize,
    starving: AtomicBool,
    // two-sided messages that arrived before their receive
    unexpected: AtomicUsize,
}

/// A handle to one rank's device, cheap to clone and share between threads.
#[derive(Clone)]
pub struct Device {
    pub(crate) inner: Arc<DeviceInner>,
}

/// An implementation of the Builder design pattern, used to construct a [Device].
///
/// Every setting starts from the process configuration (`LCI_*` environment
/// variables) and can be overridden per device, so devices with different
/// settings can share a process.
///
/// # Examples
///
///```
/// use lci::{DeviceBuilder, LoopbackFabric, RdvProtocol};
///
/// let fabric = LoopbackFabric::new(2);
/// let device = DeviceBuilder::new()
///                 .with_fabric(fabric.clone(), 0)
///                 .with_rdv_protocol(RdvProtocol::Write)
///                 .build()
///                 .unwrap();
///```
#[derive(Debug)]
pub struct DeviceBuilder {
    backend: Backend,
    fabric: Option<(Arc<LoopbackFabric>, usize)>,
    settings: DeviceSettings,
}

impl Default for DeviceBuilder {
    fn default() -> Self {
        DeviceBuilder::new()
    }
}

impl DeviceBuilder {
    /// Construct a new device builder from the process configuration
    #[tracing::instrument(skip_all, level = "debug")]
    pub fn new() -> DeviceBuilder {
        DeviceBuilder {
            backend: Default::default(),
            fabric: None,
            settings: DeviceSettings::from_config(),
        }
    }

    pub fn with_backend(mut self, backend: Backend) -> DeviceBuilder {
        self.backend = backend;
        self
    }

    /// Attach the device to `rank` of an existing loopback fabric. Without
    /// this the device gets a private single-rank fabric.
    pub fn with_fabric(mut self, fabric: Arc<LoopbackFabric>, rank: usize) -> DeviceBuilder {
        self.fabric = Some((fabric, rank));
        self
    }

    pub fn with_packet_size(mut self, packet_size: usize) -> DeviceBuilder {
        self.settings.packet_size = packet_size;
        self
    }

    /// Number of packets created for this device; also resets the default
    /// completion queue length to twice this number.
    pub fn with_num_packets(mut self, num_pkts: usize) -> DeviceBuilder {
        self.settings.num_pkts = num_pkts;
        self.settings.queue_length = 2 * num_pkts;
        self
    }

    pub fn with_max_recvs(mut self, max_recvs: usize) -> DeviceBuilder {
        self.settings.max_recvs = max_recvs;
        self
    }

    pub fn with_max_cqes(mut self, max_cqes: usize) -> DeviceBuilder {
        self.settings.max_cqes = max_cqes;
        self
    }

    pub fn with_max_endpoints(mut self, max_endpoints: usize) -> DeviceBuilder {
        self.settings.max_endpoints = max_endpoints;
        self
    }

    pub fn with_packet_return_threshold(mut self, threshold: usize) -> DeviceBuilder {
        self.settings.packet_return_threshold = threshold;
        self
    }

    pub fn with_rdv_protocol(mut self, protocol: RdvProtocol) -> DeviceBuilder {
        self.settings.rdv_protocol = protocol;
        self
    }

    pub fn with_archive_bits(mut self, bits: u32) -> DeviceBuilder {
        self.settings.archive_bits = bits;
        self
    }

    pub fn with_max_msg_size(mut self, max_msg_size: usize) -> DeviceBuilder {
        self.settings.max_msg_size = max_msg_size;
        self
    }

    pub fn with_queue_length(mut self, queue_length: usize) -> DeviceBuilder {
        self.settings.queue_length = queue_length;
        self
    }

    pub fn with_progress_core(mut self, core: usize) -> DeviceBuilder {
        self.settings.progress_core = Some(core);
        self
    }

    /// Instantiate the device: create its packets and post its receives.
    #[tracing::instrument(skip_all, level = "debug")]
    pub fn build(self) -> anyhow::Result<Device> {
        let settings = self.settings;
        anyhow::ensure!(
            settings.packet_size >= MIN_PACKET_SIZE,
            "packet size {} is below the minimum of {}",
            settings.packet_size,
            MIN_PACKET_SIZE
        );
        anyhow::ensure!(settings.num_pkts > 0, "a device needs at least one packet");
        anyhow::ensure!(
            settings.archive_bits <= 16,
            "archive keys travel in a 16 bit field, {} archive bits is too many",
            settings.archive_bits
        );
        anyhow::ensure!(
            settings.max_endpoints > 0 && settings.max_endpoints <= MAX_ENDPOINTS,
            "max endpoints must be between 1 and {}",
            MAX_ENDPOINTS
        );
        anyhow::ensure!(settings.matchtable_bits < 32, "too many matching table bits");

        let network: Network = match self.backend {
            Backend::Loopback => {
                let (fabric, rank) = self.fabric.unwrap_or_else(|| (LoopbackFabric::new(1), 0));
                fabric
                    .claim(rank)?
                    .with_max_msg_size(settings.max_msg_size)
                    .into()
            }
        };

        let pool = crate::packet_pool::PacketPool::new(settings.max_packet_pools, settings.packet_size);
        pool.populate(pool.local_id(), settings.num_pkts);

        let inner = Arc::new(DeviceInner {
            network,
            pool,
            table: MatchTable::new(settings.matchtable_bits),
            archive: ContextArchive::new(settings.archive_bits),
            bq: BacklogQueue::new(),
            endpoints: RwLock::new(Vec::new()),
            recvs_posted: AtomicUsize::new(0),
            starving: AtomicBool::new(false),
            unexpected: AtomicUsize::new(0),
            settings,
        });
        inner.fill_rq();
        tracing::debug!(
            rank = inner.network.rank(),
            nranks = inner.network.nranks(),
            settings = ?inner.settings,
            "device ready"
        );
        Ok(Device { inner })
    }
}

impl Device {
    /// A device built entirely from the process configuration.
    pub fn new() -> anyhow::Result<Device> {
        DeviceBuilder::new().build()
    }

    pub fn rank(&self) -> usize {
        self.inner.network.rank()
    }

    pub fn nranks(&self) -> usize {
        self.inner.network.nranks()
    }

    pub fn packet_size(&self) -> usize {
        self.inner.settings.packet_size
    }

    pub fn rdv_protocol(&self) -> RdvProtocol {
        self.inner.settings.rdv_protocol
    }

    /// Start building an endpoint on this device.
    pub fn endpoint_builder(&self) -> EndpointBuilder {
        EndpointBuilder::new(self)
    }

    /// Polls the fabric once, serves what completed, drains the backlog queue
    /// and reposts receives.
    ///
    /// Returns `Retry` if no completion was served.
    pub fn progress(&self) -> LciResult<()> {
        self.inner.progress()
    }

    /// A synchronizer that becomes ready after `threshold` signals.
    pub fn alloc_sync(&self, threshold: usize) -> Arc<Synchronizer> {
        Arc::new(Synchronizer::new(threshold))
    }

    /// A completion queue of the device's default length.
    pub fn alloc_queue(&self) -> Arc<CompletionQueue> {
        Arc::new(CompletionQueue::new(self.inner.settings.queue_length))
    }

    /// Waits for `sync`, driving this device's progress meanwhile.
    pub fn wait(&self, sync: &Synchronizer) -> Vec<Request> {
        sync.wait(|| {
            let _ = self.progress();
        })
    }

    /// Waits for one request in `queue`, driving this device's progress meanwhile.
    pub fn wait_queue(&self, queue: &CompletionQueue) -> Request {
        queue.wait(|| {
            let _ = self.progress();
        })
    }

    /// packets currently sitting in the pool, not posted and not in flight
    pub fn available_packets(&self) -> usize {
        self.inner.pool.available()
    }

    /// receives currently posted to the fabric
    pub fn posted_recvs(&self) -> usize {
        self.inner.recvs_posted.load(Ordering::SeqCst)
    }

    /// posts waiting in the backlog queue
    pub fn backlog_len(&self) -> usize {
        self.inner.bq.len()
    }

    /// two-sided messages so far that had to wait in the matching table for
    /// their receive
    pub fn unexpected_arrivals(&self) -> usize {
        self.inner.unexpected.load(Ordering::SeqCst)
    }

    /// Registers `data` with the fabric once, for use as the source or the
    /// destination of any number of long transfers.
    ///
    /// Transfers through a registered buffer skip the per-transfer
    /// registration and leave the registration in place when they complete.
    #[tracing::instrument(skip_all, level = "debug")]
    pub fn register(&self, data: Vec<u8>) -> RegisteredBuffer {
        let mr = self
            .inner
            .network
            .register(data.as_ptr() as usize, data.len());
        tracing::debug!(rkey = mr.rkey, len = mr.len, "registered buffer");
        RegisteredBuffer { data, mr }
    }

    /// Releases the registration of `buffer` and hands back its data.
    #[tracing::instrument(skip_all, level = "debug")]
    pub fn deregister(&self, buffer: RegisteredBuffer) -> Vec<u8> {
        self.inner.network.deregister(buffer.mr);
        buffer.data
    }

    /// Starts a named background thread that calls [progress][Device::progress]
    /// until the returned guard is dropped.
    #[tracing::instrument(skip_all, level = "debug")]
    pub fn spawn_progress_thread(&self) -> anyhow::Result<ProgressThread> {
        let running = Arc::new(AtomicBool::new(true));
        let device = self.clone();
        let keep_going = running.clone();
        let core = self.inner.settings.progress_core;
        let handle = thread::Builder::new()
            .name(format!("lci_progress_{}", self.rank()))
            .spawn(move || {
                if let Some(core) = core {
                    let id = pick_core(core_affinity::get_core_ids(), core);
                    core_affinity::set_for_current(id);
                }
                tracing::debug!(rank = device.rank(), "progress thread running");
                let backoff = Backoff::new();
                while keep_going.load(Ordering::SeqCst) {
                    match device.progress() {
                        Ok(()) => backoff.reset(),
                        Err(_) => backoff.snooze(),
                    }
                }
            })?;
        Ok(ProgressThread {
            running,
            handle: Some(handle),
        })
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("rank", &self.rank())
            .field("nranks", &self.nranks())
            .field("pool", &self.inner.pool)
            .field("backlog", &self.inner.bq)
            .field("posted_recvs", &self.posted_recvs())
            .finish()
    }
}

/// the `core`-th of the detected cores, wrapping around; core 0 when none are detected
fn pick_core(core_ids: Option<Vec<core_affinity::CoreId>>, core: usize) -> core_affinity::CoreId {
    match core_ids {
        Some(core_ids) if !core_ids.is_empty() => core_ids[core % core_ids.len()],
        _ => core_affinity::CoreId { id: 0 },
    }
}

/// Stops and joins its progress thread when dropped.
#[derive(Debug)]
pub struct ProgressThread {
    running: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Drop for ProgressThread {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("progress thread panicked");
            }
        }
    }
}

impl DeviceInner {
    pub(crate) fn progress(&self) -> LciResult<()> {
        let mut served = 0;
        while served < self.settings.max_cqes {
            match self.network.poll_cq() {
                Some(event) => {
                    self.serve(event);
                    served += 1;
                }
                None => break,
            }
        }
        while self.bq.progress(&self.network).is_ok() {}
        self.fill_rq();
        if served > 0 {
            Ok(())
        } else {
            Err(LciError::Retry)
        }
    }

    /// Keeps `max_recvs` receives posted while the pool has packets.
    fn fill_rq(&self) {
        let target = self.settings.max_recvs;
        loop {
            if self.recvs_posted.fetch_add(1, Ordering::SeqCst) >= target {
                self.recvs_posted.fetch_sub(1, Ordering::SeqCst);
                break;
            }
            let packet = match self.pool.acquire() {
                Some(packet) => packet,
                None => {
                    self.recvs_posted.fetch_sub(1, Ordering::SeqCst);
                    break;
                }
            };
            if let Err(Rejected { op, .. }) = self.network.post_recv(packet) {
                self.recvs_posted.fetch_sub(1, Ordering::SeqCst);
                self.pool.release(op);
                break;
            }
        }
        let posted = self.recvs_posted.load(Ordering::SeqCst);
        if posted < target / 2 {
            if !self.starving.swap(true, Ordering::SeqCst) {
                RuntimeWarning::DeadlockAlert(posted, target).print();
            }
        } else {
            self.starving.store(false, Ordering::SeqCst);
        }
    }

    fn serve(&self, event: CompletionEvent) {
        match event.opcode {
            Opcode::Send => self.serve_send(event.packet, event.ctx),
            Opcode::Recv | Opcode::RemoteWrite => {
                self.recvs_posted.fetch_sub(1, Ordering::SeqCst);
                let packet = match event.packet {
                    Some(packet) => packet,
                    None => fatal!("{:?} completion without a packet", event.opcode),
                };
                let proto = Proto(event.imm);
                if event.opcode == Opcode::Recv {
                    self.serve_recv(packet, proto);
                } else {
                    self.handle_remote_write(packet, proto);
                }
            }
        }
    }

    fn serve_send(&self, packet: Option<Box<Packet>>, ctx: PostCtx) {
        if let Some(packet) = packet {
            self.pool.release(packet);
        }
        match ctx {
            PostCtx::None => {}
            PostCtx::Op(ctx) => dispatch(ctx, &self.network),
            PostCtx::Scatter(scatter) => self.scatter_put_done(scatter),
        }
    }

    fn serve_recv(&self, packet: Box<Packet>, proto: Proto) {
        let src_rank = packet.header.src_rank;
        match proto.kind() {
            MsgKind::Short => self.serve_matched(packet, proto, MatchKind::Short),
            MsgKind::Medium => self.serve_matched(packet, proto, MatchKind::Medium),
            MsgKind::RdmaShort => {
                let endpoint = self.endpoint(proto.gid());
                let data = RequestData::Short(ShortData::new(packet.payload()));
                self.pool.release(packet);
                let ctx = Context::new(data, src_rank, proto.tag(), endpoint.default_comp.clone(), 0);
                dispatch(ctx, &self.network);
            }
            MsgKind::RdmaMedium => {
                let endpoint = self.endpoint(proto.gid());
                let data = RequestData::Medium(packet.payload().to_vec());
                self.pool.release(packet);
                let ctx = Context::new(data, src_rank, proto.tag(), endpoint.default_comp.clone(), 0);
                dispatch(ctx, &self.network);
            }
            MsgKind::Rts => match Rts::peek_type(packet.payload()) {
                RdvType::TwoSided => self.serve_matched(packet, proto, MatchKind::Long),
                RdvType::OneSided => self.handle_1sided_rts(packet, proto),
                RdvType::Iovec => self.handle_iovec_rts(packet, proto),
            },
            MsgKind::Rtr => self.handle_rtr(packet, proto),
            MsgKind::Fin => self.handle_fin(packet),
            kind @ (MsgKind::None | MsgKind::RdvData) => {
                fatal!("unexpected {:?} message from rank {}", kind, src_rank)
            }
        }
    }

    /// An arrived two-sided message looks for its posted receive.
    fn serve_matched(&self, packet: Box<Packet>, proto: Proto, kind: MatchKind) {
        let endpoint = self.endpoint(proto.gid());
        let key = make_key(
            packet.header.src_rank,
            proto.gid(),
            proto.tag(),
            kind,
            endpoint.match_type,
        );
        match self
            .table
            .insert_or_match(key, MatchEntry::Arrived(packet), MatchSide::Send)
        {
            MatchOutcome::Inserted => {
                self.unexpected.fetch_add(1, Ordering::SeqCst);
                tracing::trace!(tag = proto.tag(), ?kind, "unexpected message parked")
            }
            MatchOutcome::Matched { stored, incoming } => {
                self.complete_match(stored, incoming, kind, proto.gid())
            }
        }
    }

    /// A posted receive looks for its message.
    pub(crate) fn post_match(
        &self,
        ctx: Box<Context>,
        gid: u16,
        match_type: MatchType,
        kind: MatchKind,
    ) {
        let key = make_key(ctx.rank, gid, ctx.tag, kind, match_type);
        match self
            .table
            .insert_or_match(key, MatchEntry::Recv(ctx), MatchSide::Recv)
        {
            MatchOutcome::Inserted => {}
            MatchOutcome::Matched { stored, incoming } => {
                self.complete_match(stored, incoming, kind, gid)
            }
        }
    }

    fn complete_match(&self, stored: MatchEntry, incoming: MatchEntry, kind: MatchKind, gid: u16) {
        let (mut ctx, packet) = match (stored, incoming) {
            (MatchEntry::Recv(ctx), MatchEntry::Arrived(packet))
            | (MatchEntry::Arrived(packet), MatchEntry::Recv(ctx)) => (ctx, packet),
            _ => fatal!("matching table paired two entries of the same side"),
        };
        ctx.rank = packet.header.src_rank;
        match kind {
            MatchKind::Short => {
                ctx.data = RequestData::Short(ShortData::new(packet.payload()));
                self.pool.release(packet);
                dispatch(ctx, &self.network);
            }
            MatchKind::Medium => {
                let payload = packet.payload();
                let buffer = match std::mem::replace(&mut ctx.data, RequestData::None) {
                    RequestData::None => payload.to_vec(),
                    RequestData::Medium(mut buffer) => {
                        if buffer.len() < payload.len() {
                            fatal!(
                                "receive buffer of {} bytes is too small for a {} byte message",
                                buffer.len(),
                                payload.len()
                            );
                        }
                        buffer.truncate(payload.len());
                        buffer.copy_from_slice(payload);
                        buffer
                    }
                    other => fatal!("medium receive posted with {:?} data", other.data_type()),
                };
                ctx.data = RequestData::Medium(buffer);
                self.pool.release(packet);
                dispatch(ctx, &self.network);
            }
            MatchKind::Long => {
                let proto = Proto::new(gid, MsgKind::Rts, ctx.tag);
                self.handle_2sided_rts(ctx, packet, proto);
            }
        }
    }

    /// Registers an endpoint and returns its id.
    pub(crate) fn add_endpoint(
        &self,
        make: impl FnOnce(u16) -> EndpointInner,
    ) -> anyhow::Result<Arc<EndpointInner>> {
        let mut endpoints = self.endpoints.write();
        anyhow::ensure!(
            endpoints.len() < self.settings.max_endpoints,
            "device already has the maximum of {} endpoints",
            self.settings.max_endpoints
        );
        let endpoint = Arc::new(make(endpoints.len() as u16));
        endpoints.push(endpoint.clone());
        Ok(endpoint)
    }

    pub(crate) fn endpoint(&self, gid: u16) -> Arc<EndpointInner> {
        match self.endpoints.read().get(gid as usize) {
            Some(endpoint) => endpoint.clone(),
            None => fatal!("message for unknown endpoint {}", gid),
        }
    }

    /// A packet for an outgoing message, or `Retry` when the backlog queue is
    /// holding posts or the pool is dry.
    pub(crate) fn acquire_send_packet(&self) -> LciResult<Box<Packet>> {
        if !self.bq.is_empty() {
            return Err(LciError::Retry);
        }
        self.pool.acquire().ok_or(LciError::Retry)
    }

    /// Drives progress until the backlog drains and a packet frees up.
    pub(crate) fn acquire_send_packet_blocking(&self) -> Box<Packet> {
        let backoff = Backoff::new();
        while !self.bq.is_empty() {
            let _ = self.progress();
            backoff.snooze();
        }
        self.pool.acquire_blocking(|| {
            let _ = self.progress();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_device(fabric: &Arc<LoopbackFabric>, rank: usize) -> Device {
        DeviceBuilder::new()
            .with_fabric(fabric.clone(), rank)
            .with_num_packets(32)
            .with_max_recvs(8)
            .build()
            .unwrap()
    }

    #[test]
    fn build_posts_receives() {
        let fabric = LoopbackFabric::new(1);
        let device = small_device(&fabric, 0);
        assert_eq!(device.posted_recvs(), 8);
        assert_eq!(fabric.posted_recvs(0), 8);
        assert_eq!(device.available_packets(), 24);
        assert_eq!(device.progress(), Err(LciError::Retry));
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let fabric = LoopbackFabric::new(1);
        assert!(DeviceBuilder::new()
            .with_fabric(fabric.clone(), 0)
            .with_packet_size(16)
            .build()
            .is_err());
        assert!(DeviceBuilder::new()
            .with_fabric(fabric.clone(), 0)
            .with_archive_bits(17)
            .build()
            .is_err());
        // the failed builds never claimed the port
        assert!(small_device(&fabric, 0).rank() == 0);
        assert!(DeviceBuilder::new().with_fabric(fabric, 0).build().is_err());
    }

    #[test]
    fn endpoints_are_bounded() {
        let fabric = LoopbackFabric::new(1);
        let device = DeviceBuilder::new()
            .with_fabric(fabric, 0)
            .with_num_packets(16)
            .with_max_recvs(4)
            .with_max_endpoints(2)
            .build()
            .unwrap();
        assert_eq!(device.endpoint_builder().build().unwrap().gid(), 0);
        assert_eq!(device.endpoint_builder().build().unwrap().gid(), 1);
        assert!(device.endpoint_builder().build().is_err());
    }

    #[test]
    fn starving_receive_queue_still_progresses() {
        let fabric = LoopbackFabric::new(1);
        // fewer packets than the receive target
        let device = DeviceBuilder::new()
            .with_fabric(fabric, 0)
            .with_num_packets(4)
            .with_max_recvs(16)
            .build()
            .unwrap();
        assert_eq!(device.posted_recvs(), 4);
        assert_eq!(device.available_packets(), 0);
        assert!(device.inner.starving.load(Ordering::SeqCst));
    }

    #[test]
    fn progress_core_wraps_and_falls_back() {
        let cores = (0..4).map(|id| core_affinity::CoreId { id }).collect::<Vec<_>>();
        assert_eq!(pick_core(Some(cores), 6).id, 2);
        assert_eq!(pick_core(Some(Vec::new()), 3).id, 0);
        assert_eq!(pick_core(None, 3).id, 0);
    }

    #[test]
    fn pinned_progress_thread_runs() {
        let fabric = LoopbackFabric::new(1);
        let device = DeviceBuilder::new()
            .with_fabric(fabric, 0)
            .with_num_packets(16)
            .with_max_recvs(4)
            .with_progress_core(1)
            .build()
            .unwrap();
        let ep = device.endpoint_builder().build().unwrap();
        let sync = device.alloc_sync(1);
        ep.recv_short(0, 1, sync.clone().into(), 0).unwrap();
        let guard = device.spawn_progress_thread().unwrap();
        ep.send_short(&[1], 0, 1).unwrap();
        while sync.test().is_err() {
            std::thread::yield_now();
        }
        drop(guard);
    }

    #[test]
    fn progress_thread_stops_on_drop() {
        let fabric = LoopbackFabric::new(1);
        let device = small_device(&fabric, 0);
        let guard = device.spawn_progress_thread().unwrap();
        drop(guard);
        assert_eq!(device.posted_recvs(), 8);
    }
}
