use lci::{Device, DeviceBuilder, Endpoint, LoopbackFabric};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// One rank of a multi-rank test, running on its own thread.
pub struct Rank {
    pub rank: usize,
    pub device: Device,
    pub ep: Endpoint,
    pub fabric: Arc<LoopbackFabric>,
    arrived: Arc<AtomicUsize>,
}

impl Rank {
    pub fn nranks(&self) -> usize {
        self.fabric.nranks()
    }

    /// Progresses until `f` succeeds.
    pub fn retry<F>(&self, mut f: F)
    where
        F: FnMut() -> lci::LciResult<()>,
    {
        while let Err(err) = f() {
            assert!(err.is_retry(), "unexpected error {:?}", err);
            let _ = self.device.progress();
        }
    }

    /// Waits until every rank got here, progressing meanwhile.
    fn quiesce(&self) {
        self.arrived.fetch_add(1, Ordering::SeqCst);
        while self.arrived.load(Ordering::SeqCst) < self.nranks() {
            let _ = self.device.progress();
            std::thread::yield_now();
        }
        while self.device.progress().is_ok() {}
    }
}

#[allow(dead_code)]
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}

/// A small device for `rank` of `fabric`.
pub fn small_device(fabric: &Arc<LoopbackFabric>, rank: usize) -> DeviceBuilder {
    DeviceBuilder::new()
        .with_fabric(fabric.clone(), rank)
        .with_num_packets(128)
        .with_max_recvs(32)
        .with_packet_size(1024)
}

/// Runs `body` on `nranks` threads sharing one loopback fabric, each with its
/// own device (configured by `configure`) and a default endpoint.
#[allow(dead_code)]
pub fn run_ranks<C, F>(nranks: usize, configure: C, body: F)
where
    C: Fn(usize, DeviceBuilder) -> DeviceBuilder + Send + Sync + 'static,
    F: Fn(&Rank) + Send + Sync + 'static,
{
    init_logging();
    let fabric = LoopbackFabric::new(nranks);
    let arrived = Arc::new(AtomicUsize::new(0));
    let configure = Arc::new(configure);
    let body = Arc::new(body);
    let handles: Vec<_> = (0..nranks)
        .map(|rank| {
            let fabric = fabric.clone();
            let arrived = arrived.clone();
            let configure = configure.clone();
            let body = body.clone();
            std::thread::Builder::new()
                .name(format!("rank_{}", rank))
                .spawn(move || {
                    let device = configure(rank, small_device(&fabric, rank))
                        .build()
                        .unwrap();
                    let ep = device.endpoint_builder().build().unwrap();
                    let rank = Rank {
                        rank,
                        device,
                        ep,
                        fabric,
                        arrived,
                    };
                    body(&rank);
                    rank.quiesce();
                })
                .unwrap()
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

/// Every packet of a quiet device is either in its pool or posted.
#[allow(dead_code)]
pub fn assert_packets_conserved(device: &Device, num_pkts: usize) {
    while device.progress().is_ok() {}
    assert_eq!(device.available_packets() + device.posted_recvs(), num_pkts);
}

#[allow(dead_code)]
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}
