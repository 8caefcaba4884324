/// ------------LCI Latency: ping pong -------------------------
/// Two ranks bounce a medium message back and forth over the loopback
/// fabric, each rank on its own thread, and report the round trip latency
/// per message size.
/// --------------------------------------------------------------------
use lci::{Completion, DeviceBuilder, LoopbackFabric};
use std::time::Instant;

const ITERS: usize = 10_000;

fn main() {
    let fabric = LoopbackFabric::new(2);
    let ranks: Vec<_> = (0..2)
        .map(|rank| {
            let fabric = fabric.clone();
            std::thread::spawn(move || {
                let device = DeviceBuilder::new()
                    .with_fabric(fabric, rank)
                    .build()
                    .expect("failed to build device");
                let ep = device.endpoint_builder().build().expect("failed to build endpoint");
                let peer = 1 - rank;
                let sync = device.alloc_sync(1);
                let mut size = 1;
                while size <= device.packet_size() {
                    let data = vec![rank as u8; size];
                    let timer = Instant::now();
                    for i in 0..ITERS {
                        let tag = (i % 1024) as u16;
                        if rank == 0 {
                            ep.send_medium_blocking(&data, peer, tag, Completion::None, 0).unwrap();
                            ep.recv_medium(None, peer, tag, sync.clone().into(), 0).unwrap();
                            device.wait(&sync);
                        } else {
                            ep.recv_medium(None, peer, tag, sync.clone().into(), 0).unwrap();
                            device.wait(&sync);
                            ep.send_medium_blocking(&data, peer, tag, Completion::None, 0).unwrap();
                        }
                    }
                    if rank == 0 {
                        let elapsed = timer.elapsed().as_secs_f64();
                        println!(
                            "size: {:>6}B latency: {:.3}us",
                            size,
                            elapsed * 1_000_000.0 / (2 * ITERS) as f64
                        );
                    }
                    size *= 2;
                }
                // let the peer drain its last message
                for _ in 0..1000 {
                    let _ = device.progress();
                }
            })
        })
        .collect();
    for rank in ranks {
        rank.join().unwrap();
    }
}
