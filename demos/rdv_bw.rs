/// ------------LCI Bandwidth: rendezvous -------------------------
/// Rank 0 streams long messages to rank 1 through the rendezvous protocol
/// and reports the throughput per message size. The strategy is taken from
/// the first argument ("write" or "writeimm"), default writeimm.
/// --------------------------------------------------------------------
use lci::{DeviceBuilder, LoopbackFabric, RdvProtocol};
use std::sync::Arc;
use std::time::Instant;

const WINDOW: usize = 64;

fn main() {
    let protocol = match std::env::args().nth(1).as_deref() {
        Some("write") => RdvProtocol::Write,
        _ => RdvProtocol::WriteImm,
    };
    let fabric = LoopbackFabric::new(2);
    let ranks: Vec<_> = (0..2)
        .map(|rank| {
            let fabric = fabric.clone();
            std::thread::spawn(move || {
                let device = DeviceBuilder::new()
                    .with_fabric(fabric, rank)
                    .with_rdv_protocol(protocol)
                    .build()
                    .expect("failed to build device");
                let ep = device.endpoint_builder().build().expect("failed to build endpoint");
                if rank == 0 {
                    println!("==================Bandwidth test ({:?})===========================", protocol);
                }
                for i in 12..25 {
                    let num_bytes = 1usize << i;
                    let data: Arc<[u8]> = (0..num_bytes).map(|b| b as u8).collect::<Vec<u8>>().into();
                    let sync = device.alloc_sync(WINDOW);
                    let timer = Instant::now();
                    for tag in 0..WINDOW as u16 {
                        if rank == 0 {
                            while ep.send_long(data.clone(), 1, tag, sync.clone().into(), 0).is_err() {
                                let _ = device.progress();
                            }
                        } else {
                            ep.recv_long(None, 0, tag, sync.clone().into(), 0).unwrap();
                        }
                    }
                    device.wait(&sync);
                    if rank == 0 {
                        let elapsed = timer.elapsed().as_secs_f64();
                        println!(
                            "tx_size: {:?}B num_tx: {:?} time: {:.6}s throughput: {:.2}MB/s",
                            num_bytes,
                            WINDOW,
                            elapsed,
                            (num_bytes * WINDOW) as f64 / 1048576.0 / elapsed
                        );
                    }
                }
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
