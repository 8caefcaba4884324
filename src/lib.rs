//! lci is a lightweight communication interface for clusters: two-sided
//! send/receive and one-sided put over RDMA-style fabrics.
//!
//! The heart of the crate is the machinery that completes messages:
//! - a per-thread packet pool with work stealing supplies fixed-size wire buffers,
//! - a concurrent matching table pairs posted receives with arrived messages exactly once,
//! - completion objects (synchronizers, queues, handlers) notify the caller,
//! - a rendezvous protocol (RTS/RTR/FIN) moves large messages with one-sided writes,
//! - a backlog queue absorbs posts a saturated fabric refuses.
//!
//! Every rank owns a [Device], which is attached to one port of a fabric.
//! Operations go through an [Endpoint] created on the device, and nothing
//! moves unless someone calls [Device::progress] (directly, through the wait
//! helpers, or from a [progress thread][Device::spawn_progress_thread]).
//!
//! The crate ships an in-process [LoopbackFabric], so several ranks can run
//! as threads of a single process.
//!
//! EXAMPLES
//! --------
//!
//! # A short message between two ranks
//! ```
//! use lci::{Completion, DeviceBuilder, LoopbackFabric};
//!
//! let fabric = LoopbackFabric::new(2);
//! let ranks: Vec<_> = (0..2)
//!     .map(|rank| {
//!         let fabric = fabric.clone();
//!         std::thread::spawn(move || {
//!             let device = DeviceBuilder::new().with_fabric(fabric, rank).build().unwrap();
//!             let ep = device.endpoint_builder().build().unwrap();
//!             if rank == 0 {
//!                 while ep.send_short(b"hello", 1, 7).is_err() {
//!                     let _ = device.progress();
//!                 }
//!             } else {
//!                 let sync = device.alloc_sync(1);
//!                 ep.recv_short(0, 7, sync.clone().into(), 0).unwrap();
//!                 let reqs = device.wait(&sync);
//!                 println!("got {:?}", reqs[0].data);
//!             }
//!         })
//!     })
//!     .collect();
//! for rank in ranks {
//!     rank.join().unwrap();
//! }
//! ```

pub mod completion;
pub use completion::{Completion, CompletionQueue, Handler, Synchronizer};

mod backlog_queue;
mod context;
pub use context::{
    Buffer, DataType, IovecData, RegisteredBuffer, Request, RequestData, ShortData, UserContext,
};

mod ctx_archive;
mod device;
pub use device::{Device, DeviceBuilder, ProgressThread};

mod endpoint;
pub use endpoint::{CompRemote, Endpoint, EndpointBuilder, DEFAULT_COMP_REMOTE};

mod env_var;
pub use env_var::{config, Config};

mod error;
pub use error::{LciError, LciResult};

mod match_table;
pub use match_table::MatchType;

mod network;
pub use network::loopback::LoopbackFabric;
pub use network::Backend;

mod packet;
pub use packet::SHORT_SIZE;

mod packet_pool;
mod rendezvous;
pub use rendezvous::RdvProtocol;

mod spinlock;
mod warnings;

/// Message tags are 16 bits, they travel in the immediate word.
pub type Tag = u16;

/// Turns the runtime warnings (receive starvation, leftover backlog) back on.
pub fn enable_warnings() {
    warnings::RuntimeWarning::enable_warnings();
}

/// Silences every runtime warning, regardless of the `LCI_*_WARNING` settings.
pub fn disable_warnings() {
    warnings::RuntimeWarning::disable_warnings();
}
