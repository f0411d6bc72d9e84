// A shared-memory multiprocessor simulator: per-core write-back caches
// kept coherent by a snooping MESI protocol over a broadcast interconnect.

pub mod bus;
pub mod cache;
pub mod commons;
pub mod memory;
pub mod processor;
pub mod workload;

pub use bus::{BusClient, Interconnect};
pub use cache::{Cache, LineInfo};
pub use commons::{BusMsg, CacheStats, MesiState, SimError};
pub use memory::{MainMemory, MemoryPort};
pub use processor::{Instruction, ProcessingElement};
