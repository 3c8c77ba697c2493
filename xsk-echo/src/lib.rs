// Public modules and re-exports
pub mod mmap;
pub mod packet;
pub mod pool;
pub mod ring;
pub mod run;
pub mod socket;
pub mod stats;

pub use pool::FramePool;
pub use run::EchoLoop;
pub use socket::{Socket, XskConfig};
pub use stats::{Stats, StatsRecord};

/// Size of one UMEM frame in bytes. Frame addresses are always multiples of this.
pub const FRAME_SIZE: usize = 4096;

/// Number of frames in the UMEM arena.
pub const FRAME_COUNT: usize = 4096;

/// Depth of each of the four rings (RX, TX, Fill, Completion).
pub const DEFAULT_RING_SIZE: usize = 2048;

/// Maximum RX descriptors consumed per loop iteration.
pub const RX_BATCH_SIZE: usize = 64;

/// Sentinel for "no frame available". Never a valid frame address.
pub const INVALID_FRAME: u64 = u64::MAX;
