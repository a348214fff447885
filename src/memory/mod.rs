//! Device memory management
//!
//! The runtime reserves one arena per device session and carves every
//! buffer out of it. This avoids a driver allocation per tensor, which is
//! slow and on some drivers unstable once a graph has thousands of buffers.
//!
//! - [`MemoryPool`]: best-fit allocator over the arena, with packed
//!   contiguous groups for communication kernels
//! - [`DeviceAddress`]: logical buffer with a lazy [`Binding`]
//! - [`MemoryCalculator`]: required-memory computation, no allocation

pub mod address;
pub mod calculator;
pub mod pool;

pub use address::{Address, Allocation, Binding, DeviceAddress};
pub use calculator::{MemoryCalculator, MemoryRequirement, StaticLayout};
pub use pool::{align_up, MemoryPool, PoolStats};
