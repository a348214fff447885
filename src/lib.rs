//! graphforge - device memory lifecycle and kernel dispatch for compute graphs
//!
//! Executes a scheduled kernel graph on an accelerator while reusing a single
//! device memory pool: buffers are allocated when their producer runs and
//! freed as soon as their last consumer has launched. Collective kernels get
//! packed contiguous regions, and a static mode places everything at fixed
//! offsets for one-off inference.

#![allow(clippy::needless_range_loop)] // Index loops mirror kernel/slot numbering
#![allow(clippy::type_complexity)] // Nested slot tables are common here

pub mod device;
pub mod error;
pub mod graph;
pub mod kernel;
pub mod logging;
pub mod memory;
pub mod reuse;
pub mod runtime;

pub use device::{Device, DevicePtr, DeviceStream, HostDevice, HostStream, MemoryInfo};
pub use error::{ErrorCategory, ForgeError, ForgeResult};
pub use graph::{DType, Format, GraphId, InputEdge, KernelGraph, KernelId, KernelNode, OutputDesc};
pub use kernel::{FnKernel, KernelMod, LaunchError, OpClass};
pub use memory::{Address, DeviceAddress, MemoryCalculator, MemoryPool, MemoryRequirement, PoolStats};
pub use reuse::{RefCount, RefCountTable, MAX_REF_COUNT};
pub use runtime::{KernelRuntime, MemoryMode, RunReport, RuntimeConfig};
