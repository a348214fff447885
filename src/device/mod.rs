//! Device collaborator contracts
//!
//! The runtime never talks to a driver directly. Everything it needs from the
//! accelerator goes through two traits:
//! - [`Device`]: enumeration, device selection, the default execution stream
//!   and reservation of the raw memory arena backing the pool
//! - [`DeviceStream`]: the in-order execution stream kernels are launched on
//!
//! [`HostDevice`] is a host-only implementation with fake device pointers,
//! used by the test suite and for planning on machines without an
//! accelerator.

pub mod host;

use std::fmt;
use std::sync::Arc;

use crate::error::ForgeResult;

pub use host::{HostDevice, HostStream};

/// Raw device pointer
///
/// A plain address in the device's address space. The host never
/// dereferences it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DevicePtr(pub usize);

impl DevicePtr {
    /// Pointer `bytes` past this one
    pub fn offset(self, bytes: usize) -> DevicePtr {
        DevicePtr(self.0 + bytes)
    }

    /// Byte distance from `base` to this pointer
    pub fn offset_from(self, base: DevicePtr) -> usize {
        self.0 - base.0
    }

    pub fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// In-order device execution stream
pub trait DeviceStream: Send + Sync + fmt::Debug {
    /// Opaque handle passed through to kernel launches
    fn handle(&self) -> usize;

    /// Block until every operation queued on the stream has completed
    fn synchronize(&self) -> ForgeResult<()>;
}

/// Free and total device memory in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    pub free: usize,
    pub total: usize,
}

/// Accelerator device
pub trait Device: Send + Sync + fmt::Debug {
    /// Human-readable device name for logs
    fn name(&self) -> &str;

    /// Number of visible devices
    fn device_count(&self) -> usize;

    /// Make `device_id` the current device for this process
    fn set_device(&self, device_id: u32) -> ForgeResult<()>;

    /// The default execution stream of the current device
    fn default_stream(&self) -> ForgeResult<Arc<dyn DeviceStream>>;

    fn memory_info(&self) -> ForgeResult<MemoryInfo>;

    /// Reserve `bytes` of raw device memory as one contiguous region
    fn reserve(&self, bytes: usize) -> ForgeResult<DevicePtr>;

    /// Return a region obtained from [`Device::reserve`]
    fn release(&self, base: DevicePtr, bytes: usize);

    /// Tear down device state (queues, contexts). Called once at session end.
    fn release_device(&self) {}
}
