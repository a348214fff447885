//! Host-only device (no accelerator required)
//!
//! Hands out fake, never-dereferenced addresses from a private address space.
//! Counts synchronizations and can be told to fail them, which is what the
//! runtime tests need.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::device::{Device, DevicePtr, DeviceStream, MemoryInfo};
use crate::error::{ForgeError, ForgeResult};

/// First fake address handed out. Non-zero so a zero pointer is never valid.
const FAKE_BASE: usize = 0x1000_0000;

/// Host stream with a synchronization counter
#[derive(Debug, Default)]
pub struct HostStream {
    sync_count: AtomicUsize,
    fail_sync: AtomicBool,
}

impl HostStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful or failed `synchronize` calls so far
    pub fn sync_count(&self) -> usize {
        self.sync_count.load(Ordering::SeqCst)
    }

    /// Make subsequent `synchronize` calls fail
    pub fn set_fail_sync(&self, fail: bool) {
        self.fail_sync.store(fail, Ordering::SeqCst);
    }
}

impl DeviceStream for HostStream {
    fn handle(&self) -> usize {
        self as *const HostStream as usize
    }

    fn synchronize(&self) -> ForgeResult<()> {
        self.sync_count.fetch_add(1, Ordering::SeqCst);
        if self.fail_sync.load(Ordering::SeqCst) {
            return Err(ForgeError::DeviceSyncFailed(
                "host stream configured to fail".to_string(),
            ));
        }
        Ok(())
    }
}

/// Simulated accelerator
#[derive(Debug)]
pub struct HostDevice {
    name: String,
    device_count: usize,
    total_memory: usize,
    current_device: Mutex<Option<u32>>,
    stream: Arc<HostStream>,
    next_base: AtomicUsize,
    reserved: Mutex<Vec<(DevicePtr, usize)>>,
    released: AtomicBool,
}

impl HostDevice {
    /// Create a single simulated device with `total_memory` bytes
    pub fn new(total_memory: usize) -> Self {
        Self {
            name: "host-simulated".to_string(),
            device_count: 1,
            total_memory,
            current_device: Mutex::new(None),
            stream: Arc::new(HostStream::new()),
            next_base: AtomicUsize::new(FAKE_BASE),
            reserved: Mutex::new(Vec::new()),
            released: AtomicBool::new(false),
        }
    }

    /// Pretend `count` devices are visible (0 simulates a machine without one)
    pub fn with_device_count(mut self, count: usize) -> Self {
        self.device_count = count;
        self
    }

    /// The concrete stream, for inspecting sync counts in tests
    pub fn host_stream(&self) -> Arc<HostStream> {
        Arc::clone(&self.stream)
    }

    pub fn current_device(&self) -> Option<u32> {
        self.current_device.lock().ok().and_then(|d| *d)
    }

    /// Bytes currently reserved through [`Device::reserve`]
    pub fn reserved_bytes(&self) -> usize {
        self.reserved
            .lock()
            .map(|r| r.iter().map(|(_, size)| size).sum())
            .unwrap_or(0)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl Device for HostDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn device_count(&self) -> usize {
        self.device_count
    }

    fn set_device(&self, device_id: u32) -> ForgeResult<()> {
        if device_id as usize >= self.device_count {
            return Err(crate::backend_error!(
                "device {} out of range ({} visible)",
                device_id,
                self.device_count
            ));
        }
        *self.current_device.lock()? = Some(device_id);
        Ok(())
    }

    fn default_stream(&self) -> ForgeResult<Arc<dyn DeviceStream>> {
        let stream: Arc<dyn DeviceStream> = self.stream.clone();
        Ok(stream)
    }

    fn memory_info(&self) -> ForgeResult<MemoryInfo> {
        let reserved = self.reserved_bytes();
        Ok(MemoryInfo {
            free: self.total_memory.saturating_sub(reserved),
            total: self.total_memory,
        })
    }

    fn reserve(&self, bytes: usize) -> ForgeResult<DevicePtr> {
        let mut reserved = self.reserved.lock()?;
        let in_use: usize = reserved.iter().map(|(_, size)| size).sum();
        let available = self.total_memory.saturating_sub(in_use);
        if bytes > available {
            return Err(ForgeError::OutOfMemory {
                requested: bytes,
                available,
            });
        }
        // Leave a gap between reservations so stray arithmetic is visible.
        let base = DevicePtr(self.next_base.fetch_add(bytes + FAKE_BASE, Ordering::SeqCst));
        reserved.push((base, bytes));
        tracing::debug!("HostDevice reserved {} bytes at {}", bytes, base);
        Ok(base)
    }

    fn release(&self, base: DevicePtr, bytes: usize) {
        match self.reserved.lock() {
            Ok(mut reserved) => {
                let before = reserved.len();
                reserved.retain(|&(ptr, size)| !(ptr == base && size == bytes));
                if reserved.len() == before {
                    tracing::warn!("HostDevice: release of unknown region {} ({} bytes)", base, bytes);
                }
            }
            Err(e) => tracing::error!("HostDevice: reservation table poisoned: {}", e),
        }
    }

    fn release_device(&self) {
        self.released.store(true, Ordering::SeqCst);
    }
}
