//! Device addresses
//!
//! A [`DeviceAddress`] is the logical buffer behind one kernel output (or one
//! graph parameter). Its [`Binding`] says whether device memory currently
//! backs it. Consumers never own addresses; they reach them through the
//! graph's input edges.

use crate::device::DevicePtr;
use crate::graph::{DType, Format};

/// Device memory currently backing an address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub ptr: DevicePtr,
    pub size: usize,
}

/// Whether an address is backed by device memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Binding {
    #[default]
    Unallocated,
    Allocated(Allocation),
}

/// Logical device buffer with lazy binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAddress {
    binding: Binding,
    size: usize,
    format: Format,
    dtype: DType,
}

impl DeviceAddress {
    /// Create an unallocated address of `size` bytes
    pub fn new(size: usize, format: Format, dtype: DType) -> Self {
        Self {
            binding: Binding::Unallocated,
            size,
            format,
            dtype,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn binding(&self) -> Binding {
        self.binding
    }

    pub fn is_allocated(&self) -> bool {
        matches!(self.binding, Binding::Allocated(_))
    }

    pub fn ptr(&self) -> Option<DevicePtr> {
        match self.binding {
            Binding::Allocated(allocation) => Some(allocation.ptr),
            Binding::Unallocated => None,
        }
    }

    /// Launch-time view of the binding, if any
    pub fn address(&self) -> Option<Address> {
        match self.binding {
            Binding::Allocated(Allocation { ptr, size }) => Some(Address { ptr, size }),
            Binding::Unallocated => None,
        }
    }

    /// Attach device memory.
    ///
    /// # Panics
    /// If the address is already bound. A bound pointer must stay stable
    /// until it is explicitly released.
    pub fn bind(&mut self, ptr: DevicePtr, size: usize) {
        if let Binding::Allocated(existing) = self.binding {
            panic!(
                "device address already bound to {} ({} bytes), refusing to rebind to {}",
                existing.ptr, existing.size, ptr
            );
        }
        self.binding = Binding::Allocated(Allocation { ptr, size });
    }

    /// Detach device memory, returning what was bound
    pub fn unbind(&mut self) -> Option<Allocation> {
        match std::mem::take(&mut self.binding) {
            Binding::Allocated(allocation) => Some(allocation),
            Binding::Unallocated => None,
        }
    }
}

/// Ephemeral `{pointer, size}` pair handed to a kernel launch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    pub ptr: DevicePtr,
    pub size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_address_is_unallocated() {
        let addr = DeviceAddress::new(64, Format::Nchw, DType::F16);
        assert!(!addr.is_allocated());
        assert_eq!(addr.ptr(), None);
        assert_eq!(addr.address(), None);
        assert_eq!(addr.size(), 64);
        assert_eq!(addr.format(), Format::Nchw);
        assert_eq!(addr.dtype(), DType::F16);
    }

    #[test]
    fn test_bind_and_unbind() {
        let mut addr = DeviceAddress::new(64, Format::Default, DType::F32);
        addr.bind(DevicePtr(0x2000), 64);
        assert_eq!(
            addr.address(),
            Some(Address {
                ptr: DevicePtr(0x2000),
                size: 64
            })
        );

        let released = addr.unbind().unwrap();
        assert_eq!(released.ptr, DevicePtr(0x2000));
        assert!(!addr.is_allocated());
        assert!(addr.unbind().is_none());
    }

    #[test]
    #[should_panic(expected = "already bound")]
    fn test_rebind_panics() {
        let mut addr = DeviceAddress::new(64, Format::Default, DType::F32);
        addr.bind(DevicePtr(0x2000), 64);
        addr.bind(DevicePtr(0x4000), 64);
    }
}
