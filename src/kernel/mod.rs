//! Kernel collaborator contract
//!
//! The runtime treats kernels as opaque: it asks for their buffer sizes and
//! launches them with resolved addresses. The only thing it inspects is the
//! [`OpClass`], which decides whether the communication allocator handles the
//! kernel and whether its inputs survive the launch.

use std::fmt;

use thiserror::Error;

use crate::device::DeviceStream;
use crate::memory::Address;

/// Failure reported by a kernel launch
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LaunchError {
    /// The kernel refused the arguments (wrong arity, bad shapes)
    #[error("launch rejected: {0}")]
    Rejected(String),
    /// The device reported an error while enqueueing the kernel
    #[error("device fault: {0}")]
    DeviceFault(String),
}

/// Compiled kernel
///
/// Size lists are fixed for the lifetime of the kernel. `launch` enqueues
/// work on `stream` and must not block on it.
pub trait KernelMod: Send + Sync {
    /// Byte size of each output slot
    fn output_size_list(&self) -> &[usize];

    /// Byte size of each scratch slot; zero means the slot is unused
    fn workspace_size_list(&self) -> &[usize];

    /// Enqueue the kernel.
    ///
    /// `workspaces[i]` is `None` exactly when `workspace_size_list()[i]` is 0.
    fn launch(
        &self,
        inputs: &[Address],
        workspaces: &[Option<Address>],
        outputs: &[Address],
        stream: &dyn DeviceStream,
    ) -> Result<(), LaunchError>;
}

/// How the runtime treats a kernel's buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpClass {
    #[default]
    Compute,
    /// Collective: inputs and outputs each occupy one contiguous region.
    /// When `retains_inputs` is set the inputs stay bound after the launch.
    Communication { retains_inputs: bool },
}

impl OpClass {
    /// Classify a kernel by its operator name
    pub fn from_op_name(name: &str) -> Self {
        match name {
            "AllReduce" => OpClass::Communication {
                retains_inputs: true,
            },
            "AllGather" | "ReduceScatter" | "Broadcast" => OpClass::Communication {
                retains_inputs: false,
            },
            _ => OpClass::Compute,
        }
    }

    pub fn is_communication(&self) -> bool {
        matches!(self, OpClass::Communication { .. })
    }

    pub fn retains_inputs(&self) -> bool {
        matches!(
            self,
            OpClass::Communication {
                retains_inputs: true
            }
        )
    }
}

type LaunchFn = dyn Fn(&[Address], &[Option<Address>], &[Address]) -> Result<(), LaunchError>
    + Send
    + Sync;

/// Kernel backed by a closure
///
/// Handy for host-side ops and for tests that need to observe launches.
pub struct FnKernel {
    output_sizes: Vec<usize>,
    workspace_sizes: Vec<usize>,
    launch_fn: Box<LaunchFn>,
}

impl fmt::Debug for FnKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnKernel")
            .field("output_sizes", &self.output_sizes)
            .field("workspace_sizes", &self.workspace_sizes)
            .finish()
    }
}

impl FnKernel {
    /// Kernel whose launch does nothing
    pub fn new(output_sizes: Vec<usize>, workspace_sizes: Vec<usize>) -> Self {
        Self {
            output_sizes,
            workspace_sizes,
            launch_fn: Box::new(|_, _, _| Ok(())),
        }
    }

    pub fn with_launch<F>(mut self, launch_fn: F) -> Self
    where
        F: Fn(&[Address], &[Option<Address>], &[Address]) -> Result<(), LaunchError>
            + Send
            + Sync
            + 'static,
    {
        self.launch_fn = Box::new(launch_fn);
        self
    }
}

impl KernelMod for FnKernel {
    fn output_size_list(&self) -> &[usize] {
        &self.output_sizes
    }

    fn workspace_size_list(&self) -> &[usize] {
        &self.workspace_sizes
    }

    fn launch(
        &self,
        inputs: &[Address],
        workspaces: &[Option<Address>],
        outputs: &[Address],
        _stream: &dyn DeviceStream,
    ) -> Result<(), LaunchError> {
        (self.launch_fn)(inputs, workspaces, outputs)
    }
}
