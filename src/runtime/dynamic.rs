//! Dynamic-pool execution
//!
//! Walks the execution order once. For each kernel:
//! 1. resolve inputs (they must already be bound by their producer)
//! 2. bind outputs from the pool if they are not bound yet
//! 3. allocate a fresh workspace for every non-empty slot
//! 4. launch
//! 5. drop one use of every input, free inputs whose last use this was,
//!    free outputs nobody reads, free the workspaces
//!
//! Workspaces live in a [`WorkspaceGuard`], so they go back to the pool on
//! every exit path, including a failed launch.

use tracing::{debug, error, trace, warn};

use crate::device::DeviceStream;
use crate::error::{ForgeError, ForgeResult};
use crate::graph::{AddressTable, KernelGraph, KernelId, KernelNode};
use crate::memory::{Address, MemoryPool};
use crate::reuse::RefCountTable;
use crate::runtime::communication::alloc_communication_op_dynamic_res;

/// Scratch buffers of one launch
pub(crate) struct WorkspaceGuard<'p> {
    pool: &'p MemoryPool,
    slots: Vec<Option<Address>>,
}

impl<'p> WorkspaceGuard<'p> {
    fn new(pool: &'p MemoryPool, capacity: usize) -> Self {
        Self {
            pool,
            slots: Vec::with_capacity(capacity),
        }
    }

    /// Allocate the next slot; zero-sized slots stay empty
    fn push(&mut self, size: usize) -> ForgeResult<()> {
        if size == 0 {
            self.slots.push(None);
            return Ok(());
        }
        let ptr = self.pool.allocate(size)?;
        self.slots.push(Some(Address { ptr, size }));
        Ok(())
    }

    pub(crate) fn addresses(&self) -> &[Option<Address>] {
        &self.slots
    }

    /// Free every workspace, reporting the first failure
    pub(crate) fn release(mut self) -> ForgeResult<()> {
        let mut result = Ok(());
        for workspace in self.slots.drain(..).flatten() {
            if let Err(e) = self.pool.free(workspace.ptr) {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }
}

impl Drop for WorkspaceGuard<'_> {
    fn drop(&mut self) {
        for workspace in self.slots.drain(..).flatten() {
            if let Err(e) = self.pool.free(workspace.ptr) {
                warn!("failed to free workspace at {}: {}", workspace.ptr, e);
            }
        }
    }
}

/// Run every kernel of `graph` in order, allocating and freeing on the way.
///
/// Returns the number of kernels launched. Stops at the first failure; the
/// caller sees the error and no later kernel is launched.
pub(crate) fn launch_kernel_dynamic(
    pool: &MemoryPool,
    stream: &dyn DeviceStream,
    graph: &mut KernelGraph,
    table: &mut RefCountTable,
) -> ForgeResult<usize> {
    if !table.all_reset() {
        debug!(
            "graph {}: previous run stopped early, resetting reference counts",
            graph.id()
        );
        table.reset();
    }

    alloc_communication_op_dynamic_res(pool, graph)?;

    let (order, nodes, addresses) = graph.split_mut();
    let mut launched = 0;
    for &kernel in order {
        let node = &nodes[kernel.0];
        let (inputs, outputs, workspaces) = alloc_kernel_dynamic_res(pool, kernel, node, addresses)?;

        trace!(
            "launching '{}' ({}) with {} inputs, {} outputs",
            node.name(),
            kernel,
            inputs.len(),
            outputs.len()
        );
        if let Err(e) = node
            .kernel()
            .launch(&inputs, workspaces.addresses(), &outputs, stream)
        {
            error!("kernel '{}' ({}) failed to launch: {}", node.name(), kernel, e);
            return Err(ForgeError::KernelLaunchFailed {
                kernel: node.name().to_string(),
                reason: e.to_string(),
            });
        }
        launched += 1;

        free_kernel_dynamic_res(pool, kernel, node, addresses, table, workspaces)?;
    }

    Ok(launched)
}

/// Resolve the launch arguments of one kernel.
///
/// # Panics
/// If an input is not bound: its producer never ran or freed it too early.
fn alloc_kernel_dynamic_res<'p>(
    pool: &'p MemoryPool,
    kernel: KernelId,
    node: &KernelNode,
    addresses: &mut AddressTable,
) -> ForgeResult<(Vec<Address>, Vec<Address>, WorkspaceGuard<'p>)> {
    let mut inputs = Vec::with_capacity(node.inputs().len());
    for (index, &edge) in node.inputs().iter().enumerate() {
        match addresses.get(edge).and_then(|addr| addr.address()) {
            Some(address) => inputs.push(address),
            None => panic!(
                "consistency violation: input {} ({:?}) of kernel '{}' ({}) is not allocated",
                index,
                edge,
                node.name(),
                kernel
            ),
        }
    }

    let mut outputs = Vec::with_capacity(node.output_count());
    for index in 0..node.output_count() {
        let Some(address) = addresses.output_mut(kernel, index) else {
            panic!(
                "output {} of kernel '{}' ({}) has no device address",
                index,
                node.name(),
                kernel
            );
        };
        if !address.is_allocated() {
            let size = address.size();
            pool.malloc_address(address, size)?;
        }
        if let Some(bound) = address.address() {
            outputs.push(bound);
        }
    }

    let sizes = node.kernel().workspace_size_list();
    let mut workspaces = WorkspaceGuard::new(pool, sizes.len());
    for &size in sizes {
        workspaces.push(size)?;
    }

    Ok((inputs, outputs, workspaces))
}

/// Post-launch release for one kernel
fn free_kernel_dynamic_res(
    pool: &MemoryPool,
    kernel: KernelId,
    node: &KernelNode,
    addresses: &mut AddressTable,
    table: &mut RefCountTable,
    workspaces: WorkspaceGuard<'_>,
) -> ForgeResult<()> {
    if !node.op_class().retains_inputs() {
        for (index, &edge) in node.inputs().iter().enumerate() {
            if !table.consume_input(kernel, index) {
                continue;
            }
            if let Some(address) = addresses.get_mut(edge) {
                trace!("'{}' was the last reader of {:?}, freeing it", node.name(), edge);
                pool.free_address(address)?;
            }
        }
    }

    for index in 0..node.output_count() {
        if table.output_unused(kernel, index) {
            if let Some(address) = addresses.output_mut(kernel, index) {
                pool.free_address(address)?;
            }
        }
    }

    workspaces.release()
}
