//! Static memory mode
//!
//! Every output and workspace of the graph gets a fixed offset inside one
//! pool block, assigned once in `assign_memory`. Parameters read by a
//! communication kernel are moved into the block next to the rest of its
//! input group. Runs only launch; nothing is allocated or freed between
//! kernels.

use tracing::{error, info, trace};

use crate::device::{DevicePtr, DeviceStream};
use crate::error::{ForgeError, ForgeResult};
use crate::graph::{InputEdge, KernelGraph, KernelId};
use crate::memory::{Address, MemoryCalculator, MemoryPool};

/// Fixed placement of one graph
#[derive(Debug)]
pub struct StaticPlan {
    /// Pool block backing the plan; `None` when the layout is empty
    block: Option<DevicePtr>,
    total_bytes: usize,
    /// Outputs this plan bound, which must not be freed one by one
    bound_outputs: Vec<(KernelId, usize)>,
    /// Parameters moved into the block
    bound_parameters: Vec<usize>,
    workspaces: Vec<Vec<Option<Address>>>,
}

impl StaticPlan {
    /// Reserve one block for the graph and bind every unbound output into it.
    ///
    /// Parameters packed with a communication group give their own
    /// allocation back before the block is requested.
    pub fn assign(pool: &MemoryPool, graph: &mut KernelGraph) -> ForgeResult<Self> {
        let layout = MemoryCalculator::with_alignment(pool.alignment()).static_layout(graph);
        let moved: Vec<(usize, usize)> = layout
            .parameters
            .iter()
            .enumerate()
            .filter_map(|(param, offset)| offset.map(|offset| (param, offset)))
            .collect();
        for &(param, _) in &moved {
            if let Some(address) = graph.addresses_mut().get_mut(InputEdge::Parameter(param)) {
                pool.free_address(address)?;
            }
        }

        let block = if layout.total_bytes > 0 {
            Some(pool.allocate(layout.total_bytes)?)
        } else {
            None
        };
        let base = block.unwrap_or_else(|| pool.base());

        let mut bound_outputs = Vec::new();
        let (_, nodes, addresses) = graph.split_mut();
        for (kernel_index, slots) in layout.outputs.iter().enumerate() {
            for (index, offset) in slots.iter().enumerate() {
                let Some(offset) = offset else { continue };
                let kernel = KernelId(kernel_index);
                if let Some(address) = addresses.output_mut(kernel, index) {
                    let size = address.size();
                    address.bind(base.offset(*offset), size);
                    bound_outputs.push((kernel, index));
                }
            }
        }

        let mut bound_parameters = Vec::with_capacity(moved.len());
        for (param, offset) in moved {
            if let Some(address) = addresses.get_mut(InputEdge::Parameter(param)) {
                let size = address.size();
                address.bind(base.offset(offset), size);
                bound_parameters.push(param);
            }
        }

        let workspaces: Vec<Vec<Option<Address>>> = layout
            .workspaces
            .iter()
            .zip(nodes)
            .map(|(slots, node)| {
                let sizes = node.kernel().workspace_size_list();
                slots
                    .iter()
                    .zip(sizes)
                    .map(|(offset, &size)| {
                        offset.map(|offset| Address {
                            ptr: base.offset(offset),
                            size,
                        })
                    })
                    .collect()
            })
            .collect();

        info!(
            "static plan for graph {}: {} bytes, {} outputs and {} parameters placed",
            graph.id(),
            layout.total_bytes,
            bound_outputs.len(),
            bound_parameters.len()
        );
        Ok(Self {
            block,
            total_bytes: layout.total_bytes,
            bound_outputs,
            bound_parameters,
            workspaces,
        })
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn block(&self) -> Option<DevicePtr> {
        self.block
    }

    /// Number of kernels the plan was laid out for
    pub fn kernel_count(&self) -> usize {
        self.workspaces.len()
    }

    /// Launch every kernel in order with its fixed addresses
    pub fn launch(&self, graph: &KernelGraph, stream: &dyn DeviceStream) -> ForgeResult<usize> {
        let addresses = graph.addresses();
        let mut launched = 0;
        for &kernel in graph.execution_order() {
            let node = graph.node(kernel);
            let inputs: Vec<Address> = node
                .inputs()
                .iter()
                .enumerate()
                .map(|(index, &edge)| {
                    addresses.get(edge).and_then(|addr| addr.address()).unwrap_or_else(|| {
                        panic!(
                            "consistency violation: input {} ({:?}) of kernel '{}' ({}) is not allocated",
                            index,
                            edge,
                            node.name(),
                            kernel
                        )
                    })
                })
                .collect();
            let outputs: Vec<Address> = (0..node.output_count())
                .map(|index| {
                    addresses
                        .output(kernel, index)
                        .and_then(|addr| addr.address())
                        .unwrap_or_else(|| {
                            panic!(
                                "output {} of kernel '{}' ({}) has no static address",
                                index,
                                node.name(),
                                kernel
                            )
                        })
                })
                .collect();
            let workspaces = self
                .workspaces
                .get(kernel.0)
                .map(Vec::as_slice)
                .unwrap_or(&[]);

            trace!("launching '{}' ({}) from static plan", node.name(), kernel);
            if let Err(e) = node.kernel().launch(&inputs, workspaces, &outputs, stream) {
                error!("kernel '{}' ({}) failed to launch: {}", node.name(), kernel, e);
                return Err(ForgeError::KernelLaunchFailed {
                    kernel: node.name().to_string(),
                    reason: e.to_string(),
                });
            }
            launched += 1;
        }
        Ok(launched)
    }

    /// Unbind the outputs and parameters this plan placed, then free its block
    pub fn release(mut self, pool: &MemoryPool, graph: &mut KernelGraph) -> ForgeResult<()> {
        let addresses = graph.addresses_mut();
        for &(kernel, index) in &self.bound_outputs {
            if let Some(address) = addresses.output_mut(kernel, index) {
                address.unbind();
            }
        }
        for &param in &self.bound_parameters {
            if let Some(address) = addresses.get_mut(InputEdge::Parameter(param)) {
                address.unbind();
            }
        }
        self.bound_outputs.clear();
        self.bound_parameters.clear();
        self.release_block(pool)
    }

    /// Free the block without touching any graph
    pub fn release_block(&mut self, pool: &MemoryPool) -> ForgeResult<()> {
        match self.block.take() {
            Some(block) => pool.free(block),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, HostDevice, HostStream};
    use crate::graph::{DType, Format, GraphId, InputEdge, KernelNode};
    use crate::kernel::FnKernel;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn pool() -> MemoryPool {
        let device: Arc<dyn Device> = Arc::new(HostDevice::new(1 << 20));
        MemoryPool::reserve(device, 64 * 1024, 512).unwrap()
    }

    fn graph() -> KernelGraph {
        let mut graph = KernelGraph::new(GraphId(5));
        let a = graph.add_kernel(KernelNode::new(
            "A",
            Box::new(FnKernel::new(vec![100], vec![50, 0])),
        ));
        let b = graph.add_kernel(
            KernelNode::new("B", Box::new(FnKernel::new(vec![200], vec![])))
                .with_inputs(vec![InputEdge::output(a, 0)]),
        );
        graph.mark_output(InputEdge::output(b, 0));
        graph.init_output_addresses();
        graph
    }

    #[test]
    fn test_assign_binds_everything_in_one_block() {
        let pool = pool();
        let mut graph = graph();
        let plan = StaticPlan::assign(&pool, &mut graph).unwrap();

        assert_eq!(plan.total_bytes(), 1536);
        assert_eq!(pool.live_allocations(), 1);
        let block = plan.block().unwrap();
        let a_out = graph.addresses().output(KernelId(0), 0).unwrap();
        assert_eq!(a_out.ptr(), Some(block));
        let b_out = graph.addresses().output(KernelId(1), 0).unwrap();
        assert_eq!(b_out.ptr(), Some(block.offset(1024)));
        assert_eq!(plan.workspaces[0][0].unwrap().ptr, block.offset(512));
        assert!(plan.workspaces[0][1].is_none());
    }

    #[test]
    fn test_launch_uses_fixed_addresses() {
        let pool = pool();
        let seen = Arc::new(AtomicUsize::new(0));
        let recorder = Arc::clone(&seen);
        let mut graph = KernelGraph::new(GraphId(6));
        graph.add_kernel(KernelNode::new(
            "Recorder",
            Box::new(FnKernel::new(vec![64], vec![]).with_launch(move |_, _, outputs| {
                recorder.store(outputs[0].ptr.as_usize(), Ordering::SeqCst);
                Ok(())
            })),
        ));
        graph.init_output_addresses();
        let plan = StaticPlan::assign(&pool, &mut graph).unwrap();
        let stream = HostStream::new();

        for _ in 0..2 {
            assert_eq!(plan.launch(&graph, &stream).unwrap(), 1);
            assert_eq!(seen.load(Ordering::SeqCst), plan.block().unwrap().as_usize());
        }
        assert_eq!(pool.live_allocations(), 1);
    }

    #[test]
    fn test_release_unbinds_and_frees() {
        let pool = pool();
        let mut graph = graph();
        let plan = StaticPlan::assign(&pool, &mut graph).unwrap();
        plan.release(&pool, &mut graph).unwrap();
        assert_eq!(pool.live_allocations(), 0);
        assert!(graph.addresses().outputs().all(|addr| !addr.is_allocated()));
    }

    #[test]
    fn test_empty_graph_needs_no_block() {
        let pool = pool();
        let mut graph = KernelGraph::new(GraphId(7));
        let mut plan = StaticPlan::assign(&pool, &mut graph).unwrap();
        assert!(plan.block().is_none());
        plan.release_block(&pool).unwrap();
        assert_eq!(pool.stats().allocation_count, 0);
    }

    #[test]
    fn test_collective_parameter_moves_into_block() {
        let pool = pool();
        let mut graph = KernelGraph::new(GraphId(8));
        let x = graph.add_parameter(8, Format::Default, DType::F32);
        let b = graph.add_kernel(KernelNode::new("B", Box::new(FnKernel::new(vec![16], vec![]))));
        let g = graph.add_kernel(
            KernelNode::new("AllGather", Box::new(FnKernel::new(vec![24], vec![])))
                .with_inputs(vec![x, InputEdge::output(b, 0)]),
        );
        graph.mark_output(InputEdge::output(g, 0));
        graph.init_output_addresses();
        let param = graph.addresses_mut().get_mut(x).unwrap();
        pool.malloc_address(param, 8).unwrap();
        let old = param.ptr().unwrap();

        let plan = StaticPlan::assign(&pool, &mut graph).unwrap();

        let block = plan.block().unwrap();
        // The parameter gave its block back first, so the plan starts there.
        assert_eq!(block, old);
        assert_eq!(graph.addresses().get(x).unwrap().ptr(), Some(block));
        assert_eq!(graph.addresses().output(b, 0).unwrap().ptr(), Some(block.offset(8)));
        assert_eq!(pool.live_allocations(), 1);

        plan.release(&pool, &mut graph).unwrap();
        assert!(!graph.addresses().get(x).unwrap().is_allocated());
        assert_eq!(pool.live_allocations(), 0);
    }
}
