//! Contiguous memory for communication kernels
//!
//! Collectives read all of their inputs from one region and write all of
//! their outputs to another. Before the first launch of a run, every
//! communication kernel gets one packed block per group. Members that are
//! already bound somewhere else are released first, so a group is never
//! half in and half out of its block.

use tracing::{debug, trace, warn};

use crate::error::ForgeResult;
use crate::graph::{AddressTable, InputEdge, KernelGraph, KernelId};
use crate::memory::MemoryPool;

/// Give every communication kernel in `graph` a contiguous input region and
/// a contiguous output region.
pub(crate) fn alloc_communication_op_dynamic_res(
    pool: &MemoryPool,
    graph: &mut KernelGraph,
) -> ForgeResult<()> {
    let (order, nodes, addresses) = graph.split_mut();
    for &kernel in order {
        let node = &nodes[kernel.0];
        if !node.op_class().is_communication() {
            continue;
        }

        let mut inputs: Vec<InputEdge> = Vec::with_capacity(node.inputs().len());
        for &edge in node.inputs() {
            if inputs.contains(&edge) {
                warn!(
                    "communication kernel '{}' reads {:?} more than once, packing it once",
                    node.name(),
                    edge
                );
                continue;
            }
            inputs.push(edge);
        }
        alloc_group(pool, addresses, &inputs, kernel, node.name(), "input")?;

        let outputs: Vec<InputEdge> = (0..node.output_count())
            .map(|index| InputEdge::output(kernel, index))
            .collect();
        alloc_group(pool, addresses, &outputs, kernel, node.name(), "output")?;
    }
    Ok(())
}

fn alloc_group(
    pool: &MemoryPool,
    addresses: &mut AddressTable,
    members: &[InputEdge],
    kernel: KernelId,
    name: &str,
    group: &str,
) -> ForgeResult<()> {
    let mut need_alloc = false;
    let mut need_free = false;
    let mut sizes = Vec::with_capacity(members.len());
    for &edge in members {
        let Some(address) = addresses.get(edge) else {
            panic!(
                "{} {:?} of communication kernel '{}' ({}) has no device address",
                group, edge, name, kernel
            );
        };
        if address.is_allocated() {
            need_free = true;
        } else {
            need_alloc = true;
        }
        sizes.push(address.size());
    }

    if !need_alloc {
        return Ok(());
    }

    if need_free {
        for &edge in members {
            if let Some(address) = addresses.get_mut(edge) {
                if address.is_allocated() {
                    debug!(
                        "releasing stale {} {:?} of '{}' before packing its group",
                        group, edge, name
                    );
                    pool.free_address(address)?;
                }
            }
        }
    }

    let total: usize = sizes.iter().sum();
    let ptrs = if total == 0 {
        vec![pool.base(); sizes.len()]
    } else {
        pool.allocate_contiguous(&sizes)?
    };
    for ((&edge, &size), ptr) in members.iter().zip(&sizes).zip(ptrs) {
        if let Some(address) = addresses.get_mut(edge) {
            address.bind(ptr, size);
        }
    }

    trace!(
        "packed {} {} buffers ({} bytes) for '{}'",
        members.len(),
        group,
        total,
        name
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, HostDevice};
    use crate::graph::{DType, Format, GraphId, KernelNode};
    use crate::kernel::FnKernel;
    use std::sync::Arc;

    fn pool() -> MemoryPool {
        let device: Arc<dyn Device> = Arc::new(HostDevice::new(1 << 20));
        MemoryPool::reserve(device, 64 * 1024, 512).unwrap()
    }

    fn node(name: &str, outputs: Vec<usize>, inputs: Vec<InputEdge>) -> KernelNode {
        KernelNode::new(name, Box::new(FnKernel::new(outputs, vec![]))).with_inputs(inputs)
    }

    fn gather_graph() -> (KernelGraph, [KernelId; 4]) {
        let mut graph = KernelGraph::new(GraphId(0));
        let a = graph.add_kernel(node("A", vec![8], vec![]));
        let b = graph.add_kernel(node("B", vec![16], vec![]));
        let c = graph.add_kernel(node("C", vec![24], vec![]));
        let g = graph.add_kernel(node(
            "AllGather",
            vec![48],
            vec![
                InputEdge::output(a, 0),
                InputEdge::output(b, 0),
                InputEdge::output(c, 0),
            ],
        ));
        graph.init_output_addresses();
        (graph, [a, b, c, g])
    }

    #[test]
    fn test_inputs_packed_back_to_back() {
        let pool = pool();
        let (mut graph, [a, b, c, g]) = gather_graph();
        alloc_communication_op_dynamic_res(&pool, &mut graph).unwrap();

        let addrs = graph.addresses();
        let p0 = addrs.output(a, 0).unwrap().ptr().unwrap();
        let p1 = addrs.output(b, 0).unwrap().ptr().unwrap();
        let p2 = addrs.output(c, 0).unwrap().ptr().unwrap();
        assert_eq!(p1, p0.offset(8));
        assert_eq!(p2, p1.offset(16));
        assert!(addrs.output(g, 0).unwrap().is_allocated());
        assert_eq!(pool.live_allocations(), 4);
    }

    #[test]
    fn test_fully_bound_group_is_left_alone() {
        let pool = pool();
        let (mut graph, [a, ..]) = gather_graph();
        alloc_communication_op_dynamic_res(&pool, &mut graph).unwrap();
        let before = graph.addresses().output(a, 0).unwrap().ptr();
        let allocs = pool.stats().allocation_count;

        alloc_communication_op_dynamic_res(&pool, &mut graph).unwrap();
        assert_eq!(graph.addresses().output(a, 0).unwrap().ptr(), before);
        assert_eq!(pool.stats().allocation_count, allocs);
    }

    #[test]
    fn test_partially_bound_group_is_repacked() {
        let pool = pool();
        let (mut graph, [a, b, c, _]) = gather_graph();
        let stale = {
            let addr = graph.addresses_mut().output_mut(b, 0).unwrap();
            pool.malloc_address(addr, 16).unwrap();
            addr.ptr().unwrap()
        };

        alloc_communication_op_dynamic_res(&pool, &mut graph).unwrap();
        let addrs = graph.addresses();
        let p0 = addrs.output(a, 0).unwrap().ptr().unwrap();
        // The stale block was returned first, so best fit hands it back.
        assert_eq!(p0, stale);
        assert_eq!(addrs.output(b, 0).unwrap().ptr(), Some(p0.offset(8)));
        assert_eq!(addrs.output(c, 0).unwrap().ptr(), Some(p0.offset(24)));
        assert_eq!(pool.stats().free_count, 1);
    }

    #[test]
    fn test_duplicate_input_packed_once() {
        let pool = pool();
        let mut graph = KernelGraph::new(GraphId(1));
        let a = graph.add_kernel(node("A", vec![32], vec![]));
        graph.add_kernel(node(
            "AllGather",
            vec![64],
            vec![InputEdge::output(a, 0), InputEdge::output(a, 0)],
        ));
        graph.init_output_addresses();
        alloc_communication_op_dynamic_res(&pool, &mut graph).unwrap();
        // One input member, one output member.
        assert_eq!(pool.live_allocations(), 2);
    }

    #[test]
    fn test_zero_sized_group_skips_pool() {
        let pool = pool();
        let mut graph = KernelGraph::new(GraphId(2));
        let x = graph.add_parameter(0, Format::Default, DType::F32);
        graph.add_kernel(node("Broadcast", vec![0], vec![x]));
        graph.init_output_addresses();
        alloc_communication_op_dynamic_res(&pool, &mut graph).unwrap();
        assert!(graph.addresses().parameter(0).unwrap().is_allocated());
        assert_eq!(pool.live_allocations(), 0);
    }
}
