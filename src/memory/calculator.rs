//! Memory requirements calculator for kernel graphs
//!
//! Computes how much device memory a graph needs before anything is
//! allocated:
//! - the fixed layout used by static mode (one offset per output and
//!   workspace, packed groups for communication kernels)
//! - the peak footprint of a dynamic run, by replaying the reference-count
//!   protocol without touching a pool
//! - the bytes held by graph parameters
//!
//! Sizes are rounded the way [`MemoryPool`](super::MemoryPool) rounds them, so
//! the numbers match what the runtime will actually reserve.

use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::graph::{InputEdge, KernelGraph, KernelId};
use crate::memory::pool::{align_up, MemoryPool};
use crate::reuse::RefCountTable;

/// Memory needed to run a graph, in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryRequirement {
    /// Outputs and workspaces laid out for static mode
    pub static_bytes: usize,
    /// Peak pool usage of one dynamic run (upper bound, ignores fragmentation)
    pub dynamic_peak_bytes: usize,
    /// Graph parameters, needed in both modes
    pub parameter_bytes: usize,
}

impl MemoryRequirement {
    pub fn static_total(&self) -> usize {
        self.static_bytes + self.parameter_bytes
    }

    pub fn dynamic_total(&self) -> usize {
        self.dynamic_peak_bytes + self.parameter_bytes
    }
}

/// Fixed offsets for static mode, relative to one block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticLayout {
    /// Per kernel and output slot; `None` when the output is already bound
    pub outputs: Vec<Vec<Option<usize>>>,
    /// Per kernel and workspace slot; `None` for zero-sized slots
    pub workspaces: Vec<Vec<Option<usize>>>,
    /// Per parameter; `Some` only for parameters packed into the input
    /// group of a communication kernel
    pub parameters: Vec<Option<usize>>,
    pub total_bytes: usize,
}

impl StaticLayout {
    pub fn output_offset(&self, kernel: KernelId, index: usize) -> Option<usize> {
        self.outputs
            .get(kernel.0)
            .and_then(|slots| slots.get(index))
            .copied()
            .flatten()
    }

    pub fn workspace_offset(&self, kernel: KernelId, index: usize) -> Option<usize> {
        self.workspaces
            .get(kernel.0)
            .and_then(|slots| slots.get(index))
            .copied()
            .flatten()
    }

    pub fn parameter_offset(&self, index: usize) -> Option<usize> {
        self.parameters.get(index).copied().flatten()
    }
}

/// Calculate memory requirements of a graph
///
/// # Example
/// ```ignore
/// let calc = MemoryCalculator::with_alignment(512);
/// let req = calc.requirement(&graph);
/// println!("static {} MB, dynamic peak {} MB",
///     req.static_total() / 1024 / 1024,
///     req.dynamic_total() / 1024 / 1024);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct MemoryCalculator {
    alignment: usize,
}

impl MemoryCalculator {
    pub const DEFAULT_ALIGNMENT: usize = MemoryPool::DEFAULT_ALIGNMENT;

    pub fn new() -> Self {
        Self::with_alignment(Self::DEFAULT_ALIGNMENT)
    }

    /// Calculator matching a pool with `alignment` (a power of two)
    pub fn with_alignment(alignment: usize) -> Self {
        Self { alignment }
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Bytes one pool allocation of `size` costs. Zero-sized buffers cost nothing.
    pub fn charged_size(&self, size: usize) -> usize {
        if size == 0 {
            0
        } else {
            align_up(size, self.alignment)
        }
    }

    /// Everything at once
    ///
    /// Parameters the static layout packs into a communication group are
    /// counted with the layout, not in `parameter_bytes`.
    pub fn requirement(&self, graph: &KernelGraph) -> MemoryRequirement {
        let layout = self.static_layout(graph);
        let parameter_bytes = graph
            .addresses()
            .parameters()
            .enumerate()
            .filter(|(index, param)| !param.is_allocated() && layout.parameter_offset(*index).is_none())
            .map(|(_, param)| self.charged_size(param.size()))
            .sum();
        let requirement = MemoryRequirement {
            static_bytes: layout.total_bytes,
            dynamic_peak_bytes: self.dynamic_peak(graph),
            parameter_bytes,
        };
        debug!(
            "graph {} needs {} bytes static, {} bytes dynamic peak, {} bytes of parameters",
            graph.id(),
            requirement.static_bytes,
            requirement.dynamic_peak_bytes,
            requirement.parameter_bytes
        );
        requirement
    }

    /// Bytes needed to bind every parameter that is not bound yet
    pub fn parameter_bytes(&self, graph: &KernelGraph) -> usize {
        graph
            .addresses()
            .parameters()
            .filter(|param| !param.is_allocated())
            .map(|param| self.charged_size(param.size()))
            .sum()
    }

    /// Lay out every unbound output and every workspace of the scheduled
    /// kernels in one block.
    ///
    /// Output groups of communication kernels are packed without padding
    /// between members, and so are their input groups when no member has been
    /// claimed by another group. Parameters in such an input group are placed
    /// in the block too, whether they are bound or not; the caller moves them.
    pub fn static_layout(&self, graph: &KernelGraph) -> StaticLayout {
        let nodes = graph.nodes();
        let mut layout = StaticLayout {
            outputs: nodes
                .iter()
                .map(|node| vec![None; node.output_count()])
                .collect(),
            workspaces: nodes
                .iter()
                .map(|node| vec![None; node.kernel().workspace_size_list().len()])
                .collect(),
            parameters: vec![None; graph.addresses().parameters().count()],
            total_bytes: 0,
        };
        let needs_placement = |kernel: KernelId, index: usize| {
            !graph
                .addresses()
                .output(kernel, index)
                .map(|addr| addr.is_allocated())
                .unwrap_or(false)
        };

        let mut cursor = 0usize;
        for &kernel in graph.execution_order() {
            let node = graph.node(kernel);
            if !node.op_class().is_communication() {
                continue;
            }

            let mut members: Vec<InputEdge> = Vec::with_capacity(node.inputs().len());
            for &edge in node.inputs() {
                if !members.contains(&edge) {
                    members.push(edge);
                }
            }
            let packable = members.iter().all(|&edge| match edge {
                InputEdge::Output { producer, index } => {
                    layout.outputs[producer.0][index].is_none() && needs_placement(producer, index)
                }
                InputEdge::Parameter(param) => {
                    layout.parameters.get(param).map_or(false, Option::is_none)
                }
            });
            if packable {
                cursor = self.pack_group(&mut layout, &members, graph, cursor);
            } else {
                warn!(
                    "static layout: inputs of communication kernel '{}' cannot be packed",
                    node.name()
                );
            }

            let outputs: Vec<InputEdge> = (0..node.output_count())
                .filter(|&index| needs_placement(kernel, index))
                .map(|index| InputEdge::output(kernel, index))
                .collect();
            cursor = self.pack_group(&mut layout, &outputs, graph, cursor);
        }

        for &kernel in graph.execution_order() {
            let node = graph.node(kernel);
            for (index, &size) in node.kernel().output_size_list().iter().enumerate() {
                if layout.outputs[kernel.0][index].is_some() || !needs_placement(kernel, index) {
                    continue;
                }
                layout.outputs[kernel.0][index] = Some(cursor);
                cursor += self.charged_size(size);
            }
            for (index, &size) in node.kernel().workspace_size_list().iter().enumerate() {
                if size == 0 {
                    continue;
                }
                layout.workspaces[kernel.0][index] = Some(cursor);
                cursor += self.charged_size(size);
            }
        }

        layout.total_bytes = cursor;
        layout
    }

    fn pack_group(
        &self,
        layout: &mut StaticLayout,
        members: &[InputEdge],
        graph: &KernelGraph,
        start: usize,
    ) -> usize {
        let mut offset = start;
        for &edge in members {
            let slot = match edge {
                InputEdge::Output { producer, index } => &mut layout.outputs[producer.0][index],
                InputEdge::Parameter(param) => &mut layout.parameters[param],
            };
            if slot.is_some() {
                continue;
            }
            *slot = Some(offset);
            offset += buffer_size(graph, edge);
        }
        start + self.charged_size(offset - start)
    }

    /// Peak pool usage of a dynamic run on a graph with nothing bound yet.
    ///
    /// Communication groups are charged up front, like the runtime does, and
    /// each member is rounded on its own, which over-estimates packed groups.
    pub fn dynamic_peak(&self, graph: &KernelGraph) -> usize {
        let mut table = RefCountTable::build(graph);
        let mut live: HashMap<InputEdge, usize> = HashMap::new();
        let mut current = 0usize;
        let mut peak = 0usize;

        let charge = |live: &mut HashMap<InputEdge, usize>, current: &mut usize, edge: InputEdge| {
            if !live.contains_key(&edge) {
                let bytes = self.charged_size(buffer_size(graph, edge));
                live.insert(edge, bytes);
                *current += bytes;
            }
        };

        // Parameter members move into the group and stay there.
        for &kernel in graph.execution_order() {
            let node = graph.node(kernel);
            if !node.op_class().is_communication() {
                continue;
            }
            for &edge in node.inputs() {
                charge(&mut live, &mut current, edge);
            }
            for index in 0..node.output_count() {
                charge(&mut live, &mut current, InputEdge::output(kernel, index));
            }
        }
        peak = peak.max(current);

        for &kernel in graph.execution_order() {
            let node = graph.node(kernel);
            for index in 0..node.output_count() {
                charge(&mut live, &mut current, InputEdge::output(kernel, index));
            }
            let workspace: usize = node
                .kernel()
                .workspace_size_list()
                .iter()
                .map(|&size| self.charged_size(size))
                .sum();
            peak = peak.max(current + workspace);

            if !node.op_class().retains_inputs() {
                for (input_index, &edge) in node.inputs().iter().enumerate() {
                    if table.consume_input(kernel, input_index) {
                        if let Some(bytes) = live.remove(&edge) {
                            current -= bytes;
                        }
                    }
                }
            }
            for index in 0..node.output_count() {
                if table.output_unused(kernel, index) {
                    if let Some(bytes) = live.remove(&InputEdge::output(kernel, index)) {
                        current -= bytes;
                    }
                }
            }
        }

        peak
    }
}

/// Declared size of the buffer behind `edge`
fn buffer_size(graph: &KernelGraph, edge: InputEdge) -> usize {
    match edge {
        InputEdge::Output { producer, index } => graph
            .node(producer)
            .kernel()
            .output_size_list()
            .get(index)
            .copied()
            .unwrap_or(0),
        InputEdge::Parameter(param) => graph
            .addresses()
            .parameter(param)
            .map(|addr| addr.size())
            .unwrap_or(0),
    }
}

impl Default for MemoryCalculator {
    fn default() -> Self {
        Self::new()
    }
}
