//! Reference counting for buffer reuse
//!
//! Every kernel output carries a static use count (how many input edges read
//! it) and a dynamic count that the executor decrements as consumers finish.
//! When the dynamic count hits zero the buffer is dead for the rest of the
//! run and its memory goes back to the pool.
//!
//! Buffers that must outlive the run (graph outputs, and inputs of collectives
//! that keep their inputs alive) carry [`MAX_REF_COUNT`] and are never
//! decremented.

use tracing::trace;

use crate::graph::{InputEdge, KernelGraph, KernelId};

/// Count marking a buffer that is never freed during a run
pub const MAX_REF_COUNT: usize = usize::MAX;

/// Use counts of one kernel output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefCount {
    pub static_count: usize,
    pub dynamic_count: usize,
}

impl RefCount {
    fn new(static_count: usize) -> Self {
        Self {
            static_count,
            dynamic_count: static_count,
        }
    }

    pub fn is_pinned(&self) -> bool {
        self.static_count == MAX_REF_COUNT
    }

    fn pin(&mut self) {
        *self = RefCount::new(MAX_REF_COUNT);
    }
}

/// Per-graph reference counts
#[derive(Debug, Clone)]
pub struct RefCountTable {
    /// Indexed by kernel, then output slot
    outputs: Vec<Vec<RefCount>>,
    /// Producer slot read by each input edge; `None` for parameters
    inputs: Vec<Vec<Option<(KernelId, usize)>>>,
}

impl RefCountTable {
    /// Count the edges of every kernel in the execution order.
    ///
    /// Kernels outside the execution order contribute no uses.
    pub fn build(graph: &KernelGraph) -> Self {
        let nodes = graph.nodes();
        let mut outputs: Vec<Vec<RefCount>> = nodes
            .iter()
            .map(|node| vec![RefCount::new(0); node.output_count()])
            .collect();
        let inputs: Vec<Vec<Option<(KernelId, usize)>>> = nodes
            .iter()
            .map(|node| {
                node.inputs()
                    .iter()
                    .map(|edge| match *edge {
                        InputEdge::Output { producer, index } => Some((producer, index)),
                        InputEdge::Parameter(_) => None,
                    })
                    .collect()
            })
            .collect();

        for &kernel in graph.execution_order() {
            for (producer, index) in inputs[kernel.0].iter().flatten() {
                if let Some(count) = outputs[producer.0].get_mut(*index) {
                    count.static_count += 1;
                    count.dynamic_count += 1;
                }
            }
        }

        let mut pinned = Vec::new();
        for edge in graph.graph_outputs() {
            if let InputEdge::Output { producer, index } = *edge {
                pinned.push((producer, index));
            }
        }
        for &kernel in graph.execution_order() {
            if graph.node(kernel).op_class().retains_inputs() {
                pinned.extend(inputs[kernel.0].iter().flatten().copied());
            }
        }
        for (producer, index) in pinned {
            if let Some(count) = outputs[producer.0].get_mut(index) {
                count.pin();
            }
        }

        trace!(
            "built ref-count table for graph {}: {} kernels",
            graph.id(),
            outputs.len()
        );
        Self { outputs, inputs }
    }

    /// Count of the buffer read by input `input_index` of `kernel`.
    ///
    /// `None` for parameter inputs, which are not reference counted.
    pub fn input_ref(&self, kernel: KernelId, input_index: usize) -> Option<RefCount> {
        let (producer, index) = self.producer_of(kernel, input_index)?;
        self.output_ref(producer, index)
    }

    pub fn input_ref_mut(&mut self, kernel: KernelId, input_index: usize) -> Option<&mut RefCount> {
        let (producer, index) = self.producer_of(kernel, input_index)?;
        self.output_ref_mut(producer, index)
    }

    pub fn output_ref(&self, kernel: KernelId, output_index: usize) -> Option<RefCount> {
        self.outputs
            .get(kernel.0)
            .and_then(|slots| slots.get(output_index))
            .copied()
    }

    pub fn output_ref_mut(&mut self, kernel: KernelId, output_index: usize) -> Option<&mut RefCount> {
        self.outputs
            .get_mut(kernel.0)
            .and_then(|slots| slots.get_mut(output_index))
    }

    fn producer_of(&self, kernel: KernelId, input_index: usize) -> Option<(KernelId, usize)> {
        self.inputs
            .get(kernel.0)
            .and_then(|edges| edges.get(input_index))
            .copied()
            .flatten()
    }

    /// Record that `kernel` has finished reading input `input_index`.
    ///
    /// Returns true when that was the last use: the caller must free the
    /// buffer. The dynamic count is already back at its static value.
    pub fn consume_input(&mut self, kernel: KernelId, input_index: usize) -> bool {
        let Some(count) = self.input_ref_mut(kernel, input_index) else {
            return false;
        };
        if count.is_pinned() {
            return false;
        }
        if count.dynamic_count == 0 {
            panic!(
                "reference count underflow on input {} of kernel {}",
                input_index, kernel
            );
        }
        count.dynamic_count -= 1;
        if count.dynamic_count == 0 {
            count.dynamic_count = count.static_count;
            return true;
        }
        false
    }

    /// True when output `output_index` of `kernel` has no consumer at all
    pub fn output_unused(&self, kernel: KernelId, output_index: usize) -> bool {
        self.output_ref(kernel, output_index)
            .map(|count| count.dynamic_count == 0)
            .unwrap_or(false)
    }

    /// Restore every dynamic count to its static value
    pub fn reset(&mut self) {
        for count in self.outputs.iter_mut().flatten() {
            count.dynamic_count = count.static_count;
        }
    }

    /// Number of kernels the table was built for
    pub fn kernel_count(&self) -> usize {
        self.outputs.len()
    }

    /// Whether every dynamic count equals its static count
    pub fn all_reset(&self) -> bool {
        self.outputs
            .iter()
            .flatten()
            .all(|count| count.dynamic_count == count.static_count)
    }
}
