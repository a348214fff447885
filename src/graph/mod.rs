//! Kernel graphs as handed over by the graph compiler
//!
//! A [`KernelGraph`] is an ordered schedule of [`KernelNode`]s. Each node
//! reads its inputs through [`InputEdge`]s that point either at another
//! node's output slot or at a graph parameter. The topology is fixed once the
//! graph is built; only the device addresses behind the edges change while
//! the runtime executes it.
//!
//! Nodes and addresses live in separate tables so the runtime can hold a
//! kernel by shared reference while it binds and frees the buffers around it.

pub mod tensor;

use std::fmt;

use serde::Serialize;

use crate::kernel::{KernelMod, OpClass};
use crate::memory::DeviceAddress;

pub use tensor::{DType, Format, OutputDesc};

/// Identity of a compiled graph; keys per-graph runtime state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct GraphId(pub u32);

impl fmt::Display for GraphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a kernel node inside its graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KernelId(pub usize);

impl fmt::Display for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where a kernel input comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputEdge {
    /// Output slot `index` of kernel `producer`
    Output { producer: KernelId, index: usize },
    /// Graph parameter (external input or constant)
    Parameter(usize),
}

impl InputEdge {
    pub fn output(producer: KernelId, index: usize) -> Self {
        InputEdge::Output { producer, index }
    }
}

/// One scheduled operation
pub struct KernelNode {
    name: String,
    op_class: OpClass,
    kernel: Box<dyn KernelMod>,
    inputs: Vec<InputEdge>,
    output_descs: Vec<OutputDesc>,
}

impl fmt::Debug for KernelNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelNode")
            .field("name", &self.name)
            .field("op_class", &self.op_class)
            .field("inputs", &self.inputs)
            .field("outputs", &self.kernel.output_size_list())
            .field("workspaces", &self.kernel.workspace_size_list())
            .finish()
    }
}

impl KernelNode {
    /// Create a node; the op class is derived from `name`
    pub fn new(name: impl Into<String>, kernel: Box<dyn KernelMod>) -> Self {
        let name = name.into();
        Self {
            op_class: OpClass::from_op_name(&name),
            name,
            kernel,
            inputs: Vec::new(),
            output_descs: Vec::new(),
        }
    }

    pub fn with_inputs(mut self, inputs: Vec<InputEdge>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_op_class(mut self, op_class: OpClass) -> Self {
        self.op_class = op_class;
        self
    }

    /// Declare format/dtype per output slot; missing slots get the default
    pub fn with_output_descs(mut self, descs: Vec<OutputDesc>) -> Self {
        self.output_descs = descs;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn op_class(&self) -> OpClass {
        self.op_class
    }

    pub fn kernel(&self) -> &dyn KernelMod {
        self.kernel.as_ref()
    }

    pub fn inputs(&self) -> &[InputEdge] {
        &self.inputs
    }

    pub fn output_count(&self) -> usize {
        self.kernel.output_size_list().len()
    }

    pub fn output_desc(&self, index: usize) -> OutputDesc {
        self.output_descs.get(index).copied().unwrap_or_default()
    }
}

/// Device addresses of every kernel output and every parameter of a graph
#[derive(Debug, Default)]
pub struct AddressTable {
    outputs: Vec<Vec<DeviceAddress>>,
    parameters: Vec<DeviceAddress>,
}

impl AddressTable {
    /// Address behind an input edge, if it has been created
    pub fn get(&self, edge: InputEdge) -> Option<&DeviceAddress> {
        match edge {
            InputEdge::Output { producer, index } => self.output(producer, index),
            InputEdge::Parameter(index) => self.parameters.get(index),
        }
    }

    pub fn get_mut(&mut self, edge: InputEdge) -> Option<&mut DeviceAddress> {
        match edge {
            InputEdge::Output { producer, index } => self.output_mut(producer, index),
            InputEdge::Parameter(index) => self.parameters.get_mut(index),
        }
    }

    pub fn output(&self, kernel: KernelId, index: usize) -> Option<&DeviceAddress> {
        self.outputs.get(kernel.0).and_then(|slots| slots.get(index))
    }

    pub fn output_mut(&mut self, kernel: KernelId, index: usize) -> Option<&mut DeviceAddress> {
        self.outputs
            .get_mut(kernel.0)
            .and_then(|slots| slots.get_mut(index))
    }

    pub fn parameter(&self, index: usize) -> Option<&DeviceAddress> {
        self.parameters.get(index)
    }

    pub fn parameters(&self) -> impl Iterator<Item = &DeviceAddress> {
        self.parameters.iter()
    }

    pub fn parameters_mut(&mut self) -> impl Iterator<Item = &mut DeviceAddress> {
        self.parameters.iter_mut()
    }

    /// Every kernel output address that has been created so far
    pub fn outputs_mut(&mut self) -> impl Iterator<Item = &mut DeviceAddress> {
        self.outputs.iter_mut().flatten()
    }

    pub fn outputs(&self) -> impl Iterator<Item = &DeviceAddress> {
        self.outputs.iter().flatten()
    }
}

/// Scheduled kernel graph
#[derive(Debug)]
pub struct KernelGraph {
    id: GraphId,
    nodes: Vec<KernelNode>,
    execution_order: Vec<KernelId>,
    graph_outputs: Vec<InputEdge>,
    addresses: AddressTable,
}

impl KernelGraph {
    pub fn new(id: GraphId) -> Self {
        Self {
            id,
            nodes: Vec::new(),
            execution_order: Vec::new(),
            graph_outputs: Vec::new(),
            addresses: AddressTable::default(),
        }
    }

    pub fn id(&self) -> GraphId {
        self.id
    }

    /// Add a graph parameter of `size` bytes and return the edge reading it
    pub fn add_parameter(&mut self, size: usize, format: Format, dtype: DType) -> InputEdge {
        self.addresses
            .parameters
            .push(DeviceAddress::new(size, format, dtype));
        InputEdge::Parameter(self.addresses.parameters.len() - 1)
    }

    /// Append a node to the graph and to the execution order
    pub fn add_kernel(&mut self, node: KernelNode) -> KernelId {
        let id = KernelId(self.nodes.len());
        self.nodes.push(node);
        self.execution_order.push(id);
        id
    }

    /// Replace the execution order (must be a topological order of the nodes)
    pub fn set_execution_order(&mut self, order: Vec<KernelId>) {
        self.execution_order = order;
    }

    /// Mark a buffer as a graph output; its memory survives every run
    pub fn mark_output(&mut self, edge: InputEdge) {
        self.graph_outputs.push(edge);
    }

    pub fn execution_order(&self) -> &[KernelId] {
        &self.execution_order
    }

    pub fn graph_outputs(&self) -> &[InputEdge] {
        &self.graph_outputs
    }

    pub fn nodes(&self) -> &[KernelNode] {
        &self.nodes
    }

    pub fn node(&self, id: KernelId) -> &KernelNode {
        &self.nodes[id.0]
    }

    pub fn kernel_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn addresses(&self) -> &AddressTable {
        &self.addresses
    }

    pub fn addresses_mut(&mut self) -> &mut AddressTable {
        &mut self.addresses
    }

    /// Create an unallocated address for every declared output that has none.
    ///
    /// Sizes come from each kernel's output size list. Existing addresses
    /// (and their bindings) are left alone.
    pub fn init_output_addresses(&mut self) {
        self.addresses.outputs.resize_with(self.nodes.len(), Vec::new);
        for (node, slots) in self.nodes.iter().zip(self.addresses.outputs.iter_mut()) {
            let sizes = node.kernel.output_size_list();
            for (index, &size) in sizes.iter().enumerate().skip(slots.len()) {
                let desc = node.output_desc(index);
                slots.push(DeviceAddress::new(size, desc.format, desc.dtype));
            }
        }
    }

    /// Whether every declared output already has a device address
    pub fn has_output_addresses(&self) -> bool {
        self.addresses.outputs.len() == self.nodes.len()
            && self
                .nodes
                .iter()
                .zip(&self.addresses.outputs)
                .all(|(node, slots)| slots.len() == node.output_count())
    }

    /// Borrow the schedule and the nodes immutably and the addresses mutably
    pub fn split_mut(&mut self) -> (&[KernelId], &[KernelNode], &mut AddressTable) {
        (&self.execution_order, &self.nodes, &mut self.addresses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::FnKernel;

    fn kernel(outputs: Vec<usize>) -> Box<dyn KernelMod> {
        Box::new(FnKernel::new(outputs, vec![]))
    }

    #[test]
    fn test_build_chain() {
        let mut graph = KernelGraph::new(GraphId(1));
        let x = graph.add_parameter(64, Format::Default, DType::F32);
        let a = graph.add_kernel(KernelNode::new("Relu", kernel(vec![64])).with_inputs(vec![x]));
        let b = graph.add_kernel(
            KernelNode::new("Add", kernel(vec![64])).with_inputs(vec![InputEdge::output(a, 0), x]),
        );
        graph.mark_output(InputEdge::output(b, 0));

        assert_eq!(graph.execution_order(), &[a, b]);
        assert_eq!(graph.node(b).inputs().len(), 2);
        assert_eq!(graph.graph_outputs(), &[InputEdge::output(b, 0)]);
        assert_eq!(graph.addresses().parameter(0).unwrap().size(), 64);
    }

    #[test]
    fn test_init_output_addresses_is_incremental() {
        let mut graph = KernelGraph::new(GraphId(2));
        let a = graph.add_kernel(
            KernelNode::new("Split", kernel(vec![32, 16]))
                .with_output_descs(vec![OutputDesc::new(Format::Nhwc, DType::F16)]),
        );
        assert!(graph.addresses().output(a, 0).is_none());

        graph.init_output_addresses();
        let first = graph.addresses().output(a, 0).unwrap();
        assert_eq!(first.size(), 32);
        assert_eq!(first.format(), Format::Nhwc);
        assert_eq!(first.dtype(), DType::F16);
        let second = graph.addresses().output(a, 1).unwrap();
        assert_eq!(second.format(), Format::Default);

        graph
            .addresses_mut()
            .output_mut(a, 0)
            .unwrap()
            .bind(crate::device::DevicePtr(0x100), 32);
        graph.init_output_addresses();
        assert!(graph.addresses().output(a, 0).unwrap().is_allocated());
        assert_eq!(graph.addresses().outputs().count(), 2);
    }

    #[test]
    fn test_op_class_derived_from_name() {
        let node = KernelNode::new("AllReduce", kernel(vec![8]));
        assert!(node.op_class().is_communication());
        assert!(node.op_class().retains_inputs());

        let node = KernelNode::new("MatMul", kernel(vec![8]));
        assert!(!node.op_class().is_communication());
    }
}
