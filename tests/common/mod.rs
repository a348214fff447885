//! Common test utilities for runtime tests
//!
//! Every test runs against the simulated [`HostDevice`]. Kernels are
//! [`FnKernel`]s that record each launch into a shared [`LaunchLog`],
//! including a snapshot of the pool taken at launch time, so tests can check
//! what was live when a kernel ran.
//!
//! # Usage
//!
//! ```ignore
//! let harness = Harness::new(RuntimeConfig::new(), 64 * 1024);
//! let mut graph = KernelGraph::new(GraphId(0));
//! let a = harness.add(&mut graph, "A", &[512], &[], vec![]);
//! ```

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use graphforge::{
    Address, Device, GraphId, HostDevice, InputEdge, KernelGraph, KernelId, KernelNode,
    KernelRuntime, LaunchError, MemoryPool, RuntimeConfig,
};

/// One observed launch
#[derive(Debug, Clone)]
pub struct LaunchRecord {
    pub name: String,
    pub inputs: Vec<Address>,
    pub workspaces: Vec<Option<Address>>,
    pub outputs: Vec<Address>,
    /// Every non-empty input pointer was a live pool allocation
    pub inputs_live: bool,
    pub live_allocations: usize,
    pub in_use: usize,
}

pub type LaunchLog = Arc<Mutex<Vec<LaunchRecord>>>;

/// Host device, shared pool and an initialized runtime
pub struct Harness {
    pub host: Arc<HostDevice>,
    pub pool: Arc<MemoryPool>,
    pub runtime: KernelRuntime,
    pub log: LaunchLog,
}

impl Harness {
    /// Runtime over a fresh pool of `pool_bytes`
    pub fn new(config: RuntimeConfig, pool_bytes: usize) -> Self {
        let host = Arc::new(HostDevice::new(1 << 30));
        let device: Arc<dyn Device> = host.clone();
        let pool = Arc::new(
            MemoryPool::reserve(Arc::clone(&device), pool_bytes, config.alignment).unwrap(),
        );
        Self::with_pool(host, pool, config)
    }

    /// Runtime over an existing pool
    pub fn with_pool(host: Arc<HostDevice>, pool: Arc<MemoryPool>, config: RuntimeConfig) -> Self {
        let device: Arc<dyn Device> = host.clone();
        let mut runtime = KernelRuntime::new(device, config)
            .unwrap()
            .with_pool(Arc::clone(&pool));
        runtime.init_device().unwrap();
        Self {
            host,
            pool,
            runtime,
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Add a recording kernel
    pub fn add(
        &self,
        graph: &mut KernelGraph,
        name: &str,
        outputs: &[usize],
        workspaces: &[usize],
        inputs: Vec<InputEdge>,
    ) -> KernelId {
        let kernel = recording_kernel(&self.log, &self.pool, name, outputs, workspaces, None);
        graph.add_kernel(KernelNode::new(name, kernel).with_inputs(inputs))
    }

    /// Add a recording kernel whose launch fails
    pub fn add_failing(
        &self,
        graph: &mut KernelGraph,
        name: &str,
        outputs: &[usize],
        workspaces: &[usize],
        inputs: Vec<InputEdge>,
    ) -> KernelId {
        let kernel = recording_kernel(
            &self.log,
            &self.pool,
            name,
            outputs,
            workspaces,
            Some(LaunchError::DeviceFault("injected".to_string())),
        );
        graph.add_kernel(KernelNode::new(name, kernel).with_inputs(inputs))
    }

    pub fn launches(&self) -> Vec<LaunchRecord> {
        self.log.lock().unwrap().clone()
    }

    pub fn launch(&self, name: &str) -> LaunchRecord {
        self.launches()
            .into_iter()
            .rev()
            .find(|record| record.name == name)
            .unwrap_or_else(|| panic!("kernel {} never launched", name))
    }

    pub fn launched_names(&self) -> Vec<String> {
        self.launches().into_iter().map(|record| record.name).collect()
    }

    pub fn clear_log(&self) {
        self.log.lock().unwrap().clear();
    }
}

/// Kernel that records its launch and optionally fails
pub fn recording_kernel(
    log: &LaunchLog,
    pool: &Arc<MemoryPool>,
    name: &str,
    outputs: &[usize],
    workspaces: &[usize],
    failure: Option<LaunchError>,
) -> Box<graphforge::FnKernel> {
    let log = Arc::clone(log);
    let pool = Arc::clone(pool);
    let name = name.to_string();
    Box::new(
        graphforge::FnKernel::new(outputs.to_vec(), workspaces.to_vec()).with_launch(
            move |inputs, ws, outs| {
                let inputs_live = inputs
                    .iter()
                    .filter(|input| input.size > 0)
                    .all(|input| pool.is_live(input.ptr));
                let stats = pool.stats();
                log.lock().unwrap().push(LaunchRecord {
                    name: name.clone(),
                    inputs: inputs.to_vec(),
                    workspaces: ws.to_vec(),
                    outputs: outs.to_vec(),
                    inputs_live,
                    live_allocations: pool.live_allocations(),
                    in_use: stats.in_use,
                });
                match &failure {
                    Some(err) => Err(err.clone()),
                    None => Ok(()),
                }
            },
        ),
    )
}

/// A -> B -> C, each with one 512-byte output; C's output is the graph output
pub fn chain(harness: &Harness, id: u32) -> (KernelGraph, [KernelId; 3]) {
    let mut graph = KernelGraph::new(GraphId(id));
    let a = harness.add(&mut graph, "A", &[512], &[], vec![]);
    let b = harness.add(&mut graph, "B", &[512], &[], vec![InputEdge::output(a, 0)]);
    let c = harness.add(&mut graph, "C", &[512], &[], vec![InputEdge::output(b, 0)]);
    graph.mark_output(InputEdge::output(c, 0));
    (graph, [a, b, c])
}

/// Whether the output slot is bound after a run
pub fn is_bound(graph: &KernelGraph, kernel: KernelId, index: usize) -> bool {
    graph
        .addresses()
        .output(kernel, index)
        .map(|addr| addr.is_allocated())
        .unwrap_or(false)
}
