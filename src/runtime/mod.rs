//! Kernel runtime session
//!
//! [`KernelRuntime`] owns everything tied to one device session: the device
//! handle, the default stream, the memory pool and the per-graph memory
//! state. A graph goes through three steps:
//!
//! 1. `assign_memory`: create device addresses, bind parameters, and either
//!    build a reference-count table (dynamic mode) or a fixed layout
//!    (static mode)
//! 2. `run`, as often as needed
//! 3. `release_graph` once the graph is no longer needed
//!
//! The pool is an `Arc<MemoryPool>`. Runtimes built with
//! [`KernelRuntime::with_pool`] share one pool, which is how several graphs
//! execute concurrently against the same arena.

pub mod communication;
pub mod config;
pub mod dynamic;
pub mod static_plan;
pub mod stats;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, debug_span, error, info, warn};

use crate::device::{Device, DeviceStream};
use crate::error::{ForgeError, ForgeResult};
use crate::graph::{GraphId, KernelGraph};
use crate::memory::{MemoryCalculator, MemoryPool, MemoryRequirement};
use crate::reuse::RefCountTable;

pub use config::RuntimeConfig;
pub use static_plan::StaticPlan;
pub use stats::{MemoryMode, RunReport};

/// Memory state of one assigned graph
#[derive(Debug)]
enum GraphMemory {
    Dynamic(RefCountTable),
    Static(StaticPlan),
}

impl GraphMemory {
    fn mode(&self) -> MemoryMode {
        match self {
            GraphMemory::Dynamic(_) => MemoryMode::Dynamic,
            GraphMemory::Static(_) => MemoryMode::Static,
        }
    }

    /// Whether `graph` is the graph this state was built for, as far as
    /// its shape and addresses can tell
    fn fits(&self, graph: &KernelGraph) -> bool {
        let kernels = match self {
            GraphMemory::Dynamic(table) => table.kernel_count(),
            GraphMemory::Static(plan) => plan.kernel_count(),
        };
        kernels == graph.kernel_count() && graph.has_output_addresses()
    }
}

/// Device session that assigns memory to graphs and runs them
#[derive(Debug)]
pub struct KernelRuntime {
    device: Arc<dyn Device>,
    config: RuntimeConfig,
    pool: Option<Arc<MemoryPool>>,
    stream: Option<Arc<dyn DeviceStream>>,
    graphs: HashMap<GraphId, GraphMemory>,
}

impl KernelRuntime {
    /// Create a session; nothing touches the device until [`init_device`](Self::init_device)
    pub fn new(device: Arc<dyn Device>, config: RuntimeConfig) -> ForgeResult<Self> {
        config.validate()?;
        Ok(Self {
            device,
            config,
            pool: None,
            stream: None,
            graphs: HashMap::new(),
        })
    }

    /// Use an existing pool instead of reserving one during init
    pub fn with_pool(mut self, pool: Arc<MemoryPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn pool(&self) -> Option<&Arc<MemoryPool>> {
        self.pool.as_ref()
    }

    pub fn is_initialized(&self) -> bool {
        self.stream.is_some() && self.pool.is_some()
    }

    /// Select the device, fetch its default stream and reserve the pool.
    ///
    /// Calling it again on an initialized session does nothing.
    ///
    /// # Errors
    /// - `DeviceNotFound` when no device is visible
    /// - `DeviceInitFailed` when the device cannot be selected
    /// - `OutOfMemory` when the pool arena cannot be reserved
    pub fn init_device(&mut self) -> ForgeResult<()> {
        if self.is_initialized() {
            return Ok(());
        }

        let count = self.device.device_count();
        if count == 0 {
            return Err(ForgeError::DeviceNotFound);
        }
        self.device.set_device(self.config.device_id)?;
        let stream = self.device.default_stream()?;

        if self.pool.is_none() {
            let info = self.device.memory_info()?;
            let bytes = self.config.pool_bytes(info.free);
            let pool = MemoryPool::reserve(Arc::clone(&self.device), bytes, self.config.alignment)?;
            self.pool = Some(Arc::new(pool));
        }
        self.stream = Some(stream);

        info!(
            "initialized device {} of {} ({}), {} memory mode",
            self.config.device_id,
            count,
            self.device.name(),
            self.config.memory_mode()
        );
        Ok(())
    }

    fn session(&self) -> ForgeResult<(Arc<MemoryPool>, Arc<dyn DeviceStream>)> {
        match (&self.pool, &self.stream) {
            (Some(pool), Some(stream)) => Ok((Arc::clone(pool), Arc::clone(stream))),
            _ => Err(ForgeError::DeviceNotInitialized),
        }
    }

    /// Prepare `graph` for execution under the configured memory mode.
    ///
    /// Creates a device address for every kernel output and binds every graph
    /// parameter. Dynamic mode then builds the reference-count table; static
    /// mode places all outputs and workspaces in one block. A graph that is
    /// already assigned keeps its mode.
    ///
    /// Graph ids must be unique within a session.
    ///
    /// # Errors
    /// `GraphIdConflict` if another graph with the same id is assigned
    pub fn assign_memory(&mut self, graph: &mut KernelGraph) -> ForgeResult<MemoryMode> {
        let (pool, _) = self.session()?;
        if let Some(existing) = self.graphs.get(&graph.id()) {
            if !existing.fits(graph) {
                warn!("graph id {} is already taken by another graph", graph.id());
                return Err(ForgeError::GraphIdConflict(graph.id()));
            }
            debug!("graph {} already assigned ({})", graph.id(), existing.mode());
            return Ok(existing.mode());
        }

        graph.init_output_addresses();
        for param in graph.addresses_mut().parameters_mut() {
            if !param.is_allocated() {
                let size = param.size();
                pool.malloc_address(param, size)?;
            }
        }

        let memory = match self.config.memory_mode() {
            MemoryMode::Dynamic => GraphMemory::Dynamic(RefCountTable::build(graph)),
            MemoryMode::Static => GraphMemory::Static(StaticPlan::assign(&pool, graph)?),
        };
        let mode = memory.mode();
        info!(
            "assigned {} memory to graph {} ({} kernels)",
            mode,
            graph.id(),
            graph.execution_order().len()
        );
        self.graphs.insert(graph.id(), memory);
        Ok(mode)
    }

    /// Mode `graph_id` was assigned, if any
    pub fn memory_mode(&self, graph_id: GraphId) -> Option<MemoryMode> {
        self.graphs.get(&graph_id).map(GraphMemory::mode)
    }

    /// Reference counts of a dynamic-mode graph
    pub fn ref_counts(&self, graph_id: GraphId) -> Option<&RefCountTable> {
        match self.graphs.get(&graph_id) {
            Some(GraphMemory::Dynamic(table)) => Some(table),
            _ => None,
        }
    }

    /// Execute every kernel of `graph` once, then wait for the stream.
    ///
    /// # Errors
    /// - `GraphNotAssigned` if `assign_memory` was not called for the graph
    /// - `GraphIdConflict` if the id belongs to a different assigned graph
    /// - `OutOfMemory` if the pool runs dry mid-run
    /// - `KernelLaunchFailed` if a kernel rejects its launch; no later
    ///   kernel is launched
    /// - `DeviceSyncFailed` if the end-of-run barrier fails
    pub fn run(&mut self, graph: &mut KernelGraph) -> ForgeResult<RunReport> {
        let (pool, stream) = self.session()?;
        let graph_id = graph.id();
        let memory = self
            .graphs
            .get_mut(&graph_id)
            .ok_or(ForgeError::GraphNotAssigned(graph_id))?;
        if !memory.fits(graph) {
            return Err(ForgeError::GraphIdConflict(graph_id));
        }
        let mode = memory.mode();

        let _span = debug_span!("run", graph = %graph_id, mode = %mode).entered();
        let start = Instant::now();
        let kernels_launched = match memory {
            GraphMemory::Dynamic(table) => {
                dynamic::launch_kernel_dynamic(&pool, stream.as_ref(), graph, table)?
            }
            GraphMemory::Static(plan) => plan.launch(graph, stream.as_ref())?,
        };
        sync_stream(stream.as_ref())?;
        let elapsed_us = start.elapsed().as_micros() as u64;

        debug!(
            "graph {} ran {} kernels in {} us ({} mode)",
            graph_id, kernels_launched, elapsed_us, mode
        );
        Ok(RunReport {
            graph_id,
            mode,
            kernels_launched,
            elapsed_us,
            pool: pool.stats(),
        })
    }

    /// Block until the session stream is idle
    pub fn sync_stream(&self) -> ForgeResult<()> {
        let (_, stream) = self.session()?;
        sync_stream(stream.as_ref())
    }

    /// Memory `graph` needs under either strategy, computed without
    /// allocating anything
    pub fn required_memory(&self, graph: &KernelGraph) -> MemoryRequirement {
        let alignment = self
            .pool
            .as_ref()
            .map(|pool| pool.alignment())
            .unwrap_or(self.config.alignment);
        MemoryCalculator::with_alignment(alignment).requirement(graph)
    }

    /// Give back everything `graph` holds in the pool and forget its state.
    ///
    /// Unbinds outputs and parameters; the graph can be assigned again.
    ///
    /// # Errors
    /// `GraphIdConflict` if the id belongs to a different assigned graph
    pub fn release_graph(&mut self, graph: &mut KernelGraph) -> ForgeResult<()> {
        match self.graphs.get(&graph.id()) {
            None => return Ok(()),
            Some(memory) if !memory.fits(graph) => {
                return Err(ForgeError::GraphIdConflict(graph.id()))
            }
            Some(_) => {}
        }
        let Some(memory) = self.graphs.remove(&graph.id()) else {
            return Ok(());
        };
        let Some(pool) = self.pool.clone() else {
            return Err(ForgeError::DeviceNotInitialized);
        };

        if let GraphMemory::Static(plan) = memory {
            plan.release(&pool, graph)?;
        }
        let addresses = graph.addresses_mut();
        for address in addresses.outputs_mut() {
            pool.free_address(address)?;
        }
        for param in addresses.parameters_mut() {
            pool.free_address(param)?;
        }
        debug!("released graph {}", graph.id());
        Ok(())
    }

    /// Tear the session down.
    ///
    /// Frees the blocks of static plans, drops every reference-count table,
    /// the stream and this session's pool handle, then releases the device.
    /// Graphs not passed to [`release_graph`](Self::release_graph) first keep
    /// stale bindings and must not be run again.
    pub fn release_device_resources(&mut self) -> ForgeResult<()> {
        let mut result = Ok(());
        if let Some(pool) = self.pool.as_ref() {
            for (graph_id, memory) in self.graphs.iter_mut() {
                if let GraphMemory::Static(plan) = memory {
                    if let Err(e) = plan.release_block(pool) {
                        warn!("graph {}: failed to free static block: {}", graph_id, e);
                        if result.is_ok() {
                            result = Err(e);
                        }
                    }
                }
            }
        }
        let graphs = self.graphs.len();
        self.graphs.clear();
        self.stream = None;
        if let Some(pool) = self.pool.take() {
            info!("releasing device resources: {}", pool.stats());
        }
        self.device.release_device();
        info!("released device session ({} graphs)", graphs);
        result
    }
}

fn sync_stream(stream: &dyn DeviceStream) -> ForgeResult<()> {
    stream.synchronize().map_err(|e| {
        error!("stream synchronization failed: {}", e);
        match e {
            ForgeError::DeviceSyncFailed(_) => e,
            other => ForgeError::DeviceSyncFailed(other.to_string()),
        }
    })
}
