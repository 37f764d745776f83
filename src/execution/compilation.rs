//! Compilation handle: the bridge between the compiler's output and
//! executions
//!
//! The compiler and partitioner live outside this crate; what reaches the
//! runtime is a [`Compilation`] wrapping the finished plan plus the few
//! compilation-scoped facts executions need: whether the client pinned an
//! explicit device list (timing and timeouts require exactly one explicit
//! device), and whether partitioning was done with CPU fallback allowed.

use std::sync::Arc;

use crate::model::Model;
use crate::plan::ExecutionPlan;

/// How the compiler partitioned the model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partitioning {
    /// Step failures surface to the client unchanged
    WithoutFallback,
    /// Step failures may be retried on the CPU backend
    WithFallback,
}

impl Partitioning {
    pub fn allows_fallback(self) -> bool {
        self == Partitioning::WithFallback
    }
}

/// A compiled model ready to spawn executions
#[derive(Debug, Clone)]
pub struct Compilation {
    pub(crate) plan: Arc<ExecutionPlan>,
    pub(crate) main_model: Arc<Model>,
    pub(crate) explicit_device_list: bool,
    pub(crate) device_count: usize,
    pub(crate) partitioning: Partitioning,
    pub(crate) sync_exec_runtime: bool,
}

impl Compilation {
    pub fn new(plan: Arc<ExecutionPlan>, main_model: Arc<Model>) -> Self {
        Compilation {
            plan,
            main_model,
            explicit_device_list: false,
            device_count: 0,
            partitioning: Partitioning::WithFallback,
            sync_exec_runtime: false,
        }
    }

    /// Record that the client compiled for an explicit device list
    pub fn with_explicit_devices(mut self, device_count: usize) -> Self {
        self.explicit_device_list = true;
        self.device_count = device_count;
        self
    }

    pub fn with_partitioning(mut self, partitioning: Partitioning) -> Self {
        self.partitioning = partitioning;
        self
    }

    /// Run asynchronous executions inline on the caller thread
    pub fn with_sync_exec_runtime(mut self, sync_exec: bool) -> Self {
        self.sync_exec_runtime = sync_exec;
        self
    }

    pub fn plan(&self) -> &Arc<ExecutionPlan> {
        &self.plan
    }

    pub fn main_model(&self) -> &Arc<Model> {
        &self.main_model
    }

    /// True when timing and timeout APIs are available on executions
    pub fn single_explicit_device(&self) -> bool {
        self.explicit_device_list && self.device_count == 1
    }

    pub fn allows_cpu_fallback(&self) -> bool {
        self.partitioning.allows_fallback()
    }
}
