//! Backend device abstraction
//!
//! A [`Device`] prepares models; a [`PreparedModel`] executes them, either
//! blocking or fenced. The runtime never inspects what a backend does with
//! a step beyond the observable contract: a wire-level status, an
//! output-shape vector obeying the rules checked in
//! `execution::step_executor`, and timing in microseconds with `u64::MAX`
//! meaning "unknown".

pub mod cpu;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{ExecStatus, ForgeResult};
use crate::execution::binding::ArgumentBinding;
use crate::fence::SyncFence;
use crate::memory::RuntimeMemory;
use crate::model::Model;
use crate::operand::Dimensions;

pub use cpu::{cpu_device, CpuDevice};

/// Step timing in microseconds; `u64::MAX` means unknown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub time_on_device: u64,
    pub time_in_driver: u64,
}

impl Timing {
    pub const UNKNOWN: Timing = Timing {
        time_on_device: u64::MAX,
        time_in_driver: u64::MAX,
    };

    pub fn measured(micros: u64) -> Self {
        Timing {
            time_on_device: micros,
            time_in_driver: micros,
        }
    }
}

impl Default for Timing {
    fn default() -> Self {
        Timing::UNKNOWN
    }
}

/// Shape reported by a backend for one step output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputShape {
    pub dimensions: Dimensions,
    pub is_sufficient: bool,
}

impl OutputShape {
    pub fn sufficient(dimensions: Dimensions) -> Self {
        OutputShape {
            dimensions,
            is_sufficient: true,
        }
    }

    pub fn insufficient(dimensions: Dimensions) -> Self {
        OutputShape {
            dimensions,
            is_sufficient: false,
        }
    }
}

/// Result of a blocking step execution
pub type ComputeResult = (ExecStatus, Vec<OutputShape>, Timing);

/// Result of a fenced step execution: status, completion fence (absent when
/// the step completed synchronously), and the callback that reports fenced
/// timing once the fence signals
pub type FencedComputeResult = (
    ExecStatus,
    Option<SyncFence>,
    Option<Arc<dyn FencedComputeCallback>>,
    Timing,
);

/// Post-completion information for a fenced step
pub trait FencedComputeCallback: Send + Sync + fmt::Debug {
    /// `(status, timing_launched, timing_fenced)` for the completed step
    fn execution_info(&self) -> (ExecStatus, Timing, Timing);
}

/// Reusable fast-path resources for repeated executions of one step
///
/// Backends are free to ignore it; the CPU reference backend does.
#[derive(Debug)]
pub struct BurstController {
    step_index: usize,
}

impl BurstController {
    pub fn new(step_index: usize) -> Self {
        BurstController { step_index }
    }

    pub fn step_index(&self) -> usize {
        self.step_index
    }
}

/// Per-compilation holder of burst controllers, one per step on demand
#[derive(Debug, Default)]
pub struct BurstBuilder {
    controllers: Mutex<HashMap<usize, Arc<BurstController>>>,
}

impl BurstBuilder {
    pub fn new() -> Self {
        BurstBuilder::default()
    }

    pub fn controller_for_step(&self, step_index: usize) -> Arc<BurstController> {
        let mut controllers = self.controllers.lock().expect("burst lock poisoned");
        Arc::clone(
            controllers
                .entry(step_index)
                .or_insert_with(|| Arc::new(BurstController::new(step_index))),
        )
    }
}

/// An execution backend
pub trait Device: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// True only for the CPU reference backend
    fn is_cpu(&self) -> bool {
        false
    }

    /// Compile a (step) model for this device
    fn prepare_model(&self, model: &Arc<Model>) -> ForgeResult<Arc<dyn PreparedModel>>;
}

/// A model compiled for one device, ready to execute
pub trait PreparedModel: Send + Sync + fmt::Debug {
    /// Execute one step, blocking until it completes
    ///
    /// The output-shape vector must obey the contract enforced by the step
    /// executor: empty or complete on success, complete with at least one
    /// insufficient entry on `InsufficientSize`, empty on any other status.
    #[allow(clippy::too_many_arguments)]
    fn execute(
        &self,
        inputs: &[ArgumentBinding],
        outputs: &[ArgumentBinding],
        memories: &[Arc<RuntimeMemory>],
        burst: Option<&BurstController>,
        measure: bool,
        deadline: Option<Instant>,
        loop_timeout: Option<Duration>,
    ) -> ComputeResult;

    /// Submit one step, returning a completion fence instead of blocking
    ///
    /// `wait_for` fences gate the step's start. A backend that completes
    /// the work synchronously returns no fence and no callback.
    #[allow(clippy::too_many_arguments)]
    fn execute_fenced(
        &self,
        inputs: &[ArgumentBinding],
        outputs: &[ArgumentBinding],
        memories: &[Arc<RuntimeMemory>],
        wait_for: &[SyncFence],
        measure: bool,
        deadline: Option<Instant>,
        loop_timeout: Option<Duration>,
        timeout_after_fence: Option<Duration>,
    ) -> FencedComputeResult;
}
