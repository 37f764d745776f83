//! The execution state machine
//!
//! An [`ExecutionBuilder`] binds a compilation to inputs and outputs,
//! ignites exactly once (blocking, asynchronous, burst, or fenced), and
//! drives the plan step by step: shapes propagate between steps,
//! insufficient-size reports grow dynamic temporaries and retry, and
//! failed accelerator steps are re-run on the CPU backend when the
//! compilation allows it. A missed deadline is terminal either way.
//!
//! Completion travels through exactly one of two channels: the non-fenced
//! finish (which records a [`Completion`] and updates memory validators)
//! or a sync fence whose state is probed lazily.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::device::{
    cpu_device, BurstBuilder, ComputeResult, FencedComputeCallback, OutputShape, Timing,
};
use crate::error::{Completion, ExecStatus, ForgeResult, StepForgeError};
use crate::execution::binding::{ArgumentBinding, BindingState};
use crate::execution::callback::ExecutionCallback;
use crate::execution::compilation::Compilation;
use crate::execution::step_executor::{
    validate_output_shapes_from_backend, StepExecutor, UpdateOutputShapes,
};
use crate::execution::{DriveContext, LOOP_TIMEOUT_DEFAULT, LOOP_TIMEOUT_MAXIMUM};
use crate::fence::{FenceState, SyncFence};
use crate::memory::{IoRole, MemoryMetadata, MemoryTracker, RuntimeMemory};
use crate::model::Model;
use crate::operand::{check_dimension_info, is_updatable, size_of_data, Dimensions, OperandSpec};
use crate::plan::{Controller, ExecutionPlan};

/// Which measured duration `get_duration` reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurationKind {
    OnHardware,
    InDriver,
    FencedOnHardware,
    FencedInDriver,
}

#[derive(Debug)]
struct ExecutionState {
    inputs: Vec<ArgumentBinding>,
    outputs: Vec<ArgumentBinding>,
    memories: MemoryTracker,
    measure_timing: bool,
    timeout: Option<Duration>,
    loop_timeout: Option<Duration>,
    started: bool,
    finished_without_fence: bool,
    completion: Completion,
    timing: Timing,
    sync_fence: Option<SyncFence>,
    fenced_callback: Option<Arc<dyn FencedComputeCallback>>,
}

struct BuilderInner {
    plan: Arc<ExecutionPlan>,
    model: Arc<Model>,
    allow_cpu_fallback: bool,
    single_explicit_device: bool,
    sync_exec_runtime: bool,
    state: Mutex<ExecutionState>,
}

/// One execution of a compiled model
///
/// Cheap to clone; clones share the execution's state. Configuration
/// methods fail with `BadState` once the execution has started.
#[derive(Clone)]
pub struct ExecutionBuilder {
    inner: Arc<BuilderInner>,
}

impl ExecutionBuilder {
    pub fn new(compilation: &Compilation) -> Self {
        let model = Arc::clone(compilation.main_model());
        debug!(
            inputs = model.input_count(),
            outputs = model.output_count(),
            "execution builder created"
        );
        let state = ExecutionState {
            inputs: vec![ArgumentBinding::unspecified(); model.input_count()],
            outputs: vec![ArgumentBinding::unspecified(); model.output_count()],
            memories: MemoryTracker::new(),
            measure_timing: false,
            timeout: None,
            loop_timeout: None,
            started: false,
            finished_without_fence: false,
            completion: Completion::NoError,
            timing: Timing::UNKNOWN,
            sync_fence: None,
            fenced_callback: None,
        };
        ExecutionBuilder {
            inner: Arc::new(BuilderInner {
                plan: Arc::clone(compilation.plan()),
                model,
                allow_cpu_fallback: compilation.allows_cpu_fallback(),
                single_explicit_device: compilation.single_explicit_device(),
                sync_exec_runtime: compilation.sync_exec_runtime,
                state: Mutex::new(state),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ExecutionState> {
        self.inner.state.lock().expect("execution lock poisoned")
    }

    // ---- configuration ----

    /// Bind caller memory to an input; `None` binds the optional input to
    /// no value.
    ///
    /// The buffer must stay alive and unaliased from ignition until the
    /// execution has finished; the runtime only reads it.
    pub fn set_input(
        &self,
        index: usize,
        spec: Option<&OperandSpec>,
        data: Option<&[u8]>,
    ) -> ForgeResult<()> {
        let mut state = self.lock();
        if state.started {
            return Err(StepForgeError::BadState(
                "set_input called after the execution has started".to_string(),
            ));
        }
        if index >= state.inputs.len() {
            return Err(StepForgeError::BadData(format!(
                "set_input bad index {} (model has {} inputs)",
                index,
                state.inputs.len()
            )));
        }
        if !state.inputs[index].is_unspecified() {
            return Err(StepForgeError::BadState(format!(
                "set_input called when input {} has already been provided",
                index
            )));
        }
        let operand = self.inner.model.input_operand(index);
        state.inputs[index] = match data {
            None => {
                check_dimension_info(operand, spec, "set_input", true)?;
                ArgumentBinding::no_value()
            }
            Some(data) => ArgumentBinding::from_pointer(
                operand,
                spec,
                data.as_ptr() as *mut u8,
                data.len(),
                "set_input",
                false,
            )?,
        };
        Ok(())
    }

    /// Bind a memory-pool region to an input
    pub fn set_input_from_memory(
        &self,
        index: usize,
        spec: Option<&OperandSpec>,
        memory: &Arc<RuntimeMemory>,
        offset: u32,
        length: u32,
    ) -> ForgeResult<()> {
        let mut state = self.lock();
        if state.started {
            return Err(StepForgeError::BadState(
                "set_input_from_memory called after the execution has started".to_string(),
            ));
        }
        if index >= state.inputs.len() {
            return Err(StepForgeError::BadData(format!(
                "set_input_from_memory bad index {} (model has {} inputs)",
                index,
                state.inputs.len()
            )));
        }
        if !state.inputs[index].is_unspecified() {
            return Err(StepForgeError::BadState(format!(
                "set_input_from_memory called when input {} has already been provided",
                index
            )));
        }
        let operand = self.inner.model.input_operand(index);
        check_dimension_info(operand, spec, "set_input_from_memory", false)?;
        memory
            .validator()
            .validate(IoRole::Input, index, spec, offset, length)?;
        // Some memories admit (offset = 0, length = 0) as "the whole pool";
        // backends still expect a real length.
        let length = if offset == 0 && length == 0 {
            memory.size()
        } else {
            length
        };
        let pool_index = state.memories.add(memory);
        state.inputs[index] = ArgumentBinding::from_memory(
            operand,
            spec,
            pool_index,
            offset,
            length,
            "set_input_from_memory",
            false,
        )?;
        Ok(())
    }

    /// Bind caller memory to an output; `None` binds the optional output to
    /// no value. Output dimensions may be left unspecified for the backend
    /// to fill in.
    ///
    /// The buffer must stay alive and unaliased from ignition until the
    /// execution has finished.
    pub fn set_output(
        &self,
        index: usize,
        spec: Option<&OperandSpec>,
        data: Option<&mut [u8]>,
    ) -> ForgeResult<()> {
        let mut state = self.lock();
        if state.started {
            return Err(StepForgeError::BadState(
                "set_output called after the execution has started".to_string(),
            ));
        }
        if index >= state.outputs.len() {
            return Err(StepForgeError::BadData(format!(
                "set_output bad index {} (model has {} outputs)",
                index,
                state.outputs.len()
            )));
        }
        if !state.outputs[index].is_unspecified() {
            return Err(StepForgeError::BadState(format!(
                "set_output called when output {} has already been provided",
                index
            )));
        }
        let operand = self.inner.model.output_operand(index);
        state.outputs[index] = match data {
            None => {
                check_dimension_info(operand, spec, "set_output", true)?;
                ArgumentBinding::no_value()
            }
            Some(data) => ArgumentBinding::from_pointer(
                operand,
                spec,
                data.as_mut_ptr(),
                data.len(),
                "set_output",
                true,
            )?,
        };
        Ok(())
    }

    /// Bind a memory-pool region to an output
    pub fn set_output_from_memory(
        &self,
        index: usize,
        spec: Option<&OperandSpec>,
        memory: &Arc<RuntimeMemory>,
        offset: u32,
        length: u32,
    ) -> ForgeResult<()> {
        let mut state = self.lock();
        if state.started {
            return Err(StepForgeError::BadState(
                "set_output_from_memory called after the execution has started".to_string(),
            ));
        }
        if index >= state.outputs.len() {
            return Err(StepForgeError::BadData(format!(
                "set_output_from_memory bad index {} (model has {} outputs)",
                index,
                state.outputs.len()
            )));
        }
        if !state.outputs[index].is_unspecified() {
            return Err(StepForgeError::BadState(format!(
                "set_output_from_memory called when output {} has already been provided",
                index
            )));
        }
        let operand = self.inner.model.output_operand(index);
        check_dimension_info(operand, spec, "set_output_from_memory", true)?;
        memory
            .validator()
            .validate(IoRole::Output, index, spec, offset, length)?;
        let length = if offset == 0 && length == 0 {
            memory.size()
        } else {
            length
        };
        let pool_index = state.memories.add(memory);
        state.outputs[index] = ArgumentBinding::from_memory(
            operand,
            spec,
            pool_index,
            offset,
            length,
            "set_output_from_memory",
            true,
        )?;
        Ok(())
    }

    /// Enable timing measurement; requires a compilation for exactly one
    /// explicit device
    pub fn set_measure_timing(&self, measure: bool) -> ForgeResult<()> {
        if !self.inner.single_explicit_device {
            return Err(StepForgeError::BadData(
                "set_measure_timing requires a compilation for exactly one explicit device"
                    .to_string(),
            ));
        }
        let mut state = self.lock();
        if state.started {
            return Err(StepForgeError::BadState(
                "set_measure_timing called after the execution has started".to_string(),
            ));
        }
        state.measure_timing = measure;
        Ok(())
    }

    /// Set the execution timeout; `None` clears it. Requires a compilation
    /// for exactly one explicit device.
    pub fn set_timeout(&self, duration: Option<Duration>) -> ForgeResult<()> {
        if !self.inner.single_explicit_device {
            return Err(StepForgeError::BadData(
                "set_timeout requires a compilation for exactly one explicit device".to_string(),
            ));
        }
        let mut state = self.lock();
        if state.started {
            return Err(StepForgeError::BadState(
                "set_timeout called after the execution has started".to_string(),
            ));
        }
        state.timeout = duration.filter(|duration| !duration.is_zero());
        Ok(())
    }

    /// Bound interpreter time inside control-flow operators; clamped to
    /// [`LOOP_TIMEOUT_MAXIMUM`]
    pub fn set_loop_timeout(&self, duration: Duration) -> ForgeResult<()> {
        let mut state = self.lock();
        if state.started {
            return Err(StepForgeError::BadState(
                "set_loop_timeout called after the execution has started".to_string(),
            ));
        }
        let clamped = if duration > LOOP_TIMEOUT_MAXIMUM {
            warn!(
                requested = ?duration,
                maximum = ?LOOP_TIMEOUT_MAXIMUM,
                "loop timeout exceeds the maximum allowed duration; clamping"
            );
            LOOP_TIMEOUT_MAXIMUM
        } else {
            duration
        };
        state.loop_timeout = Some(clamped);
        Ok(())
    }

    // ---- ignition ----

    /// Validate bindings, flip `started`, and snapshot the configuration
    fn prepare_ignition(
        &self,
        tag: &str,
        require_fully_specified_outputs: bool,
    ) -> ForgeResult<(DriveContext, Option<Instant>)> {
        let mut state = self.lock();
        if state.started {
            return Err(StepForgeError::BadState(format!(
                "{} called on an execution that has already started",
                tag
            )));
        }
        for (i, binding) in state.inputs.iter().enumerate() {
            match binding.state() {
                BindingState::Unspecified => {
                    return Err(StepForgeError::BadData(format!(
                        "{}: input {} is not specified",
                        tag, i
                    )));
                }
                BindingState::Memory => {
                    let pool_index = binding.pool_index().expect("memory binding without pool");
                    let memory = state.memories.get(pool_index);
                    if memory
                        .validator()
                        .validate_input_dimensions(binding.dimensions())
                        .is_err()
                    {
                        return Err(StepForgeError::OpFailed(format!(
                            "{}: input {} dimensions rejected by its memory",
                            tag, i
                        )));
                    }
                }
                _ => {}
            }
        }
        for (i, binding) in state.outputs.iter().enumerate() {
            if binding.is_unspecified() {
                return Err(StepForgeError::BadData(format!(
                    "{}: output {} is not specified",
                    tag, i
                )));
            }
            if require_fully_specified_outputs
                && binding.state() != BindingState::NoValue
                && self.inner.model.output_operand(i).is_tensor()
                && (binding.dimensions().is_empty() || binding.dimensions().contains(&0))
            {
                return Err(StepForgeError::BadData(format!(
                    "{}: output {} does not have fully specified dimensions",
                    tag, i
                )));
            }
        }
        let deadline = state.timeout.map(|timeout| Instant::now() + timeout);
        state.started = true;
        Ok((
            DriveContext {
                inputs: state.inputs.clone(),
                outputs: state.outputs.clone(),
                memories: state.memories.clone(),
                measure: state.measure_timing,
                loop_timeout: state.loop_timeout.or(Some(LOOP_TIMEOUT_DEFAULT)),
            },
            deadline,
        ))
    }

    fn compute_internal(
        &self,
        burst: Option<&Arc<BurstBuilder>>,
        synchronous: bool,
    ) -> ForgeResult<Arc<ExecutionCallback>> {
        let tag = if burst.is_some() {
            "compute_burst"
        } else if synchronous {
            "compute"
        } else {
            "start_compute"
        };
        let (ctx, deadline) = self.prepare_ignition(tag, false)?;
        let allow_fallback = self.inner.allow_cpu_fallback;
        let controller = self.inner.plan.make_controller(burst.map(Arc::clone));

        let callback = Arc::new(ExecutionCallback::new());
        let finisher = self.clone();
        callback.set_on_finish(Box::new(move |status, shapes, timing| {
            finisher.finish_without_sync_fence(status, shapes, timing)
        }));

        if synchronous || self.inner.sync_exec_runtime {
            debug!(tag, "driving plan inline");
            let mut controller = controller;
            drive_non_fenced(
                &self.inner.plan,
                &self.inner.model,
                &mut controller,
                &ctx,
                allow_fallback,
                deadline,
                &callback,
            );
        } else {
            debug!(tag, "driving plan on a worker thread");
            let plan = Arc::clone(&self.inner.plan);
            let model = Arc::clone(&self.inner.model);
            let worker_callback = Arc::clone(&callback);
            let handle = thread::spawn(move || {
                let mut controller = controller;
                drive_non_fenced(
                    &plan,
                    &model,
                    &mut controller,
                    &ctx,
                    allow_fallback,
                    deadline,
                    &worker_callback,
                );
            });
            callback.bind_thread(handle);
        }
        Ok(callback)
    }

    /// Run the execution, blocking until it finishes
    pub fn compute(&self) -> ForgeResult<()> {
        let callback = self.compute_internal(None, true)?;
        callback.status().into_result()
    }

    /// Run the execution with burst resources, blocking until it finishes
    pub fn compute_burst(&self, burst: &Arc<BurstBuilder>) -> ForgeResult<()> {
        let callback = self.compute_internal(Some(burst), true)?;
        callback.status().into_result()
    }

    /// Launch the execution; the returned callback reports completion
    pub fn start_compute(&self) -> ForgeResult<Arc<ExecutionCallback>> {
        self.compute_internal(None, false)
    }

    /// Launch a fenced execution
    ///
    /// Returns the completion fence of the last step, or `None` when the
    /// execution already completed synchronously.
    pub fn compute_fenced(
        &self,
        wait_for: &[SyncFence],
        timeout_after_fence: Option<Duration>,
    ) -> ForgeResult<Option<SyncFence>> {
        if timeout_after_fence.is_some_and(|duration| !duration.is_zero())
            && !self.inner.single_explicit_device
        {
            return Err(StepForgeError::BadData(
                "compute_fenced with a post-fence timeout requires a compilation for exactly \
                 one explicit device"
                    .to_string(),
            ));
        }
        if self.inner.plan.has_dynamic_temporaries() {
            return Err(StepForgeError::BadState(
                "fenced execution does not support plans with dynamic temporaries".to_string(),
            ));
        }
        let (ctx, deadline) = self.prepare_ignition("compute_fenced", true)?;
        let allow_fallback = self.inner.allow_cpu_fallback;
        let mut controller = self.inner.plan.make_controller(None);
        debug!("driving plan fenced");
        let (fence, fenced_callback) = drive_fenced(
            self,
            &self.inner.plan,
            &mut controller,
            &ctx,
            wait_for,
            timeout_after_fence,
            deadline,
            allow_fallback,
        )?;
        let mut state = self.lock();
        state.sync_fence = fence.clone();
        state.fenced_callback = fenced_callback;
        Ok(fence)
    }

    // ---- completion ----

    /// Record the execution's result through the non-fenced channel
    ///
    /// Runs exactly once per non-fenced execution: re-validates the final
    /// shapes, updates memory metadata, marks output memories initialized
    /// or not, and sets the completion kind. Returns the (possibly
    /// downgraded) status.
    pub(crate) fn finish_without_sync_fence(
        &self,
        status: ExecStatus,
        output_shapes: &[OutputShape],
        timing: Timing,
    ) -> ExecStatus {
        let mut state = self.lock();
        if state.finished_without_fence {
            error!("finish_without_sync_fence called twice; ignoring");
            return status;
        }
        if state.sync_fence.is_some() {
            error!("finish_without_sync_fence called on a fenced execution; ignoring");
            return status;
        }
        let mut status = status;
        if let Err(e) =
            update_output_shapes_locked(&self.inner.model, &mut state, status, output_shapes)
        {
            error!("final output shapes rejected: {}", e);
            status = ExecStatus::GeneralFailure;
        } else if !update_memories_locked(&state) {
            error!("output memory metadata rejected the final shapes");
            status = ExecStatus::GeneralFailure;
        }
        let success = status == ExecStatus::Ok;
        for binding in &state.outputs {
            if let Some(pool_index) = binding.pool_index() {
                state
                    .memories
                    .get(pool_index)
                    .validator()
                    .set_initialized(success);
            }
        }
        state.timing = timing;
        state.completion = status.completion();
        state.finished_without_fence = true;
        status
    }

    /// Non-blocking: has the execution finished, through either channel?
    pub fn is_finished(&self) -> bool {
        let state = self.lock();
        debug_assert!(!(state.finished_without_fence && state.sync_fence.is_some()));
        if state.finished_without_fence {
            return true;
        }
        if let Some(fence) = &state.sync_fence {
            let fence_state = fence.state();
            debug_assert!(fence_state != FenceState::Unknown);
            return fence_state != FenceState::Active;
        }
        false
    }

    /// How the execution completed; `BadState` before it has finished
    pub fn completed_with(&self) -> ForgeResult<Completion> {
        let state = self.lock();
        if state.finished_without_fence {
            return Ok(state.completion);
        }
        if let Some(fence) = &state.sync_fence {
            return match fence.state() {
                FenceState::Signaled => Ok(Completion::NoError),
                FenceState::Error => Ok(Completion::OtherError),
                FenceState::Active | FenceState::Unknown => Err(StepForgeError::BadState(
                    "completed_with called before the execution has finished".to_string(),
                )),
            };
        }
        Err(StepForgeError::BadState(
            "completed_with called before the execution has finished".to_string(),
        ))
    }

    // ---- introspection ----

    fn check_introspectable(&self, tag: &str) -> ForgeResult<()> {
        if !self.is_finished() {
            return Err(StepForgeError::BadState(format!(
                "{} called before the execution has finished",
                tag
            )));
        }
        if self.completed_with()? == Completion::OtherError {
            return Err(StepForgeError::BadState(format!(
                "{} called on an execution that has encountered an error",
                tag
            )));
        }
        Ok(())
    }

    /// Recorded shape of an output, including its sufficiency bit
    pub fn output_operand_shape(&self, index: usize) -> ForgeResult<OutputShape> {
        self.check_introspectable("output_operand_shape")?;
        let state = self.lock();
        if index >= state.outputs.len() {
            return Err(StepForgeError::BadData(format!(
                "output_operand_shape bad index {} (model has {} outputs)",
                index,
                state.outputs.len()
            )));
        }
        let binding = &state.outputs[index];
        Ok(OutputShape {
            dimensions: binding.dimensions().clone(),
            is_sufficient: binding.is_sufficient(),
        })
    }

    /// Rank of an output; `InsufficientSize` when its buffer was too small
    pub fn output_operand_rank(&self, index: usize) -> ForgeResult<u32> {
        let shape = self.output_operand_shape(index)?;
        if !shape.is_sufficient {
            return Err(StepForgeError::InsufficientSize);
        }
        Ok(shape.dimensions.len() as u32)
    }

    /// Dimensions of an output; `InsufficientSize` when its buffer was too
    /// small, `BadData` for scalars
    pub fn output_operand_dimensions(&self, index: usize) -> ForgeResult<Dimensions> {
        let shape = self.output_operand_shape(index)?;
        if shape.dimensions.is_empty() {
            return Err(StepForgeError::BadData(
                "cannot query dimensions of a scalar".to_string(),
            ));
        }
        if !shape.is_sufficient {
            return Err(StepForgeError::InsufficientSize);
        }
        Ok(shape.dimensions)
    }

    /// Measured duration in nanoseconds; `u64::MAX` means unknown
    ///
    /// Valid only after a successful finish with timing enabled. Backend
    /// timing is in microseconds and is scaled here, preserving `MAX`.
    pub fn get_duration(&self, kind: DurationKind) -> ForgeResult<u64> {
        if !self.is_finished() {
            return Err(StepForgeError::BadState(
                "get_duration called before the execution has finished".to_string(),
            ));
        }
        if self.completed_with()? != Completion::NoError {
            return Err(StepForgeError::BadState(
                "get_duration called on an execution that has encountered an error".to_string(),
            ));
        }
        let state = self.lock();
        if !state.measure_timing {
            return Err(StepForgeError::BadState(
                "get_duration called but timing was not enabled".to_string(),
            ));
        }
        let launched = state.timing;
        let (launched, fenced) = match &state.fenced_callback {
            Some(callback) => {
                let (status, launched, fenced) = callback.execution_info();
                if status != ExecStatus::Ok {
                    return Err(StepForgeError::BadState(
                        "fenced execution reported an error".to_string(),
                    ));
                }
                (launched, fenced)
            }
            None => (launched, launched),
        };
        let micros = match kind {
            DurationKind::OnHardware => launched.time_on_device,
            DurationKind::InDriver => launched.time_in_driver,
            DurationKind::FencedOnHardware => fenced.time_on_device,
            DurationKind::FencedInDriver => fenced.time_in_driver,
        };
        Ok(if micros == u64::MAX {
            u64::MAX
        } else {
            micros * 1000
        })
    }
}

// ---- the drive loops ----

/// Initial output shapes as implied by the output bindings
fn initial_output_shapes(outputs: &[ArgumentBinding]) -> Vec<OutputShape> {
    outputs
        .iter()
        .map(|binding| OutputShape {
            dimensions: if binding.state() == BindingState::NoValue {
                Vec::new()
            } else {
                binding.dimensions().clone()
            },
            is_sufficient: true,
        })
        .collect()
}

/// Recompile the whole model for the CPU backend and run it once
fn cpu_fallback_full(ctx: &DriveContext, model: &Arc<Model>) -> ComputeResult {
    debug!("cpu_fallback_full");
    let mut executor = StepExecutor::new(None, Arc::clone(model), cpu_device(), None, ctx);
    executor.map_trivially(ctx);
    executor.compute_on_cpu_fallback()
}

/// Re-yield the current step and run it on the CPU backend
fn cpu_fallback_partial(
    plan: &ExecutionPlan,
    controller: &mut Controller,
    ctx: &DriveContext,
    output_shapes: &[OutputShape],
) -> (ExecStatus, Vec<OutputShape>, Timing, Option<StepExecutor>) {
    debug!("cpu_fallback_partial");
    match plan.fallback(controller, ctx, Some(output_shapes)) {
        Err(e) => (e.exec_status(), Vec::new(), Timing::UNKNOWN, None),
        Ok(None) => (
            ExecStatus::GeneralFailure,
            Vec::new(),
            Timing::UNKNOWN,
            None,
        ),
        Ok(Some(mut step)) => {
            let (status, shapes, timing) = step.executor.compute_on_cpu_fallback();
            (status, shapes, timing, Some(step.executor))
        }
    }
}

/// The non-fenced driver: plan -> step -> shape propagation -> repeat, with
/// insufficient-size retry and partial/full CPU fallback
fn drive_non_fenced(
    plan: &Arc<ExecutionPlan>,
    model: &Arc<Model>,
    controller: &mut Controller,
    ctx: &DriveContext,
    allow_fallback_in: bool,
    deadline: Option<Instant>,
    callback: &ExecutionCallback,
) {
    debug!("driving plan iteratively");
    let mut output_shapes = initial_output_shapes(&ctx.outputs);
    let mut timing = Timing::UNKNOWN;
    // A simple plan already on the CPU has nothing to fall back to.
    let allow_fallback = allow_fallback_in && !plan.is_simple_cpu();
    let mut retry_current_step = false;

    'plan: loop {
        let next = if retry_current_step {
            plan.fallback(controller, ctx, Some(&output_shapes))
        } else {
            plan.next(controller, ctx, Some(&output_shapes))
        };
        retry_current_step = false;

        let step = match next {
            Err(e) => {
                // A loop timeout inside control-flow interpretation can
                // surface here as a missed deadline.
                if allow_fallback && !e.is_missed_deadline() {
                    break 'plan;
                }
                callback.notify(e.exec_status(), Vec::new(), Timing::UNKNOWN);
                return;
            }
            Ok(None) => {
                callback.notify(ExecStatus::Ok, output_shapes, timing);
                return;
            }
            Ok(Some(step)) => step,
        };
        let executor_is_cpu = step.executor.is_cpu();

        let (mut step_status, step_shapes, step_timing) =
            step.executor.compute(deadline, step.burst.as_deref());

        let update = match step.executor.update_output_shapes(
            step_status,
            &step_shapes,
            &mut output_shapes,
            Some(controller.dynamic_temporaries_mut()),
        ) {
            Ok(update) => update,
            Err(e) => {
                error!("backend violated the output-shape contract: {}", e);
                step_status = ExecStatus::GeneralFailure;
                UpdateOutputShapes::default()
            }
        };

        if step_status == ExecStatus::Ok {
            if update.zero_sized_input {
                // A zero-sized tensor feeding a later step can only be
                // handled by a full-model CPU run.
                debug!("zero-sized step output feeds a downstream step");
                step_status = ExecStatus::OpFailed;
            } else {
                if let Some(step_index) = step.executor.step_index() {
                    debug_assert!(controller.dynamic_temporaries().allocated(step_index));
                }
                // Timing is only meaningful for single-step plans; keeping
                // the last step's value is equivalent there.
                timing = step_timing;
                continue 'plan;
            }
        }

        if step_status == ExecStatus::InsufficientSize {
            debug!(?update, "step reported insufficient size");
            if update.main_output_insufficient || !update.updated_dynamic_temporary {
                // Either a main output is too small, or nothing new was
                // learned about any dynamic temporary. Not recoverable.
                callback.notify(ExecStatus::InsufficientSize, output_shapes, Timing::UNKNOWN);
                return;
            }
            // A dynamic temporary grew; retry the same step.
            retry_current_step = true;
            continue 'plan;
        }

        // A missed deadline is terminal: a CPU retry cannot beat an
        // already-expired deadline.
        if step_status.is_missed_deadline() {
            callback.notify(step_status, Vec::new(), Timing::UNKNOWN);
            return;
        }

        if !allow_fallback {
            callback.notify(step_status, Vec::new(), Timing::UNKNOWN);
            return;
        }

        if executor_is_cpu {
            if !plan.is_simple() {
                break 'plan;
            }
            callback.notify(step_status, Vec::new(), Timing::UNKNOWN);
            return;
        }

        if update.zero_sized_input {
            break 'plan;
        }

        // Partial fallback: re-run the failed step on the CPU backend.
        loop {
            let (mut fb_status, fb_shapes, fb_timing, fb_executor) =
                cpu_fallback_partial(plan, controller, ctx, &output_shapes);

            let fb_update = match &fb_executor {
                Some(executor) => match executor.update_output_shapes(
                    fb_status,
                    &fb_shapes,
                    &mut output_shapes,
                    Some(controller.dynamic_temporaries_mut()),
                ) {
                    Ok(update) => update,
                    Err(e) => {
                        error!("CPU fallback violated the output-shape contract: {}", e);
                        fb_status = ExecStatus::GeneralFailure;
                        UpdateOutputShapes::default()
                    }
                },
                None => UpdateOutputShapes::default(),
            };

            if fb_status == ExecStatus::Ok {
                if fb_update.zero_sized_input {
                    debug!("zero-sized output during partial fallback");
                    break;
                }
                timing = fb_timing;
                continue 'plan;
            }

            if fb_status == ExecStatus::InsufficientSize {
                debug!(?fb_update, "partial fallback reported insufficient size");
                if fb_update.main_output_insufficient || !fb_update.updated_dynamic_temporary {
                    callback.notify(
                        ExecStatus::InsufficientSize,
                        output_shapes,
                        Timing::UNKNOWN,
                    );
                    return;
                }
                // A dynamic temporary grew; retry the partial fallback.
                continue;
            }

            // Do not fall back twice when the plan is a single step.
            if plan.is_simple() {
                callback.notify(fb_status, Vec::new(), Timing::UNKNOWN);
                return;
            }
            break;
        }
        break 'plan;
    }

    // A potentially recoverable error occurred; run the whole model on the
    // CPU instead.
    let (full_status, full_shapes, full_timing) = cpu_fallback_full(ctx, model);
    callback.notify(full_status, full_shapes, full_timing);
}

/// The fenced driver: each step waits on the prior step's fence; the last
/// fence is returned to the caller
#[allow(clippy::too_many_arguments)]
fn drive_fenced(
    builder: &ExecutionBuilder,
    plan: &Arc<ExecutionPlan>,
    controller: &mut Controller,
    ctx: &DriveContext,
    wait_for: &[SyncFence],
    timeout_after_fence: Option<Duration>,
    deadline: Option<Instant>,
    allow_fallback_in: bool,
) -> ForgeResult<(Option<SyncFence>, Option<Arc<dyn FencedComputeCallback>>)> {
    let allow_fallback = allow_fallback_in && !plan.is_simple_cpu();
    let mut wait_fences: Vec<SyncFence> = wait_for.to_vec();
    let mut sync_fence: Option<SyncFence> = None;
    let mut fenced_callback: Option<Arc<dyn FencedComputeCallback>> = None;
    let mut timing = Timing::UNKNOWN;

    loop {
        let step = match plan.next(controller, ctx, None) {
            Err(e) => {
                if allow_fallback && !e.is_missed_deadline() {
                    break;
                }
                return Err(e);
            }
            Ok(None) => {
                if sync_fence.is_none() {
                    // The final step completed synchronously; finish
                    // through the non-fenced channel.
                    let shapes = initial_output_shapes(&ctx.outputs);
                    builder.finish_without_sync_fence(ExecStatus::Ok, &shapes, timing);
                }
                return Ok((sync_fence, fenced_callback));
            }
            Ok(Some(step)) => step,
        };
        let executor_is_cpu = step.executor.is_cpu();

        let (status, fence, callback, step_timing) =
            step.executor
                .compute_fenced(&wait_fences, timeout_after_fence, deadline);

        if fence.is_none() && callback.is_none() {
            timing = step_timing;
        }
        sync_fence = fence;
        fenced_callback = callback;
        wait_fences = match &sync_fence {
            Some(fence) => vec![fence.clone()],
            None => Vec::new(),
        };

        if status == ExecStatus::Ok {
            continue;
        }
        if status.is_missed_deadline() {
            return Err(status.into_result().unwrap_err());
        }
        if !allow_fallback {
            return Err(status.into_result().unwrap_err());
        }
        if executor_is_cpu {
            if !plan.is_simple() {
                break;
            }
            return Err(status.into_result().unwrap_err());
        }
        break;
    }

    // Full CPU fallback: wait for the caller's fences, then run the whole
    // model synchronously.
    debug!("performing full fallback on the CPU (fenced path)");
    for fence in wait_for {
        if fence.wait(None) != FenceState::Signaled {
            return Err(StepForgeError::OpFailed(
                "a wait fence signaled an error".to_string(),
            ));
        }
    }
    let (full_status, full_shapes, full_timing) = cpu_fallback_full(ctx, &builder.inner.model);
    let final_status = builder.finish_without_sync_fence(full_status, &full_shapes, full_timing);
    final_status.into_result().map(|()| (None, None))
}

/// Fold the final shapes into the builder's output bindings
fn update_output_shapes_locked(
    model: &Model,
    state: &mut ExecutionState,
    status: ExecStatus,
    output_shapes: &[OutputShape],
) -> ForgeResult<()> {
    validate_output_shapes_from_backend(status, model, output_shapes)?;
    if output_shapes.is_empty() {
        return Ok(());
    }
    if output_shapes.len() != state.outputs.len() {
        return Err(StepForgeError::Unmappable(format!(
            "{} final shapes for {} outputs",
            output_shapes.len(),
            state.outputs.len()
        )));
    }
    for (i, shape) in output_shapes.iter().enumerate() {
        if !is_updatable(state.outputs[i].dimensions(), &shape.dimensions) {
            return Err(StepForgeError::Unmappable(format!(
                "output {} final shape regressed: {:?} -> {:?}",
                i,
                state.outputs[i].dimensions(),
                shape.dimensions
            )));
        }
        let operand_type = model.output_operand(i).operand_type;
        size_of_data(operand_type, &shape.dimensions)?;
    }
    for (i, shape) in output_shapes.iter().enumerate() {
        state.outputs[i].set_dimensions(shape.dimensions.clone());
        state.outputs[i].set_sufficient(shape.is_sufficient);
    }
    Ok(())
}

/// Record final output dimensions on the memories bound as outputs
fn update_memories_locked(state: &ExecutionState) -> bool {
    for binding in &state.outputs {
        let Some(pool_index) = binding.pool_index() else {
            continue;
        };
        let ok = state
            .memories
            .get(pool_index)
            .validator()
            .update_metadata(MemoryMetadata {
                logical_size: 0,
                dimensions: binding.dimensions().clone(),
            });
        if !ok {
            return false;
        }
    }
    true
}
