//! Step execution: one partition of the plan on one backend
//!
//! A [`StepExecutor`] lives for a single step dispatch. The plan maps the
//! builder's arguments into step arguments, the executor runs the backend
//! (blocking or fenced), and `update_output_shapes` folds what the backend
//! reported back into the builder's output shapes and the controller's
//! dynamic temporaries. When an accelerator step fails,
//! `compute_on_cpu_fallback` re-prepares the step model for the CPU
//! backend, materializing any device-only memories into host buffers
//! around the run.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, trace, warn};

use crate::device::{
    cpu_device, BurstController, ComputeResult, Device, FencedComputeResult, OutputShape,
    PreparedModel, Timing,
};
use crate::error::{ExecStatus, ForgeResult, StepForgeError};
use crate::execution::binding::{ArgumentBinding, BindingState};
use crate::execution::temporaries::DynamicTemporaries;
use crate::execution::DriveContext;
use crate::fence::SyncFence;
use crate::memory::{MemoryTracker, RuntimeMemory};
use crate::model::Model;
use crate::operand::{is_updatable, size_of_data, Operand};
use crate::plan::{ExecutionStep, StepOutputTarget};

/// What `update_output_shapes` learned from one step's reported shapes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOutputShapes {
    /// Some dynamic temporary's declaration changed (shape refined or
    /// length grown); retrying the step can make progress
    pub updated_dynamic_temporary: bool,
    /// A main model output was reported insufficient; not recoverable
    pub main_output_insufficient: bool,
    /// A zero-sized step output feeds a downstream step; only a full-model
    /// CPU re-run can handle this
    pub zero_sized_input: bool,
}

/// Which step argument slot a mapping targets
#[derive(Debug, Clone, Copy)]
pub(crate) enum ArgSlot {
    Input(usize),
    Output(usize),
}

/// Executes one partition of the plan on one backend
#[derive(Debug)]
pub struct StepExecutor {
    step: Option<Arc<ExecutionStep>>,
    model: Arc<Model>,
    device: Arc<dyn Device>,
    prepared_model: Option<Arc<dyn PreparedModel>>,
    inputs: Vec<ArgumentBinding>,
    outputs: Vec<ArgumentBinding>,
    memories: MemoryTracker,
    measure: bool,
    loop_timeout: Option<Duration>,
}

impl StepExecutor {
    pub(crate) fn new(
        step: Option<Arc<ExecutionStep>>,
        model: Arc<Model>,
        device: Arc<dyn Device>,
        prepared_model: Option<Arc<dyn PreparedModel>>,
        ctx: &DriveContext,
    ) -> Self {
        let inputs = vec![ArgumentBinding::unspecified(); model.input_count()];
        let outputs = vec![ArgumentBinding::unspecified(); model.output_count()];
        debug!(
            inputs = inputs.len(),
            outputs = outputs.len(),
            device = device.name(),
            "step executor created"
        );
        StepExecutor {
            step,
            model,
            device,
            prepared_model,
            inputs,
            outputs,
            memories: MemoryTracker::new(),
            measure: ctx.measure,
            loop_timeout: ctx.loop_timeout,
        }
    }

    pub fn is_cpu(&self) -> bool {
        self.device.is_cpu()
    }

    pub(crate) fn step_index(&self) -> Option<usize> {
        self.step.as_ref().map(|step| step.index())
    }

    /// Copy all builder bindings verbatim; used when the step is the whole
    /// model
    pub(crate) fn map_trivially(&mut self, ctx: &DriveContext) {
        self.inputs = ctx.inputs.clone();
        self.outputs = ctx.outputs.clone();
        self.memories = ctx.memories.clone();
    }

    /// State-preserving copy of one builder argument into a step slot,
    /// re-indexing memory pools into this executor's own table
    pub(crate) fn map_argument(
        &mut self,
        source: &ArgumentBinding,
        slot: ArgSlot,
        builder_memories: &MemoryTracker,
        override_dims: Option<&[u32]>,
    ) -> ForgeResult<()> {
        let mut binding = source.clone();
        match binding.state() {
            BindingState::Unspecified | BindingState::NoValue => {}
            BindingState::Pointer => {
                if let Some(dims) = override_dims {
                    binding.set_dimensions(dims.to_vec());
                }
            }
            BindingState::Memory => {
                if let Some(dims) = override_dims {
                    binding.set_dimensions(dims.to_vec());
                }
                let pool_index = binding.pool_index().ok_or_else(|| {
                    StepForgeError::GeneralFailure("memory binding without pool".to_string())
                })?;
                let memory = builder_memories.get(pool_index);
                let step_pool_index = self.memories.add(memory);
                binding.set_pool_index(step_pool_index);
            }
        }
        self.set_slot(slot, binding);
        Ok(())
    }

    /// Attach a step-private pool region (a temporary) to a step slot
    pub(crate) fn bind_step_internal(
        &mut self,
        slot: ArgSlot,
        operand: &Operand,
        memory: &Arc<RuntimeMemory>,
        offset: u32,
        dimensions: &[u32],
        length: Option<u32>,
    ) -> ForgeResult<()> {
        let pool_index = self.memories.add(memory);
        let length = match length {
            Some(length) => length,
            None => size_of_data(operand.operand_type, dimensions)?,
        };
        let binding =
            ArgumentBinding::internal_memory(dimensions.to_vec(), pool_index, offset, length);
        self.set_slot(slot, binding);
        Ok(())
    }

    fn set_slot(&mut self, slot: ArgSlot, binding: ArgumentBinding) {
        match slot {
            ArgSlot::Input(i) => self.inputs[i] = binding,
            ArgSlot::Output(i) => self.outputs[i] = binding,
        }
    }

    /// Run the step, blocking until the backend completes
    pub(crate) fn compute(
        &self,
        deadline: Option<Instant>,
        burst: Option<&BurstController>,
    ) -> ComputeResult {
        let Some(prepared) = &self.prepared_model else {
            return (ExecStatus::GeneralFailure, Vec::new(), Timing::UNKNOWN);
        };
        trace!(inputs = ?self.inputs, outputs = ?self.outputs, "step arguments");
        prepared.execute(
            &self.inputs,
            &self.outputs,
            self.memories.objects(),
            burst,
            self.measure,
            deadline,
            self.loop_timeout,
        )
    }

    /// Submit the step, returning a completion fence
    pub(crate) fn compute_fenced(
        &self,
        wait_for: &[SyncFence],
        timeout_after_fence: Option<Duration>,
        deadline: Option<Instant>,
    ) -> FencedComputeResult {
        let Some(prepared) = &self.prepared_model else {
            return (ExecStatus::GeneralFailure, None, None, Timing::UNKNOWN);
        };
        trace!(inputs = ?self.inputs, outputs = ?self.outputs, "step arguments (fenced)");
        prepared.execute_fenced(
            &self.inputs,
            &self.outputs,
            self.memories.objects(),
            wait_for,
            self.measure,
            deadline,
            self.loop_timeout,
            timeout_after_fence,
        )
    }

    /// Re-prepare the step model for the CPU backend and run it once
    ///
    /// Device-only memories are opaque to the CPU; they are replaced with
    /// host buffers of the same logical size, populated for pools used as
    /// inputs and written back for pools used as outputs.
    pub(crate) fn compute_on_cpu_fallback(&mut self) -> ComputeResult {
        warn!(device = self.device.name(), "re-compiling step model for CPU fallback");
        let cpu: Arc<dyn Device> = cpu_device();
        self.device = cpu;
        self.prepared_model = None;
        let prepared = match self.device.prepare_model(&self.model) {
            Ok(prepared) => prepared,
            Err(e) => {
                error!("CPU re-compilation failed: {}", e);
                return (e.exec_status(), Vec::new(), Timing::UNKNOWN);
            }
        };
        self.prepared_model = Some(Arc::clone(&prepared));

        let pools = self.memories.objects().to_vec();
        let mut used_as_input = vec![false; pools.len()];
        let mut used_as_output = vec![false; pools.len()];
        for binding in &self.inputs {
            if let Some(pool) = binding.pool_index() {
                used_as_input[pool as usize] = true;
            }
        }
        for binding in &self.outputs {
            if let Some(pool) = binding.pool_index() {
                if pools[pool as usize].validator().created_with_unknown_shape() {
                    error!("cannot fall back to CPU: an output memory has unknown shape");
                    return (ExecStatus::OpFailed, Vec::new(), Timing::UNKNOWN);
                }
                used_as_output[pool as usize] = true;
            }
        }

        // Materialize device pools into host buffers.
        let mut effective = pools.clone();
        for (i, pool) in pools.iter().enumerate() {
            let Some(buffer) = pool.device_buffer() else {
                continue;
            };
            let size = pool.validator().metadata().logical_size;
            let host = RuntimeMemory::host(size);
            if used_as_input[i] {
                let mut staging = vec![0u8; size as usize];
                if buffer.copy_to_host(&mut staging).is_err() {
                    return (ExecStatus::OpFailed, Vec::new(), Timing::UNKNOWN);
                }
                let copied =
                    host.with_bytes_mut(0, size, |bytes| bytes.copy_from_slice(&staging));
                if copied.is_err() {
                    return (ExecStatus::OpFailed, Vec::new(), Timing::UNKNOWN);
                }
            }
            effective[i] = host;
        }

        let (status, shapes, timing) = prepared.execute(
            &self.inputs,
            &self.outputs,
            &effective,
            None,
            self.measure,
            None,
            self.loop_timeout,
        );
        if status != ExecStatus::Ok {
            return (status, shapes, timing);
        }

        // Write results back into device pools used as outputs.
        for (i, pool) in pools.iter().enumerate() {
            let Some(buffer) = pool.device_buffer() else {
                continue;
            };
            if !used_as_output[i] {
                continue;
            }
            let size = pool.validator().metadata().logical_size;
            let bytes = match effective[i].with_bytes(0, size, |bytes| bytes.to_vec()) {
                Ok(bytes) => bytes,
                Err(_) => return (ExecStatus::OpFailed, Vec::new(), Timing::UNKNOWN),
            };
            if buffer.copy_from_host(&bytes).is_err() {
                return (ExecStatus::OpFailed, Vec::new(), Timing::UNKNOWN);
            }
        }
        (ExecStatus::Ok, shapes, timing)
    }

    /// Fold shapes reported by the backend into the builder's output shapes
    /// and the dynamic temporaries
    ///
    /// An `Err` means the backend violated its contract; callers promote it
    /// to `GeneralFailure`.
    pub(crate) fn update_output_shapes(
        &self,
        status: ExecStatus,
        from: &[OutputShape],
        to: &mut [OutputShape],
        mut temporaries: Option<&mut DynamicTemporaries>,
    ) -> ForgeResult<UpdateOutputShapes> {
        validate_output_shapes_from_backend(status, &self.model, from)?;
        let mut update = UpdateOutputShapes::default();
        if from.is_empty() {
            return Ok(update);
        }

        let Some(step) = &self.step else {
            // Whole-model execution: shapes map one to one.
            if from.len() != to.len() {
                return Err(StepForgeError::Unmappable(format!(
                    "{} shapes reported for {} outputs",
                    from.len(),
                    to.len()
                )));
            }
            for (i, shape) in from.iter().enumerate() {
                if !is_updatable(&to[i].dimensions, &shape.dimensions) {
                    return Err(StepForgeError::Unmappable(format!(
                        "output {} shape regressed: {:?} -> {:?}",
                        i, to[i].dimensions, shape.dimensions
                    )));
                }
                to[i] = shape.clone();
            }
            return Ok(update);
        };

        for (i, target) in step.outputs().iter().enumerate() {
            let shape = &from[i];
            match target {
                StepOutputTarget::MainOutput(main_index) => {
                    let main_index = *main_index;
                    if main_index >= to.len() {
                        return Err(StepForgeError::Unmappable(format!(
                            "step maps output {} past main output count {}",
                            main_index,
                            to.len()
                        )));
                    }
                    if !is_updatable(&to[main_index].dimensions, &shape.dimensions) {
                        return Err(StepForgeError::Unmappable(format!(
                            "main output {} shape regressed: {:?} -> {:?}",
                            main_index, to[main_index].dimensions, shape.dimensions
                        )));
                    }
                    to[main_index] = shape.clone();
                    update.main_output_insufficient |= !shape.is_sufficient;
                    if step.is_downstream_main_output(main_index)
                        && is_zero_sized_tensor(status, shape)
                    {
                        update.zero_sized_input = true;
                    }
                }
                StepOutputTarget::Temporary(source_index) => {
                    let Some(temporaries) = temporaries.as_deref_mut() else {
                        return Err(StepForgeError::Unmappable(
                            "step writes a temporary but no temporaries are tracked".to_string(),
                        ));
                    };
                    let Some(view) = temporaries.lookup(*source_index) else {
                        // A statically sized temporary; nothing to learn.
                        continue;
                    };
                    if !is_updatable(&view.dimensions, &shape.dimensions) {
                        return Err(StepForgeError::Unmappable(format!(
                            "temporary {:?} shape regressed: {:?} -> {:?}",
                            source_index, view.dimensions, shape.dimensions
                        )));
                    }
                    let operand_type = self.model.output_operand(i).operand_type;
                    let actual_size = size_of_data(operand_type, &shape.dimensions)
                        .map_err(|e| StepForgeError::Unmappable(e.to_string()))?;
                    let changed = if actual_size > 0 {
                        temporaries.redeclare(*source_index, &shape.dimensions, actual_size)?
                    } else if !shape.is_sufficient {
                        if view.length >= crate::execution::MAX_TEMPORARY_LENGTH {
                            return Err(StepForgeError::Unmappable(format!(
                                "temporary {:?} length overflow",
                                source_index
                            )));
                        }
                        temporaries.redeclare(
                            *source_index,
                            &shape.dimensions,
                            2 * view.length,
                        )?
                    } else {
                        // Unspecified dimensions and a sufficient buffer:
                        // the only legal way to get here on success is a
                        // zero-sized tensor.
                        if status == ExecStatus::Ok {
                            if !is_zero_sized_tensor(status, shape) {
                                return Err(StepForgeError::Unmappable(format!(
                                    "temporary {:?} reported sufficient with unknown size",
                                    source_index
                                )));
                            }
                            update.zero_sized_input = true;
                        }
                        false
                    };
                    if changed {
                        update.updated_dynamic_temporary = true;
                    }
                }
            }
        }
        Ok(update)
    }
}

/// Enforce the output-shape contract imposed on backends
///
/// - Success: the vector is empty or complete, every entry sufficient,
///   tensor entries of nonzero rank.
/// - Insufficient size: complete, at least one entry insufficient.
/// - Any other status: empty.
pub(crate) fn validate_output_shapes_from_backend(
    status: ExecStatus,
    model: &Model,
    shapes: &[OutputShape],
) -> ForgeResult<()> {
    match status {
        ExecStatus::Ok => {
            if !shapes.is_empty() && shapes.len() != model.output_count() {
                return Err(StepForgeError::Unmappable(format!(
                    "with status {} shapes must be empty or of length {}, got {}",
                    status,
                    model.output_count(),
                    shapes.len()
                )));
            }
            for (i, shape) in shapes.iter().enumerate() {
                if !shape.is_sufficient {
                    return Err(StepForgeError::Unmappable(format!(
                        "with status {} output {} is marked insufficient",
                        status, i
                    )));
                }
                if model.output_operand(i).is_tensor() && shape.dimensions.is_empty() {
                    return Err(StepForgeError::Unmappable(format!(
                        "with status {} tensor output {} has zero rank",
                        status, i
                    )));
                }
            }
        }
        ExecStatus::InsufficientSize => {
            if shapes.len() != model.output_count() {
                return Err(StepForgeError::Unmappable(format!(
                    "with status {} shapes must be of length {}, got {}",
                    status,
                    model.output_count(),
                    shapes.len()
                )));
            }
            if shapes.iter().all(|shape| shape.is_sufficient) {
                return Err(StepForgeError::Unmappable(format!(
                    "with status {} no output is marked insufficient",
                    status
                )));
            }
        }
        _ => {
            if !shapes.is_empty() {
                return Err(StepForgeError::Unmappable(format!(
                    "with status {} shapes must be empty, got {}",
                    status,
                    shapes.len()
                )));
            }
        }
    }
    Ok(())
}

/// A successfully produced tensor one of whose axes is zero
pub(crate) fn is_zero_sized_tensor(status: ExecStatus, shape: &OutputShape) -> bool {
    status == ExecStatus::Ok
        && shape.is_sufficient
        && !shape.dimensions.is_empty()
        && shape.dimensions.contains(&0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{OpKind, Operation};
    use crate::operand::{Operand, OperandType};

    fn one_output_model() -> Arc<Model> {
        Model::new(
            vec![
                Operand::tensor(OperandType::TensorFloat32, vec![2, 2]),
                Operand::tensor(OperandType::TensorFloat32, vec![0, 0]),
            ],
            vec![Operation {
                kind: OpKind::Identity,
                inputs: vec![0],
                outputs: vec![1],
            }],
            vec![0],
            vec![1],
        )
    }

    #[test]
    fn test_shape_contract_on_success() {
        let model = one_output_model();
        let ok = [OutputShape::sufficient(vec![2, 2])];
        assert!(validate_output_shapes_from_backend(ExecStatus::Ok, &model, &ok).is_ok());
        assert!(validate_output_shapes_from_backend(ExecStatus::Ok, &model, &[]).is_ok());

        let insufficient = [OutputShape::insufficient(vec![2, 2])];
        assert!(
            validate_output_shapes_from_backend(ExecStatus::Ok, &model, &insufficient).is_err()
        );

        let zero_rank = [OutputShape::sufficient(vec![])];
        assert!(validate_output_shapes_from_backend(ExecStatus::Ok, &model, &zero_rank).is_err());

        let too_many = [
            OutputShape::sufficient(vec![2, 2]),
            OutputShape::sufficient(vec![2, 2]),
        ];
        assert!(validate_output_shapes_from_backend(ExecStatus::Ok, &model, &too_many).is_err());
    }

    #[test]
    fn test_shape_contract_on_insufficient() {
        let model = one_output_model();
        let good = [OutputShape::insufficient(vec![3, 5])];
        assert!(
            validate_output_shapes_from_backend(ExecStatus::InsufficientSize, &model, &good)
                .is_ok()
        );
        // Insufficient status with an empty vector is illegal.
        assert!(
            validate_output_shapes_from_backend(ExecStatus::InsufficientSize, &model, &[])
                .is_err()
        );
        // As is one with every entry sufficient.
        let all_ok = [OutputShape::sufficient(vec![3, 5])];
        assert!(
            validate_output_shapes_from_backend(ExecStatus::InsufficientSize, &model, &all_ok)
                .is_err()
        );
    }

    #[test]
    fn test_shape_contract_on_failure() {
        let model = one_output_model();
        assert!(validate_output_shapes_from_backend(ExecStatus::OpFailed, &model, &[]).is_ok());
        let nonempty = [OutputShape::sufficient(vec![2, 2])];
        assert!(
            validate_output_shapes_from_backend(ExecStatus::OpFailed, &model, &nonempty).is_err()
        );
    }

    #[test]
    fn test_zero_sized_tensor_detection() {
        let shape = OutputShape::sufficient(vec![0, 4]);
        assert!(is_zero_sized_tensor(ExecStatus::Ok, &shape));
        assert!(!is_zero_sized_tensor(ExecStatus::OpFailed, &shape));
        let full = OutputShape::sufficient(vec![2, 4]);
        assert!(!is_zero_sized_tensor(ExecStatus::Ok, &full));
        let insufficient = OutputShape::insufficient(vec![0, 4]);
        assert!(!is_zero_sized_tensor(ExecStatus::Ok, &insufficient));
    }

    #[test]
    fn test_whole_model_shape_update() {
        let model = one_output_model();
        let ctx = DriveContext {
            inputs: vec![ArgumentBinding::unspecified()],
            outputs: vec![ArgumentBinding::unspecified()],
            memories: MemoryTracker::new(),
            measure: false,
            loop_timeout: None,
        };
        let executor = StepExecutor::new(
            None,
            Arc::clone(&model),
            cpu_device(),
            None,
            &ctx,
        );
        let mut to = vec![OutputShape::sufficient(vec![0, 0])];
        let from = [OutputShape::sufficient(vec![3, 5])];
        let update = executor
            .update_output_shapes(ExecStatus::Ok, &from, &mut to, None)
            .unwrap();
        assert_eq!(update, UpdateOutputShapes::default());
        assert_eq!(to[0].dimensions, vec![3, 5]);

        // A contradicting update is a contract violation.
        let regressed = [OutputShape::sufficient(vec![4, 5])];
        assert!(executor
            .update_output_shapes(ExecStatus::Ok, &regressed, &mut to, None)
            .is_err());
    }
}
