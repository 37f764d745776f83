//! CPU reference backend
//!
//! Executes step models with a scalar interpreter over the reference op
//! set. This is the floor every plan can fall back to: accelerator steps
//! that fail are re-prepared and re-run here, and simple plans may target
//! it directly.

use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use tracing::trace;

use crate::error::{ExecStatus, ForgeResult};
use crate::execution::binding::ArgumentBinding;
use crate::fence::{FenceState, SyncFence};
use crate::memory::RuntimeMemory;
use crate::model::{Model, OpKind};
use crate::operand::{Dimensions, OperandType};

use super::{
    BurstController, ComputeResult, Device, FencedComputeResult, OutputShape, PreparedModel,
    Timing,
};

static CPU_DEVICE: Lazy<Arc<CpuDevice>> = Lazy::new(|| Arc::new(CpuDevice));

/// The process-wide CPU reference device
pub fn cpu_device() -> Arc<CpuDevice> {
    Arc::clone(&CPU_DEVICE)
}

/// The CPU reference backend
#[derive(Debug)]
pub struct CpuDevice;

impl Device for CpuDevice {
    fn name(&self) -> &str {
        "cpu-reference"
    }

    fn is_cpu(&self) -> bool {
        true
    }

    fn prepare_model(&self, model: &Arc<Model>) -> ForgeResult<Arc<dyn PreparedModel>> {
        Ok(Arc::new(CpuPreparedModel {
            model: Arc::clone(model),
        }))
    }
}

#[derive(Debug)]
pub struct CpuPreparedModel {
    model: Arc<Model>,
}

#[derive(Debug, Clone)]
struct TensorValue {
    dimensions: Dimensions,
    bytes: Vec<u8>,
}

fn to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn from_f32(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_ne_bytes()).collect()
}

fn deadline_expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() > d)
}

impl CpuPreparedModel {
    /// Run the interpreter; `Err(status)` aborts with that wire status.
    fn run(
        &self,
        inputs: &[ArgumentBinding],
        outputs: &[ArgumentBinding],
        memories: &[Arc<RuntimeMemory>],
        deadline: Option<Instant>,
    ) -> Result<(ExecStatus, Vec<OutputShape>), ExecStatus> {
        let model = &self.model;
        let mut values: Vec<Option<TensorValue>> = vec![None; model.operand_count()];

        for (i, binding) in inputs.iter().enumerate() {
            let bytes = binding.read_bytes(memories).map_err(|_| ExecStatus::OpFailed)?;
            values[model.input_operand_index(i)] = Some(TensorValue {
                dimensions: binding.dimensions().clone(),
                bytes,
            });
        }

        for operation in model.operations() {
            if deadline_expired(deadline) {
                return Err(ExecStatus::MissedDeadlineTransient);
            }
            let operands: Vec<TensorValue> = operation
                .inputs
                .iter()
                .map(|&idx| values[idx].clone().ok_or(ExecStatus::OpFailed))
                .collect::<Result<_, _>>()?;
            let result = self.evaluate(operation.kind, &operands, operation.inputs.first())?;
            let out_idx = *operation.outputs.first().ok_or(ExecStatus::OpFailed)?;
            values[out_idx] = Some(result);
        }

        // Gather outputs, checking destination capacity.
        let mut shapes = Vec::with_capacity(model.output_count());
        let mut insufficient = false;
        for i in 0..model.output_count() {
            let value = values[model.output_operand_index(i)]
                .take()
                .ok_or(ExecStatus::OpFailed)?;
            let binding = &outputs[i];
            let destination_len = binding.length().unwrap_or(u32::MAX) as usize;
            if destination_len < value.bytes.len() {
                trace!(
                    output = i,
                    need = value.bytes.len(),
                    have = destination_len,
                    "output destination too small"
                );
                shapes.push(OutputShape::insufficient(value.dimensions));
                insufficient = true;
                continue;
            }
            if binding.length().is_some() {
                binding
                    .write_bytes(memories, &value.bytes)
                    .map_err(|_| ExecStatus::OpFailed)?;
            }
            shapes.push(OutputShape::sufficient(value.dimensions));
        }

        if insufficient {
            Ok((ExecStatus::InsufficientSize, shapes))
        } else {
            Ok((ExecStatus::Ok, shapes))
        }
    }

    fn evaluate(
        &self,
        kind: OpKind,
        operands: &[TensorValue],
        first_input_index: Option<&usize>,
    ) -> Result<TensorValue, ExecStatus> {
        let float_only = |value: &TensorValue| -> Result<(), ExecStatus> {
            let idx = *first_input_index.ok_or(ExecStatus::OpFailed)?;
            if self.model.operand(idx).operand_type != OperandType::TensorFloat32 {
                return Err(ExecStatus::OpFailed);
            }
            if value.bytes.len() % 4 != 0 {
                return Err(ExecStatus::OpFailed);
            }
            Ok(())
        };

        match kind {
            OpKind::Identity => {
                let input = operands.first().ok_or(ExecStatus::OpFailed)?;
                Ok(input.clone())
            }
            OpKind::Relu => {
                let input = operands.first().ok_or(ExecStatus::OpFailed)?;
                float_only(input)?;
                let result: Vec<f32> = to_f32(&input.bytes).iter().map(|v| v.max(0.0)).collect();
                Ok(TensorValue {
                    dimensions: input.dimensions.clone(),
                    bytes: from_f32(&result),
                })
            }
            OpKind::Add | OpKind::Mul => {
                let [a, b] = operands else {
                    return Err(ExecStatus::OpFailed);
                };
                if a.dimensions != b.dimensions {
                    return Err(ExecStatus::OpFailed);
                }
                float_only(a)?;
                let lhs = to_f32(&a.bytes);
                let rhs = to_f32(&b.bytes);
                let result: Vec<f32> = lhs
                    .iter()
                    .zip(&rhs)
                    .map(|(x, y)| if kind == OpKind::Add { x + y } else { x * y })
                    .collect();
                Ok(TensorValue {
                    dimensions: a.dimensions.clone(),
                    bytes: from_f32(&result),
                })
            }
            OpKind::Concat => {
                let first = operands.first().ok_or(ExecStatus::OpFailed)?;
                let rank = first.dimensions.len();
                if rank == 0 {
                    return Err(ExecStatus::OpFailed);
                }
                let mut leading = 0u32;
                let mut bytes = Vec::new();
                for value in operands {
                    if value.dimensions.len() != rank
                        || value.dimensions[1..] != first.dimensions[1..]
                    {
                        return Err(ExecStatus::OpFailed);
                    }
                    leading += value.dimensions[0];
                    bytes.extend_from_slice(&value.bytes);
                }
                let mut dimensions = first.dimensions.clone();
                dimensions[0] = leading;
                Ok(TensorValue { dimensions, bytes })
            }
        }
    }
}

impl PreparedModel for CpuPreparedModel {
    fn execute(
        &self,
        inputs: &[ArgumentBinding],
        outputs: &[ArgumentBinding],
        memories: &[Arc<RuntimeMemory>],
        _burst: Option<&BurstController>,
        measure: bool,
        deadline: Option<Instant>,
        _loop_timeout: Option<Duration>,
    ) -> ComputeResult {
        if deadline_expired(deadline) {
            return (ExecStatus::MissedDeadlineTransient, Vec::new(), Timing::UNKNOWN);
        }
        let start = Instant::now();
        match self.run(inputs, outputs, memories, deadline) {
            Ok((status, shapes)) => {
                let timing = if measure && status == ExecStatus::Ok {
                    Timing::measured(start.elapsed().as_micros() as u64)
                } else {
                    Timing::UNKNOWN
                };
                (status, shapes, timing)
            }
            Err(status) => (status, Vec::new(), Timing::UNKNOWN),
        }
    }

    fn execute_fenced(
        &self,
        inputs: &[ArgumentBinding],
        outputs: &[ArgumentBinding],
        memories: &[Arc<RuntimeMemory>],
        wait_for: &[SyncFence],
        measure: bool,
        deadline: Option<Instant>,
        loop_timeout: Option<Duration>,
        _timeout_after_fence: Option<Duration>,
    ) -> FencedComputeResult {
        for fence in wait_for {
            if fence.wait(None) != FenceState::Signaled {
                return (ExecStatus::OpFailed, None, None, Timing::UNKNOWN);
            }
        }
        let (status, shapes, timing) = self.execute(
            inputs,
            outputs,
            memories,
            None,
            measure,
            deadline,
            loop_timeout,
        );
        // Work completed synchronously; output shapes cannot be reported
        // through the fenced interface, which is why plans with dynamic
        // shapes are rejected for fenced execution up front.
        let _ = shapes;
        (status, None, None, timing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Operation;
    use crate::operand::Operand;

    fn bind_input(data: &[u8], dims: Vec<u32>) -> ArgumentBinding {
        let operand = Operand::tensor(OperandType::TensorFloat32, dims.clone());
        ArgumentBinding::from_pointer(
            &operand,
            None,
            data.as_ptr() as *mut u8,
            data.len(),
            "test",
            false,
        )
        .unwrap()
    }

    fn bind_output(buf: &mut [u8], dims: Vec<u32>) -> ArgumentBinding {
        let operand = Operand::tensor(OperandType::TensorFloat32, dims);
        ArgumentBinding::from_pointer(&operand, None, buf.as_mut_ptr(), buf.len(), "test", true)
            .unwrap()
    }

    fn relu_model() -> Arc<Model> {
        Model::new(
            vec![
                Operand::tensor(OperandType::TensorFloat32, vec![4]),
                Operand::tensor(OperandType::TensorFloat32, vec![0]),
            ],
            vec![Operation {
                kind: OpKind::Relu,
                inputs: vec![0],
                outputs: vec![1],
            }],
            vec![0],
            vec![1],
        )
    }

    #[test]
    fn test_relu_executes() {
        let prepared = cpu_device().prepare_model(&relu_model()).unwrap();
        let input = from_f32(&[-1.0, 2.0, -3.0, 4.0]);
        let mut out = [0u8; 16];
        let inputs = [bind_input(&input, vec![4])];
        let outputs = [bind_output(&mut out, vec![0])];
        let (status, shapes, _) =
            prepared.execute(&inputs, &outputs, &[], None, false, None, None);
        assert_eq!(status, ExecStatus::Ok);
        assert_eq!(shapes.len(), 1);
        assert!(shapes[0].is_sufficient);
        assert_eq!(shapes[0].dimensions, vec![4]);
        assert_eq!(to_f32(&out), vec![0.0, 2.0, 0.0, 4.0]);
    }

    #[test]
    fn test_small_output_reports_insufficient() {
        let prepared = cpu_device().prepare_model(&relu_model()).unwrap();
        let input = from_f32(&[1.0, 2.0, 3.0, 4.0]);
        let mut out = [0u8; 8];
        let inputs = [bind_input(&input, vec![4])];
        let outputs = [bind_output(&mut out, vec![0])];
        let (status, shapes, _) =
            prepared.execute(&inputs, &outputs, &[], None, false, None, None);
        assert_eq!(status, ExecStatus::InsufficientSize);
        assert_eq!(shapes.len(), 1);
        assert!(!shapes[0].is_sufficient);
        assert_eq!(shapes[0].dimensions, vec![4]);
    }

    #[test]
    fn test_expired_deadline_misses() {
        let prepared = cpu_device().prepare_model(&relu_model()).unwrap();
        let input = from_f32(&[1.0; 4]);
        let mut out = [0u8; 16];
        let inputs = [bind_input(&input, vec![4])];
        let outputs = [bind_output(&mut out, vec![0])];
        let past = Instant::now() - Duration::from_millis(5);
        let (status, shapes, _) =
            prepared.execute(&inputs, &outputs, &[], None, false, Some(past), None);
        assert_eq!(status, ExecStatus::MissedDeadlineTransient);
        assert!(shapes.is_empty());
    }

    #[test]
    fn test_measured_timing() {
        let prepared = cpu_device().prepare_model(&relu_model()).unwrap();
        let input = from_f32(&[1.0; 4]);
        let mut out = [0u8; 16];
        let inputs = [bind_input(&input, vec![4])];
        let outputs = [bind_output(&mut out, vec![0])];
        let (status, _, timing) =
            prepared.execute(&inputs, &outputs, &[], None, true, None, None);
        assert_eq!(status, ExecStatus::Ok);
        assert_ne!(timing.time_on_device, u64::MAX);
    }

    #[test]
    fn test_fenced_runs_synchronously() {
        let prepared = cpu_device().prepare_model(&relu_model()).unwrap();
        let input = from_f32(&[-2.0, 5.0, -1.0, 0.5]);
        let mut out = [0u8; 16];
        let inputs = [bind_input(&input, vec![4])];
        let outputs = [bind_output(&mut out, vec![0])];
        let gate = SyncFence::signaled();
        let (status, fence, callback, _) = prepared.execute_fenced(
            &inputs,
            &outputs,
            &[],
            &[gate],
            false,
            None,
            None,
            None,
        );
        assert_eq!(status, ExecStatus::Ok);
        assert!(fence.is_none());
        assert!(callback.is_none());
        assert_eq!(to_f32(&out), vec![0.0, 5.0, 0.0, 0.5]);
    }

    #[test]
    fn test_fenced_errored_wait_fence_fails() {
        let prepared = cpu_device().prepare_model(&relu_model()).unwrap();
        let input = from_f32(&[1.0; 4]);
        let mut out = [0u8; 16];
        let inputs = [bind_input(&input, vec![4])];
        let outputs = [bind_output(&mut out, vec![0])];
        let gate = SyncFence::new();
        gate.signal(false);
        let (status, ..) = prepared.execute_fenced(
            &inputs,
            &outputs,
            &[],
            &[gate],
            false,
            None,
            None,
            None,
        );
        assert_eq!(status, ExecStatus::OpFailed);
    }

    #[test]
    fn test_concat_shape_inference() {
        let model = Model::new(
            vec![
                Operand::tensor(OperandType::TensorFloat32, vec![1, 2]),
                Operand::tensor(OperandType::TensorFloat32, vec![2, 2]),
                Operand::tensor(OperandType::TensorFloat32, vec![0, 0]),
            ],
            vec![Operation {
                kind: OpKind::Concat,
                inputs: vec![0, 1],
                outputs: vec![2],
            }],
            vec![0, 1],
            vec![2],
        );
        let prepared = cpu_device().prepare_model(&model).unwrap();
        let a = from_f32(&[1.0, 2.0]);
        let b = from_f32(&[3.0, 4.0, 5.0, 6.0]);
        let mut out = [0u8; 24];
        let inputs = [bind_input(&a, vec![1, 2]), bind_input(&b, vec![2, 2])];
        let outputs = [bind_output(&mut out, vec![0, 0])];
        let (status, shapes, _) =
            prepared.execute(&inputs, &outputs, &[], None, false, None, None);
        assert_eq!(status, ExecStatus::Ok);
        assert_eq!(shapes[0].dimensions, vec![3, 2]);
        assert_eq!(to_f32(&out), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }
}
