//! Shared helpers for integration tests: model builders, byte conversions,
//! and a scriptable accelerator device that delegates real compute to the
//! CPU reference backend.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use stepforge::execution::binding::ArgumentBinding;
use stepforge::memory::DeviceBuffer;
use stepforge::{
    cpu_device, BurstController, Device, ExecStatus, FencedComputeCallback, ForgeResult, Model,
    OpKind, Operand, OperandType, Operation, OutputShape, PreparedModel, RuntimeMemory, SyncFence,
    Timing,
};

pub fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_ne_bytes()).collect()
}

pub fn f32_from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// `input dims -> single op -> output dims` model
pub fn unary_model(kind: OpKind, in_dims: Vec<u32>, out_dims: Vec<u32>) -> Arc<Model> {
    Model::new(
        vec![
            Operand::tensor(OperandType::TensorFloat32, in_dims),
            Operand::tensor(OperandType::TensorFloat32, out_dims),
        ],
        vec![Operation {
            kind,
            inputs: vec![0],
            outputs: vec![1],
        }],
        vec![0],
        vec![1],
    )
}

/// One scripted response of the fake accelerator
#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    /// Delegate to the CPU interpreter (real compute)
    Succeed,
    /// Fail with the given status and empty shapes
    Fail(ExecStatus),
    /// Report insufficient size with the given shapes
    Insufficient(Vec<OutputShape>),
}

/// A fake accelerator whose responses are scripted per execute call
///
/// Responses pop front-of-queue; an empty queue means `Succeed`. Fenced
/// executions compute inline but return unsignaled fences collected in
/// `pending_fences`, so tests control when the execution "completes".
#[derive(Debug)]
pub struct ScriptedDevice {
    name: String,
    script: Arc<Mutex<VecDeque<ScriptedResponse>>>,
    pending_fences: Arc<Mutex<Vec<SyncFence>>>,
    fenced_waits: Arc<Mutex<Vec<Vec<SyncFence>>>>,
}

impl ScriptedDevice {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(ScriptedDevice {
            name: name.to_string(),
            script: Arc::new(Mutex::new(VecDeque::new())),
            pending_fences: Arc::new(Mutex::new(Vec::new())),
            fenced_waits: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn push(&self, response: ScriptedResponse) {
        self.script.lock().unwrap().push_back(response);
    }

    /// Fences handed out by fenced executions, in dispatch order
    pub fn pending_fences(&self) -> Vec<SyncFence> {
        self.pending_fences.lock().unwrap().clone()
    }

    /// Signal every handed-out fence as successful
    pub fn signal_pending(&self) {
        for fence in self.pending_fences.lock().unwrap().iter() {
            fence.signal(true);
        }
    }

    /// The wait-fence lists received by fenced executions, in order
    pub fn fenced_waits(&self) -> Vec<Vec<SyncFence>> {
        self.fenced_waits.lock().unwrap().clone()
    }
}

impl Device for ScriptedDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare_model(&self, model: &Arc<Model>) -> ForgeResult<Arc<dyn PreparedModel>> {
        let inner = cpu_device().prepare_model(model)?;
        Ok(Arc::new(ScriptedPreparedModel {
            inner,
            script: Arc::clone(&self.script),
            pending_fences: Arc::clone(&self.pending_fences),
            fenced_waits: Arc::clone(&self.fenced_waits),
        }))
    }
}

#[derive(Debug)]
struct ScriptedPreparedModel {
    inner: Arc<dyn PreparedModel>,
    script: Arc<Mutex<VecDeque<ScriptedResponse>>>,
    pending_fences: Arc<Mutex<Vec<SyncFence>>>,
    fenced_waits: Arc<Mutex<Vec<Vec<SyncFence>>>>,
}

impl ScriptedPreparedModel {
    fn pop(&self) -> ScriptedResponse {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ScriptedResponse::Succeed)
    }
}

#[derive(Debug)]
struct ScriptedFencedCallback {
    timing: Timing,
}

impl FencedComputeCallback for ScriptedFencedCallback {
    fn execution_info(&self) -> (ExecStatus, Timing, Timing) {
        (ExecStatus::Ok, self.timing, self.timing)
    }
}

impl PreparedModel for ScriptedPreparedModel {
    fn execute(
        &self,
        inputs: &[ArgumentBinding],
        outputs: &[ArgumentBinding],
        memories: &[Arc<RuntimeMemory>],
        burst: Option<&BurstController>,
        measure: bool,
        deadline: Option<Instant>,
        loop_timeout: Option<Duration>,
    ) -> (ExecStatus, Vec<OutputShape>, Timing) {
        match self.pop() {
            ScriptedResponse::Succeed => self.inner.execute(
                inputs,
                outputs,
                memories,
                burst,
                measure,
                deadline,
                loop_timeout,
            ),
            ScriptedResponse::Fail(status) => (status, Vec::new(), Timing::UNKNOWN),
            ScriptedResponse::Insufficient(shapes) => {
                (ExecStatus::InsufficientSize, shapes, Timing::UNKNOWN)
            }
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
    ) -> (
        ExecStatus,
        Option<SyncFence>,
        Option<Arc<dyn FencedComputeCallback>>,
        Timing,
    ) {
        self.fenced_waits.lock().unwrap().push(wait_for.to_vec());
        match self.pop() {
            ScriptedResponse::Succeed => {
                // Compute inline, but report completion through a fence the
                // test signals later.
                let (status, _, timing) = self.inner.execute(
                    inputs,
                    outputs,
                    memories,
                    None,
                    measure,
                    deadline,
                    loop_timeout,
                );
                if status != ExecStatus::Ok {
                    return (status, None, None, Timing::UNKNOWN);
                }
                let fence = SyncFence::new();
                self.pending_fences.lock().unwrap().push(fence.clone());
                let callback = Arc::new(ScriptedFencedCallback { timing });
                (ExecStatus::Ok, Some(fence), Some(callback), Timing::UNKNOWN)
            }
            ScriptedResponse::Fail(status) => (status, None, None, Timing::UNKNOWN),
            ScriptedResponse::Insufficient(_) => {
                (ExecStatus::InsufficientSize, None, None, Timing::UNKNOWN)
            }
        }
    }
}

/// Device-resident buffer for exercising CPU-fallback materialization
#[derive(Debug)]
pub struct TestDeviceBuffer {
    bytes: Mutex<Vec<u8>>,
}

impl TestDeviceBuffer {
    pub fn new(bytes: Vec<u8>) -> Arc<Self> {
        Arc::new(TestDeviceBuffer {
            bytes: Mutex::new(bytes),
        })
    }

    pub fn contents(&self) -> Vec<u8> {
        self.bytes.lock().unwrap().clone()
    }
}

impl DeviceBuffer for TestDeviceBuffer {
    fn size(&self) -> u32 {
        self.bytes.lock().unwrap().len() as u32
    }

    fn copy_to_host(&self, dst: &mut [u8]) -> ForgeResult<()> {
        let bytes = self.bytes.lock().unwrap();
        dst.copy_from_slice(&bytes);
        Ok(())
    }

    fn copy_from_host(&self, src: &[u8]) -> ForgeResult<()> {
        let mut bytes = self.bytes.lock().unwrap();
        bytes.copy_from_slice(src);
        Ok(())
    }
}
