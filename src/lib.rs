//! StepForge - partitioned execution runtime for on-device neural network
//! inference
//!
//! A compiled model arrives as an immutable execution plan partitioned
//! across one or more backends (accelerators plus the CPU reference
//! backend). StepForge binds the plan to caller buffers and drives it step
//! by step: dynamic output shapes propagate between steps, deadlines and
//! loop bounds are honored, insufficient buffers grow and retry, and steps
//! that fail on an accelerator recover on the CPU backend. Executions run
//! blocking, asynchronously, or fenced.

#![allow(clippy::too_many_arguments)] // Backend contracts carry many arguments
#![allow(clippy::result_large_err)] // Error variants carry context strings

pub mod device;
pub mod error;
pub mod execution;
pub mod fence;
pub mod logging;
pub mod memory;
pub mod model;
pub mod operand;
pub mod plan;

pub use device::{
    cpu_device, BurstBuilder, BurstController, CpuDevice, Device, FencedComputeCallback,
    OutputShape, PreparedModel, Timing,
};
pub use error::{Completion, ErrorCategory, ExecStatus, ForgeResult, StepForgeError};
pub use execution::{
    Compilation, DurationKind, DynamicTemporaries, ExecutionBuilder, ExecutionCallback,
    Partitioning, StepExecutor,
};
pub use fence::{FenceState, SyncFence};
pub use memory::{IoRole, MemoryTracker, MemoryValidator, RuntimeMemory};
pub use model::{Model, OpKind, Operation, SourceModels, SourceOperandIndex};
pub use operand::{Dimensions, Operand, OperandSpec, OperandType};
pub use plan::{Controller, ExecutionPlan, ExecutionStep, StepInputSource, StepOutputTarget};
