//! Execution subsystem: bindings, temporaries, step execution, and the
//! builder state machine that drives a partitioned plan

pub mod binding;
pub mod builder;
pub mod callback;
pub mod compilation;
pub mod step_executor;
pub mod temporaries;

use std::time::Duration;

use crate::execution::binding::ArgumentBinding;
use crate::memory::MemoryTracker;

pub use builder::{DurationKind, ExecutionBuilder};
pub use callback::ExecutionCallback;
pub use compilation::{Compilation, Partitioning};
pub use step_executor::{StepExecutor, UpdateOutputShapes};
pub use temporaries::{DynamicTemporaries, MAX_TEMPORARY_LENGTH};

/// Loop timeout applied to control-flow interpretation when the client sets
/// none
pub const LOOP_TIMEOUT_DEFAULT: Duration = Duration::from_secs(2);

/// Upper bound a client-requested loop timeout is clamped to
pub const LOOP_TIMEOUT_MAXIMUM: Duration = Duration::from_secs(15);

/// Frozen snapshot of the builder's configuration taken at ignition
///
/// The drive loop and the plan read bindings from here instead of going
/// back to the (locked) builder; bindings are immutable once the execution
/// has started.
#[derive(Debug, Clone)]
pub(crate) struct DriveContext {
    pub inputs: Vec<ArgumentBinding>,
    pub outputs: Vec<ArgumentBinding>,
    pub memories: MemoryTracker,
    pub measure: bool,
    pub loop_timeout: Option<Duration>,
}
