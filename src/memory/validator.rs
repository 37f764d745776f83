//! Admission and lifecycle validation for memory pools
//!
//! Validators are owned by the memory object; the execution builder is only
//! a consumer. The single write the builder performs on shared state is
//! flipping the initialization bit when an execution finishes.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::error::{ForgeResult, StepForgeError};
use crate::operand::{Dimensions, OperandSpec};

/// Whether a binding uses the pool as an execution input or output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoRole {
    Input,
    Output,
}

/// Metadata a validator maintains about the pool's contents
#[derive(Debug, Clone, Default)]
pub struct MemoryMetadata {
    /// Size in bytes of the data the pool logically holds
    pub logical_size: u32,
    /// Dimensions of the operand the pool was last bound to, if any
    pub dimensions: Dimensions,
}

/// Per-pool admission policy and initialization tracking
pub trait MemoryValidator: Send + Sync + fmt::Debug {
    /// Admit or reject a binding of `(role, index)` with the given region
    fn validate(
        &self,
        role: IoRole,
        index: usize,
        spec: Option<&OperandSpec>,
        offset: u32,
        length: u32,
    ) -> ForgeResult<()>;

    /// Admit or reject the dimensions an input binding carries at compute
    /// time
    fn validate_input_dimensions(&self, _dimensions: &[u32]) -> ForgeResult<()> {
        Ok(())
    }

    /// Record the dimensions an execution determined for the pool's data.
    /// Returns false if the update contradicts earlier metadata.
    fn update_metadata(&self, metadata: MemoryMetadata) -> bool;

    fn metadata(&self) -> MemoryMetadata;

    /// Flip the initialization state after an execution that wrote the pool
    fn set_initialized(&self, initialized: bool);

    fn is_initialized(&self) -> bool;

    /// True when the pool was created for an operand of unknown shape, in
    /// which case the CPU fallback cannot size a replacement buffer for it
    fn created_with_unknown_shape(&self) -> bool {
        false
    }
}

/// Default validator for plain byte pools of known size
///
/// Admits any in-bounds region and the `(offset = 0, length = 0)` shorthand
/// for "the whole pool".
#[derive(Debug)]
pub struct SizedMemoryValidator {
    size: u32,
    initialized: AtomicBool,
    metadata: Mutex<MemoryMetadata>,
    unknown_shape: bool,
}

impl SizedMemoryValidator {
    pub fn new(size: u32) -> Self {
        SizedMemoryValidator {
            size,
            initialized: AtomicBool::new(false),
            metadata: Mutex::new(MemoryMetadata {
                logical_size: size,
                dimensions: Vec::new(),
            }),
            unknown_shape: false,
        }
    }

    /// A validator for a pool whose producing operand has unknown shape
    pub fn with_unknown_shape(size: u32) -> Self {
        SizedMemoryValidator {
            unknown_shape: true,
            ..SizedMemoryValidator::new(size)
        }
    }
}

impl MemoryValidator for SizedMemoryValidator {
    fn validate(
        &self,
        _role: IoRole,
        _index: usize,
        _spec: Option<&OperandSpec>,
        offset: u32,
        length: u32,
    ) -> ForgeResult<()> {
        if offset == 0 && length == 0 {
            return Ok(());
        }
        let end = offset.checked_add(length).ok_or_else(|| {
            StepForgeError::BadData(format!("memory region {}+{} overflows", offset, length))
        })?;
        if end > self.size {
            return Err(StepForgeError::BadData(format!(
                "memory region [{}, {}) exceeds pool of {} bytes",
                offset, end, self.size
            )));
        }
        Ok(())
    }

    fn update_metadata(&self, metadata: MemoryMetadata) -> bool {
        let mut current = self.metadata.lock().expect("validator lock poisoned");
        if !crate::operand::is_updatable(&current.dimensions, &metadata.dimensions)
            && !metadata.dimensions.is_empty()
        {
            return false;
        }
        if !metadata.dimensions.is_empty() {
            current.dimensions = metadata.dimensions;
        }
        if metadata.logical_size != 0 {
            current.logical_size = metadata.logical_size;
        }
        true
    }

    fn metadata(&self) -> MemoryMetadata {
        self.metadata.lock().expect("validator lock poisoned").clone()
    }

    fn set_initialized(&self, initialized: bool) {
        self.initialized.store(initialized, Ordering::Release);
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn created_with_unknown_shape(&self) -> bool {
        self.unknown_shape
    }
}
