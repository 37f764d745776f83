//! Argument bindings: how each model input and output is sourced
//!
//! A binding starts `Unspecified` and is bound at most once, to caller
//! memory (a raw pointer captured from a slice), to a region of a
//! [`RuntimeMemory`] pool, or to nothing at all for optional operands. The
//! constructors run every admission check; there is no way to build a
//! binding that skipped them.

use std::sync::Arc;

use crate::error::{ForgeResult, StepForgeError};
use crate::memory::RuntimeMemory;
use crate::operand::{
    check_dimension_info, size_of_data, Dimensions, Operand, OperandSpec,
};

/// Raw caller pointer that may cross into the execution worker thread
///
/// SAFETY: the execution API contract requires the caller to keep bound
/// buffers alive and unaliased from ignition until the execution finishes;
/// within that window the runtime is the only accessor, and accesses from
/// the worker thread are serialized by the execution lifecycle.
#[derive(Debug, Clone, Copy)]
pub struct SendPtr(*mut u8);

unsafe impl Send for SendPtr {}
unsafe impl Sync for SendPtr {}

impl SendPtr {
    pub(crate) fn new(ptr: *mut u8) -> Self {
        SendPtr(ptr)
    }

    pub(crate) unsafe fn as_slice<'a>(self, len: usize) -> &'a [u8] {
        std::slice::from_raw_parts(self.0 as *const u8, len)
    }

    pub(crate) unsafe fn as_slice_mut<'a>(self, len: usize) -> &'a mut [u8] {
        std::slice::from_raw_parts_mut(self.0, len)
    }

    fn is_null(self) -> bool {
        self.0.is_null()
    }
}

/// Where a bound argument's bytes live
#[derive(Debug, Clone)]
pub enum ArgumentSource {
    /// Not yet bound
    Unspecified,
    /// Bound to nothing (optional operand)
    NoValue,
    /// Caller memory
    Pointer { ptr: SendPtr, length: u32 },
    /// Region of a memory pool, by index into the owner's pool table
    Memory {
        pool_index: u32,
        offset: u32,
        length: u32,
    },
}

/// Coarse binding state, for checks that only care about the variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingState {
    Unspecified,
    NoValue,
    Pointer,
    Memory,
}

/// One model input or output binding, plus the shape knowledge attached to
/// it over the execution's lifetime
#[derive(Debug, Clone)]
pub struct ArgumentBinding {
    source: ArgumentSource,
    dimensions: Dimensions,
    is_sufficient: bool,
}

impl ArgumentBinding {
    pub fn unspecified() -> Self {
        ArgumentBinding {
            source: ArgumentSource::Unspecified,
            dimensions: Vec::new(),
            is_sufficient: true,
        }
    }

    pub fn no_value() -> Self {
        ArgumentBinding {
            source: ArgumentSource::NoValue,
            dimensions: Vec::new(),
            is_sufficient: true,
        }
    }

    /// Bind caller memory to an operand
    ///
    /// `allow_unspecified` is true for outputs, whose dimensions the
    /// backend may supply.
    pub fn from_pointer(
        operand: &Operand,
        spec: Option<&OperandSpec>,
        ptr: *mut u8,
        length: usize,
        tag: &str,
        allow_unspecified: bool,
    ) -> ForgeResult<Self> {
        check_dimension_info(operand, spec, tag, allow_unspecified)?;
        let length = u32::try_from(length)
            .map_err(|_| StepForgeError::BadData(format!("{}: length exceeds u32", tag)))?;
        let ptr = SendPtr::new(ptr);
        if ptr.is_null() && length > 0 {
            return Err(StepForgeError::BadData(format!(
                "{}: null buffer with nonzero length",
                tag
            )));
        }
        let dimensions = Self::bound_dimensions(operand, spec);
        Self::check_length(operand, &dimensions, length, tag)?;
        Ok(ArgumentBinding {
            source: ArgumentSource::Pointer { ptr, length },
            dimensions,
            is_sufficient: true,
        })
    }

    /// Bind a memory-pool region to an operand
    pub fn from_memory(
        operand: &Operand,
        spec: Option<&OperandSpec>,
        pool_index: u32,
        offset: u32,
        length: u32,
        tag: &str,
        allow_unspecified: bool,
    ) -> ForgeResult<Self> {
        check_dimension_info(operand, spec, tag, allow_unspecified)?;
        let dimensions = Self::bound_dimensions(operand, spec);
        Self::check_length(operand, &dimensions, length, tag)?;
        Ok(ArgumentBinding {
            source: ArgumentSource::Memory {
                pool_index,
                offset,
                length,
            },
            dimensions,
            is_sufficient: true,
        })
    }

    /// Bind a step-private pool region without caller-facing checks
    ///
    /// Used for temporaries the plan itself owns; the pool and region were
    /// sized by the runtime.
    pub(crate) fn internal_memory(
        dimensions: Dimensions,
        pool_index: u32,
        offset: u32,
        length: u32,
    ) -> Self {
        ArgumentBinding {
            source: ArgumentSource::Memory {
                pool_index,
                offset,
                length,
            },
            dimensions,
            is_sufficient: true,
        }
    }

    fn bound_dimensions(operand: &Operand, spec: Option<&OperandSpec>) -> Dimensions {
        match spec {
            Some(spec) => spec.dimensions.clone(),
            None => operand.dimensions.clone(),
        }
    }

    /// For fully specified operands the bound length must match the data
    /// size exactly; partially specified operands accept any length.
    fn check_length(
        operand: &Operand,
        dimensions: &[u32],
        length: u32,
        tag: &str,
    ) -> ForgeResult<()> {
        if operand.is_tensor() && (dimensions.is_empty() || dimensions.contains(&0)) {
            return Ok(());
        }
        let expected = size_of_data(operand.operand_type, dimensions)?;
        if length != expected {
            return Err(StepForgeError::BadData(format!(
                "{}: length {} does not match operand size {}",
                tag, length, expected
            )));
        }
        Ok(())
    }

    pub fn state(&self) -> BindingState {
        match self.source {
            ArgumentSource::Unspecified => BindingState::Unspecified,
            ArgumentSource::NoValue => BindingState::NoValue,
            ArgumentSource::Pointer { .. } => BindingState::Pointer,
            ArgumentSource::Memory { .. } => BindingState::Memory,
        }
    }

    pub fn is_unspecified(&self) -> bool {
        self.state() == BindingState::Unspecified
    }

    pub fn source(&self) -> &ArgumentSource {
        &self.source
    }

    pub fn dimensions(&self) -> &Dimensions {
        &self.dimensions
    }

    pub fn set_dimensions(&mut self, dimensions: Dimensions) {
        self.dimensions = dimensions;
    }

    pub fn is_sufficient(&self) -> bool {
        self.is_sufficient
    }

    pub fn set_sufficient(&mut self, sufficient: bool) {
        self.is_sufficient = sufficient;
    }

    /// Bound length in bytes, if the binding carries data
    pub fn length(&self) -> Option<u32> {
        match self.source {
            ArgumentSource::Pointer { length, .. } | ArgumentSource::Memory { length, .. } => {
                Some(length)
            }
            _ => None,
        }
    }

    pub fn pool_index(&self) -> Option<u32> {
        match self.source {
            ArgumentSource::Memory { pool_index, .. } => Some(pool_index),
            _ => None,
        }
    }

    pub(crate) fn set_pool_index(&mut self, new_index: u32) {
        if let ArgumentSource::Memory { pool_index, .. } = &mut self.source {
            *pool_index = new_index;
        }
    }

    /// Copy out the bytes this binding references
    pub(crate) fn read_bytes(&self, memories: &[Arc<RuntimeMemory>]) -> ForgeResult<Vec<u8>> {
        match &self.source {
            ArgumentSource::Unspecified => Err(StepForgeError::BadState(
                "reading an unspecified argument".to_string(),
            )),
            ArgumentSource::NoValue => Ok(Vec::new()),
            ArgumentSource::Pointer { ptr, length } => {
                // SAFETY: see SendPtr; the buffer is live for the execution.
                Ok(unsafe { ptr.as_slice(*length as usize) }.to_vec())
            }
            ArgumentSource::Memory {
                pool_index,
                offset,
                length,
            } => memories[*pool_index as usize]
                .with_bytes(*offset, *length, |bytes| bytes.to_vec()),
        }
    }

    /// Write `data` into the destination this binding references
    ///
    /// The caller checks capacity first; a short destination is an error
    /// here, not an insufficient-size report.
    pub(crate) fn write_bytes(
        &self,
        memories: &[Arc<RuntimeMemory>],
        data: &[u8],
    ) -> ForgeResult<()> {
        match &self.source {
            ArgumentSource::Unspecified | ArgumentSource::NoValue => Err(StepForgeError::BadState(
                "writing an argument that has no destination".to_string(),
            )),
            ArgumentSource::Pointer { ptr, length } => {
                if (*length as usize) < data.len() {
                    return Err(StepForgeError::BadData(format!(
                        "destination of {} bytes cannot hold {} bytes",
                        length,
                        data.len()
                    )));
                }
                // SAFETY: see SendPtr; the buffer is live for the execution.
                unsafe { ptr.as_slice_mut(data.len()) }.copy_from_slice(data);
                Ok(())
            }
            ArgumentSource::Memory {
                pool_index,
                offset,
                length,
            } => {
                if (*length as usize) < data.len() {
                    return Err(StepForgeError::BadData(format!(
                        "destination of {} bytes cannot hold {} bytes",
                        length,
                        data.len()
                    )));
                }
                memories[*pool_index as usize].with_bytes_mut(
                    *offset,
                    data.len() as u32,
                    |bytes| bytes.copy_from_slice(data),
                )
            }
        }
    }
}
