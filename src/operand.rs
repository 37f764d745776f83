//! Operand descriptors and dimension arithmetic
//!
//! Dimensions use `0` to mean "unspecified along this axis"; an empty
//! dimension vector on a tensor operand means the rank itself is unknown.
//! Fully-specified dimension vectors are upper bounds of the refinement
//! partial order checked by [`is_updatable`], which is what makes
//! insufficient-size retry terminate (see `execution::temporaries`).

use crate::error::{ForgeResult, StepForgeError};

/// Dimension vector of a tensor operand; `0` marks an unspecified axis.
pub type Dimensions = Vec<u32>;

/// Operand element types understood by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandType {
    /// Scalar 32-bit float
    Float32,
    /// Scalar 32-bit signed integer
    Int32,
    /// Scalar boolean
    Bool,
    /// Tensor of 32-bit floats
    TensorFloat32,
    /// Tensor of 32-bit signed integers
    TensorInt32,
    /// Tensor of asymmetric quantized 8-bit values
    TensorQuant8Asymm,
}

impl OperandType {
    pub fn is_tensor(self) -> bool {
        matches!(
            self,
            OperandType::TensorFloat32 | OperandType::TensorInt32 | OperandType::TensorQuant8Asymm
        )
    }

    /// Size in bytes of one element of this type
    pub fn element_size(self) -> u32 {
        match self {
            OperandType::Float32 | OperandType::TensorFloat32 => 4,
            OperandType::Int32 | OperandType::TensorInt32 => 4,
            OperandType::Bool | OperandType::TensorQuant8Asymm => 1,
        }
    }
}

/// Descriptor of one model operand
#[derive(Debug, Clone, PartialEq)]
pub struct Operand {
    pub operand_type: OperandType,
    pub dimensions: Dimensions,
    pub scale: f32,
    pub zero_point: i32,
}

impl Operand {
    pub fn tensor(operand_type: OperandType, dimensions: Dimensions) -> Self {
        debug_assert!(operand_type.is_tensor());
        Operand {
            operand_type,
            dimensions,
            scale: 0.0,
            zero_point: 0,
        }
    }

    pub fn scalar(operand_type: OperandType) -> Self {
        debug_assert!(!operand_type.is_tensor());
        Operand {
            operand_type,
            dimensions: Vec::new(),
            scale: 0.0,
            zero_point: 0,
        }
    }

    pub fn is_tensor(&self) -> bool {
        self.operand_type.is_tensor()
    }

    /// True if the operand has unknown rank or at least one unspecified axis
    pub fn has_unspecified_dimensions(&self) -> bool {
        self.is_tensor() && (self.dimensions.is_empty() || self.dimensions.contains(&0))
    }
}

/// Caller-supplied override of an operand's type at bind time
///
/// The override may only concretize unspecified dimensions; it must agree
/// with the declared type, scale, and zero point.
#[derive(Debug, Clone, PartialEq)]
pub struct OperandSpec {
    pub operand_type: OperandType,
    pub dimensions: Dimensions,
    pub scale: f32,
    pub zero_point: i32,
}

impl OperandSpec {
    pub fn new(operand_type: OperandType, dimensions: Dimensions) -> Self {
        OperandSpec {
            operand_type,
            dimensions,
            scale: 0.0,
            zero_point: 0,
        }
    }
}

/// Size in bytes of data of `operand_type` with the given dimensions
///
/// Returns `Ok(0)` when the dimensions contain an unspecified (or genuinely
/// zero-sized) axis and an error when the product overflows `u32`.
pub fn size_of_data(operand_type: OperandType, dimensions: &[u32]) -> ForgeResult<u32> {
    if !operand_type.is_tensor() {
        return Ok(operand_type.element_size());
    }
    let mut size: u32 = operand_type.element_size();
    for &d in dimensions {
        size = size.checked_mul(d).ok_or_else(|| {
            StepForgeError::BadData(format!(
                "operand size overflows u32: dimensions {:?}",
                dimensions
            ))
        })?;
    }
    if dimensions.is_empty() {
        // Unknown rank: size is unknown, reported as zero.
        return Ok(0);
    }
    Ok(size)
}

/// Check whether dimensions `to` may be updated by dimensions `from`
///
/// `from` must be at no lower a specification level: equal at every
/// fully-specified axis of `to`, free to concretize axes `to` leaves at
/// zero. An empty `to` (unknown rank) accepts anything.
pub fn is_updatable(to: &[u32], from: &[u32]) -> bool {
    if to.is_empty() {
        return true;
    }
    if to.len() != from.len() {
        return false;
    }
    to.iter().zip(from).all(|(&t, &f)| t == f || t == 0)
}

/// Merge an update into `to`, keeping any axis `from` leaves unspecified
pub fn merge_dimensions(to: &[u32], from: &[u32]) -> Dimensions {
    if to.is_empty() {
        return from.to_vec();
    }
    debug_assert_eq!(to.len(), from.len());
    to.iter()
        .zip(from)
        .map(|(&t, &f)| if f != 0 { f } else { t })
        .collect()
}

/// Validate a bind-time operand override against the declared operand
///
/// With no override, a fully-specified operand is demanded unless
/// `allow_unspecified` (outputs may leave dimensions to the backend; absent
/// arguments carry no data at all).
pub fn check_dimension_info(
    operand: &Operand,
    spec: Option<&OperandSpec>,
    tag: &str,
    allow_unspecified: bool,
) -> ForgeResult<()> {
    let Some(spec) = spec else {
        if !allow_unspecified && operand.has_unspecified_dimensions() {
            return Err(StepForgeError::BadData(format!(
                "{}: operand type is not fully specified",
                tag
            )));
        }
        return Ok(());
    };

    if spec.operand_type != operand.operand_type {
        return Err(StepForgeError::BadData(format!(
            "{}: override changes the operand type",
            tag
        )));
    }
    if spec.scale != operand.scale || spec.zero_point != operand.zero_point {
        return Err(StepForgeError::BadData(format!(
            "{}: override changes quantization parameters",
            tag
        )));
    }
    if !allow_unspecified
        && operand.is_tensor()
        && (spec.dimensions.is_empty() || spec.dimensions.contains(&0))
    {
        return Err(StepForgeError::BadData(format!(
            "{}: override is not fully specified",
            tag
        )));
    }
    if operand.dimensions.is_empty() {
        return Ok(());
    }
    if operand.dimensions.len() != spec.dimensions.len() {
        return Err(StepForgeError::BadData(format!(
            "{}: override has incompatible dimension count",
            tag
        )));
    }
    for (i, (&declared, &wanted)) in operand.dimensions.iter().zip(&spec.dimensions).enumerate() {
        if declared != wanted && declared != 0 {
            return Err(StepForgeError::BadData(format!(
                "{}: overriding fully specified dimension {} is disallowed",
                tag, i
            )));
        }
    }
    Ok(())
}
