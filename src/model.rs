//! Read-only model representation
//!
//! The runtime consumes models produced elsewhere (by a model builder and
//! the compiler's partitioner); it never constructs or rewrites them. A
//! [`Model`] is an operand table, a topologically ordered operation list,
//! and the operand indices that form the model's inputs and outputs. Step
//! models handed to backends use the same representation.

use std::sync::Arc;

use crate::operand::Operand;

/// Operations understood by the CPU reference backend
///
/// Accelerator backends are free to support more; the reference set is the
/// floor every plan can fall back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// Copy input to output
    Identity,
    /// Elementwise max(0, x)
    Relu,
    /// Elementwise addition of two tensors of identical shape
    Add,
    /// Elementwise multiplication of two tensors of identical shape
    Mul,
    /// Concatenation of all inputs along axis 0
    Concat,
}

/// One operation: a kind plus operand indices for its inputs and outputs
#[derive(Debug, Clone)]
pub struct Operation {
    pub kind: OpKind,
    pub inputs: Vec<usize>,
    pub outputs: Vec<usize>,
}

/// An immutable compiled model (main model or step model)
#[derive(Debug, Clone)]
pub struct Model {
    operands: Vec<Operand>,
    operations: Vec<Operation>,
    inputs: Vec<usize>,
    outputs: Vec<usize>,
}

impl Model {
    pub fn new(
        operands: Vec<Operand>,
        operations: Vec<Operation>,
        inputs: Vec<usize>,
        outputs: Vec<usize>,
    ) -> Arc<Self> {
        debug_assert!(inputs.iter().all(|&i| i < operands.len()));
        debug_assert!(outputs.iter().all(|&i| i < operands.len()));
        Arc::new(Model {
            operands,
            operations,
            inputs,
            outputs,
        })
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    pub fn operand(&self, index: usize) -> &Operand {
        &self.operands[index]
    }

    pub fn operand_count(&self) -> usize {
        self.operands.len()
    }

    pub fn input_operand(&self, input_index: usize) -> &Operand {
        &self.operands[self.inputs[input_index]]
    }

    pub fn output_operand(&self, output_index: usize) -> &Operand {
        &self.operands[self.outputs[output_index]]
    }

    pub fn input_operand_index(&self, input_index: usize) -> usize {
        self.inputs[input_index]
    }

    pub fn output_operand_index(&self, output_index: usize) -> usize {
        self.outputs[output_index]
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }
}

/// Index of an operand within a source model: `(source model, operand)`
pub type SourceOperandIndex = (u32, u32);

/// The source models a compound plan's steps were partitioned from
#[derive(Debug, Clone, Default)]
pub struct SourceModels {
    models: Vec<Arc<Model>>,
}

impl SourceModels {
    pub fn new(models: Vec<Arc<Model>>) -> Self {
        SourceModels { models }
    }

    pub fn model(&self, index: u32) -> &Arc<Model> {
        &self.models[index as usize]
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
