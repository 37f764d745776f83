//! Insufficient-size recovery through dynamic temporaries, and the
//! monotonicity property that makes the retry loop terminate.

mod common;

use std::sync::Arc;

use common::{f32_bytes, f32_from_bytes, unary_model, ScriptedDevice, ScriptedResponse};
use proptest::prelude::*;
use stepforge::execution::temporaries::{DynamicTemporaries, MAX_TEMPORARY_LENGTH};
use stepforge::operand::is_updatable;
use stepforge::{
    Compilation, Completion, ExecutionBuilder, ExecutionPlan, ExecutionStep, Model, OpKind,
    Operand, OperandType, Operation, OutputShape, StepInputSource, StepOutputTarget,
};
use stepforge::{Partitioning, SourceModels};

/// Producer writes a dynamic temporary, consumer forwards it to the main
/// output. The producer first reports insufficient size for the temporary;
/// the driver redeclares it, retries the same step, and converges.
#[test]
fn insufficient_size_retry_converges() {
    let device = ScriptedDevice::new("npu0");

    // Main model: in[3,5] -> identity -> temp[?,?] -> identity -> out[?,?].
    let main = Model::new(
        vec![
            Operand::tensor(OperandType::TensorFloat32, vec![3, 5]),
            Operand::tensor(OperandType::TensorFloat32, vec![0, 0]),
            Operand::tensor(OperandType::TensorFloat32, vec![0, 0]),
        ],
        vec![
            Operation {
                kind: OpKind::Identity,
                inputs: vec![0],
                outputs: vec![1],
            },
            Operation {
                kind: OpKind::Identity,
                inputs: vec![1],
                outputs: vec![2],
            },
        ],
        vec![0],
        vec![2],
    );
    let source_models = SourceModels::new(vec![Arc::clone(&main)]);

    let producer = ExecutionStep::new(
        0,
        0,
        unary_model(OpKind::Identity, vec![3, 5], vec![0, 0]),
        device.clone() as Arc<dyn stepforge::Device>,
        vec![StepInputSource::MainInput(0)],
        vec![StepOutputTarget::Temporary((0, 1))],
    )
    .unwrap();
    let consumer = ExecutionStep::new(
        1,
        0,
        unary_model(OpKind::Identity, vec![0, 0], vec![0, 0]),
        device.clone() as Arc<dyn stepforge::Device>,
        vec![StepInputSource::Temporary((0, 1))],
        vec![StepOutputTarget::MainOutput(0)],
    )
    .unwrap();

    let plan = Arc::new(ExecutionPlan::compound(source_models, vec![producer, consumer]).unwrap());
    assert!(plan.has_dynamic_temporaries());
    let compilation = Compilation::new(plan, main);
    let builder = ExecutionBuilder::new(&compilation);

    // First dispatch of the producer: the temporary is too small; the
    // backend reports the real shape. The retry (and everything after)
    // delegates to real compute.
    device.push(ScriptedResponse::Insufficient(vec![
        OutputShape::insufficient(vec![3, 5]),
    ]));

    let values: Vec<f32> = (0..15).map(|v| v as f32).collect();
    let input = f32_bytes(&values);
    let mut output = [0u8; 60];
    builder.set_input(0, None, Some(&input)).unwrap();
    builder.set_output(0, None, Some(&mut output)).unwrap();

    builder.compute().unwrap();
    assert_eq!(builder.completed_with().unwrap(), Completion::NoError);
    assert_eq!(builder.output_operand_dimensions(0).unwrap(), vec![3, 5]);
    assert_eq!(f32_from_bytes(&output), values);
}

/// When the backend keeps reporting insufficient size without teaching the
/// driver anything new about the temporary, the retry loop stops instead
/// of looping forever. No main output is actually insufficient, so the
/// finish-time shape validation downgrades the status to a general
/// failure.
#[test]
fn unproductive_insufficient_size_surfaces() {
    let device = ScriptedDevice::new("npu0");

    let main = Model::new(
        vec![
            Operand::tensor(OperandType::TensorFloat32, vec![3, 5]),
            Operand::tensor(OperandType::TensorFloat32, vec![0, 0]),
            Operand::tensor(OperandType::TensorFloat32, vec![0, 0]),
        ],
        vec![
            Operation {
                kind: OpKind::Identity,
                inputs: vec![0],
                outputs: vec![1],
            },
            Operation {
                kind: OpKind::Identity,
                inputs: vec![1],
                outputs: vec![2],
            },
        ],
        vec![0],
        vec![2],
    );
    let source_models = SourceModels::new(vec![Arc::clone(&main)]);
    let producer = ExecutionStep::new(
        0,
        0,
        unary_model(OpKind::Identity, vec![3, 5], vec![0, 0]),
        device.clone() as Arc<dyn stepforge::Device>,
        vec![StepInputSource::MainInput(0)],
        vec![StepOutputTarget::Temporary((0, 1))],
    )
    .unwrap();
    let consumer = ExecutionStep::new(
        1,
        0,
        unary_model(OpKind::Identity, vec![0, 0], vec![0, 0]),
        device.clone() as Arc<dyn stepforge::Device>,
        vec![StepInputSource::Temporary((0, 1))],
        vec![StepOutputTarget::MainOutput(0)],
    )
    .unwrap();
    let plan = Arc::new(ExecutionPlan::compound(source_models, vec![producer, consumer]).unwrap());
    let compilation =
        Compilation::new(plan, main).with_partitioning(Partitioning::WithoutFallback);
    let builder = ExecutionBuilder::new(&compilation);

    // The same shape twice: the first report redeclares (3,5) and grows
    // the buffer; the second teaches nothing new and must be terminal.
    device.push(ScriptedResponse::Insufficient(vec![
        OutputShape::insufficient(vec![3, 5]),
    ]));
    device.push(ScriptedResponse::Insufficient(vec![
        OutputShape::insufficient(vec![3, 5]),
    ]));

    let input = f32_bytes(&[0.0; 15]);
    let mut output = [0u8; 60];
    builder.set_input(0, None, Some(&input)).unwrap();
    builder.set_output(0, None, Some(&mut output)).unwrap();

    assert!(matches!(
        builder.compute(),
        Err(stepforge::StepForgeError::GeneralFailure(_))
    ));
    assert_eq!(builder.completed_with().unwrap(), Completion::OtherError);
}

proptest! {
    /// Across any sequence of redeclarations, dimensions form a chain
    /// under refinement and length never decreases or exceeds the cap.
    #[test]
    fn redeclaration_is_monotonic(
        updates in proptest::collection::vec(
            (proptest::collection::vec(0u32..6, 2), 0u32..4096),
            1..24,
        )
    ) {
        let mut temps = DynamicTemporaries::new();
        temps.declare((0, 0), 0, vec![0, 0], 1);
        let mut prev = temps.lookup((0, 0)).unwrap();
        for (dims, length) in updates {
            let before = temps.lookup((0, 0)).unwrap();
            match temps.redeclare((0, 0), &dims, length) {
                Ok(changed) => {
                    let after = temps.lookup((0, 0)).unwrap();
                    prop_assert!(is_updatable(&prev.dimensions, &after.dimensions));
                    prop_assert!(after.length >= prev.length);
                    prop_assert!(after.length <= MAX_TEMPORARY_LENGTH);
                    if !changed {
                        prop_assert_eq!(&before.dimensions, &after.dimensions);
                        prop_assert_eq!(before.length, after.length);
                    }
                    prev = after;
                }
                Err(_) => {
                    // A rejected update must leave the declaration intact.
                    let after = temps.lookup((0, 0)).unwrap();
                    prop_assert_eq!(&before.dimensions, &after.dimensions);
                    prop_assert_eq!(before.length, after.length);
                }
            }
        }
    }

    /// Productive redeclarations are finite: every accepted change either
    /// specializes a dimension or grows the length, so a driver that only
    /// retries on change cannot loop forever.
    #[test]
    fn accepted_changes_make_progress(
        updates in proptest::collection::vec(
            (proptest::collection::vec(0u32..4, 2), 0u32..512),
            1..16,
        )
    ) {
        let mut temps = DynamicTemporaries::new();
        temps.declare((0, 0), 0, vec![0, 0], 1);
        for (dims, length) in updates {
            let before = temps.lookup((0, 0)).unwrap();
            if let Ok(true) = temps.redeclare((0, 0), &dims, length) {
                let after = temps.lookup((0, 0)).unwrap();
                let specialized = after.dimensions.iter().filter(|&&d| d != 0).count()
                    > before.dimensions.iter().filter(|&&d| d != 0).count();
                let grew = after.length > before.length;
                prop_assert!(specialized || grew);
            }
        }
    }
}
