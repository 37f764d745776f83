//! Execution plans and the controller cursor that drives them
//!
//! A plan is an immutable value produced by the compiler's partitioner:
//! either a single step covering the whole model on one device, or a
//! sequence of steps, each a sub-model prepared for its own device, wired
//! together through main-model arguments and inter-step temporaries. The
//! only mutable state of an execution in flight lives in its
//! [`Controller`], which is consumed by exactly one execution.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use crate::device::{BurstBuilder, BurstController, Device, OutputShape, PreparedModel};
use crate::error::{ForgeResult, StepForgeError};
use crate::execution::step_executor::{ArgSlot, StepExecutor};
use crate::execution::temporaries::DynamicTemporaries;
use crate::execution::DriveContext;
use crate::memory::RuntimeMemory;
use crate::model::{Model, SourceModels, SourceOperandIndex};
use crate::operand::{size_of_data, Dimensions};

/// Where a step-model input gets its data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepInputSource {
    /// A main-model input, by builder input index
    MainInput(usize),
    /// A main-model output produced by an earlier step, by builder output
    /// index
    MainOutput(usize),
    /// An inter-step temporary, by source-model operand
    Temporary(SourceOperandIndex),
}

/// Where a step-model output goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutputTarget {
    /// A main-model output, by builder output index
    MainOutput(usize),
    /// An inter-step temporary, by source-model operand
    Temporary(SourceOperandIndex),
}

/// One partition of the plan, prepared for one device
#[derive(Debug)]
pub struct ExecutionStep {
    index: usize,
    source_model_index: u32,
    step_model: Arc<Model>,
    device: Arc<dyn Device>,
    prepared_model: Arc<dyn PreparedModel>,
    inputs: Vec<StepInputSource>,
    outputs: Vec<StepOutputTarget>,
    /// Main outputs this step produces that a later step consumes
    downstream_main_outputs: HashSet<usize>,
}

impl ExecutionStep {
    /// Build a step, compiling the step model for its device
    pub fn new(
        index: usize,
        source_model_index: u32,
        step_model: Arc<Model>,
        device: Arc<dyn Device>,
        inputs: Vec<StepInputSource>,
        outputs: Vec<StepOutputTarget>,
    ) -> ForgeResult<Self> {
        if inputs.len() != step_model.input_count() {
            return Err(StepForgeError::BadData(format!(
                "step {}: {} input sources for {} step-model inputs",
                index,
                inputs.len(),
                step_model.input_count()
            )));
        }
        if outputs.len() != step_model.output_count() {
            return Err(StepForgeError::BadData(format!(
                "step {}: {} output targets for {} step-model outputs",
                index,
                outputs.len(),
                step_model.output_count()
            )));
        }
        let prepared_model = device.prepare_model(&step_model)?;
        Ok(ExecutionStep {
            index,
            source_model_index,
            step_model,
            device,
            prepared_model,
            inputs,
            outputs,
            downstream_main_outputs: HashSet::new(),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn source_model_index(&self) -> u32 {
        self.source_model_index
    }

    pub fn step_model(&self) -> &Arc<Model> {
        &self.step_model
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn inputs(&self) -> &[StepInputSource] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[StepOutputTarget] {
        &self.outputs
    }

    pub fn is_downstream_main_output(&self, main_output_index: usize) -> bool {
        self.downstream_main_outputs.contains(&main_output_index)
    }
}

/// A temporary the plan knows about, declared per controller
#[derive(Debug, Clone)]
struct TempDeclaration {
    index: SourceOperandIndex,
    step_index: usize,
    dimensions: Dimensions,
    length: u32,
    dynamic: bool,
}

#[derive(Debug)]
enum PlanBody {
    Simple {
        model: Arc<Model>,
        device: Arc<dyn Device>,
        prepared_model: Arc<dyn PreparedModel>,
    },
    Compound {
        steps: Vec<Arc<ExecutionStep>>,
        source_models: SourceModels,
        temps: Vec<TempDeclaration>,
        has_dynamic_temporaries: bool,
    },
}

/// An immutable partitioned execution plan
#[derive(Debug)]
pub struct ExecutionPlan {
    body: PlanBody,
}

/// The next unit of work the plan yields
pub(crate) struct NextStep {
    pub executor: StepExecutor,
    pub burst: Option<Arc<BurstController>>,
}

impl ExecutionPlan {
    /// A plan that runs the whole model as one step on one device
    pub fn simple(model: Arc<Model>, device: Arc<dyn Device>) -> ForgeResult<Self> {
        let prepared_model = device.prepare_model(&model)?;
        Ok(ExecutionPlan {
            body: PlanBody::Simple {
                model,
                device,
                prepared_model,
            },
        })
    }

    /// A plan of partitioned steps over `source_models`
    pub fn compound(source_models: SourceModels, mut steps: Vec<ExecutionStep>) -> ForgeResult<Self> {
        for (position, step) in steps.iter().enumerate() {
            if step.index != position {
                return Err(StepForgeError::BadData(format!(
                    "step at position {} carries index {}",
                    position, step.index
                )));
            }
        }
        // Main outputs of one step that later steps read back.
        let mut downstream: Vec<HashSet<usize>> = vec![HashSet::new(); steps.len()];
        for (k, step) in steps.iter().enumerate() {
            for target in &step.outputs {
                let StepOutputTarget::MainOutput(main_index) = target else {
                    continue;
                };
                let consumed_later = steps[k + 1..].iter().any(|later| {
                    later
                        .inputs
                        .iter()
                        .any(|source| *source == StepInputSource::MainOutput(*main_index))
                });
                if consumed_later {
                    downstream[k].insert(*main_index);
                }
            }
        }
        for (step, set) in steps.iter_mut().zip(downstream) {
            step.downstream_main_outputs = set;
        }

        // Collect temporary declarations; a temporary is dynamic when its
        // source operand has unspecified dimensions.
        let mut temps: Vec<TempDeclaration> = Vec::new();
        let mut seen: HashMap<SourceOperandIndex, usize> = HashMap::new();
        let mut has_dynamic_temporaries = false;
        for step in &steps {
            for target in &step.outputs {
                let StepOutputTarget::Temporary(source_index) = target else {
                    continue;
                };
                if seen.contains_key(source_index) {
                    return Err(StepForgeError::BadData(format!(
                        "temporary {:?} written by more than one step",
                        source_index
                    )));
                }
                let operand = source_models
                    .model(source_index.0)
                    .operand(source_index.1 as usize);
                let dynamic = operand.has_unspecified_dimensions();
                has_dynamic_temporaries |= dynamic;
                let length = size_of_data(operand.operand_type, &operand.dimensions)?;
                seen.insert(*source_index, step.index);
                temps.push(TempDeclaration {
                    index: *source_index,
                    step_index: step.index,
                    dimensions: operand.dimensions.clone(),
                    length,
                    dynamic,
                });
            }
        }
        // Every consumed temporary must have a producer.
        for step in &steps {
            for source in &step.inputs {
                let StepInputSource::Temporary(source_index) = source else {
                    continue;
                };
                let producer = seen.get(source_index).ok_or_else(|| {
                    StepForgeError::BadData(format!(
                        "temporary {:?} consumed but never produced",
                        source_index
                    ))
                })?;
                if *producer >= step.index {
                    return Err(StepForgeError::BadData(format!(
                        "temporary {:?} consumed by step {} before step {} produces it",
                        source_index, step.index, producer
                    )));
                }
            }
        }

        Ok(ExecutionPlan {
            body: PlanBody::Compound {
                steps: steps.into_iter().map(Arc::new).collect(),
                source_models,
                temps,
                has_dynamic_temporaries,
            },
        })
    }

    pub fn is_simple(&self) -> bool {
        matches!(self.body, PlanBody::Simple { .. })
    }

    pub fn is_simple_cpu(&self) -> bool {
        match &self.body {
            PlanBody::Simple { device, .. } => device.is_cpu(),
            PlanBody::Compound { .. } => false,
        }
    }

    pub fn has_dynamic_temporaries(&self) -> bool {
        match &self.body {
            PlanBody::Simple { .. } => false,
            PlanBody::Compound {
                has_dynamic_temporaries,
                ..
            } => *has_dynamic_temporaries,
        }
    }

    pub fn step_count(&self) -> usize {
        match &self.body {
            PlanBody::Simple { .. } => 1,
            PlanBody::Compound { steps, .. } => steps.len(),
        }
    }

    pub fn source_models(&self) -> Option<&SourceModels> {
        match &self.body {
            PlanBody::Simple { .. } => None,
            PlanBody::Compound { source_models, .. } => Some(source_models),
        }
    }

    /// Allocate the per-execution cursor and temporary state
    pub fn make_controller(&self, burst: Option<Arc<BurstBuilder>>) -> Controller {
        let mut controller = Controller {
            next_step_index: 0,
            fallback_next_step_index: None,
            simple_fallback_used: false,
            dynamic_temporaries: DynamicTemporaries::new(),
            static_temps: HashMap::new(),
            burst,
        };
        if let PlanBody::Compound { temps, .. } = &self.body {
            for temp in temps {
                if temp.dynamic {
                    controller.dynamic_temporaries.declare(
                        temp.index,
                        temp.step_index,
                        temp.dimensions.clone(),
                        temp.length,
                    );
                } else {
                    controller.static_temps.insert(
                        temp.index,
                        StaticTemp {
                            dimensions: temp.dimensions.clone(),
                            length: temp.length,
                            memory: RuntimeMemory::host(temp.length),
                        },
                    );
                }
            }
        }
        controller
    }

    /// Yield the next step's executor, or `None` when the plan is exhausted
    pub(crate) fn next(
        &self,
        controller: &mut Controller,
        ctx: &DriveContext,
        main_output_shapes: Option<&[OutputShape]>,
    ) -> ForgeResult<Option<NextStep>> {
        debug!(cursor = controller.next_step_index, "looking for next step executor");
        match &self.body {
            PlanBody::Simple {
                model,
                device,
                prepared_model,
            } => {
                if controller.next_step_index > 0 {
                    return Ok(None);
                }
                controller.next_step_index = 1;
                let mut executor = StepExecutor::new(
                    None,
                    Arc::clone(model),
                    Arc::clone(device),
                    Some(Arc::clone(prepared_model)),
                    ctx,
                );
                executor.map_trivially(ctx);
                let burst = controller
                    .burst
                    .as_ref()
                    .map(|builder| builder.controller_for_step(0));
                Ok(Some(NextStep { executor, burst }))
            }
            PlanBody::Compound { steps, .. } => {
                let index = controller.next_step_index;
                if index >= steps.len() {
                    return Ok(None);
                }
                controller.fallback_next_step_index = Some(index);
                controller.next_step_index = index + 1;
                let executor =
                    self.dispatch_step(&steps[index], controller, ctx, main_output_shapes)?;
                let burst = controller
                    .burst
                    .as_ref()
                    .map(|builder| builder.controller_for_step(index));
                Ok(Some(NextStep { executor, burst }))
            }
        }
    }

    /// Re-yield the step most recently returned by `next`
    pub(crate) fn fallback(
        &self,
        controller: &mut Controller,
        ctx: &DriveContext,
        main_output_shapes: Option<&[OutputShape]>,
    ) -> ForgeResult<Option<NextStep>> {
        match &self.body {
            PlanBody::Simple { .. } => {
                if controller.next_step_index == 0 || controller.simple_fallback_used {
                    return Err(StepForgeError::OpFailed(
                        "no step available to fall back to".to_string(),
                    ));
                }
                controller.simple_fallback_used = true;
                controller.next_step_index = 0;
                self.next(controller, ctx, main_output_shapes)
            }
            PlanBody::Compound { .. } => {
                let Some(index) = controller.fallback_next_step_index else {
                    return Err(StepForgeError::OpFailed(
                        "no step available to fall back to".to_string(),
                    ));
                };
                controller.next_step_index = index;
                self.next(controller, ctx, main_output_shapes)
            }
        }
    }

    fn dispatch_step(
        &self,
        step: &Arc<ExecutionStep>,
        controller: &mut Controller,
        ctx: &DriveContext,
        main_output_shapes: Option<&[OutputShape]>,
    ) -> ForgeResult<StepExecutor> {
        // Temporaries this step writes must be backed before it runs.
        controller.dynamic_temporaries.allocate(step.index)?;

        let mut executor = StepExecutor::new(
            Some(Arc::clone(step)),
            Arc::clone(step.step_model()),
            Arc::clone(step.device()),
            Some(Arc::clone(&step.prepared_model)),
            ctx,
        );

        for (i, source) in step.inputs.iter().enumerate() {
            match source {
                StepInputSource::MainInput(main_index) => {
                    executor.map_argument(
                        &ctx.inputs[*main_index],
                        ArgSlot::Input(i),
                        &ctx.memories,
                        None,
                    )?;
                }
                StepInputSource::MainOutput(main_index) => {
                    let dims = main_output_shapes
                        .and_then(|shapes| shapes.get(*main_index))
                        .map(|shape| shape.dimensions.as_slice());
                    executor.map_argument(
                        &ctx.outputs[*main_index],
                        ArgSlot::Input(i),
                        &ctx.memories,
                        dims,
                    )?;
                }
                StepInputSource::Temporary(source_index) => {
                    let (dimensions, length, memory) = controller.temp_view(*source_index)?;
                    executor.bind_step_internal(
                        ArgSlot::Input(i),
                        step.step_model().input_operand(i),
                        &memory,
                        0,
                        &dimensions,
                        Some(length),
                    )?;
                }
            }
        }

        for (i, target) in step.outputs.iter().enumerate() {
            match target {
                StepOutputTarget::MainOutput(main_index) => {
                    executor.map_argument(
                        &ctx.outputs[*main_index],
                        ArgSlot::Output(i),
                        &ctx.memories,
                        None,
                    )?;
                }
                StepOutputTarget::Temporary(source_index) => {
                    let (dimensions, length, memory) = controller.temp_view(*source_index)?;
                    executor.bind_step_internal(
                        ArgSlot::Output(i),
                        step.step_model().output_operand(i),
                        &memory,
                        0,
                        &dimensions,
                        Some(length),
                    )?;
                }
            }
        }

        Ok(executor)
    }
}

#[derive(Debug)]
struct StaticTemp {
    dimensions: Dimensions,
    length: u32,
    memory: Arc<RuntimeMemory>,
}

/// Mutable cursor of one execution through a plan
///
/// Owned and consumed by exactly one execution; holds the dynamic
/// temporaries and the buffers backing statically sized temporaries.
#[derive(Debug)]
pub struct Controller {
    next_step_index: usize,
    fallback_next_step_index: Option<usize>,
    simple_fallback_used: bool,
    dynamic_temporaries: DynamicTemporaries,
    static_temps: HashMap<SourceOperandIndex, StaticTemp>,
    burst: Option<Arc<BurstBuilder>>,
}

impl Controller {
    pub(crate) fn dynamic_temporaries_mut(&mut self) -> &mut DynamicTemporaries {
        &mut self.dynamic_temporaries
    }

    pub(crate) fn dynamic_temporaries(&self) -> &DynamicTemporaries {
        &self.dynamic_temporaries
    }

    /// Current declaration and backing buffer of a temporary
    fn temp_view(
        &self,
        index: SourceOperandIndex,
    ) -> ForgeResult<(Dimensions, u32, Arc<RuntimeMemory>)> {
        if let Some(view) = self.dynamic_temporaries.lookup(index) {
            let memory = view.memory.ok_or_else(|| {
                StepForgeError::GeneralFailure(format!(
                    "temporary {:?} used before allocation",
                    index
                ))
            })?;
            return Ok((view.dimensions, view.length, memory));
        }
        let temp = self.static_temps.get(&index).ok_or_else(|| {
            StepForgeError::GeneralFailure(format!("unknown temporary {:?}", index))
        })?;
        Ok((
            temp.dimensions.clone(),
            temp.length,
            Arc::clone(&temp.memory),
        ))
    }
}
