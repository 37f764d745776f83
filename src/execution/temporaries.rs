//! Dynamic temporaries: inter-step tensors of initially unknown size
//!
//! A dynamic temporary is declared when a controller is created and
//! redeclared as executions learn more about it. Redeclaration is
//! monotonic, enforced here rather than at call sites: dimensions may only
//! move toward fully specified, and length may only grow, bounded by
//! `u32::MAX / 2`. Every accepted change strictly shrinks the distance to a
//! fully specified shape or strictly grows a bounded length, so a step can
//! only be retried a finite number of times.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{ForgeResult, StepForgeError};
use crate::memory::RuntimeMemory;
use crate::model::SourceOperandIndex;
use crate::operand::{is_updatable, merge_dimensions, Dimensions};

/// Length above which the next doubling would overflow; redeclaring past it
/// is a hard failure.
pub const MAX_TEMPORARY_LENGTH: u32 = u32::MAX / 2;

#[derive(Debug)]
struct Temporary {
    /// Index of the plan step that writes this temporary
    step_index: usize,
    dimensions: Dimensions,
    length: u32,
    memory: Option<Arc<RuntimeMemory>>,
}

/// A read-only view of one temporary's current declaration
#[derive(Debug, Clone)]
pub struct TemporaryView {
    pub dimensions: Dimensions,
    pub length: u32,
    pub memory: Option<Arc<RuntimeMemory>>,
}

/// The set of dynamic temporaries owned by one plan controller
#[derive(Debug, Default)]
pub struct DynamicTemporaries {
    temporaries: HashMap<SourceOperandIndex, Temporary>,
}

impl DynamicTemporaries {
    pub fn new() -> Self {
        DynamicTemporaries::default()
    }

    pub fn is_empty(&self) -> bool {
        self.temporaries.is_empty()
    }

    /// Declare a temporary written by `step_index`
    ///
    /// `initial_length` of zero gets a one-element floor so the first
    /// dispatch has a real buffer to report against.
    pub fn declare(
        &mut self,
        index: SourceOperandIndex,
        step_index: usize,
        initial_dimensions: Dimensions,
        initial_length: u32,
    ) {
        debug_assert!(!self.temporaries.contains_key(&index));
        self.temporaries.insert(
            index,
            Temporary {
                step_index,
                dimensions: initial_dimensions,
                length: initial_length.max(1),
                memory: None,
            },
        );
    }

    /// Record new knowledge about a temporary's shape or size
    ///
    /// Returns whether anything changed. Non-monotonic updates and lengths
    /// past [`MAX_TEMPORARY_LENGTH`] are hard failures.
    pub fn redeclare(
        &mut self,
        index: SourceOperandIndex,
        dimensions: &[u32],
        length: u32,
    ) -> ForgeResult<bool> {
        let temp = self.temporaries.get_mut(&index).ok_or_else(|| {
            StepForgeError::GeneralFailure(format!(
                "redeclaring unknown temporary {:?}",
                index
            ))
        })?;
        if !is_updatable(&temp.dimensions, dimensions) {
            return Err(StepForgeError::GeneralFailure(format!(
                "non-monotonic redeclaration of temporary {:?}: {:?} -> {:?}",
                index, temp.dimensions, dimensions
            )));
        }
        if length > MAX_TEMPORARY_LENGTH {
            return Err(StepForgeError::GeneralFailure(format!(
                "temporary {:?} length {} exceeds cap {}",
                index, length, MAX_TEMPORARY_LENGTH
            )));
        }

        let merged = merge_dimensions(&temp.dimensions, dimensions);
        let dims_changed = merged != temp.dimensions;
        let grew = length > temp.length;
        if !dims_changed && !grew {
            return Ok(false);
        }
        temp.dimensions = merged;
        if grew {
            temp.length = length;
            // Existing buffer is now too small; the next allocate() for the
            // producing step replaces it.
            if let Some(memory) = &temp.memory {
                if memory.size() < temp.length {
                    temp.memory = None;
                }
            }
        }
        Ok(true)
    }

    /// Ensure every temporary written by `step_index` has a buffer of its
    /// current length
    pub fn allocate(&mut self, step_index: usize) -> ForgeResult<()> {
        for temp in self.temporaries.values_mut() {
            if temp.step_index != step_index {
                continue;
            }
            let needs_buffer = match &temp.memory {
                Some(memory) => memory.size() < temp.length,
                None => true,
            };
            if needs_buffer {
                temp.memory = Some(RuntimeMemory::host(temp.length));
            }
        }
        Ok(())
    }

    /// True iff every temporary written by `step_index` is backed by a
    /// buffer of sufficient size
    pub fn allocated(&self, step_index: usize) -> bool {
        self.temporaries
            .values()
            .filter(|temp| temp.step_index == step_index)
            .all(|temp| {
                temp.memory
                    .as_ref()
                    .is_some_and(|memory| memory.size() >= temp.length)
            })
    }

    pub fn lookup(&self, index: SourceOperandIndex) -> Option<TemporaryView> {
        self.temporaries.get(&index).map(|temp| TemporaryView {
            dimensions: temp.dimensions.clone(),
            length: temp.length,
            memory: temp.memory.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMP: SourceOperandIndex = (0, 3);

    #[test]
    fn test_declare_and_lookup() {
        let mut temps = DynamicTemporaries::new();
        assert!(temps.is_empty());
        temps.declare(TEMP, 0, vec![0, 0], 0);
        let view = temps.lookup(TEMP).unwrap();
        assert_eq!(view.dimensions, vec![0, 0]);
        assert_eq!(view.length, 1);
        assert!(view.memory.is_none());
        assert!(temps.lookup((0, 9)).is_none());
    }

    #[test]
    fn test_redeclare_specializes_and_grows() {
        let mut temps = DynamicTemporaries::new();
        temps.declare(TEMP, 0, vec![0, 0], 4);
        assert!(temps.redeclare(TEMP, &[3, 5], 60).unwrap());
        let view = temps.lookup(TEMP).unwrap();
        assert_eq!(view.dimensions, vec![3, 5]);
        assert_eq!(view.length, 60);
        // Same declaration again: nothing changed.
        assert!(!temps.redeclare(TEMP, &[3, 5], 60).unwrap());
        // Smaller length without new shape knowledge: nothing changed.
        assert!(!temps.redeclare(TEMP, &[3, 5], 30).unwrap());
        assert_eq!(temps.lookup(TEMP).unwrap().length, 60);
    }

    #[test]
    fn test_redeclare_rejects_contradiction() {
        let mut temps = DynamicTemporaries::new();
        temps.declare(TEMP, 0, vec![0, 0], 4);
        temps.redeclare(TEMP, &[3, 5], 60).unwrap();
        assert!(temps.redeclare(TEMP, &[4, 5], 80).is_err());
        assert!(temps.redeclare(TEMP, &[3], 60).is_err());
    }

    #[test]
    fn test_redeclare_caps_length() {
        let mut temps = DynamicTemporaries::new();
        temps.declare(TEMP, 0, vec![0], 4);
        assert!(temps.redeclare(TEMP, &[0], MAX_TEMPORARY_LENGTH).is_ok());
        assert!(temps
            .redeclare(TEMP, &[0], MAX_TEMPORARY_LENGTH + 1)
            .is_err());
    }

    #[test]
    fn test_allocate_tracks_growth() {
        let mut temps = DynamicTemporaries::new();
        temps.declare(TEMP, 2, vec![0, 0], 16);
        assert!(!temps.allocated(2));
        temps.allocate(2).unwrap();
        assert!(temps.allocated(2));
        let first = temps.lookup(TEMP).unwrap().memory.unwrap();
        assert_eq!(first.size(), 16);

        // Growth invalidates the buffer until the next allocate.
        temps.redeclare(TEMP, &[3, 5], 60).unwrap();
        assert!(!temps.allocated(2));
        temps.allocate(2).unwrap();
        assert!(temps.allocated(2));
        assert!(temps.lookup(TEMP).unwrap().memory.unwrap().size() >= 60);
    }

    #[test]
    fn test_allocated_vacuous_for_step_without_temps() {
        let mut temps = DynamicTemporaries::new();
        temps.declare(TEMP, 0, vec![0], 4);
        assert!(temps.allocated(7));
    }
}
