//! Dependency units: the conditions a node declares before a processing step.

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::id::{FenceHandle, RequestId, TagId};

/// Maximum fences in one unit.
pub const MAX_DEPENDENT_FENCES: usize = 32;
/// Maximum properties in one unit.
pub const MAX_PROPERTIES: usize = 32;

/// Explicit flag set; no bitfield layout is implied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DependencyFlags {
    pub has_property_dependency: bool,
    pub has_fence_dependency: bool,
    pub has_io_buffer_availability_dependency: bool,
    /// May be dropped when the pipeline stops.
    pub is_preemptable: bool,
    /// Resolved by base scheduling logic, not by the node's own execution.
    pub is_internal_dependency: bool,
}

impl DependencyFlags {
    pub fn any_condition(&self) -> bool {
        self.has_property_dependency
            || self.has_fence_dependency
            || self.has_io_buffer_availability_dependency
    }
}

/// One property (or metadata tag) that must be published for the request
/// `current - offset` (`current + offset` when `negate` is set).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyRequirement {
    pub tag: TagId,
    pub offset: u64,
    pub negate: bool,
}

impl PropertyRequirement {
    pub fn current(tag: TagId) -> Self {
        Self {
            tag,
            offset: 0,
            negate: false,
        }
    }

    /// Property of an earlier request.
    pub fn previous(tag: TagId, offset: u64) -> Self {
        Self {
            tag,
            offset,
            negate: false,
        }
    }

    /// The request the property is read from. `None` when the offset points
    /// before request 0; such a requirement is satisfied trivially.
    pub fn addressed_request(&self, current: RequestId) -> Option<RequestId> {
        if self.negate {
            current.checked_add(self.offset)
        } else {
            current.checked_sub(self.offset)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceKind {
    /// Guards an input buffer.
    Buffer,
    /// Externally supplied fence.
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FenceRequirement {
    pub fence: FenceHandle,
    pub kind: FenceKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyUnit {
    pub flags: DependencyFlags,
    pub properties: Vec<PropertyRequirement>,
    pub fences: Vec<FenceRequirement>,
    /// Returned to the node when the unit is satisfied so it can resume.
    pub process_sequence_id: u32,
}

impl DependencyUnit {
    pub fn builder(process_sequence_id: u32) -> DependencyUnitBuilder {
        DependencyUnitBuilder {
            unit: DependencyUnit {
                flags: DependencyFlags::default(),
                properties: Vec::new(),
                fences: Vec::new(),
                process_sequence_id,
            },
        }
    }

    pub fn has_any_dependency(&self) -> bool {
        self.flags.any_condition()
    }

    pub fn is_internal(&self) -> bool {
        self.flags.is_internal_dependency
    }

    pub fn is_preemptable(&self) -> bool {
        self.flags.is_preemptable
    }
}

pub struct DependencyUnitBuilder {
    unit: DependencyUnit,
}

impl DependencyUnitBuilder {
    pub fn property(mut self, requirement: PropertyRequirement) -> Self {
        self.unit.properties.push(requirement);
        self.unit.flags.has_property_dependency = true;
        self
    }

    pub fn properties(mut self, requirements: impl IntoIterator<Item = PropertyRequirement>) -> Self {
        for r in requirements {
            self = self.property(r);
        }
        self
    }

    pub fn buffer_fence(mut self, fence: FenceHandle) -> Self {
        self.unit.fences.push(FenceRequirement {
            fence,
            kind: FenceKind::Buffer,
        });
        self.unit.flags.has_fence_dependency = true;
        self.unit.flags.has_io_buffer_availability_dependency = true;
        self
    }

    pub fn external_fence(mut self, fence: FenceHandle) -> Self {
        self.unit.fences.push(FenceRequirement {
            fence,
            kind: FenceKind::External,
        });
        self.unit.flags.has_fence_dependency = true;
        self
    }

    pub fn preemptable(mut self) -> Self {
        self.unit.flags.is_preemptable = true;
        self
    }

    pub fn internal(mut self) -> Self {
        self.unit.flags.is_internal_dependency = true;
        self
    }

    /// Validate against the fixed maxima.
    pub fn build(self) -> PipelineResult<DependencyUnit> {
        let unit = self.unit;
        if unit.fences.len() > MAX_DEPENDENT_FENCES {
            return Err(PipelineError::InvalidArgument(format!(
                "{} fences exceed the per-unit maximum of {}",
                unit.fences.len(),
                MAX_DEPENDENT_FENCES
            )));
        }
        if unit.properties.len() > MAX_PROPERTIES {
            return Err(PipelineError::InvalidArgument(format!(
                "{} properties exceed the per-unit maximum of {}",
                unit.properties.len(),
                MAX_PROPERTIES
            )));
        }
        if unit.fences.iter().any(|f| !f.fence.is_valid()) {
            return Err(PipelineError::InvalidArgument(
                "dependency on an invalid fence handle".to_string(),
            ));
        }
        Ok(unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_sets_flags() {
        let unit = DependencyUnit::builder(1)
            .buffer_fence(FenceHandle(4))
            .property(PropertyRequirement::current(TagId(0x10)))
            .build()
            .unwrap();
        assert!(unit.flags.has_fence_dependency);
        assert!(unit.flags.has_io_buffer_availability_dependency);
        assert!(unit.flags.has_property_dependency);
        assert!(!unit.is_internal());
        assert!(unit.has_any_dependency());
    }

    #[test]
    fn test_empty_unit_has_no_dependency() {
        let unit = DependencyUnit::builder(7).preemptable().build().unwrap();
        assert!(!unit.has_any_dependency());
        assert_eq!(unit.process_sequence_id, 7);
    }

    #[test]
    fn test_maxima_enforced() {
        let mut b = DependencyUnit::builder(0);
        for i in 0..=MAX_DEPENDENT_FENCES as u64 {
            b = b.external_fence(FenceHandle(i + 1));
        }
        assert!(matches!(b.build(), Err(PipelineError::InvalidArgument(_))));

        let props = (0..=MAX_PROPERTIES as u32).map(|t| PropertyRequirement::current(TagId(t)));
        assert!(DependencyUnit::builder(0).properties(props).build().is_err());
    }

    #[test]
    fn test_addressed_request() {
        let prev = PropertyRequirement::previous(TagId(1), 2);
        assert_eq!(prev.addressed_request(5), Some(3));
        assert_eq!(prev.addressed_request(1), None);
        let ahead = PropertyRequirement {
            negate: true,
            ..prev
        };
        assert_eq!(ahead.addressed_request(5), Some(7));
    }
}
