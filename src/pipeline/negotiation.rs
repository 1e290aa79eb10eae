//! Buffer requirement algebra and the default negotiation logic.
//!
//! A requirement is a `[min, max]` box with an optimal size, an optional
//! format and per-plane alignment. Combining requirements intersects the
//! boxes, keeps the largest optimal size that still fits, and aligns every
//! plane to the least common multiple of the alignments asked for.

use crate::pipeline::buffer::{BufferProperties, Dimension, Format, PlaneAlignment, MAX_PLANES};
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::id::NodeId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferRequirement {
    pub min: Dimension,
    pub max: Dimension,
    pub optimal: Dimension,
    /// `None` accepts any format.
    pub format: Option<Format>,
    pub alignment: [PlaneAlignment; MAX_PLANES],
}

impl Default for BufferRequirement {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl BufferRequirement {
    pub fn unbounded() -> Self {
        Self {
            min: Dimension::new(1, 1),
            max: Dimension::UNBOUNDED,
            optimal: Dimension::new(1, 1),
            format: None,
            alignment: [PlaneAlignment::default(); MAX_PLANES],
        }
    }

    /// Exactly `dimension`.
    pub fn exact(dimension: Dimension) -> Self {
        Self {
            min: dimension,
            max: dimension,
            optimal: dimension,
            ..Self::unbounded()
        }
    }

    pub fn range(min: Dimension, max: Dimension, optimal: Dimension) -> Self {
        Self {
            min,
            max,
            optimal,
            ..Self::unbounded()
        }
    }

    pub fn with_format(mut self, format: Option<Format>) -> Self {
        self.format = format;
        self
    }

    pub fn with_alignment(mut self, plane: usize, alignment: PlaneAlignment) -> Self {
        if plane < MAX_PLANES {
            self.alignment[plane] = alignment;
        }
        self
    }

    /// Only the size box, without format or alignment.
    pub fn dimensions_only(self) -> Self {
        Self {
            format: None,
            alignment: [PlaneAlignment::default(); MAX_PLANES],
            ..self
        }
    }

    /// Intersect with `other`. Err carries a human-readable conflict.
    pub fn combine(&self, other: &Self) -> Result<Self, String> {
        let format = match (self.format, other.format) {
            (Some(a), Some(b)) if a != b => {
                return Err(format!("format conflict {:?} vs {:?}", a, b));
            }
            (a, b) => a.or(b),
        };
        let min = self.min.component_max(other.min);
        let max = self.max.component_min(other.max);
        if !min.fits_inside(max) {
            return Err(format!("min {} exceeds max {}", min, max));
        }
        let optimal = self.optimal.component_max(other.optimal).clamp(min, max);
        let mut alignment = [PlaneAlignment::default(); MAX_PLANES];
        for (plane, a) in alignment.iter_mut().enumerate() {
            *a = self.alignment[plane]
                .combine(other.alignment[plane])
                .ok_or_else(|| {
                    format!(
                        "plane {} alignments {:?} and {:?} overflow",
                        plane, self.alignment[plane], other.alignment[plane]
                    )
                })?;
        }
        Ok(Self {
            min,
            max,
            optimal,
            format,
            alignment,
        })
    }

    /// Check that `props` satisfies this requirement.
    pub fn accepts(&self, props: &BufferProperties) -> Result<(), String> {
        if let Some(f) = self.format {
            if f != props.format {
                return Err(format!("format {:?} where {:?} is required", props.format, f));
            }
        }
        if !props.dimension.within(self.min, self.max) {
            return Err(format!(
                "{} outside [{}, {}]",
                props.dimension, self.min, self.max
            ));
        }
        for plane in 0..props.format.plane_count() {
            let need = self.alignment[plane];
            let have = props.alignment[plane];
            if have.stride % need.stride.max(1) != 0 || have.scanline % need.scanline.max(1) != 0 {
                return Err(format!(
                    "plane {} alignment {:?} does not honor {:?}",
                    plane, have, need
                ));
            }
        }
        Ok(())
    }

    /// Concrete properties at the optimal size.
    pub fn resolve(&self, fallback_format: Format) -> BufferProperties {
        BufferProperties::new(self.format.unwrap_or(fallback_format), self.optimal)
            .with_alignment(self.alignment)
    }
}

/// Combine any number of requirements. `Ok(None)` for an empty list.
pub fn combine_requirements<'a>(
    reqs: impl IntoIterator<Item = &'a BufferRequirement>,
) -> Result<Option<BufferRequirement>, String> {
    let mut acc: Option<BufferRequirement> = None;
    for r in reqs {
        acc = Some(match acc {
            None => *r,
            Some(a) => a.combine(r)?,
        });
    }
    Ok(acc)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NegotiationMode {
    /// Any unsatisfiable bound fails configuration.
    #[default]
    Strict,
    /// Unsatisfiable ports resolve to their declared default properties.
    FallbackToDefault,
}

#[derive(Debug, Clone)]
pub struct InputPortNegotiationData {
    pub port_index: u16,
    /// What this input accepts, as declared by the node.
    pub declared: BufferRequirement,
    /// Set by Walk 1; forwarded to the producer.
    pub requirement_to_producer: Option<BufferRequirement>,
    /// Set by Walk 2 from the producer's final properties.
    pub resolved: Option<BufferProperties>,
    pub loopback: bool,
}

#[derive(Debug, Clone)]
pub struct OutputPortNegotiationData {
    pub port_index: u16,
    pub format: Option<Format>,
    pub capability: BufferRequirement,
    pub default_properties: Option<BufferProperties>,
    /// Every consumer's (and the HAL stream's) requirement.
    pub consumer_requirements: Vec<BufferRequirement>,
    pub is_sink: bool,
    /// Set by Walk 2.
    pub final_properties: Option<BufferProperties>,
}

/// Scratch state for one node during one (re)negotiation.
#[derive(Debug, Clone)]
pub struct BufferNegotiationData {
    pub node: NodeId,
    pub mode: NegotiationMode,
    /// The node forwards its input buffer instead of producing one.
    pub forwards_input: bool,
    pub inputs: Vec<InputPortNegotiationData>,
    pub outputs: Vec<OutputPortNegotiationData>,
}

impl BufferNegotiationData {
    pub fn fail(&self, port: Option<u16>, reason: impl Into<String>) -> PipelineError {
        PipelineError::negotiation(self.node, port, reason)
    }

    fn aggregated_output_requirement(&self) -> PipelineResult<Option<BufferRequirement>> {
        let mut acc = None;
        for out in &self.outputs {
            let port = match combine_requirements(&out.consumer_requirements) {
                Ok(r) => r,
                Err(reason) => match self.mode {
                    NegotiationMode::Strict => return Err(self.fail(Some(out.port_index), reason)),
                    NegotiationMode::FallbackToDefault => {
                        tracing::warn!(
                            "{:?} output {} consumers disagree ({}), ignoring them for fallback",
                            self.node,
                            out.port_index,
                            reason
                        );
                        None
                    }
                },
            };
            let Some(port) = port else { continue };
            let port = if self.forwards_input { port } else { port.dimensions_only() };
            acc = match acc {
                None => Some(port),
                Some(a) => match a.combine(&port) {
                    Ok(c) => Some(c),
                    Err(reason) if self.mode == NegotiationMode::Strict => {
                        return Err(self.fail(Some(out.port_index), reason));
                    }
                    Err(_) => Some(a),
                },
            };
        }
        Ok(acc)
    }
}

/// Default Walk 1 step: every input asks its producer for the intersection
/// of everything the outputs' consumers want and what the input accepts.
pub fn default_finalize_input_requirement(data: &mut BufferNegotiationData) -> PipelineResult<()> {
    if data.outputs.is_empty() {
        for input in &mut data.inputs {
            input.requirement_to_producer = Some(input.declared);
        }
        return Ok(());
    }
    let downstream = data.aggregated_output_requirement()?;
    let node = data.node;
    let mode = data.mode;
    for input in data.inputs.iter_mut() {
        let req = match downstream {
            None => input.declared,
            Some(d) => match input.declared.combine(&d) {
                Ok(r) => r,
                Err(reason) if mode == NegotiationMode::Strict => {
                    return Err(PipelineError::negotiation(node, Some(input.port_index), reason));
                }
                Err(reason) => {
                    tracing::warn!(
                        "{:?} input {} cannot satisfy consumers ({}), asking for declared range",
                        node,
                        input.port_index,
                        reason
                    );
                    input.declared
                }
            },
        };
        input.requirement_to_producer = Some(req);
    }
    Ok(())
}

/// Default Walk 2 step: each output takes the optimal size inside its
/// consumers' common box and its own capability. Forwarding nodes expose
/// their input buffer unchanged.
pub fn default_finalize_buffer_properties(data: &mut BufferNegotiationData) -> PipelineResult<()> {
    let input_props = data.inputs.iter().find_map(|i| if i.loopback { None } else { i.resolved });
    let node = data.node;
    let mode = data.mode;
    let forwards = data.forwards_input;

    for out in data.outputs.iter_mut() {
        if forwards {
            let props = input_props.ok_or_else(|| {
                PipelineError::negotiation(node, Some(out.port_index), "forwarding output has no resolved input")
            })?;
            out.final_properties = Some(props);
            continue;
        }

        let mut reqs = out.consumer_requirements.clone();
        reqs.push(out.capability.with_format(out.format.or(out.capability.format)));
        let resolved = combine_requirements(&reqs).and_then(|r| {
            r.ok_or_else(|| "no requirement".to_string())
        });
        let fallback_format = out
            .format
            .or_else(|| input_props.map(|p| p.format))
            .unwrap_or(Format::Nv12);
        out.final_properties = Some(match resolved {
            Ok(req) => {
                let mut props = req.resolve(fallback_format);
                // Unconstrained ports copy the input size.
                if out.consumer_requirements.is_empty() {
                    if let Some(ip) = input_props {
                        let d = ip.dimension.clamp(req.min, req.max);
                        props.dimension = d;
                    }
                }
                props
            }
            Err(reason) => match (mode, out.default_properties) {
                (NegotiationMode::FallbackToDefault, Some(default)) => {
                    tracing::warn!(
                        "{:?} output {} unsatisfiable ({}), falling back to {:?} {}",
                        node,
                        out.port_index,
                        reason,
                        default.format,
                        default.dimension
                    );
                    default
                }
                _ => return Err(PipelineError::negotiation(node, Some(out.port_index), reason)),
            },
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn output(reqs: Vec<BufferRequirement>) -> OutputPortNegotiationData {
        OutputPortNegotiationData {
            port_index: 0,
            format: Some(Format::Nv12),
            capability: BufferRequirement::unbounded(),
            default_properties: Some(BufferProperties::new(Format::Nv12, Dimension::new(640, 480))),
            consumer_requirements: reqs,
            is_sink: false,
            final_properties: None,
        }
    }

    fn data(outputs: Vec<OutputPortNegotiationData>, mode: NegotiationMode) -> BufferNegotiationData {
        BufferNegotiationData {
            node: NodeId(0),
            mode,
            forwards_input: false,
            inputs: Vec::new(),
            outputs,
        }
    }

    #[test]
    fn test_fan_out_resolves_to_strictest_consumer() {
        let full_hd = Dimension::new(1920, 1080);
        let c1 = BufferRequirement::exact(full_hd);
        let c2 = BufferRequirement::range(Dimension::new(640, 480), full_hd, Dimension::new(1280, 720));
        let mut d = data(vec![output(vec![c1, c2])], NegotiationMode::Strict);
        default_finalize_buffer_properties(&mut d).unwrap();
        assert_eq!(d.outputs[0].final_properties.unwrap().dimension, full_hd);
    }

    #[test]
    fn test_disjoint_consumers_fail_in_strict_mode() {
        let a = BufferRequirement::exact(Dimension::new(1920, 1080));
        let b = BufferRequirement::exact(Dimension::new(640, 480));
        let mut d = data(vec![output(vec![a, b])], NegotiationMode::Strict);
        let err = default_finalize_buffer_properties(&mut d).unwrap_err();
        assert!(matches!(err, PipelineError::NegotiationFailure { port: Some(0), .. }));
    }

    #[test]
    fn test_fallback_uses_declared_default() {
        let a = BufferRequirement::exact(Dimension::new(1920, 1080));
        let b = BufferRequirement::exact(Dimension::new(640, 480));
        let mut d = data(vec![output(vec![a, b])], NegotiationMode::FallbackToDefault);
        default_finalize_buffer_properties(&mut d).unwrap();
        assert_eq!(
            d.outputs[0].final_properties.unwrap().dimension,
            Dimension::new(640, 480)
        );
    }

    #[test]
    fn test_format_conflict() {
        let a = BufferRequirement::unbounded().with_format(Some(Format::Nv12));
        let b = BufferRequirement::unbounded().with_format(Some(Format::RawMipi10));
        assert!(a.combine(&b).unwrap_err().contains("format"));
    }

    #[test]
    fn test_input_requirement_drops_output_format() {
        let mut d = data(
            vec![output(vec![BufferRequirement::exact(Dimension::new(1280, 720))
                .with_format(Some(Format::Nv12))])],
            NegotiationMode::Strict,
        );
        d.inputs.push(InputPortNegotiationData {
            port_index: 0,
            declared: BufferRequirement::unbounded().with_format(Some(Format::RawMipi10)),
            requirement_to_producer: None,
            resolved: None,
            loopback: false,
        });
        default_finalize_input_requirement(&mut d).unwrap();
        let req = d.inputs[0].requirement_to_producer.unwrap();
        assert_eq!(req.format, Some(Format::RawMipi10));
        assert_eq!(req.min, Dimension::new(1280, 720));
    }

    fn consumer() -> impl Strategy<Value = BufferRequirement> {
        (
            (64u32..1024, 64u32..1024),
            (1024u32..4096, 1024u32..4096),
            0u32..4,
            0u32..4,
        )
            .prop_map(|((minw, minh), (maxw, maxh), sa, la)| {
                BufferRequirement::range(
                    Dimension::new(minw, minh),
                    Dimension::new(maxw, maxh),
                    Dimension::new(minw, minh),
                )
                .with_alignment(0, PlaneAlignment::new(16 << sa, 2 << la))
                .with_alignment(1, PlaneAlignment::new(16 << la, 2 << sa))
            })
    }

    #[test]
    fn test_alignment_combines_to_common_multiple() {
        let a = BufferRequirement::unbounded().with_alignment(0, PlaneAlignment::new(48, 3));
        let b = BufferRequirement::unbounded().with_alignment(0, PlaneAlignment::new(64, 2));
        let combined = a.combine(&b).unwrap();
        assert_eq!(combined.alignment[0], PlaneAlignment::new(192, 6));

        let props = combined.resolve(Format::Nv12);
        assert!(a.accepts(&props).is_ok());
        assert!(b.accepts(&props).is_ok());
    }

    #[test]
    fn test_alignment_overflow_is_a_conflict() {
        let a = BufferRequirement::unbounded().with_alignment(0, PlaneAlignment::new(u32::MAX, 1));
        let b = BufferRequirement::unbounded().with_alignment(0, PlaneAlignment::new(u32::MAX - 1, 1));
        let err = a.combine(&b).unwrap_err();
        assert!(err.contains("overflow"), "{}", err);
    }

    fn odd_aligned_consumer() -> impl Strategy<Value = BufferRequirement> {
        (1u32..=48, 1u32..=24, 1u32..=48, 1u32..=24).prop_map(|(s0, l0, s1, l1)| {
            BufferRequirement::unbounded()
                .with_alignment(0, PlaneAlignment::new(s0, l0))
                .with_alignment(1, PlaneAlignment::new(s1, l1))
        })
    }

    proptest! {
        #[test]
        fn test_any_alignment_mix_is_honored(consumers in prop::collection::vec(odd_aligned_consumer(), 1..5)) {
            let combined = combine_requirements(&consumers).unwrap().unwrap();
            let props = combined.resolve(Format::Nv12);
            for c in &consumers {
                prop_assert!(c.accepts(&props).is_ok(), "{:?} rejected {:?}", c.alignment, props.alignment);
            }
        }

        #[test]
        fn test_resolution_satisfies_every_consumer(consumers in prop::collection::vec(consumer(), 1..8)) {
            let mut d = data(vec![output(consumers.clone())], NegotiationMode::Strict);
            default_finalize_buffer_properties(&mut d).unwrap();
            let props = d.outputs[0].final_properties.unwrap();
            for c in &consumers {
                prop_assert!(c.accepts(&props).is_ok(), "{:?} rejected {:?}", c, props);
            }
            let max_stride = consumers.iter().map(|c| c.alignment[0].stride).max().unwrap();
            prop_assert_eq!(props.alignment[0].stride, max_stride);
            prop_assert_eq!(props.plane(0).unwrap().stride % max_stride as u64, 0);
        }
    }
}
