//! StageNode: a generic hardware processing block (IFE, BPS, IPE, JPEG).
//!
//! The first invocation waits for every input fence plus the configured
//! property dependencies. Once they hold, the optional `IqModule` computes
//! the block's register programming from the awaited properties and the
//! stage publishes its result tags.

use crate::pipeline::buffer::Dimension;
use crate::pipeline::dependency::PropertyRequirement;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::id::{RequestId, TagId};
use crate::pipeline::metadata::{tags, MetadataValue, TagQuery};
use crate::pipeline::negotiation::{default_finalize_input_requirement, BufferNegotiationData};
use crate::pipeline::node::{BufferNegotiable, ExecuteContext, RequestExecutable, StreamLifecycle};
use crate::pipeline::node_type::NodeKind;

/// Resumed once inputs and properties are available.
const INPUTS_READY: u32 = 1;

/// Register programmer of one hardware block. An external collaborator:
/// the stage only hands it the properties it waited on.
#[cfg_attr(test, mockall::automock)]
pub trait IqModule: Send {
    /// Program the block for `request`. `properties` holds one entry per
    /// property dependency, in declaration order. Returns a digest of the
    /// programmed registers.
    fn program(&mut self, request: RequestId, properties: &[Option<MetadataValue>]) -> PipelineResult<i64>;
}

pub struct StageNode {
    kind: NodeKind,
    properties: Vec<PropertyRequirement>,
    preemptable: bool,
    iq: Option<Box<dyn IqModule>>,
    processed: u64,
}

impl StageNode {
    pub fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            properties: Vec::new(),
            preemptable: false,
            iq: None,
            processed: 0,
        }
    }

    pub fn with_property_dependency(mut self, requirement: PropertyRequirement) -> Self {
        self.properties.push(requirement);
        self
    }

    pub fn with_iq_module(mut self, iq: Box<dyn IqModule>) -> Self {
        self.iq = Some(iq);
        self
    }

    /// The stage's dependency units may be dropped at stream off.
    pub fn preemptable(mut self) -> Self {
        self.preemptable = true;
        self
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }

    fn run(&mut self, ctx: &mut ExecuteContext<'_>) -> PipelineResult<()> {
        let queries: Vec<TagQuery> = self
            .properties
            .iter()
            .map(|p| TagQuery {
                tag: p.tag,
                offset: p.offset,
                negate: p.negate,
            })
            .collect();
        let values = ctx.get_data_list(&queries);
        let digest = match &mut self.iq {
            Some(iq) => iq.program(ctx.request_id(), &values)?,
            None => ctx.request_id() as i64,
        };

        let mut entries: Vec<(TagId, MetadataValue)> =
            vec![(tags::stage_result(ctx.node().0), MetadataValue::Int(digest))];
        match self.kind {
            NodeKind::Ife => {
                let gain = ctx
                    .get_data_list(&[TagQuery::current(tags::SENSOR_GAIN)])
                    .into_iter()
                    .next()
                    .flatten()
                    .and_then(|v| v.as_float())
                    .unwrap_or(1.0);
                entries.push((tags::STATS_AWB_GAINS, MetadataValue::Floats(vec![1.9, 1.0, 1.6])));
                entries.push((tags::STATS_AEC_LUX, MetadataValue::Float(400.0 / gain.max(0.01))));
            }
            NodeKind::Bps | NodeKind::Ipe => {
                entries.push((tags::IQ_REGISTER_DIGEST, MetadataValue::Int(digest)));
            }
            NodeKind::Jpeg => entries.push((tags::JPEG_QUALITY, MetadataValue::Int(95))),
            _ => {}
        }
        ctx.write_data_list(&entries);
        ctx.mark_metadata_done();
        self.processed += 1;
        Ok(())
    }
}

impl BufferNegotiable for StageNode {
    /// Scalers ask their producer for a frame at least as large as the
    /// largest optimal size downstream; every output is then resolved on
    /// its own. Other stages intersect their consumers' requirements.
    fn finalize_input_requirement(&mut self, data: &mut BufferNegotiationData) -> PipelineResult<()> {
        if !self.kind.is_scaler() || data.outputs.is_empty() {
            return default_finalize_input_requirement(data);
        }
        let largest = data
            .outputs
            .iter()
            .flat_map(|o| o.consumer_requirements.iter())
            .fold(Dimension::new(1, 1), |acc, r| acc.component_max(r.optimal));
        let node = data.node;
        for input in &mut data.inputs {
            let mut req = input.declared;
            if !largest.fits_inside(req.max) {
                return Err(PipelineError::negotiation(
                    node,
                    Some(input.port_index),
                    format!("scaler needs {} but the input accepts at most {}", largest, req.max),
                ));
            }
            req.min = req.min.component_max(largest);
            req.optimal = req.optimal.component_max(largest).clamp(req.min, req.max);
            input.requirement_to_producer = Some(req);
        }
        Ok(())
    }
}

impl RequestExecutable for StageNode {
    fn execute_process_request(&mut self, ctx: &mut ExecuteContext<'_>) -> PipelineResult<()> {
        if ctx.sequence_id() == INPUTS_READY {
            return self.run(ctx);
        }
        let mut unit = ctx
            .input_dependency(INPUTS_READY)
            .properties(self.properties.iter().copied());
        if self.preemptable {
            unit = unit.preemptable();
        }
        let unit = unit.build()?;
        if !unit.has_any_dependency() {
            return self.run(ctx);
        }
        ctx.report_dependency(unit);
        Ok(())
    }
}

impl StreamLifecycle for StageNode {
    fn on_stream_on(&mut self) -> PipelineResult<()> {
        self.processed = 0;
        Ok(())
    }
}
