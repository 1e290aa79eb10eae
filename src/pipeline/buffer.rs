//! Image buffer descriptions and the per-output-port buffer pool.
//!
//! Buffers carry no pixel memory; the engine only tracks their shape, their
//! ownership and the request they were last produced for.

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::id::{PortId, RequestId};
use crate::pipeline::lock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub const MAX_PLANES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Format {
    RawMipi10,
    RawPlain16,
    Nv12,
    Nv21,
    P010,
    Rgb888,
    Jpeg,
    Blob,
}

impl Format {
    pub fn plane_count(self) -> usize {
        match self {
            Format::Nv12 | Format::Nv21 | Format::P010 => 2,
            _ => 1,
        }
    }

    /// Bytes per pixel of `plane`, in tenths of a byte.
    fn deci_bytes_per_pixel(self, plane: usize) -> u64 {
        match (self, plane) {
            (Format::RawMipi10, _) => 12, // 5 bytes per 4 pixels, rounded
            (Format::RawPlain16, _) => 20,
            (Format::Nv12 | Format::Nv21, _) => 10,
            (Format::P010, _) => 20,
            (Format::Rgb888, _) => 30,
            (Format::Jpeg | Format::Blob, _) => 10,
        }
    }

    /// Height divisor of `plane` (chroma planes are subsampled).
    fn plane_height_divisor(self, plane: usize) -> u32 {
        match (self, plane) {
            (Format::Nv12 | Format::Nv21 | Format::P010, 1) => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Dimension {
    pub width: u32,
    pub height: u32,
}

impl Dimension {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub const UNBOUNDED: Dimension = Dimension::new(u32::MAX, u32::MAX);

    pub fn component_max(self, other: Self) -> Self {
        Self::new(self.width.max(other.width), self.height.max(other.height))
    }

    pub fn component_min(self, other: Self) -> Self {
        Self::new(self.width.min(other.width), self.height.min(other.height))
    }

    pub fn clamp(self, min: Self, max: Self) -> Self {
        self.component_max(min).component_min(max)
    }

    /// Both components within `[min, max]`.
    pub fn within(self, min: Self, max: Self) -> bool {
        self.width >= min.width
            && self.height >= min.height
            && self.width <= max.width
            && self.height <= max.height
    }

    pub fn fits_inside(self, bound: Self) -> bool {
        self.width <= bound.width && self.height <= bound.height
    }
}

impl std::fmt::Display for Dimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Stride (bytes) and scanline (rows) alignment of one plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlaneAlignment {
    pub stride: u32,
    pub scanline: u32,
}

impl Default for PlaneAlignment {
    fn default() -> Self {
        Self {
            stride: 1,
            scanline: 1,
        }
    }
}

impl PlaneAlignment {
    pub const fn new(stride: u32, scanline: u32) -> Self {
        Self { stride, scanline }
    }

    /// The smallest alignment honoring both, field by field. `None` when the
    /// least common multiple does not fit in a `u32`.
    pub fn combine(self, other: Self) -> Option<Self> {
        Some(Self::new(
            lcm(self.stride, other.stride)?,
            lcm(self.scanline, other.scanline)?,
        ))
    }
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Zero is treated as no constraint.
fn lcm(a: u32, b: u32) -> Option<u32> {
    let (a, b) = (a.max(1), b.max(1));
    (a / gcd(a, b)).checked_mul(b)
}

pub fn align_up(value: u64, alignment: u32) -> u64 {
    let a = alignment.max(1) as u64;
    value.div_ceil(a) * a
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlaneLayout {
    pub stride: u64,
    pub scanlines: u64,
}

/// Final shape of the buffers an output port produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferProperties {
    pub format: Format,
    pub dimension: Dimension,
    pub alignment: [PlaneAlignment; MAX_PLANES],
}

impl BufferProperties {
    pub fn new(format: Format, dimension: Dimension) -> Self {
        Self {
            format,
            dimension,
            alignment: [PlaneAlignment::default(); MAX_PLANES],
        }
    }

    pub fn with_alignment(mut self, alignment: [PlaneAlignment; MAX_PLANES]) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn plane(&self, plane: usize) -> Option<PlaneLayout> {
        if plane >= self.format.plane_count() {
            return None;
        }
        let row_bytes =
            (self.dimension.width as u64 * self.format.deci_bytes_per_pixel(plane)).div_ceil(10);
        let rows = (self.dimension.height / self.format.plane_height_divisor(plane)) as u64;
        let a = self.alignment[plane];
        Some(PlaneLayout {
            stride: align_up(row_bytes, a.stride),
            scanlines: align_up(rows, a.scanline),
        })
    }

    pub fn planes(&self) -> Vec<PlaneLayout> {
        (0..self.format.plane_count()).filter_map(|p| self.plane(p)).collect()
    }

    pub fn size_bytes(&self) -> u64 {
        self.planes().iter().map(|p| p.stride * p.scanlines).sum()
    }
}

const NO_STAMP: u64 = u64::MAX;

/// One pooled buffer. Shape is fixed by the pool; the stamp records the
/// request the contents belong to.
#[derive(Debug)]
pub struct ImageBuffer {
    id: u32,
    owner: PortId,
    properties: BufferProperties,
    stamp: AtomicU64,
}

impl ImageBuffer {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn owner(&self) -> PortId {
        self.owner
    }

    pub fn properties(&self) -> &BufferProperties {
        &self.properties
    }

    pub fn stamp(&self) -> Option<RequestId> {
        match self.stamp.load(Ordering::Acquire) {
            NO_STAMP => None,
            r => Some(r),
        }
    }

    pub fn set_stamp(&self, request: RequestId) {
        self.stamp.store(request, Ordering::Release);
    }
}

#[derive(Debug)]
struct PoolSlot {
    buffer: Arc<ImageBuffer>,
    refs: u32,
}

#[derive(Debug, Default)]
struct ManagerInner {
    properties: Option<BufferProperties>,
    count: usize,
    /// Pool size is frozen by the first activation.
    count_locked: bool,
    active: bool,
    generation: u32,
    slots: Vec<PoolSlot>,
    free: Vec<usize>,
}

/// Buffer pool owned by one output port.
#[derive(Debug)]
pub struct ImageBufferManager {
    port: PortId,
    inner: Mutex<ManagerInner>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferPoolStats {
    pub capacity: usize,
    pub in_use: usize,
    pub active: bool,
}

impl ImageBufferManager {
    pub fn new(port: PortId) -> Self {
        Self {
            port,
            inner: Mutex::new(ManagerInner::default()),
        }
    }

    /// Set buffer shape and count. The count cannot change once the pool has
    /// been activated.
    pub fn configure(&self, properties: BufferProperties, count: usize) -> PipelineResult<()> {
        let mut inner = lock(&self.inner);
        if inner.active {
            return Err(PipelineError::Streaming);
        }
        if count == 0 {
            return Err(PipelineError::InvalidArgument(format!(
                "port {} needs at least one buffer",
                self.port
            )));
        }
        if inner.count_locked && count != inner.count {
            return Err(PipelineError::InvalidArgument(format!(
                "port {} buffer count is fixed at {} (requested {})",
                self.port, inner.count, count
            )));
        }
        inner.properties = Some(properties);
        inner.count = count;
        Ok(())
    }

    pub fn activate(&self) -> PipelineResult<()> {
        let mut inner = lock(&self.inner);
        if inner.active {
            return Ok(());
        }
        let properties = inner.properties.ok_or_else(|| {
            PipelineError::InvalidArgument(format!("port {} activated before negotiation", self.port))
        })?;
        inner.generation += 1;
        let base = inner.generation << 16;
        let owner = self.port;
        inner.slots = (0..inner.count)
            .map(|i| PoolSlot {
                buffer: Arc::new(ImageBuffer {
                    id: base | i as u32,
                    owner,
                    properties,
                    stamp: AtomicU64::new(NO_STAMP),
                }),
                refs: 0,
            })
            .collect();
        inner.free = (0..inner.count).rev().collect();
        inner.count_locked = true;
        inner.active = true;
        tracing::debug!("Port {} activated {} buffers ({:?})", self.port, inner.count, properties.dimension);
        Ok(())
    }

    pub fn deactivate(&self) {
        let mut inner = lock(&self.inner);
        let held = inner.slots.iter().filter(|s| s.refs > 0).count();
        if held > 0 {
            tracing::warn!("Port {} deactivated with {} buffers still referenced", self.port, held);
        }
        inner.slots.clear();
        inner.free.clear();
        inner.active = false;
    }

    /// Take a free buffer with one reference held by the producer.
    pub fn acquire(&self, request: RequestId) -> PipelineResult<Arc<ImageBuffer>> {
        let mut inner = lock(&self.inner);
        if !inner.active {
            return Err(PipelineError::NotStreaming);
        }
        let idx = inner.free.pop().ok_or_else(|| {
            PipelineError::ResourceExhausted(format!(
                "port {} has no free buffer for request {} ({} in pool)",
                self.port, request, inner.count
            ))
        })?;
        let slot = &mut inner.slots[idx];
        slot.refs = 1;
        slot.buffer.set_stamp(request);
        Ok(slot.buffer.clone())
    }

    pub fn add_reference(&self, buffer: &ImageBuffer) -> PipelineResult<u32> {
        self.add_references(buffer, 1)
    }

    /// Take `count` references at once. Either all of them are taken or none.
    pub fn add_references(&self, buffer: &ImageBuffer, count: u32) -> PipelineResult<u32> {
        let mut inner = lock(&self.inner);
        let slot = Self::find(&mut inner, buffer, self.port)?;
        if slot.refs == 0 {
            return Err(PipelineError::InvalidArgument(format!(
                "buffer {:#x} of port {} is not in use",
                buffer.id, self.port
            )));
        }
        slot.refs = slot.refs.checked_add(count).ok_or_else(|| {
            PipelineError::ResourceExhausted(format!(
                "buffer {:#x} of port {} cannot take {} more references",
                buffer.id, self.port, count
            ))
        })?;
        Ok(slot.refs)
    }

    /// Drop one reference; the buffer returns to the free list at zero.
    pub fn release_reference(&self, buffer: &ImageBuffer) -> PipelineResult<u32> {
        let mut inner = lock(&self.inner);
        let (idx, refs) = {
            let idx = Self::index_of(&inner, buffer, self.port)?;
            let slot = &mut inner.slots[idx];
            if slot.refs == 0 {
                return Err(PipelineError::InvalidArgument(format!(
                    "buffer {:#x} of port {} released below zero",
                    buffer.id, self.port
                )));
            }
            slot.refs -= 1;
            (idx, slot.refs)
        };
        if refs == 0 {
            inner.free.push(idx);
        }
        Ok(refs)
    }

    pub fn ref_count(&self, buffer: &ImageBuffer) -> u32 {
        let inner = lock(&self.inner);
        Self::index_of(&inner, buffer, self.port)
            .map(|i| inner.slots[i].refs)
            .unwrap_or(0)
    }

    pub fn properties(&self) -> Option<BufferProperties> {
        lock(&self.inner).properties
    }

    pub fn stats(&self) -> BufferPoolStats {
        let inner = lock(&self.inner);
        BufferPoolStats {
            capacity: inner.count,
            in_use: inner.slots.iter().filter(|s| s.refs > 0).count(),
            active: inner.active,
        }
    }

    fn index_of(inner: &ManagerInner, buffer: &ImageBuffer, port: PortId) -> PipelineResult<usize> {
        let idx = (buffer.id & 0xFFFF) as usize;
        match inner.slots.get(idx) {
            Some(slot) if slot.buffer.id == buffer.id => Ok(idx),
            _ => Err(PipelineError::InvalidArgument(format!(
                "buffer {:#x} does not belong to port {}",
                buffer.id, port
            ))),
        }
    }

    fn find<'a>(
        inner: &'a mut ManagerInner,
        buffer: &ImageBuffer,
        port: PortId,
    ) -> PipelineResult<&'a mut PoolSlot> {
        let idx = Self::index_of(inner, buffer, port)?;
        Ok(&mut inner.slots[idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::id::NodeId;

    fn props() -> BufferProperties {
        BufferProperties::new(Format::Nv12, Dimension::new(1920, 1080))
    }

    #[test]
    fn test_nv12_layout() {
        let p = props().with_alignment([
            PlaneAlignment::new(128, 32),
            PlaneAlignment::new(128, 16),
            PlaneAlignment::default(),
        ]);
        let planes = p.planes();
        assert_eq!(planes.len(), 2);
        assert_eq!(planes[0].stride, 1920);
        assert_eq!(planes[0].scanlines, 1088);
        assert_eq!(planes[1].scanlines, 544);
        assert_eq!(p.size_bytes(), 1920 * 1088 + 1920 * 544);
    }

    #[test]
    fn test_acquire_exhausts_pool() {
        let mgr = ImageBufferManager::new(PortId::new(NodeId(0), 0));
        mgr.configure(props(), 2).unwrap();
        mgr.activate().unwrap();
        let a = mgr.acquire(0).unwrap();
        let _b = mgr.acquire(1).unwrap();
        assert!(matches!(mgr.acquire(2), Err(PipelineError::ResourceExhausted(_))));
        assert_eq!(mgr.release_reference(&a).unwrap(), 0);
        let c = mgr.acquire(2).unwrap();
        assert_eq!(c.stamp(), Some(2));
    }

    #[test]
    fn test_reference_counting() {
        let mgr = ImageBufferManager::new(PortId::new(NodeId(1), 0));
        mgr.configure(props(), 1).unwrap();
        mgr.activate().unwrap();
        let buf = mgr.acquire(9).unwrap();
        assert_eq!(mgr.add_reference(&buf).unwrap(), 2);
        assert_eq!(mgr.ref_count(&buf), 2);
        assert_eq!(mgr.release_reference(&buf).unwrap(), 1);
        assert_eq!(mgr.release_reference(&buf).unwrap(), 0);
        assert!(mgr.release_reference(&buf).is_err());
        assert_eq!(mgr.stats().in_use, 0);
    }

    #[test]
    fn test_bulk_references_all_or_nothing() {
        let mgr = ImageBufferManager::new(PortId::new(NodeId(1), 1));
        mgr.configure(props(), 1).unwrap();
        mgr.activate().unwrap();
        let buf = mgr.acquire(4).unwrap();
        assert_eq!(mgr.add_references(&buf, 3).unwrap(), 4);
        assert!(matches!(
            mgr.add_references(&buf, u32::MAX),
            Err(PipelineError::ResourceExhausted(_))
        ));
        assert_eq!(mgr.ref_count(&buf), 4);

        for _ in 0..4 {
            mgr.release_reference(&buf).unwrap();
        }
        // A free buffer takes no references at all.
        assert!(mgr.add_references(&buf, 2).is_err());
        assert_eq!(mgr.ref_count(&buf), 0);
        assert_eq!(mgr.stats().in_use, 0);
    }

    #[test]
    fn test_count_fixed_after_first_activation() {
        let mgr = ImageBufferManager::new(PortId::new(NodeId(2), 1));
        mgr.configure(props(), 4).unwrap();
        mgr.configure(props(), 6).unwrap();
        mgr.activate().unwrap();
        assert!(matches!(mgr.configure(props(), 6), Err(PipelineError::Streaming)));
        mgr.deactivate();
        assert!(mgr.configure(props(), 8).is_err());
        let smaller = BufferProperties::new(Format::Nv12, Dimension::new(640, 480));
        mgr.configure(smaller, 6).unwrap();
        assert_eq!(mgr.properties().unwrap().dimension, Dimension::new(640, 480));
    }
}
