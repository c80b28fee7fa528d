//! Triangle batches: per-pass index buffers and the renderer interface

use std::collections::{HashMap, HashSet};

use piste_core::{MaterialId, PisteError, Result};

use crate::corner::CornerContext;
use crate::grid::TerrainGrid;

/// What the renderer should bind before drawing a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchKind {
    /// Triangles touching one material, drawn with that material's texture
    Material(MaterialId),
    /// Triangles whose three corners are three different materials
    Junction,
}

/// Which triangles a pass keeps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    /// Any triangle touching the material; alpha fades out toward lower ids
    Blend(MaterialId),
    /// Triangles touching the material with no corner of a lower id
    Solid(MaterialId),
    Junction,
}

impl Pass {
    pub fn batch(self) -> BatchKind {
        match self {
            Pass::Blend(m) | Pass::Solid(m) => BatchKind::Material(m),
            Pass::Junction => BatchKind::Junction,
        }
    }

    /// Vertex alphas for a triangle with corner materials `m`, or `None` when
    /// the pass skips it.
    fn accept(self, m: [MaterialId; 3]) -> Option<[u8; 3]> {
        match self {
            Pass::Blend(cur) => m
                .contains(&cur)
                .then(|| m.map(|v| if v >= cur { 255 } else { 0 })),
            Pass::Solid(cur) => {
                (m.contains(&cur) && m.iter().all(|&v| v >= cur)).then_some([255; 3])
            }
            Pass::Junction => (m[0] != m[1] && m[0] != m[2] && m[1] != m[2]).then_some([255; 3]),
        }
    }
}

/// Growable index list for one pass, with one alpha per emitted index and the
/// range of vertex indices touched.
#[derive(Debug, Clone)]
pub struct EmissionBuffer {
    indices: Vec<u32>,
    alphas: Vec<u8>,
    min_index: u32,
    max_index: u32,
}

impl Default for EmissionBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl EmissionBuffer {
    pub fn new() -> Self {
        Self {
            indices: Vec::new(),
            alphas: Vec::new(),
            min_index: u32::MAX,
            max_index: 0,
        }
    }

    /// Empty the buffer, keeping its allocation
    pub fn reset(&mut self) {
        self.indices.clear();
        self.alphas.clear();
        self.min_index = u32::MAX;
        self.max_index = 0;
    }

    pub fn push_triangle(&mut self, tri: [u32; 3], alphas: [u8; 3]) -> Result<()> {
        self.indices
            .try_reserve(3)
            .map_err(|e| PisteError::Allocation(format!("index buffer: {}", e)))?;
        self.alphas
            .try_reserve(3)
            .map_err(|e| PisteError::Allocation(format!("alpha buffer: {}", e)))?;

        self.indices.extend_from_slice(&tri);
        self.alphas.extend_from_slice(&alphas);
        for i in tri {
            self.min_index = self.min_index.min(i);
            self.max_index = self.max_index.max(i);
        }
        Ok(())
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    pub fn alphas(&self) -> &[u8] {
        &self.alphas
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Smallest and largest vertex index referenced
    pub fn index_range(&self) -> Option<(u32, u32)> {
        (!self.is_empty()).then_some((self.min_index, self.max_index))
    }
}

/// A pass and the buffer it fills
#[derive(Debug, Clone)]
pub struct PassBuffer {
    pub pass: Pass,
    pub buffer: EmissionBuffer,
}

/// Consumer of emitted batches. `bind` is called once before each `draw`.
pub trait TerrainRenderer {
    fn bind(&mut self, batch: BatchKind);
    fn draw(&mut self, buffer: &EmissionBuffer);
}

/// All passes of one frame. Buffers are reused from frame to frame.
#[derive(Debug, Clone, Default)]
pub struct FrameBuffers {
    passes: Vec<PassBuffer>,
    budget: Option<usize>,
    triangles: usize,
}

impl FrameBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set up one pass per material (ascending), plus the junction pass when
    /// blending, and clear every buffer.
    pub fn begin(&mut self, materials: &[MaterialId], blend: bool, budget: Option<usize>) {
        let count = materials.len() + usize::from(blend);
        self.passes.resize_with(count, || PassBuffer {
            pass: Pass::Junction,
            buffer: EmissionBuffer::new(),
        });

        let mut sorted = materials.to_vec();
        sorted.sort_unstable();
        let passes = sorted
            .into_iter()
            .map(|m| if blend { Pass::Blend(m) } else { Pass::Solid(m) })
            .chain(blend.then_some(Pass::Junction));
        for (slot, pass) in self.passes.iter_mut().zip(passes) {
            slot.pass = pass;
            slot.buffer.reset();
        }

        self.budget = budget;
        self.triangles = 0;
    }

    pub fn passes(&self) -> &[PassBuffer] {
        &self.passes
    }

    /// Triangles emitted across all passes this frame
    pub fn triangle_count(&self) -> usize {
        self.triangles
    }

    pub(crate) fn emit_fan(&mut self, fan: &Fan, uncovered: u8) -> Result<()> {
        for slot in &mut self.passes {
            if let Pass::Blend(m) | Pass::Solid(m) = slot.pass {
                if !fan.material.contains(&m) {
                    continue;
                }
            }
            for tri in fan.triangles(uncovered).into_iter().flatten() {
                let Some(alphas) = slot.pass.accept(tri.map(|v| fan.material[v])) else {
                    continue;
                };
                if let Some(budget) = self.budget {
                    if self.triangles >= budget {
                        return Err(PisteError::TriangleBudgetExceeded { budget });
                    }
                }
                slot.buffer.push_triangle(tri.map(|v| fan.index[v]), alphas)?;
                self.triangles += 1;
            }
        }
        Ok(())
    }

    /// Hand every non-empty pass to the renderer
    pub fn submit(&self, renderer: &mut dyn TerrainRenderer) {
        for slot in self.passes.iter().filter(|s| !s.buffer.is_empty()) {
            renderer.bind(slot.pass.batch());
            renderer.draw(&slot.buffer);
        }
    }
}

// Fan layout, z grows southward:
//
//   4---3---2    N
//   | \ | / |
//   5---0---1  W   E
//   | / | \ |
//   6---7---8    S
//
// Quadrant bits: NE 1, NW 2, SW 4, SE 8.

/// Per side: the whole triangle, then its two halves with the quadrant each lies in
const SIDES: [([usize; 3], [([usize; 3], u8); 2]); 4] = [
    ([0, 2, 8], [([0, 1, 8], 8), ([0, 2, 1], 1)]),
    ([0, 4, 2], [([0, 3, 2], 1), ([0, 4, 3], 2)]),
    ([0, 6, 4], [([0, 5, 4], 2), ([0, 6, 5], 4)]),
    ([0, 8, 6], [([0, 7, 6], 4), ([0, 8, 7], 8)]),
];

/// The nine grid vertices of one node and which sides are split.
pub(crate) struct Fan {
    index: [u32; 9],
    material: [MaterialId; 9],
    split: [bool; 4],
}

impl Fan {
    pub(crate) fn new(grid: &TerrainGrid, cd: &CornerContext<'_>, split: [bool; 4]) -> Self {
        let (x, z) = (cd.xorg, cd.zorg);
        let (h, w) = (cd.half(), cd.whole());
        let offsets = [
            (h, h),
            (w, h),
            (w, 0),
            (h, 0),
            (0, 0),
            (0, h),
            (0, w),
            (h, w),
            (w, w),
        ];
        let index = offsets.map(|(dx, dz)| grid.index(x + dx, z + dz));
        let material = index.map(|i| grid.material_at_index(i));
        Self {
            index,
            material,
            split,
        }
    }

    /// Triangles covering the quadrants set in `uncovered`. Triangles whose
    /// corners were clamped onto the same sample are dropped.
    fn triangles(&self, uncovered: u8) -> [Option<[usize; 3]>; 8] {
        let mut out = [None; 8];
        let mut n = 0;
        for (side, (whole, halves)) in SIDES.iter().enumerate() {
            if !self.split[side] {
                out[n] = Some(*whole);
                n += 1;
                continue;
            }
            for (tri, quadrant) in halves {
                if uncovered & quadrant != 0 {
                    out[n] = Some(*tri);
                    n += 1;
                }
            }
        }
        out.map(|t| t.filter(|tri| !self.degenerate(*tri)))
    }

    fn degenerate(&self, tri: [usize; 3]) -> bool {
        let [a, b, c] = tri.map(|v| self.index[v]);
        a == b || b == c || a == c
    }
}

/// A batch as seen by [`MeshRecorder`]
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedBatch {
    pub kind: BatchKind,
    pub indices: Vec<u32>,
    pub alphas: Vec<u8>,
}

/// Renderer that keeps a copy of every batch it is handed.
#[derive(Debug, Clone, Default)]
pub struct MeshRecorder {
    pub batches: Vec<RecordedBatch>,
    bound: Option<BatchKind>,
}

impl MeshRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.batches.clear();
        self.bound = None;
    }

    pub fn triangle_count(&self) -> usize {
        self.batches.iter().map(|b| b.indices.len() / 3).sum()
    }

    pub fn batch(&self, kind: BatchKind) -> Option<&RecordedBatch> {
        self.batches.iter().find(|b| b.kind == kind)
    }

    /// Distinct triangles across all material batches, as vertex index triples
    pub fn unique_triangles(&self) -> Vec<[u32; 3]> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for batch in self
            .batches
            .iter()
            .filter(|b| matches!(b.kind, BatchKind::Material(_)))
        {
            for tri in batch.indices.chunks_exact(3) {
                let tri = [tri[0], tri[1], tri[2]];
                let mut key = tri;
                key.sort_unstable();
                if seen.insert(key) {
                    out.push(tri);
                }
            }
        }
        out
    }

    /// Export the recorded surface as a compact trimesh for physics.
    /// Returns (vertices, triangle_indices) with only the referenced vertices.
    pub fn trimesh_data(&self, grid: &TerrainGrid) -> (Vec<[f32; 3]>, Vec<[u32; 3]>) {
        let triangles = self.unique_triangles();
        let mut remap = HashMap::new();
        let mut vertices = Vec::new();

        let triangles = triangles
            .into_iter()
            .map(|tri| {
                tri.map(|i| {
                    *remap.entry(i).or_insert_with(|| {
                        vertices.push(grid.vertex_position(i));
                        (vertices.len() - 1) as u32
                    })
                })
            })
            .collect();

        (vertices, triangles)
    }
}

impl TerrainRenderer for MeshRecorder {
    fn bind(&mut self, batch: BatchKind) {
        self.bound = Some(batch);
    }

    fn draw(&mut self, buffer: &EmissionBuffer) {
        let Some(kind) = self.bound else {
            log::warn!("draw without a bound batch, {} triangles dropped", buffer.triangle_count());
            return;
        };
        self.batches.push(RecordedBatch {
            kind,
            indices: buffer.indices().to_vec(),
            alphas: buffer.alphas().to_vec(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fan_for(grid: &TerrainGrid, level: i32, split: [bool; 4]) -> Fan {
        let cd = CornerContext::root(level, [0.0; 4]);
        Fan::new(grid, &cd, split)
    }

    #[test]
    fn buffer_tracks_index_range() {
        let mut buf = EmissionBuffer::new();
        assert_eq!(buf.index_range(), None);
        buf.push_triangle([4, 9, 2], [255, 0, 255]).unwrap();
        buf.push_triangle([7, 3, 5], [255; 3]).unwrap();
        assert_eq!(buf.triangle_count(), 2);
        assert_eq!(buf.index_range(), Some((2, 9)));
        assert_eq!(buf.alphas().len(), buf.indices().len());
        buf.reset();
        assert!(buf.is_empty());
        assert_eq!(buf.index_range(), None);
    }

    #[test]
    fn pass_filters() {
        assert_eq!(Pass::Blend(1).accept([0, 1, 2]), Some([0, 255, 255]));
        assert_eq!(Pass::Blend(1).accept([0, 0, 2]), None);
        assert_eq!(Pass::Solid(1).accept([1, 1, 2]), Some([255; 3]));
        assert_eq!(Pass::Solid(1).accept([0, 1, 2]), None);
        assert_eq!(Pass::Junction.accept([0, 1, 2]), Some([255; 3]));
        assert_eq!(Pass::Junction.accept([0, 1, 1]), None);
    }

    #[test]
    fn unsplit_fan_is_four_triangles() {
        let grid = TerrainGrid::flat(3, 3, 1.0).unwrap();
        let fan = fan_for(&grid, 0, [false; 4]);
        let tris: Vec<_> = fan.triangles(0b1111).into_iter().flatten().collect();
        assert_eq!(tris.len(), 4);
        // Center of a 3x3 grid is sample 4
        assert_eq!(fan.index[0], 4);
        assert_eq!(fan.index[8], 8);
    }

    #[test]
    fn split_fan_covers_only_uncovered_quadrants() {
        let grid = TerrainGrid::flat(3, 3, 1.0).unwrap();
        let fan = fan_for(&grid, 0, [true; 4]);
        let all: Vec<_> = fan.triangles(0b1111).into_iter().flatten().collect();
        assert_eq!(all.len(), 8);
        // Only the NE quadrant left: its two halves
        let ne: Vec<_> = fan.triangles(0b0001).into_iter().flatten().collect();
        assert_eq!(ne, vec![[0, 2, 1], [0, 3, 2]]);
    }

    #[test]
    fn clamped_triangles_are_dropped() {
        // Level 0 over a 2x2 grid: the fan overhangs the single cell and
        // the east and south triangles collapse onto its edges
        let grid = TerrainGrid::flat(2, 2, 1.0).unwrap();
        let fan = fan_for(&grid, 0, [false; 4]);
        let tris: Vec<_> = fan.triangles(0b1111).into_iter().flatten().collect();
        assert_eq!(tris, vec![[0, 4, 2], [0, 6, 4]]);
    }

    #[test]
    fn frame_enforces_budget() {
        let grid = TerrainGrid::flat(3, 3, 1.0).unwrap();
        let fan = fan_for(&grid, 0, [true; 4]);
        let mut frame = FrameBuffers::new();
        frame.begin(&[0], true, Some(5));
        let err = frame.emit_fan(&fan, 0b1111).unwrap_err();
        assert!(matches!(err, PisteError::TriangleBudgetExceeded { budget: 5 }));

        frame.begin(&[0], true, None);
        frame.emit_fan(&fan, 0b1111).unwrap();
        assert_eq!(frame.triangle_count(), 8);
        assert_eq!(frame.passes().len(), 2);
        assert!(frame.passes()[1].buffer.is_empty());
    }

    #[test]
    fn submit_skips_empty_passes() {
        let grid = TerrainGrid::flat(3, 3, 1.0).unwrap();
        let fan = fan_for(&grid, 0, [false; 4]);
        let mut frame = FrameBuffers::new();
        frame.begin(&[0, 3], false, None);
        frame.emit_fan(&fan, 0b1111).unwrap();

        let mut recorder = MeshRecorder::new();
        frame.submit(&mut recorder);
        assert_eq!(recorder.batches.len(), 1);
        assert_eq!(recorder.batches[0].kind, BatchKind::Material(0));
        assert_eq!(recorder.triangle_count(), 4);

        let (verts, tris) = recorder.trimesh_data(&grid);
        assert_eq!(tris.len(), 4);
        assert_eq!(verts.len(), 5);
        for tri in &tris {
            assert!(tri.iter().all(|&i| (i as usize) < verts.len()));
        }
    }
}
