//! The refinable quadtree over a terrain grid
//!
//! Holds the node arena together with the grid it was built from and runs the
//! per-node algorithms that need both: the error metric, the static bake, the
//! per-frame enable/disable update, frustum clipping, height queries and the
//! triangle fan traversal.

use std::f32::consts::SQRT_2;

use glam::Vec3;
use piste_core::{LodSettings, MaterialId, Result};

use crate::arena::NodeArena;
use crate::corner::CornerContext;
use crate::emit::{Fan, FrameBuffers};
use crate::frustum::{ClipResult, ViewFrustum};
use crate::grid::{HeightPatch, TerrainGrid};
use crate::node::{
    quadrant_error, NodeFlags, NodeId, TerrainNode, EAST, NE, NORTH, NW, SE, SOUTH, SW, WEST,
};

/// Child visit order used by the update and the static bake
const VISIT_ORDER: [usize; 4] = [NW, NE, SW, SE];

/// Edge vertices that differ by less than this from the straight line between
/// their corners carry no detail.
const LINEAR_EPSILON: f32 = 1e-5;

/// Smallest level whose root spans every cell of a `width` x `depth` grid
pub fn root_level(width: usize, depth: usize) -> i32 {
    let cells = width.max(depth).saturating_sub(1).max(1);
    let mut level = 0;
    while (2usize << level) < cells {
        level += 1;
    }
    level
}

/// Viewer and detail threshold for one update, in grid space
#[derive(Debug, Clone, Copy)]
struct View {
    pos: Vec3,
    detail: f32,
}

/// What a node needs from its parent to decide whether to switch itself off.
/// This is the same box and error the parent uses to switch it on, so a
/// converged tree does not flip back and forth.
#[derive(Debug, Clone, Copy, Default)]
struct ParentBox {
    error: f32,
    min_y: f32,
    max_y: f32,
    mixed: bool,
}

/// Summary counts over the tree
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    /// Allocated nodes
    pub nodes: usize,
    pub static_nodes: usize,
    /// Nodes reachable from the root through enabled child links
    pub enabled_nodes: usize,
    /// Child-enable bits set across the enabled tree
    pub enabled_children: usize,
    /// Edge vertices enabled across the enabled tree
    pub enabled_edges: usize,
    /// Finest level reached by the enabled tree
    pub finest_level: i32,
}

pub struct QuadTree {
    arena: NodeArena,
    root: NodeId,
    root_level: i32,
    root_verts: [f32; 4],
    grid: TerrainGrid,
    scale_x: f32,
    scale_z: f32,
    settings: LodSettings,
    frustum: Option<ViewFrustum>,
}

impl QuadTree {
    /// Build a tree holding every sample of `grid` at full resolution.
    pub fn build(grid: TerrainGrid, settings: LodSettings) -> Result<Self> {
        let level = root_level(grid.width, grid.depth);
        let mut arena = NodeArena::new();
        let root = arena.insert(TerrainNode::new(&CornerContext::root(level, [0.0; 4])))?;

        let mut tree = Self {
            arena,
            root,
            root_level: level,
            root_verts: [0.0; 4],
            scale_x: grid.scale_x as f32,
            scale_z: grid.scale_z as f32,
            grid,
            settings,
            frustum: None,
        };

        let cd = tree.root_context();
        tree.arena.add_height_map(tree.root, &cd, &tree.grid.full_patch())?;

        // The root corners are not a vertex of any node; take them straight
        // from the grid.
        let whole = 2 << level;
        tree.root_verts = [
            tree.grid.elevation(whole, 0) as f32,
            tree.grid.elevation(0, 0) as f32,
            tree.grid.elevation(0, whole) as f32,
            tree.grid.elevation(whole, whole) as f32,
        ];
        tree.arena[root].dirty = true;

        log::info!(
            "Built terrain quadtree: {}x{} grid, root level {}, {} nodes",
            tree.grid.width,
            tree.grid.depth,
            level,
            tree.arena.len()
        );
        Ok(tree)
    }

    pub fn grid(&self) -> &TerrainGrid {
        &self.grid
    }

    pub fn settings(&self) -> &LodSettings {
        &self.settings
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn root_level(&self) -> i32 {
        self.root_level
    }

    pub fn node(&self, id: NodeId) -> &TerrainNode {
        &self.arena[id]
    }

    pub fn node_count(&self) -> usize {
        self.arena.len()
    }

    /// Cap how many nodes the tree may hold. `None` lifts the cap.
    pub fn set_node_budget(&mut self, budget: Option<usize>) {
        self.arena.set_budget(budget);
    }

    pub fn set_view_frustum(&mut self, frustum: Option<ViewFrustum>) {
        self.frustum = frustum;
    }

    pub fn view_frustum(&self) -> Option<&ViewFrustum> {
        self.frustum.as_ref()
    }

    fn root_context(&self) -> CornerContext<'static> {
        let mut cd = CornerContext::root(self.root_level, self.root_verts);
        cd.node = Some(self.root);
        cd
    }

    fn row_size(&self) -> i32 {
        self.grid.width as i32
    }

    fn num_rows(&self) -> i32 {
        self.grid.depth as i32
    }

    /// Add a window of height deltas. New nodes become static.
    ///
    /// On error no height has changed and the tree is back to its static form.
    pub fn add_height_map(&mut self, patch: &HeightPatch<'_>) -> Result<()> {
        let cd = self.root_context();
        self.arena.add_height_map(self.root, &cd, patch)?;

        let whole = cd.whole();
        let corners = [(whole, 0), (0, 0), (0, whole), (whole, whole)];
        for (vert, (x, z)) in self.root_verts.iter_mut().zip(corners) {
            if patch.contains(x, z) {
                *vert += patch.sample(x, z);
            }
        }
        self.arena[self.root].dirty = true;
        Ok(())
    }

    /// Drop all dynamic nodes and enable state.
    pub fn reset(&mut self) {
        self.arena.reset_tree(self.root);
    }

    // Error metric

    fn recompute_error(&mut self, id: NodeId, cd: &CornerContext<'_>) -> f32 {
        let whole = cd.whole();
        let c = cd.verts;
        let v = self.arena[id].vertex;

        let diagonal = if cd.child_index & 1 != 0 {
            (c[1] + c[3]) * 0.5
        } else {
            (c[0] + c[2]) * 0.5
        };
        let mut max_error = (v[0] - diagonal).abs();

        let mut min_y = v[0];
        let mut max_y = v[0];
        for &y in c.iter().chain(&v[1..]) {
            min_y = min_y.min(y);
            max_y = max_y.max(y);
        }

        let mut error = [0.0f32; 6];
        error[0] = (v[1] - (c[0] + c[3]) * 0.5).abs();
        error[1] = (v[4] - (c[2] + c[3]) * 0.5).abs();

        let mut force_east = false;
        let mut force_south = false;
        if cd.level == 0 {
            let seam_error = self.settings.terrain_error_scale * (whole * whole) as f32;
            force_east = self.seam_along(cd.xorg + whole, cd.zorg, (0, 1), whole);
            force_south = self.seam_along(cd.xorg, cd.zorg + whole, (1, 0), whole);
            if force_east {
                error[0] = error[0].max(seam_error);
            }
            if force_south {
                error[1] = error[1].max(seam_error);
            }
        }
        max_error = max_error.max(error[0]).max(error[1]);

        for i in 0..4 {
            let child = self.arena[id].children[i];
            error[i + 2] = match child {
                Some(child) => {
                    let q = cd.child(&self.arena[id], i);
                    let e = self.recompute_error(child, &q);
                    let (lo, hi) = self.arena[child].height_range();
                    min_y = min_y.min(lo);
                    max_y = max_y.max(hi);
                    e
                }
                None => quadrant_error(&v, c[i], i),
            };
            max_error = max_error.max(error[i + 2]);
        }

        let (mix_error, mixed_quadrants) = self.material_mix(cd);
        max_error = max_error.max(mix_error);
        error[0] = error[0].max(mix_error);
        error[1] = error[1].max(mix_error);

        let node = &mut self.arena[id];
        node.error = error;
        node.min_y = min_y;
        node.max_y = max_y;
        node.force_east = force_east;
        node.force_south = force_south;
        node.mixed_quadrants = mixed_quadrants;
        node.dirty = false;

        max_error
    }

    /// True when the material changes along the `cells` samples after `(x, z)`
    /// in direction `step`. Samples past the grid are ignored.
    fn seam_along(&self, x: i32, z: i32, step: (i32, i32), cells: i32) -> bool {
        let (row, rows) = (self.row_size(), self.num_rows());
        if x >= row || z >= rows {
            return false;
        }
        let first = self.grid.material(x, z);
        (1..=cells)
            .map(|k| (x + k * step.0, z + k * step.1))
            .take_while(|&(px, pz)| px < row && pz < rows)
            .any(|(px, pz)| self.grid.material(px, pz) != first)
    }

    /// Error bonus for a node covering several materials, plus a bit per
    /// child quadrant that is not a single material.
    fn material_mix(&self, cd: &CornerContext<'_>) -> (f32, u8) {
        let whole = cd.whole();
        let half = cd.half();
        let x_range = cd.xorg.max(0)..=(cd.xorg + whole).min(self.row_size() - 1);
        let z_range = cd.zorg.max(0)..=(cd.zorg + whole).min(self.num_rows() - 1);
        let (mid_x, mid_z) = (cd.xorg + half, cd.zorg + half);

        let material_count = self.grid.material_count();
        let mut counts = vec![0u32; material_count];
        let mut first: [Option<MaterialId>; 4] = [None; 4];
        let mut mixed = 0u8;
        let mut total = 0u32;

        for z in z_range {
            for x in x_range.clone() {
                let m = self.grid.material(x, z);
                counts[m as usize] += 1;
                total += 1;

                let (east, west) = (x >= mid_x, x <= mid_x);
                let (north, south) = (z <= mid_z, z >= mid_z);
                for (quadrant, inside) in [
                    (NE, east && north),
                    (NW, west && north),
                    (SW, west && south),
                    (SE, east && south),
                ] {
                    if !inside {
                        continue;
                    }
                    match first[quadrant] {
                        None => first[quadrant] = Some(m),
                        Some(f) if f != m => mixed |= 1 << quadrant,
                        Some(_) => {}
                    }
                }
            }
        }

        if total == 0 {
            return (0.0, mixed);
        }

        let dominant = counts.iter().copied().max().unwrap_or(0);
        let mut fraction = 1.0 - dominant as f32 / total as f32;
        if material_count > 1 {
            fraction *= material_count as f32 / (material_count as f32 - 1.0);
        }
        let error = fraction * (whole * whole) as f32 * self.settings.terrain_error_scale;
        (error, mixed)
    }

    // Static bake

    /// Drop detail that is invisible at `threshold`, keeping what is left as
    /// the permanent base tree.
    pub fn static_cull(&mut self, threshold: f32) {
        let before = self.arena.len();
        self.reset();

        let cd = self.root_context();
        if self.arena[self.root].dirty {
            self.recompute_error(self.root, &cd);
        }
        for level in 0..=self.root_level {
            self.static_cull_aux(self.root, &cd, threshold, level);
        }

        log::info!(
            "Static bake at detail {}: {} -> {} nodes",
            threshold,
            before,
            self.arena.len()
        );
    }

    fn static_cull_aux(&mut self, id: NodeId, cd: &CornerContext<'_>, threshold: f32, target: i32) {
        if cd.level > target {
            for i in VISIT_ORDER {
                let Some(child) = self.arena[id].children[i] else {
                    continue;
                };
                let q = cd.child(&self.arena[id], i);
                self.static_cull_aux(child, &q, threshold, target);
            }
            return;
        }

        let size = cd.whole() as f32;

        let node = &self.arena[id];
        if node.children[NE].is_none() && node.children[SE].is_none() && node.error[0] * threshold < size {
            let s = self.arena.neighbor(EAST, cd);
            let clear = s.map_or(true, |s| {
                self.arena[s].children[NW].is_none() && self.arena[s].children[SW].is_none()
            });
            if clear {
                self.flatten_edge(id, EAST, (cd.verts[0] + cd.verts[3]) * 0.5, s);
            }
        }

        let node = &self.arena[id];
        if node.children[SW].is_none() && node.children[SE].is_none() && node.error[1] * threshold < size {
            let s = self.arena.neighbor(SOUTH, cd);
            let clear = s.map_or(true, |s| {
                self.arena[s].children[NE].is_none() && self.arena[s].children[NW].is_none()
            });
            if clear {
                self.flatten_edge(id, SOUTH, (cd.verts[2] + cd.verts[3]) * 0.5, s);
            }
        }

        let children = self.arena[id].children;
        let mut has_children = false;
        for child in children.into_iter().flatten() {
            has_children = true;
            if self.arena[child].dirty {
                self.arena[id].dirty = true;
            }
        }
        if has_children {
            return;
        }

        let Some(parent) = cd.parent.and_then(|p| p.node) else {
            return;
        };
        let node = &self.arena[id];
        let necessary = (0..4).any(|i| {
            let linear = (cd.verts[i] + cd.verts[(i + 3) & 3]) * 0.5;
            (node.vertex[i + 1] - linear).abs() > LINEAR_EPSILON
        });
        if !necessary && self.arena[parent].error[2 + cd.child_index] * threshold < size * SQRT_2 {
            self.arena[parent].children[cd.child_index] = None;
            self.arena.remove_subtree(id);
        }
    }

    /// Snap owned edge vertex `edge` to `y` on this node and its neighbour alias.
    fn flatten_edge(&mut self, id: NodeId, edge: usize, y: f32, neighbor: Option<NodeId>) {
        let node = &mut self.arena[id];
        node.vertex[edge + 1] = y;
        node.error[edge & 1] = 0.0;
        node.dirty = true;
        if let Some(s) = neighbor {
            let alias = &mut self.arena[s];
            alias.vertex[(edge ^ 2) + 1] = y;
            alias.dirty = true;
        }
    }

    // Per-frame update

    /// Refine or coarsen the enabled tree for a viewer at world position `viewer`.
    ///
    /// If a node cannot be created the tree is reset to its static form and the
    /// error returned.
    pub fn update(&mut self, viewer: Vec3, detail: f32) -> Result<()> {
        let view = View {
            pos: Vec3::new(viewer.x / self.scale_x, viewer.y, viewer.z / self.scale_z),
            detail,
        };
        let cd = self.root_context();
        let result =
            self.update_aux(self.root, &cd, &view, ParentBox::default(), ClipResult::SomeClip);
        if result.is_err() {
            self.reset();
        }
        result
    }

    fn update_aux(
        &mut self,
        id: NodeId,
        cd: &CornerContext<'_>,
        view: &View,
        parent_box: ParentBox,
        mut vis: ClipResult,
    ) -> Result<()> {
        if vis != ClipResult::NoClip {
            vis = self.clip_square(id, cd);
            if vis == ClipResult::NotVisible {
                return Ok(());
            }
        }

        if self.arena[id].dirty {
            self.recompute_error(id, cd);
        }

        let half = cd.half();
        let whole = cd.whole();
        let (x, z) = (cd.xorg, cd.zorg);

        if self.wants_edge(id, EAST, cd, view) {
            self.arena.enable_edge_vertex(id, EAST, false, cd)?;
        }
        if self.wants_edge(id, SOUTH, cd, view) {
            self.arena.enable_edge_vertex(id, SOUTH, false, cd)?;
        }

        if cd.level > 0 {
            for i in VISIT_ORDER {
                if self.arena[id].flags.has_child(i) {
                    continue;
                }
                let (cx, cz) = child_origin(x, z, half, i);
                let node = &self.arena[id];
                let wanted = self.box_test(
                    cx,
                    cz,
                    half,
                    node.min_y,
                    node.max_y,
                    node.error[2 + i],
                    node.mixed_quadrants & (1 << i) != 0,
                    view,
                );
                if wanted {
                    self.arena.enable_child(id, i, cd)?;
                }
            }

            for i in VISIT_ORDER {
                let node = &self.arena[id];
                if !node.flags.has_child(i) {
                    continue;
                }
                let Some(child) = node.children[i] else {
                    continue;
                };
                let child_box = ParentBox {
                    error: node.error[2 + i],
                    min_y: node.min_y,
                    max_y: node.max_y,
                    mixed: node.mixed_quadrants & (1 << i) != 0,
                };
                let q = cd.child(node, i);
                self.update_aux(child, &q, view, child_box, vis)?;
            }
        }

        // Teardown of owned edges no longer pinned by a child
        let node = &self.arena[id];
        if node.flags.has_edge(EAST)
            && node.sub_enabled_count[0] == 0
            && !self.edge_test(id, EAST, cd, view)
        {
            self.arena[id].flags.remove(NodeFlags::edge(EAST));
            if let Some(s) = self.arena.neighbor(EAST, cd) {
                self.arena[s].flags.remove(NodeFlags::edge(WEST));
            }
        }

        let node = &self.arena[id];
        if node.flags.has_edge(SOUTH)
            && node.sub_enabled_count[1] == 0
            && !self.edge_test(id, SOUTH, cd, view)
        {
            self.arena[id].flags.remove(NodeFlags::edge(SOUTH));
            if let Some(s) = self.arena.neighbor(SOUTH, cd) {
                self.arena[s].flags.remove(NodeFlags::edge(NORTH));
            }
        }

        if !self.arena[id].flags.is_empty() {
            return Ok(());
        }
        let Some(parent) = cd.parent else {
            return Ok(());
        };
        let keep = self.box_test(
            x,
            z,
            whole,
            parent_box.min_y,
            parent_box.max_y,
            parent_box.error,
            parent_box.mixed,
            view,
        );
        if !keep {
            if let Some(pid) = parent.node {
                self.arena.notify_child_disable(pid, cd.child_index, parent);
            }
        }
        Ok(())
    }

    fn wants_edge(&self, id: NodeId, edge: usize, cd: &CornerContext<'_>, view: &View) -> bool {
        !self.arena[id].flags.has_edge(edge) && self.edge_test(id, edge, cd, view)
    }

    /// Vertex test for the owned east or south edge vertex
    fn edge_test(&self, id: NodeId, edge: usize, cd: &CornerContext<'_>, view: &View) -> bool {
        let node = &self.arena[id];
        let (half, whole) = (cd.half(), cd.whole());
        if edge == EAST {
            self.vertex_test(
                cd.xorg + whole,
                node.vertex[1],
                cd.zorg + half,
                node.error[0],
                node.force_east,
                view,
            )
        } else {
            self.vertex_test(
                cd.xorg + half,
                node.vertex[4],
                cd.zorg + whole,
                node.error[1],
                node.force_south,
                view,
            )
        }
    }

    fn vertex_test(&self, x: i32, y: f32, z: i32, error: f32, forced: bool, view: &View) -> bool {
        let dx = (x as f32 - view.pos.x).abs() * self.scale_x.abs();
        let dy = (y - view.pos.y).abs();
        let dz = (z as f32 - view.pos.z).abs() * self.scale_z.abs();
        let d = dx.max(dy).max(dz);

        if forced && d < self.settings.vertex_force_threshold {
            return true;
        }
        self.magnified(error, d) * view.detail > d
    }

    #[allow(clippy::too_many_arguments)]
    fn box_test(
        &self,
        x: i32,
        z: i32,
        size: i32,
        min_y: f32,
        max_y: f32,
        error: f32,
        mixed: bool,
        view: &View,
    ) -> bool {
        let half = size as f32 * 0.5;
        let dx = ((x as f32 + half - view.pos.x).abs() - half) * self.scale_x.abs();
        let dy = ((min_y + max_y) * 0.5 - view.pos.y).abs() - (max_y - min_y) * 0.5;
        let dz = ((z as f32 + half - view.pos.z).abs() - half) * self.scale_z.abs();
        let d = dx.max(dy).max(dz);

        if mixed && d < self.settings.vertex_force_threshold {
            return true;
        }
        if self.magnified(error, d) * view.detail > d {
            return true;
        }
        self.straddles_grid_edge(x, z, size)
    }

    fn magnified(&self, error: f32, distance: f32) -> f32 {
        if distance < self.settings.error_magnification_threshold {
            error * self.settings.error_magnification_amount
        } else {
            error
        }
    }

    fn straddles_grid_edge(&self, x: i32, z: i32, size: i32) -> bool {
        let (row, rows) = (self.row_size(), self.num_rows());
        (x < row - 1 && x + size >= row) || (z < rows - 1 && z + size >= rows)
    }

    /// Classify a node's box against the view frustum. Nodes past the grid are
    /// never visible and nodes hanging over its edge always need clipping.
    fn clip_square(&self, id: NodeId, cd: &CornerContext<'_>) -> ClipResult {
        let (row, rows) = (self.row_size(), self.num_rows());
        if cd.xorg >= row - 1 || cd.zorg >= rows - 1 {
            return ClipResult::NotVisible;
        }
        let whole = cd.whole();

        let result = match &self.frustum {
            Some(frustum) => {
                let node = &self.arena[id];
                let (x0, x1) = ordered(
                    cd.xorg as f32 * self.scale_x,
                    (cd.xorg + whole) as f32 * self.scale_x,
                );
                let (z0, z1) = ordered(
                    cd.zorg as f32 * self.scale_z,
                    (cd.zorg + whole) as f32 * self.scale_z,
                );
                frustum.classify_aabb(Vec3::new(x0, node.min_y, z0), Vec3::new(x1, node.max_y, z1))
            }
            None => ClipResult::NoClip,
        };
        if result != ClipResult::NoClip {
            return result;
        }

        if cd.xorg + whole >= row || cd.zorg + whole >= rows {
            ClipResult::SomeClip
        } else {
            ClipResult::NoClip
        }
    }

    // Height query

    /// Height at fractional grid coordinates, clamped to the grid. Follows
    /// static nodes only, so the answer does not depend on the view.
    pub fn height_at(&self, x: f32, z: f32) -> f32 {
        let x = x.clamp(0.0, (self.row_size() - 1) as f32);
        let z = z.clamp(0.0, (self.num_rows() - 1) as f32);
        let cd = self.root_context();
        self.height_aux(self.root, &cd, x, z)
    }

    fn height_aux(&self, id: NodeId, cd: &CornerContext<'_>, x: f32, z: f32) -> f32 {
        let node = &self.arena[id];
        let half = cd.half() as f32;
        let lx = (x - cd.xorg as f32) / half;
        let lz = (z - cd.zorg as f32) / half;
        let ix = (lx.floor() as i32).clamp(0, 1);
        let iz = (lz.floor() as i32).clamp(0, 1);

        let index = match (ix, iz) {
            (1, 0) => NE,
            (0, 0) => NW,
            (0, _) => SW,
            _ => SE,
        };

        if let Some(child) = node.children[index] {
            if self.arena[child].is_static {
                let q = cd.child(node, index);
                return self.height_aux(child, &q, x, z);
            }
        }

        let fx = (lx - ix as f32).clamp(0.0, 1.0);
        let fz = (lz - iz as f32).clamp(0.0, 1.0);

        let v = &node.vertex;
        let c = &cd.verts;
        let (s00, s01, s10, s11) = match index {
            NE => (v[2], c[0], v[0], v[1]),
            NW => (c[1], v[2], v[3], v[0]),
            SW => (v[3], v[0], c[2], v[4]),
            _ => (v[0], v[1], v[4], c[3]),
        };

        (s00 * (1.0 - fx) + s01 * fx) * (1.0 - fz) + (s10 * (1.0 - fx) + s11 * fx) * fz
    }

    // Triangle emission

    /// Emit the enabled tree into every pass of `frame`.
    pub fn render(&self, frame: &mut FrameBuffers) -> Result<()> {
        let cd = self.root_context();
        let vis = self.clip_square(self.root, &cd);
        if vis == ClipResult::NotVisible {
            return Ok(());
        }
        self.render_aux(self.root, &cd, vis, frame)
    }

    fn render_aux(
        &self,
        id: NodeId,
        cd: &CornerContext<'_>,
        vis: ClipResult,
        frame: &mut FrameBuffers,
    ) -> Result<()> {
        let node = &self.arena[id];
        let mut uncovered = 0u8;

        for i in 0..4 {
            let child = node.children[i].filter(|_| node.flags.has_child(i));
            let Some(child) = child else {
                uncovered |= 1 << i;
                continue;
            };
            let q = cd.child(node, i);
            let child_vis = if vis == ClipResult::NoClip {
                vis
            } else {
                self.clip_square(child, &q)
            };
            if child_vis != ClipResult::NotVisible {
                self.render_aux(child, &q, child_vis, frame)?;
            }
        }

        if uncovered == 0 {
            return Ok(());
        }

        let split = self.split_edges(node.flags, cd);
        let fan = Fan::new(&self.grid, cd, split);
        frame.emit_fan(&fan, uncovered)
    }

    /// Which sides of a fan are cut at their midpoint: enabled edges, plus
    /// sides on the outer grid boundary where no neighbour can disagree.
    fn split_edges(&self, flags: NodeFlags, cd: &CornerContext<'_>) -> [bool; 4] {
        let whole = cd.whole();
        let on_boundary = [
            cd.xorg + whole == self.row_size() - 1,
            cd.zorg == 0,
            cd.xorg == 0,
            cd.zorg + whole == self.num_rows() - 1,
        ];
        std::array::from_fn(|edge| flags.has_edge(edge) || on_boundary[edge])
    }

    // Inspection

    /// Walk the tree depth first. With `enabled_only` the walk follows enabled
    /// child links only.
    pub fn visit(
        &self,
        enabled_only: bool,
        f: &mut dyn FnMut(NodeId, &TerrainNode, &CornerContext<'_>),
    ) {
        let cd = self.root_context();
        self.visit_aux(self.root, &cd, enabled_only, f);
    }

    fn visit_aux(
        &self,
        id: NodeId,
        cd: &CornerContext<'_>,
        enabled_only: bool,
        f: &mut dyn FnMut(NodeId, &TerrainNode, &CornerContext<'_>),
    ) {
        let node = &self.arena[id];
        f(id, node, cd);
        for i in 0..4 {
            let Some(child) = node.children[i] else {
                continue;
            };
            if enabled_only && !node.flags.has_child(i) {
                continue;
            }
            let q = cd.child(node, i);
            self.visit_aux(child, &q, enabled_only, f);
        }
    }

    pub fn stats(&self) -> TreeStats {
        let mut stats = TreeStats {
            nodes: self.arena.len(),
            finest_level: self.root_level,
            ..TreeStats::default()
        };
        self.visit(false, &mut |_, node, _| {
            if node.is_static {
                stats.static_nodes += 1;
            }
        });
        self.visit(true, &mut |_, node, cd| {
            stats.enabled_nodes += 1;
            stats.enabled_children += node.flags.enabled_children() as usize;
            stats.enabled_edges += (node.flags & NodeFlags::EDGES).bits().count_ones() as usize;
            stats.finest_level = stats.finest_level.min(cd.level);
        });
        stats
    }

    /// Count enabled edge vertices whose neighbour alias is off or holds a
    /// different height. Zero on a crack-free tree.
    pub fn edge_mismatches(&self) -> usize {
        let mut mismatches = 0;
        self.visit(false, &mut |_, node, cd| {
            for edge in [EAST, NORTH, WEST, SOUTH] {
                if !node.flags.has_edge(edge) {
                    continue;
                }
                let Some(s) = self.arena.neighbor(edge, cd) else {
                    continue;
                };
                let alias = &self.arena[s];
                let mirror = edge ^ 2;
                if !alias.flags.has_edge(mirror)
                    || alias.vertex[mirror + 1].to_bits() != node.vertex[edge + 1].to_bits()
                {
                    mismatches += 1;
                }
            }
        });
        mismatches
    }
}

fn child_origin(x: i32, z: i32, half: i32, index: usize) -> (i32, i32) {
    match index {
        NE => (x + half, z),
        NW => (x, z),
        SW => (x, z + half),
        _ => (x + half, z + half),
    }
}

fn ordered(a: f32, b: f32) -> (f32, f32) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frustum::CameraParams;
    use piste_core::PisteError;

    fn relief(size: usize, f: impl Fn(f64, f64) -> f64) -> TerrainGrid {
        let mut elevation = Vec::with_capacity(size * size);
        for z in 0..size {
            for x in 0..size {
                elevation.push(f(x as f64, z as f64));
            }
        }
        TerrainGrid::from_raw(elevation, vec![0; size * size], size, size, 1.0, 1.0).unwrap()
    }

    fn baked(grid: TerrainGrid) -> QuadTree {
        let settings = LodSettings::default();
        let cull = settings.cull_detail;
        let mut tree = QuadTree::build(grid, settings).unwrap();
        tree.static_cull(cull);
        tree
    }

    #[test]
    fn root_level_covers_grid() {
        assert_eq!(root_level(2, 2), 0);
        assert_eq!(root_level(3, 3), 0);
        assert_eq!(root_level(5, 5), 1);
        assert_eq!(root_level(9, 9), 2);
        assert_eq!(root_level(10, 4), 3);
        assert_eq!(root_level(1025, 1025), 9);
    }

    #[test]
    fn build_stores_every_sample() {
        let grid = relief(9, |x, z| x * x + z);
        let tree = QuadTree::build(grid, LodSettings::default()).unwrap();
        // 1 + 4 + 16 nodes down to level 0
        assert_eq!(tree.node_count(), 21);
        assert_eq!(tree.root_level(), 2);
        let root = tree.node(tree.root());
        assert_eq!(root.vertex(0), 20.0);
        assert_eq!(root.vertex(1), 68.0);
        assert!(root.is_static());
    }

    #[test]
    fn static_bake_removes_flat_detail() {
        let flat = TerrainGrid::flat(9, 9, 1.0).unwrap();
        let mut tree = QuadTree::build(flat, LodSettings::default()).unwrap();
        tree.static_cull(25.0);
        assert_eq!(tree.node_count(), 1);

        let rough = relief(9, |x, z| x * x + z * z + x * z);
        let mut bumpy = QuadTree::build(rough, LodSettings::default()).unwrap();
        bumpy.static_cull(25.0);
        assert_eq!(bumpy.node_count(), 21);
    }

    #[test]
    fn height_matches_grid_samples() {
        let grid = relief(9, |x, z| 0.5 * x * x - 0.25 * z * z + x * z);
        let expected = grid.clone();
        let tree = baked(grid);
        for z in 0..9 {
            for x in 0..9 {
                let h = tree.height_at(x as f32, z as f32);
                let e = expected.elevation(x, z) as f32;
                assert!((h - e).abs() < 1e-3, "({x}, {z}): {h} vs {e}");
            }
        }
        // Between samples the surface is bilinear within the cell
        let h = tree.height_at(2.5, 3.5);
        let e = 0.25
            * (expected.elevation(2, 3)
                + expected.elevation(3, 3)
                + expected.elevation(2, 4)
                + expected.elevation(3, 4)) as f32;
        assert!((h - e).abs() < 1e-3);
    }

    #[test]
    fn height_clamps_outside_grid() {
        let tree = baked(relief(9, |x, z| x + 2.0 * z));
        assert!((tree.height_at(-5.0, 0.0) - 0.0).abs() < 1e-4);
        assert!((tree.height_at(20.0, 20.0) - 24.0).abs() < 1e-4);
    }

    #[test]
    fn update_refines_near_viewer_and_keeps_aliases() {
        let mut tree = baked(relief(9, |x, z| x * x + z * z + x * z));
        for _ in 0..4 {
            tree.update(Vec3::new(1.0, 5.0, 1.0), 5.0).unwrap();
        }
        let stats = tree.stats();
        assert!(stats.enabled_children > 0);
        assert_eq!(stats.finest_level, 0);
        assert_eq!(tree.edge_mismatches(), 0);
    }

    #[test]
    fn frustum_facing_away_skips_everything() {
        let mut tree = baked(relief(9, |x, z| x * x + z * z));
        let camera = CameraParams::looking_at(Vec3::new(4.0, 5.0, -20.0), Vec3::new(4.0, 5.0, -40.0));
        tree.set_view_frustum(Some(ViewFrustum::new(&camera)));
        tree.update(Vec3::new(4.0, 5.0, -20.0), 1000.0).unwrap();
        assert_eq!(tree.stats().enabled_children, 0);
    }

    #[test]
    fn nodes_past_the_grid_are_invisible() {
        let grid = TerrainGrid::flat(5, 3, 1.0).unwrap();
        let tree = QuadTree::build(grid, LodSettings::default()).unwrap();
        let mut clips = Vec::new();
        tree.visit(false, &mut |id, _, cd| {
            clips.push((cd.level, cd.xorg, cd.zorg, tree.clip_square(id, cd)));
        });
        assert!(clips.contains(&(0, 0, 2, ClipResult::NotVisible)));
        assert!(clips.contains(&(0, 2, 0, ClipResult::NoClip)));
        assert!(clips.contains(&(1, 0, 0, ClipResult::SomeClip)));
    }

    #[test]
    fn update_over_node_budget_falls_back_to_static_tree() {
        let mut tree = baked(TerrainGrid::flat(6, 6, 1.0).unwrap());
        assert_eq!(tree.node_count(), 1);
        tree.set_node_budget(Some(3));

        let err = tree.update(Vec3::new(1.0, 5.0, 1.0), 1.0).unwrap_err();
        assert!(matches!(err, PisteError::NodeBudgetExceeded { budget: 3 }));
        assert_eq!(tree.node_count(), 1);
        assert_eq!(tree.stats().enabled_children, 0);
        assert_eq!(tree.edge_mismatches(), 0);

        tree.set_node_budget(None);
        tree.update(Vec3::new(1.0, 5.0, 1.0), 1.0).unwrap();
        assert!(tree.node_count() > 3);
        assert_eq!(tree.edge_mismatches(), 0);
    }
}
