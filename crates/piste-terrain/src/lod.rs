//! Level-of-detail driver: owns the tree and the frame buffers

use glam::Vec3;
use piste_core::{LodSettings, MaterialId, PisteError, Result};

use crate::emit::{FrameBuffers, TerrainRenderer};
use crate::frustum::ViewFrustum;
use crate::grid::{HeightPatch, TerrainGrid};
use crate::quadtree::{QuadTree, TreeStats};

/// Counts for the most recently submitted frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub triangles: usize,
    /// Non-empty batches handed to the renderer
    pub batches: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LodStats {
    pub tree: TreeStats,
    pub last_frame: FrameStats,
    pub frames: u64,
}

/// Terrain LOD engine for one loaded course.
///
/// Until [`TerrainLod::init`] succeeds the engine is flat: it renders nothing
/// and every height query returns 0.
pub struct TerrainLod {
    tree: Option<QuadTree>,
    settings: LodSettings,
    frustum: Option<ViewFrustum>,
    frame: FrameBuffers,
    materials: Vec<MaterialId>,
    last_frame: FrameStats,
    frames: u64,
    /// Update error that cancels the next frame
    failed_update: Option<PisteError>,
}

impl Default for TerrainLod {
    fn default() -> Self {
        Self::new(LodSettings::default())
    }
}

impl TerrainLod {
    pub fn new(settings: LodSettings) -> Self {
        Self {
            tree: None,
            settings,
            frustum: None,
            frame: FrameBuffers::new(),
            materials: Vec::new(),
            last_frame: FrameStats::default(),
            frames: 0,
            failed_update: None,
        }
    }

    pub fn settings(&self) -> &LodSettings {
        &self.settings
    }

    pub fn is_loaded(&self) -> bool {
        self.tree.is_some()
    }

    pub fn tree(&self) -> Option<&QuadTree> {
        self.tree.as_ref()
    }

    /// Build the tree for `grid`, bake its static detail and converge it for
    /// the first viewer position. On error the engine is left flat.
    pub fn init(&mut self, grid: TerrainGrid, viewer: Vec3, detail: f32) -> Result<()> {
        self.tree = None;
        self.materials.clear();
        self.failed_update = None;

        if let Err(e) = self.settings.validate() {
            log::warn!("Rejected LOD settings, terrain disabled: {}", e);
            return Err(e);
        }
        if let Err(e) = check_detail(detail) {
            log::warn!("Rejected terrain init: {}", e);
            return Err(e);
        }

        let materials = grid.materials_present();
        let mut tree = match QuadTree::build(grid, self.settings.clone()) {
            Ok(tree) => tree,
            Err(e) => {
                log_failure("Terrain build failed, terrain disabled", &e);
                return Err(e);
            }
        };
        tree.static_cull(self.settings.cull_detail);
        tree.set_node_budget(self.settings.node_budget);
        tree.set_view_frustum(self.frustum.clone());
        for _ in 0..self.settings.warmup_passes {
            if let Err(e) = tree.update(viewer, detail) {
                log_failure("Terrain warm-up failed, terrain disabled", &e);
                return Err(e);
            }
        }

        let stats = tree.stats();
        log::info!(
            "Terrain ready: {} nodes ({} static), {} enabled after {} warm-up passes",
            stats.nodes,
            stats.static_nodes,
            stats.enabled_nodes,
            self.settings.warmup_passes
        );

        self.materials = materials;
        self.tree = Some(tree);
        self.last_frame = FrameStats::default();
        self.frames = 0;
        Ok(())
    }

    /// Validate raw samples and [`init`](Self::init) from them.
    #[allow(clippy::too_many_arguments)]
    pub fn init_raw(
        &mut self,
        elevation: Vec<f64>,
        materials: Vec<MaterialId>,
        width: usize,
        depth: usize,
        scale_x: f64,
        scale_z: f64,
        viewer: Vec3,
        detail: f32,
    ) -> Result<()> {
        match TerrainGrid::from_raw(elevation, materials, width, depth, scale_x, scale_z) {
            Ok(grid) => self.init(grid, viewer, detail),
            Err(e) => {
                log::warn!("Rejected terrain grid, terrain disabled: {}", e);
                self.tree = None;
                self.materials.clear();
                Err(e)
            }
        }
    }

    /// Refine or coarsen for the viewer's world position. Call once per
    /// frame before [`render`](Self::render).
    ///
    /// A bad detail or viewer leaves the tree untouched. If the tree cannot
    /// grow it falls back to its static form and the next frame is skipped.
    pub fn update(&mut self, viewer: Vec3, detail: f32) {
        let Some(tree) = self.tree.as_mut() else {
            return;
        };
        if let Err(e) = check_detail(detail) {
            log::warn!("Terrain update ignored: {}", e);
            return;
        }
        if !viewer.is_finite() {
            log::warn!("Terrain update ignored: viewer at {}", viewer);
            return;
        }
        if let Err(e) = tree.update(viewer, detail) {
            log_failure("Terrain update failed", &e);
            self.failed_update = Some(e);
            return;
        }
        log::debug!(
            "Terrain update at ({:.1}, {:.1}, {:.1}), detail {}",
            viewer.x,
            viewer.y,
            viewer.z,
            detail
        );
    }

    /// Emit every pass and, if all of them succeed, hand them to `renderer`.
    /// A failed frame draws nothing and leaves the tree as it was.
    pub fn render(&mut self, renderer: &mut dyn TerrainRenderer) -> Result<FrameStats> {
        let Some(tree) = self.tree.as_ref() else {
            return Ok(FrameStats::default());
        };
        if let Some(e) = self.failed_update.take() {
            log::warn!("Terrain frame skipped after failed update");
            return Err(e);
        }

        self.frame.begin(
            &self.materials,
            self.settings.blend_materials,
            self.settings.triangle_budget,
        );

        if let Err(e) = tree.render(&mut self.frame) {
            log_failure("Terrain frame skipped", &e);
            return Err(e);
        }

        self.frame.submit(renderer);
        let stats = FrameStats {
            triangles: self.frame.triangle_count(),
            batches: self
                .frame
                .passes()
                .iter()
                .filter(|p| !p.buffer.is_empty())
                .count(),
        };
        log::debug!(
            "Terrain frame: {} triangles in {} batches",
            stats.triangles,
            stats.batches
        );

        self.last_frame = stats;
        self.frames += 1;
        Ok(stats)
    }

    /// Terrain height at world `(x, z)`, clamped to the course
    pub fn height_at(&self, x: f64, z: f64) -> f64 {
        let Some(tree) = &self.tree else {
            return 0.0;
        };
        let (gx, gz) = tree.grid().world_to_grid(x, z);
        f64::from(tree.height_at(gx as f32, gz as f32))
    }

    /// Cull against `frustum` from now on, or stop culling with `None`.
    pub fn set_view_frustum(&mut self, frustum: Option<ViewFrustum>) {
        if let Some(tree) = self.tree.as_mut() {
            tree.set_view_frustum(frustum.clone());
        }
        self.frustum = frustum;
    }

    /// Drop all dynamic detail; the next update starts from the static tree.
    pub fn reset(&mut self) {
        if let Some(tree) = self.tree.as_mut() {
            tree.reset();
        }
    }

    /// Add height deltas on top of the loaded terrain. Does nothing while the
    /// engine is flat.
    ///
    /// On error the heights are unchanged and dynamic detail is dropped.
    pub fn add_height_map(&mut self, patch: &HeightPatch<'_>) -> Result<()> {
        let Some(tree) = self.tree.as_mut() else {
            return Ok(());
        };
        if let Err(e) = tree.add_height_map(patch) {
            log_failure("Height map rejected", &e);
            return Err(e);
        }
        Ok(())
    }

    pub fn stats(&self) -> LodStats {
        LodStats {
            tree: self.tree.as_ref().map(QuadTree::stats).unwrap_or_default(),
            last_frame: self.last_frame,
            frames: self.frames,
        }
    }
}

fn check_detail(detail: f32) -> Result<()> {
    if detail.is_finite() && detail >= 0.0 {
        return Ok(());
    }
    Err(PisteError::ValueOutOfRange {
        field: "detail".to_string(),
        min: 0.0,
        max: f64::from(f32::MAX),
        value: f64::from(detail),
    })
}

fn log_failure(context: &str, e: &PisteError) {
    match e {
        PisteError::Allocation(_) => log::error!("{}: {}", context, e),
        _ => log::warn!("{}: {}", context, e),
    }
}
