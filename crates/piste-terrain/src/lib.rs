//! Piste Terrain - view-dependent level of detail for ski-course terrain
//!
//! Builds a quadtree over a course's elevation and material grid, bakes in the
//! detail that is always needed, then refines or coarsens it every frame for
//! the viewer's position. The enabled tree is emitted as triangle fans into
//! per-material index buffers for the renderer to draw; no GPU code lives here.

pub mod arena;
pub mod corner;
pub mod emit;
pub mod frustum;
pub mod grid;
pub mod lod;
pub mod node;
pub mod quadtree;

pub use arena::NodeArena;
pub use corner::CornerContext;
pub use emit::{
    BatchKind, EmissionBuffer, FrameBuffers, MeshRecorder, Pass, PassBuffer, RecordedBatch,
    TerrainRenderer,
};
pub use frustum::{CameraParams, ClipResult, FrustumPlane, Plane, ViewFrustum};
pub use grid::{HeightPatch, TerrainGrid};
pub use lod::{FrameStats, LodStats, TerrainLod};
pub use node::{NodeFlags, NodeId, TerrainNode};
pub use quadtree::{QuadTree, TreeStats};

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use piste_core::{LodSettings, MaterialId};

    use crate::node::{EAST, SOUTH};

    fn surface(
        size: usize,
        height: impl Fn(f64, f64) -> f64,
        material: impl Fn(usize, usize) -> MaterialId,
    ) -> TerrainGrid {
        let mut elevation = Vec::with_capacity(size * size);
        let mut materials = Vec::with_capacity(size * size);
        for z in 0..size {
            for x in 0..size {
                elevation.push(height(x as f64, z as f64));
                materials.push(material(x, z));
            }
        }
        TerrainGrid::from_raw(elevation, materials, size, size, 1.0, 1.0).unwrap()
    }

    fn bowl() -> TerrainGrid {
        surface(9, |x, z| x * x + z * z + x * z, |_, _| 0)
    }

    fn gentle() -> TerrainGrid {
        surface(17, |x, z| 0.1 * (x * x + z * z) + 0.05 * x * z, |_, _| 0)
    }

    /// Enable state of every allocated node, in depth-first order
    fn snapshot(tree: &QuadTree) -> Vec<(i32, i32, i32, u8, [u16; 2])> {
        let mut out = Vec::new();
        tree.visit(false, &mut |_, node, cd| {
            out.push((
                cd.level,
                cd.xorg,
                cd.zorg,
                node.flags().bits(),
                node.sub_enabled_count(),
            ));
        });
        out
    }

    #[test]
    fn flat_course_renders_root_fan() {
        let mut lod = TerrainLod::default();
        lod.init(TerrainGrid::flat(9, 9, 1.0).unwrap(), Vec3::new(4.0, 10.0, 4.0), 0.0)
            .unwrap();

        let mut recorder = MeshRecorder::new();
        let frame = lod.render(&mut recorder).unwrap();
        assert_eq!(frame.triangles, 8);
        assert_eq!(frame.batches, 1);
        assert_eq!(lod.stats().tree.enabled_nodes, 1);
        assert!(recorder.batch(BatchKind::Material(0)).is_some());
        assert!(recorder.batch(BatchKind::Junction).is_none());
    }

    #[test]
    fn flat_course_never_refines() {
        let mut lod = TerrainLod::default();
        lod.init(TerrainGrid::flat(9, 9, 1.0).unwrap(), Vec3::new(4.0, 1.0, 4.0), 1.0e6)
            .unwrap();
        let stats = lod.stats().tree;
        assert_eq!(stats.nodes, 1);
        assert_eq!(stats.enabled_children, 0);
    }

    #[test]
    fn more_detail_never_enables_less() {
        let viewer = Vec3::new(4.0, 250.0, 4.0);
        let mut previous = 0;
        for detail in [0.0, 1.0, 5.0, 20.0, 75.0, 300.0, 1.0e4, 1.0e6] {
            let mut lod = TerrainLod::default();
            lod.init(bowl(), viewer, detail).unwrap();
            let enabled = lod.stats().tree.enabled_children;
            assert!(
                enabled >= previous,
                "detail {} enabled {} children, fewer than {}",
                detail,
                enabled,
                previous
            );
            previous = enabled;
        }

        let mut lod = TerrainLod::default();
        lod.init(bowl(), viewer, 1.0e6).unwrap();
        let mut recorder = MeshRecorder::new();
        lod.render(&mut recorder).unwrap();
        assert_eq!(lod.stats().tree.finest_level, 0);
        assert_eq!(recorder.unique_triangles().len(), 128);
    }

    #[test]
    fn enabled_edges_always_have_their_alias() {
        let mut lod = TerrainLod::default();
        lod.init(gentle(), Vec3::new(0.0, 3.0, 0.0), 75.0).unwrap();
        let tree = lod.tree().unwrap();
        assert_eq!(tree.edge_mismatches(), 0);

        for step in 0..24 {
            let t = step as f32;
            let viewer = Vec3::new(0.5 + t * 0.6, 2.0 + (t * 0.3).sin(), 0.5 + t * 0.65);
            lod.update(viewer, 75.0);
            assert_eq!(lod.tree().unwrap().edge_mismatches(), 0, "step {}", step);
        }

        lod.reset();
        lod.update(Vec3::new(8.0, 1.0, 8.0), 200.0);
        assert_eq!(lod.tree().unwrap().edge_mismatches(), 0);
    }

    #[test]
    fn converged_tree_is_stable() {
        let viewer = Vec3::new(3.0, 20.0, 5.0);
        let mut lod = TerrainLod::default();
        lod.init(bowl(), viewer, 75.0).unwrap();
        for _ in 0..3 {
            lod.update(viewer, 75.0);
        }

        let before = snapshot(lod.tree().unwrap());
        let mut recorder = MeshRecorder::new();
        let first = lod.render(&mut recorder).unwrap();

        lod.update(viewer, 75.0);
        assert_eq!(snapshot(lod.tree().unwrap()), before);
        let second = lod.render(&mut recorder).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn height_is_continuous_across_cells() {
        let mut lod = TerrainLod::default();
        lod.init(bowl(), Vec3::new(4.0, 5.0, 4.0), 75.0).unwrap();

        // The steepest slope is 24, so a real seam would jump far more than
        // the slope covers over 2e-4.
        let eps = 1e-4;
        for boundary in [1.0, 2.0, 4.0, 5.0, 7.0] {
            for along in [0.5, 3.3, 6.1, 7.9] {
                let dx = lod.height_at(boundary + eps, along) - lod.height_at(boundary - eps, along);
                let dz = lod.height_at(along, boundary + eps) - lod.height_at(along, boundary - eps);
                assert!(dx.abs() < 0.05, "jump {} across x = {}", dx, boundary);
                assert!(dz.abs() < 0.05, "jump {} across z = {}", dz, boundary);
            }
        }
        assert!((lod.height_at(3.0, 5.0) - 49.0).abs() < 1e-3);
    }

    #[test]
    fn material_seams_are_split_near_the_viewer() {
        // Seam splits are forced by distance alone, whatever the detail
        for detail in [0.0, 1.0, 75.0] {
            let grid = surface(9, |_, _| 0.0, |x, z| ((x + z) % 2) as MaterialId);
            let mut lod = TerrainLod::default();
            lod.init(grid, Vec3::new(4.0, 3.0, 4.0), detail).unwrap();
            let tree = lod.tree().unwrap();

            let mut finest = 0;
            tree.visit(true, &mut |_, node, cd| {
                if cd.level != 0 {
                    return;
                }
                finest += 1;
                let (east, south) = node.forced_edges();
                assert!(east && south, "detail {detail}");
                assert!(node.flags().has_edge(EAST));
                assert!(node.flags().has_edge(SOUTH));
            });
            assert_eq!(finest, 16, "detail {detail}");
            assert_eq!(tree.edge_mismatches(), 0);

            let mut recorder = MeshRecorder::new();
            lod.render(&mut recorder).unwrap();
            assert_eq!(recorder.unique_triangles().len(), 128, "detail {detail}");
        }
    }

    #[test]
    fn material_seams_collapse_far_away() {
        let grid = surface(9, |_, _| 0.0, |x, z| ((x + z) % 2) as MaterialId);
        let mut lod = TerrainLod::default();
        lod.init(grid, Vec3::new(4.0, 1000.0, 4.0), 75.0).unwrap();
        assert_eq!(lod.stats().tree.enabled_nodes, 1);
    }

    #[test]
    fn uniform_course_collapses_from_high_up() {
        let mut lod = TerrainLod::default();
        lod.init(bowl(), Vec3::new(4.0, 1.0e5, 4.0), 1.0).unwrap();

        let mut recorder = MeshRecorder::new();
        let frame = lod.render(&mut recorder).unwrap();
        assert_eq!(lod.stats().tree.enabled_nodes, 1);
        assert_eq!(frame.triangles, 8);
    }

    #[test]
    fn three_material_corners_go_to_junction_pass() {
        // Center 1, north-east corner 2, everything else 0
        let materials = vec![0, 0, 2, 0, 1, 0, 0, 0, 0];
        let mut lod = TerrainLod::default();
        lod.init_raw(vec![0.0; 9], materials, 3, 3, 1.0, 1.0, Vec3::Y, 75.0)
            .unwrap();

        let mut recorder = MeshRecorder::new();
        lod.render(&mut recorder).unwrap();
        let junction = recorder.batch(BatchKind::Junction).unwrap();
        assert!(!junction.indices.is_empty());

        // Blend pass for material 1 fades its ground-material corners out
        let blend = recorder.batch(BatchKind::Material(1)).unwrap();
        for (i, alpha) in blend.indices.iter().zip(&blend.alphas) {
            let expected = if lod.tree().unwrap().grid().material_at_index(*i) >= 1 {
                255
            } else {
                0
            };
            assert_eq!(*alpha, expected);
        }
    }

    #[test]
    fn solid_passes_without_blending() {
        let settings = LodSettings {
            blend_materials: false,
            ..LodSettings::default()
        };
        let materials = vec![0, 0, 2, 0, 1, 0, 0, 0, 0];
        let mut lod = TerrainLod::new(settings);
        lod.init_raw(vec![0.0; 9], materials, 3, 3, 1.0, 1.0, Vec3::Y, 75.0)
            .unwrap();

        let mut recorder = MeshRecorder::new();
        let frame = lod.render(&mut recorder).unwrap();
        assert!(recorder.batch(BatchKind::Junction).is_none());
        // Each triangle lands in the pass of its lowest material only
        assert_eq!(frame.triangles, recorder.unique_triangles().len());
    }

    #[test]
    fn frustum_culls_whole_course() {
        let mut lod = TerrainLod::default();
        lod.init(TerrainGrid::flat(9, 9, 1.0).unwrap(), Vec3::new(4.0, 5.0, 4.0), 0.0)
            .unwrap();

        let away = CameraParams::looking_at(Vec3::new(4.0, 5.0, 20.0), Vec3::new(4.0, 5.0, 40.0));
        lod.set_view_frustum(Some(ViewFrustum::new(&away)));
        let mut recorder = MeshRecorder::new();
        assert_eq!(lod.render(&mut recorder).unwrap().triangles, 0);
        assert!(recorder.batches.is_empty());

        let toward = CameraParams::looking_at(Vec3::new(4.0, 5.0, 20.0), Vec3::new(4.0, 0.0, 4.0));
        lod.set_view_frustum(Some(ViewFrustum::new(&toward)));
        assert!(lod.render(&mut recorder).unwrap().triangles > 0);

        lod.set_view_frustum(None);
        assert_eq!(lod.render(&mut recorder).unwrap().triangles, 8);
    }

    #[test]
    fn height_patch_raises_course() {
        let mut lod = TerrainLod::default();
        lod.init(bowl(), Vec3::new(4.0, 50.0, 4.0), 75.0).unwrap();
        let before: Vec<f64> = [(0.0, 0.0), (3.5, 2.0), (8.0, 8.0), (6.2, 7.9)]
            .iter()
            .map(|&(x, z)| lod.height_at(x, z))
            .collect();

        let deltas = vec![5.0; 81];
        let patch = HeightPatch::new(&deltas, 0, 0, 9, 9, 9, 0).unwrap();
        lod.add_height_map(&patch).unwrap();
        lod.update(Vec3::new(4.0, 50.0, 4.0), 75.0);

        for (&(x, z), old) in [(0.0, 0.0), (3.5, 2.0), (8.0, 8.0), (6.2, 7.9)]
            .iter()
            .zip(before)
        {
            assert!((lod.height_at(x, z) - old - 5.0).abs() < 1e-3);
        }
        assert_eq!(lod.tree().unwrap().edge_mismatches(), 0);
    }
}
