//! Course statistics command

use anyhow::Result;
use piste_terrain::{BatchKind, MeshRecorder};

use super::load_course;

pub fn run(course: &str, detail: Option<f32>) -> Result<()> {
    let mut loaded = load_course(course, detail, 2.0)?;
    let lod = &mut loaded.lod;

    let mut recorder = MeshRecorder::new();
    let frame = lod.render(&mut recorder)?;
    let stats = lod.stats();

    println!("Course: {}", loaded.config.name);
    if let Some(tree) = lod.tree() {
        let grid = tree.grid();
        println!(
            "Grid: {}x{} samples ({:.1} x {:.1} world units)",
            grid.width, grid.depth, loaded.extent.0, loaded.extent.1
        );
        println!("Root level: {}", tree.root_level());
    }
    println!("");
    println!("Nodes: {} ({} static)", stats.tree.nodes, stats.tree.static_nodes);
    println!(
        "Enabled: {} nodes, {} children, {} edges, finest level {}",
        stats.tree.enabled_nodes,
        stats.tree.enabled_children,
        stats.tree.enabled_edges,
        stats.tree.finest_level
    );
    println!("");
    println!("Frame: {} triangles in {} batches", frame.triangles, frame.batches);

    for batch in &recorder.batches {
        let label = match batch.kind {
            BatchKind::Material(id) => loaded
                .config
                .material_defs
                .get(usize::from(id))
                .map_or_else(|| format!("material {}", id), |def| def.name.clone()),
            BatchKind::Junction => "junction".to_string(),
        };
        println!("  {:<12} {:>8} triangles", label, batch.indices.len() / 3);
    }

    if let Some(tree) = lod.tree() {
        let (vertices, triangles) = recorder.trimesh_data(tree.grid());
        println!("");
        println!(
            "Collision mesh: {} vertices, {} triangles",
            vertices.len(),
            triangles.len()
        );
    }

    Ok(())
}
