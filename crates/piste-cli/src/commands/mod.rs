//! CLI command implementations

pub mod fly;
pub mod height;
pub mod stats;

use anyhow::{Context, Result};
use glam::Vec3;
use piste_core::CourseConfig;
use piste_terrain::{TerrainGrid, TerrainLod};
use std::path::Path;

/// A course file loaded into a ready engine
pub struct LoadedCourse {
    pub config: CourseConfig,
    pub lod: TerrainLod,
    /// World-space extent of the grid as (width, length)
    pub extent: (f64, f64),
}

/// Load `path`, build its grid from the course images and initialise the
/// engine at the top of the course.
pub fn load_course(path: &str, detail: Option<f32>, eye_height: f32) -> Result<LoadedCourse> {
    if !Path::new(path).exists() {
        anyhow::bail!("Course file not found: {}", path);
    }

    let config = CourseConfig::load(Path::new(path)).context("Failed to load course")?;
    let grid = TerrainGrid::from_images(&config).context("Failed to load course maps")?;
    let extent = (config.width, config.length);
    let detail = detail.unwrap_or(config.lod.detail);

    // Heights are not known until the tree exists; warm up from above the
    // highest point the course can reach, then let the first frame settle.
    let top = grid.vertex_positions().iter().fold(0.0f32, |m, p| m.max(p[1]));
    let viewer = Vec3::new((extent.0 * 0.5) as f32, top + eye_height, 0.0);

    let mut lod = TerrainLod::new(config.lod.clone());
    lod.init(grid, viewer, detail)
        .context("Failed to initialise terrain")?;

    Ok(LoadedCourse {
        config,
        lod,
        extent,
    })
}
