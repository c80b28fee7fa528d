//! Fall-line flythrough command

use anyhow::Result;
use glam::Vec3;
use piste_terrain::{CameraParams, MeshRecorder, ViewFrustum};

use super::load_course;

/// How far ahead down the slope the camera looks
const LOOK_AHEAD: f64 = 10.0;

pub struct FlyArgs {
    pub course: String,
    pub frames: u32,
    pub detail: Option<f32>,
    pub eye_height: f32,
    pub frustum: bool,
}

pub fn run(args: FlyArgs) -> Result<()> {
    let mut loaded = load_course(&args.course, args.detail, args.eye_height)?;
    let detail = args.detail.unwrap_or(loaded.config.lod.detail);
    let (width, length) = loaded.extent;
    let lod = &mut loaded.lod;

    println!(
        "Flying '{}' for {} frames at detail {}",
        loaded.config.name, args.frames, detail
    );

    let x = width * 0.5;
    let step = length / f64::from(args.frames.max(1));

    let mut recorder = MeshRecorder::new();
    let mut counts = Vec::with_capacity(args.frames as usize);
    let mut skipped = 0;

    for frame in 0..args.frames {
        let z = -(f64::from(frame) * step);
        let ground = lod.height_at(x, z) as f32;
        let viewer = Vec3::new(x as f32, ground + args.eye_height, z as f32);

        if args.frustum {
            let ahead = z - LOOK_AHEAD;
            let target = Vec3::new(x as f32, lod.height_at(x, ahead) as f32, ahead as f32);
            let camera = CameraParams {
                far: length.max(75.0) as f32,
                ..CameraParams::looking_at(viewer, target)
            };
            lod.set_view_frustum(Some(ViewFrustum::new(&camera)));
        }

        lod.update(viewer, detail);
        recorder.clear();
        match lod.render(&mut recorder) {
            Ok(stats) => {
                println!(
                    "frame {:>4}  z {:>9.2}  y {:>8.2}  {:>7} triangles  {:>3} batches",
                    frame, viewer.z, viewer.y, stats.triangles, stats.batches
                );
                counts.push(stats.triangles);
            }
            Err(e) => {
                println!("frame {:>4}  skipped: {}", frame, e);
                skipped += 1;
            }
        }
    }

    let stats = lod.stats();
    println!("");
    if let (Some(min), Some(max)) = (counts.iter().min(), counts.iter().max()) {
        let mean = counts.iter().sum::<usize>() as f64 / counts.len() as f64;
        println!("Triangles per frame: min {}, max {}, mean {:.1}", min, max, mean);
    }
    if skipped > 0 {
        println!("Skipped frames: {}", skipped);
    }
    println!(
        "Final tree: {} nodes, {} enabled, finest level {}",
        stats.tree.nodes, stats.tree.enabled_nodes, stats.tree.finest_level
    );

    Ok(())
}
