//! Height query command

use anyhow::Result;

use super::load_course;

pub fn run(course: &str, x: f64, z: f64) -> Result<()> {
    let loaded = load_course(course, None, 2.0)?;
    let (width, length) = loaded.extent;

    if !(0.0..=width).contains(&x) || !(-length..=0.0).contains(&z) {
        println!(
            "Note: ({}, {}) is off the course, clamping to its edge (x 0..{}, z -{}..0)",
            x, z, width, length
        );
    }

    println!("{:.3}", loaded.lod.height_at(x, z));
    Ok(())
}
