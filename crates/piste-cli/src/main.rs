//! Piste CLI - Load ski courses and exercise the terrain LOD engine

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{fly, height, stats};

#[derive(Parser)]
#[command(name = "piste")]
#[command(about = "Inspect and fly over quadtree LOD ski-course terrain", long_about = None)]
#[command(version)]
struct Cli {
    /// Log per-frame terrain activity
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a course's tree and print node and triangle counts
    Stats {
        /// Path to course file
        course: String,

        /// Detail threshold (defaults to the course's lod.detail)
        #[arg(long)]
        detail: Option<f32>,
    },

    /// Fly the viewer down the fall line, one update and render per frame
    Fly {
        /// Path to course file
        course: String,

        /// Number of frames to simulate
        #[arg(long, default_value = "60")]
        frames: u32,

        /// Detail threshold (defaults to the course's lod.detail)
        #[arg(long)]
        detail: Option<f32>,

        /// Viewer height above the snow
        #[arg(long, default_value = "2.0")]
        eye_height: f32,

        /// Disable frustum culling
        #[arg(long)]
        no_frustum: bool,
    },

    /// Print the terrain height at a world position
    Height {
        /// Path to course file
        course: String,

        /// World X (across the slope)
        #[arg(allow_hyphen_values = true)]
        x: f64,

        /// World Z (down the slope is negative)
        #[arg(allow_hyphen_values = true)]
        z: f64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_module("piste_terrain", level)
        .filter_module("piste", level)
        .init();

    match cli.command {
        Commands::Stats { course, detail } => stats::run(&course, detail),
        Commands::Fly {
            course,
            frames,
            detail,
            eye_height,
            no_frustum,
        } => fly::run(fly::FlyArgs {
            course,
            frames,
            detail,
            eye_height,
            frustum: !no_frustum,
        }),
        Commands::Height { course, x, z } => height::run(&course, x, z),
    }
}
