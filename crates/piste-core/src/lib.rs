//! Piste Core - Foundational types for the Piste terrain engine
//!
//! This crate provides the types shared by the LOD engine and its tools:
//! - `PisteError` and the `Result` alias
//! - `LodSettings`, `CourseConfig` - TOML-backed configuration
//! - `MaterialColor`, `MaterialId` - terrain material identification

mod config;
mod error;
mod types;

pub use config::{CourseConfig, LodSettings, MaterialDef};
pub use error::{PisteError, Result};
pub use types::{MaterialColor, MaterialId, DEFAULT_COLOR_TOLERANCE};
