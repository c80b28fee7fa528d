//! Course and level-of-detail configuration, parsed from TOML

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PisteError, Result};
use crate::types::MaterialColor;

/// Tuning knobs for the terrain LOD engine.
///
/// Every field has a default, so an empty `[lod]` table (or none at all) is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LodSettings {
    /// Detail threshold used when the caller does not supply one
    pub detail: f32,
    /// Threshold used by the one-time static bake
    pub cull_detail: f32,
    /// Number of update passes run at load time before the first frame
    pub warmup_passes: u32,
    /// Scale applied to material-driven error terms
    pub terrain_error_scale: f32,
    /// World distance within which material seams always split
    pub vertex_force_threshold: f32,
    /// World distance within which errors are magnified
    pub error_magnification_threshold: f32,
    /// Error multiplier applied inside the magnification distance
    pub error_magnification_amount: f32,
    /// Blend adjacent materials with per-vertex alpha and emit a junction pass
    pub blend_materials: bool,
    /// Maximum number of triangles a single frame may emit
    pub triangle_budget: Option<usize>,
    /// Maximum number of nodes the tree may grow to after the static bake
    pub node_budget: Option<usize>,
}

impl Default for LodSettings {
    fn default() -> Self {
        Self {
            detail: 75.0,
            cull_detail: 25.0,
            warmup_passes: 10,
            terrain_error_scale: 0.1,
            vertex_force_threshold: 100.0,
            error_magnification_threshold: 20.0,
            error_magnification_amount: 3.0,
            blend_materials: true,
            triangle_budget: None,
            node_budget: None,
        }
    }
}

impl LodSettings {
    /// Parse settings from a standalone TOML document
    pub fn from_toml_str(src: &str) -> Result<Self> {
        let settings: Self = toml::from_str(src)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject negative or non-finite tuning values
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("detail", self.detail),
            ("cull_detail", self.cull_detail),
            ("terrain_error_scale", self.terrain_error_scale),
            ("vertex_force_threshold", self.vertex_force_threshold),
            (
                "error_magnification_threshold",
                self.error_magnification_threshold,
            ),
            ("error_magnification_amount", self.error_magnification_amount),
        ];
        for (field, value) in fields {
            if !value.is_finite() || value < 0.0 {
                return Err(PisteError::ValueOutOfRange {
                    field: field.to_string(),
                    min: 0.0,
                    max: f64::from(f32::MAX),
                    value: f64::from(value),
                });
            }
        }
        if self.warmup_passes > 1000 {
            return Err(PisteError::ValueOutOfRange {
                field: "warmup_passes".to_string(),
                min: 0.0,
                max: 1000.0,
                value: f64::from(self.warmup_passes),
            });
        }
        Ok(())
    }
}

/// A terrain material entry in a course file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterialDef {
    pub name: String,
    /// Color of this material in the material map
    pub color: MaterialColor,
}

fn default_base_height() -> u8 {
    127
}

/// A course description: where its maps live and how to scale them
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourseConfig {
    pub name: String,
    /// Grayscale elevation image, relative to the course file
    pub elevation: String,
    /// RGB material map, relative to the course file
    pub materials: String,
    /// World-space extent across the slope (X)
    pub width: f64,
    /// World-space extent down the slope (Z)
    pub length: f64,
    /// Height in world units of a full-range elevation sample
    pub scale: f64,
    /// Slope angle in degrees added on top of the elevation image
    #[serde(default)]
    pub angle: f64,
    /// Elevation pixel value that maps to zero height
    #[serde(default = "default_base_height")]
    pub base_height: u8,
    /// Swap the course east/west after loading
    #[serde(default)]
    pub mirror: bool,
    #[serde(rename = "material")]
    pub material_defs: Vec<MaterialDef>,
    #[serde(default)]
    pub lod: LodSettings,

    /// Directory of the course file, used to resolve relative map paths
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl CourseConfig {
    /// Parse a course description from TOML text
    pub fn from_toml_str(src: &str) -> Result<Self> {
        let config: Self = toml::from_str(src)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a course file; map paths are resolved against its directory
    pub fn load(path: &Path) -> Result<Self> {
        let src = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&src)?;
        config.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(config)
    }

    pub fn elevation_path(&self) -> PathBuf {
        self.base_dir.join(&self.elevation)
    }

    pub fn materials_path(&self) -> PathBuf {
        self.base_dir.join(&self.materials)
    }

    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("width", self.width),
            ("length", self.length),
            ("scale", self.scale),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(PisteError::ValueOutOfRange {
                    field: field.to_string(),
                    min: f64::MIN_POSITIVE,
                    max: f64::MAX,
                    value,
                });
            }
        }
        if !(-89.0..=89.0).contains(&self.angle) {
            return Err(PisteError::ValueOutOfRange {
                field: "angle".to_string(),
                min: -89.0,
                max: 89.0,
                value: self.angle,
            });
        }
        if self.material_defs.is_empty() {
            return Err(PisteError::Config(format!(
                "course '{}' defines no materials",
                self.name
            )));
        }
        if self.material_defs.len() > usize::from(u8::MAX) + 1 {
            return Err(PisteError::Config(format!(
                "course '{}' defines {} materials, at most 256 are supported",
                self.name,
                self.material_defs.len()
            )));
        }
        self.lod.validate()
    }
}
