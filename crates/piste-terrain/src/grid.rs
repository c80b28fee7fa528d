//! Height-field and material grid loading and sampling

use std::path::Path;

use piste_core::{CourseConfig, MaterialId, PisteError, Result, DEFAULT_COLOR_TOLERANCE};

/// Largest supported grid dimension. The quadtree addresses cells with `i32`
/// and the root level must stay well below 31.
pub const MAX_GRID_DIM: usize = (1 << 15) + 1;

/// A row-major grid of elevation samples and per-sample material ids.
///
/// Sample `(x, z)` lives at index `x + width * z`. The same index is used as
/// the vertex index in emitted triangle batches, so a renderer can build its
/// vertex array straight from [`TerrainGrid::vertex_positions`].
#[derive(Debug, Clone)]
pub struct TerrainGrid {
    elevation: Vec<f64>,
    materials: Vec<MaterialId>,
    /// Samples along X
    pub width: usize,
    /// Samples along Z
    pub depth: usize,
    /// World units per grid cell along X
    pub scale_x: f64,
    /// World units per grid cell along Z (may be negative)
    pub scale_z: f64,
    material_count: usize,
}

impl TerrainGrid {
    /// Build a grid from raw samples, validating dimensions and scale.
    pub fn from_raw(
        elevation: Vec<f64>,
        materials: Vec<MaterialId>,
        width: usize,
        depth: usize,
        scale_x: f64,
        scale_z: f64,
    ) -> Result<Self> {
        if width < 2 || depth < 2 {
            return Err(PisteError::InvalidGrid(format!(
                "grid must be at least 2x2 samples, got {}x{}",
                width, depth
            )));
        }
        if width > MAX_GRID_DIM || depth > MAX_GRID_DIM {
            return Err(PisteError::InvalidGrid(format!(
                "grid {}x{} cannot be padded to a quadtree (max {} samples per side)",
                width, depth, MAX_GRID_DIM
            )));
        }
        let count = width * depth;
        if elevation.len() != count || materials.len() != count {
            return Err(PisteError::InvalidGrid(format!(
                "expected {} samples, got {} elevations and {} materials",
                count,
                elevation.len(),
                materials.len()
            )));
        }
        if !scale_x.is_finite() || !scale_z.is_finite() || scale_x == 0.0 || scale_z == 0.0 {
            return Err(PisteError::InvalidGrid(format!(
                "cell scale must be finite and non-zero, got ({}, {})",
                scale_x, scale_z
            )));
        }
        if let Some(i) = elevation.iter().position(|h| !h.is_finite()) {
            return Err(PisteError::InvalidGrid(format!(
                "elevation sample {} is not finite",
                i
            )));
        }

        let material_count = materials.iter().copied().max().map_or(1, |m| m as usize + 1);

        Ok(Self {
            elevation,
            materials,
            width,
            depth,
            scale_x,
            scale_z,
            material_count,
        })
    }

    /// A single-material grid with every elevation at zero
    pub fn flat(width: usize, depth: usize, scale: f64) -> Result<Self> {
        let count = width.saturating_mul(depth);
        Self::from_raw(vec![0.0; count], vec![0; count], width, depth, scale, scale)
    }

    /// Load a course's elevation and material maps.
    ///
    /// The elevation image is read as 8-bit luma; `base_height` maps to zero and
    /// the course slope is added per row. Both images are flipped in X and Z so
    /// that row 0 is the top of the course. Material pixels are matched against
    /// the course's material colors, unknown colors fall back to material 0.
    pub fn from_images(course: &CourseConfig) -> Result<Self> {
        let elev_img = open_image(&course.elevation_path())?.into_luma8();
        let (nx, nz) = (elev_img.width() as usize, elev_img.height() as usize);

        let mat_img = open_image(&course.materials_path())?.into_rgb8();
        if mat_img.width() as usize != nx || mat_img.height() as usize != nz {
            return Err(PisteError::InvalidGrid(format!(
                "material map is {}x{} but elevation map is {}x{}",
                mat_img.width(),
                mat_img.height(),
                nx,
                nz
            )));
        }

        let slope = course.angle.to_radians().tan();
        let base = f64::from(course.base_height);
        let count = nx * nz;
        let mut elevation = vec![0.0; count];
        let mut materials = vec![0; count];

        for (x, y, pixel) in elev_img.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            let row = nz - 1 - y;
            let idx = (nx - 1 - x) + nx * row;
            elevation[idx] = (f64::from(pixel.0[0]) - base) / 255.0 * course.scale
                - row as f64 / nz as f64 * course.length * slope;
        }

        for (x, y, pixel) in mat_img.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            let idx = (nx - 1 - x) + nx * (nz - 1 - y);
            materials[idx] = course
                .material_defs
                .iter()
                .position(|def| def.color.matches(pixel.0, DEFAULT_COLOR_TOLERANCE))
                .map_or(0, |i| i as MaterialId);
        }

        let grid = Self::from_raw(
            elevation,
            materials,
            nx,
            nz,
            course.width / (nx as f64 - 1.0),
            -course.length / (nz as f64 - 1.0),
        )?;

        log::info!(
            "Loaded course '{}': {}x{} samples, {} materials in use",
            course.name,
            nx,
            nz,
            grid.materials_present().len()
        );

        Ok(if course.mirror { grid.mirrored() } else { grid })
    }

    /// Swap the grid east/west, keeping the same scale.
    pub fn mirrored(&self) -> Self {
        let mut out = self.clone();
        for z in 0..self.depth {
            for x in 0..self.width {
                let src = (self.width - 1 - x) + self.width * z;
                let dst = x + self.width * z;
                out.elevation[dst] = self.elevation[src];
                out.materials[dst] = self.materials[src];
            }
        }
        out
    }

    /// Elevation at a sample, clamped to the grid
    pub fn elevation(&self, x: i32, z: i32) -> f64 {
        self.elevation[self.index(x, z) as usize]
    }

    /// Material at a sample, clamped to the grid
    pub fn material(&self, x: i32, z: i32) -> MaterialId {
        self.materials[self.index(x, z) as usize]
    }

    /// Vertex index of a sample, clamped to the grid
    pub fn index(&self, x: i32, z: i32) -> u32 {
        let x = x.clamp(0, self.width as i32 - 1) as usize;
        let z = z.clamp(0, self.depth as i32 - 1) as usize;
        (x + self.width * z) as u32
    }

    /// Material of the vertex at a flat index
    pub fn material_at_index(&self, index: u32) -> MaterialId {
        self.materials[index as usize]
    }

    /// Number of material slots (highest id + 1)
    pub fn material_count(&self) -> usize {
        self.material_count
    }

    /// Material ids that appear in the grid, ascending
    pub fn materials_present(&self) -> Vec<MaterialId> {
        let mut seen = vec![false; self.material_count];
        for &m in &self.materials {
            seen[m as usize] = true;
        }
        seen.iter()
            .enumerate()
            .filter(|(_, s)| **s)
            .map(|(m, _)| m as MaterialId)
            .collect()
    }

    /// World-space position of the vertex at a flat index
    pub fn vertex_position(&self, index: u32) -> [f32; 3] {
        let index = index as usize;
        let x = index % self.width;
        let z = index / self.width;
        [
            (x as f64 * self.scale_x) as f32,
            self.elevation[index] as f32,
            (z as f64 * self.scale_z) as f32,
        ]
    }

    /// World-space positions of every sample, in vertex-index order
    pub fn vertex_positions(&self) -> Vec<[f32; 3]> {
        (0..(self.width * self.depth) as u32)
            .map(|i| self.vertex_position(i))
            .collect()
    }

    /// Convert world X/Z to fractional grid coordinates
    pub fn world_to_grid(&self, x: f64, z: f64) -> (f64, f64) {
        (x / self.scale_x, z / self.scale_z)
    }

    /// The whole elevation grid as a height patch at full resolution
    pub fn full_patch(&self) -> HeightPatch<'_> {
        HeightPatch {
            data: &self.elevation,
            x_origin: 0,
            z_origin: 0,
            x_size: self.width as i32,
            z_size: self.depth as i32,
            row_width: self.width as i32,
            scale: 0,
        }
    }
}

fn open_image(path: &Path) -> Result<image::DynamicImage> {
    image::open(path)
        .map_err(|e| PisteError::ImageLoad(format!("'{}': {}", path.display(), e)))
}

/// A window of height deltas to add into the quadtree.
///
/// Coordinates are in tree grid cells. A patch with `scale` s stores one
/// sample per `2^s` cells and subdivision stops at level s.
#[derive(Debug, Clone, Copy)]
pub struct HeightPatch<'a> {
    data: &'a [f64],
    x_origin: i32,
    z_origin: i32,
    x_size: i32,
    z_size: i32,
    row_width: i32,
    scale: i32,
}

impl<'a> HeightPatch<'a> {
    /// Check the window against `data` and build the patch.
    /// Samples are read at `x + row_width * z` for `x < x_size`, `z < z_size`.
    pub fn new(
        data: &'a [f64],
        x_origin: i32,
        z_origin: i32,
        x_size: i32,
        z_size: i32,
        row_width: i32,
        scale: i32,
    ) -> Result<Self> {
        if !(0..31).contains(&scale) {
            return Err(PisteError::InvalidGrid(format!(
                "height patch scale {} is outside 0..31",
                scale
            )));
        }
        if x_size < 1 || z_size < 1 {
            return Err(PisteError::InvalidGrid(format!(
                "height patch is {}x{}, both sizes must be at least 1",
                x_size, z_size
            )));
        }
        if row_width < x_size {
            return Err(PisteError::InvalidGrid(format!(
                "height patch row width {} is narrower than its {} columns",
                row_width, x_size
            )));
        }

        let (cols, rows, stride) = (x_size as usize, z_size as usize, row_width as usize);
        let needed = stride
            .checked_mul(rows - 1)
            .and_then(|n| n.checked_add(cols))
            .ok_or_else(|| {
                PisteError::InvalidGrid(format!(
                    "height patch of {} rows with row width {} is too large",
                    rows, stride
                ))
            })?;
        if data.len() < needed {
            return Err(PisteError::InvalidGrid(format!(
                "height patch needs {} samples but has {}",
                needed,
                data.len()
            )));
        }
        if (0..rows).any(|z| data[z * stride..z * stride + cols].iter().any(|v| !v.is_finite())) {
            return Err(PisteError::InvalidGrid(
                "height patch contains non-finite deltas".to_string(),
            ));
        }

        Ok(Self {
            data,
            x_origin,
            z_origin,
            x_size,
            z_size,
            row_width,
            scale,
        })
    }

    /// Tree level at which subdivision stops
    pub fn scale(&self) -> i32 {
        self.scale
    }

    /// Delta at a tree grid position, clamped to the patch window
    pub fn sample(&self, x: i32, z: i32) -> f32 {
        let lx = ((i64::from(x) - i64::from(self.x_origin)) >> self.scale)
            .clamp(0, i64::from(self.x_size) - 1);
        let lz = ((i64::from(z) - i64::from(self.z_origin)) >> self.scale)
            .clamp(0, i64::from(self.z_size) - 1);
        self.data[(lx + lz * i64::from(self.row_width)) as usize] as f32
    }

    /// True when the tree grid position `(x, z)` falls inside the patch window
    pub fn contains(&self, x: i32, z: i32) -> bool {
        let (x, z) = (i64::from(x), i64::from(z));
        let (x0, z0) = (i64::from(self.x_origin), i64::from(self.z_origin));
        x >= x0
            && z >= z0
            && x < x0 + (i64::from(self.x_size) << self.scale)
            && z < z0 + (i64::from(self.z_size) << self.scale)
    }

    /// True when a square block of `size` cells at `(x, z)` lies well clear of the patch
    pub fn misses(&self, x: i32, z: i32, size: i32) -> bool {
        let (x, z, size) = (i64::from(x), i64::from(z), i64::from(size));
        let (x0, z0) = (i64::from(self.x_origin), i64::from(self.z_origin));
        let cell = 1i64 << self.scale;
        x > x0 + ((i64::from(self.x_size) + 2) << self.scale)
            || x + size < x0 - cell
            || z > z0 + ((i64::from(self.z_size) + 2) << self.scale)
            || z + size < z0 - cell
    }
}
