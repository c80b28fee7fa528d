//! Material identification types

use serde::{Deserialize, Serialize};

/// Index of a terrain material (snow, ice, rock, ...) in the course's material list
pub type MaterialId = u8;

/// Per-channel tolerance used when matching material-map pixels to material colors
pub const DEFAULT_COLOR_TOLERANCE: u8 = 30;

/// 8-bit RGB color identifying a material in the course material map
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MaterialColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl MaterialColor {
    pub const WHITE: Self = Self::new(255, 255, 255);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    pub fn from_hex(hex: u32) -> Self {
        Self {
            r: ((hex >> 16) & 0xFF) as u8,
            g: ((hex >> 8) & 0xFF) as u8,
            b: (hex & 0xFF) as u8,
        }
    }

    pub fn to_array(&self) -> [u8; 3] {
        [self.r, self.g, self.b]
    }

    /// True when every channel of `pixel` is strictly closer than `tolerance`
    pub fn matches(&self, pixel: [u8; 3], tolerance: u8) -> bool {
        let close = |a: u8, b: u8| a.abs_diff(b) < tolerance;
        close(self.r, pixel[0]) && close(self.g, pixel[1]) && close(self.b, pixel[2])
    }
}
