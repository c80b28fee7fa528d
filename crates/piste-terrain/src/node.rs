//! Quadtree node data: samples, errors and enable state

use bitflags::bitflags;

use crate::corner::CornerContext;

/// Index of a node in the quadtree arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

/// Edge midpoints in vertex/flag order. Edges 0 (east) and 3 (south) are owned
/// by the node; 1 (north) and 2 (west) belong to the neighbours on those sides.
pub const EAST: usize = 0;
pub const NORTH: usize = 1;
pub const WEST: usize = 2;
pub const SOUTH: usize = 3;

/// Child quadrants, counter-clockwise from north-east
pub const NE: usize = 0;
pub const NW: usize = 1;
pub const SW: usize = 2;
pub const SE: usize = 3;

bitflags! {
    /// Low nibble: edge vertex active. High nibble: child active.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    #[repr(transparent)]
    pub struct NodeFlags: u8 {
        const EAST_VERT  = 1 << 0;
        const NORTH_VERT = 1 << 1;
        const WEST_VERT  = 1 << 2;
        const SOUTH_VERT = 1 << 3;
        const NE_CHILD   = 1 << 4;
        const NW_CHILD   = 1 << 5;
        const SW_CHILD   = 1 << 6;
        const SE_CHILD   = 1 << 7;

        const EDGES    = 0x0F;
        const CHILDREN = 0xF0;
    }
}

impl NodeFlags {
    /// Flag for edge `0..4` (east, north, west, south)
    pub fn edge(index: usize) -> Self {
        Self::from_bits_retain(1 << index)
    }

    /// Flag for child quadrant `0..4` (ne, nw, sw, se)
    pub fn child(index: usize) -> Self {
        Self::from_bits_retain(16 << index)
    }

    pub fn has_edge(self, index: usize) -> bool {
        self.contains(Self::edge(index))
    }

    pub fn has_child(self, index: usize) -> bool {
        self.contains(Self::child(index))
    }

    pub fn enabled_children(self) -> u32 {
        (self & Self::CHILDREN).bits().count_ones()
    }
}

/// One quadrant of the height field.
///
/// A node only stores what its parent cannot supply: the center, the four edge
/// midpoints and the error/enable state. Corner heights, origin and level are
/// reconstructed on the way down in a [`CornerContext`].
#[derive(Debug, Clone)]
pub struct TerrainNode {
    pub(crate) children: [Option<NodeId>; 4],
    /// Center, east, north, west, south
    pub(crate) vertex: [f32; 5],
    /// East edge, south edge, then one per child quadrant
    pub(crate) error: [f32; 6],
    pub(crate) min_y: f32,
    pub(crate) max_y: f32,
    pub(crate) flags: NodeFlags,
    /// Descendants still relying on the east / south edge vertex
    pub(crate) sub_enabled_count: [u16; 2],
    pub(crate) is_static: bool,
    pub(crate) dirty: bool,
    pub(crate) force_east: bool,
    pub(crate) force_south: bool,
    /// Bit i set when child quadrant i covers more than one material
    pub(crate) mixed_quadrants: u8,
}

impl TerrainNode {
    /// Seed a node from its corners: samples are the flat interpolation.
    pub fn new(cd: &CornerContext<'_>) -> Self {
        let c = cd.verts;
        let vertex = [
            0.25 * (c[0] + c[1] + c[2] + c[3]),
            0.5 * (c[3] + c[0]),
            0.5 * (c[0] + c[1]),
            0.5 * (c[1] + c[2]),
            0.5 * (c[2] + c[3]),
        ];

        let mut error = [0.0; 6];
        for i in 0..4 {
            error[i + 2] = quadrant_error(&vertex, c[i], i);
        }

        let min_y = c.iter().copied().fold(f32::INFINITY, f32::min);
        let max_y = c.iter().copied().fold(f32::NEG_INFINITY, f32::max);

        Self {
            children: [None; 4],
            vertex,
            error,
            min_y,
            max_y,
            flags: NodeFlags::empty(),
            sub_enabled_count: [0; 2],
            is_static: false,
            dirty: true,
            force_east: false,
            force_south: false,
            mixed_quadrants: 0,
        }
    }

    pub fn flags(&self) -> NodeFlags {
        self.flags
    }

    pub fn is_static(&self) -> bool {
        self.is_static
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn child(&self, index: usize) -> Option<NodeId> {
        self.children[index]
    }

    /// Height of sample `0..5` (center, east, north, west, south)
    pub fn vertex(&self, index: usize) -> f32 {
        self.vertex[index]
    }

    pub fn error(&self, index: usize) -> f32 {
        self.error[index]
    }

    pub fn height_range(&self) -> (f32, f32) {
        (self.min_y, self.max_y)
    }

    /// Material-seam forcing on the owned east / south edges
    pub fn forced_edges(&self) -> (bool, bool) {
        (self.force_east, self.force_south)
    }

    pub fn sub_enabled_count(&self) -> [u16; 2] {
        self.sub_enabled_count
    }
}

/// How far the quadrant `i` bulges away from the plane through its center,
/// corner and two edge midpoints.
pub(crate) fn quadrant_error(vertex: &[f32; 5], corner: f32, i: usize) -> f32 {
    ((vertex[0] + corner) - (vertex[i + 1] + vertex[((i + 1) & 3) + 1])).abs() * 0.25
}
