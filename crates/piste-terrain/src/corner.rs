//! Per-descent traversal record

use crate::node::{NodeId, TerrainNode};

/// Geometry of a node that is implied by its position in the tree.
///
/// Built on the stack for each step down the tree and linked to the parent's
/// record, so neighbour searches can walk back up without parent pointers in
/// the nodes themselves.
#[derive(Debug, Clone, Copy)]
pub struct CornerContext<'a> {
    pub parent: Option<&'a CornerContext<'a>>,
    /// Node this record describes, `None` until it has been created
    pub node: Option<NodeId>,
    /// Quadrant of this node within its parent
    pub child_index: usize,
    /// 0 for the finest nodes; a node spans `2 << level` cells
    pub level: i32,
    pub xorg: i32,
    pub zorg: i32,
    /// Corner heights: north-east, north-west, south-west, south-east
    pub verts: [f32; 4],
}

impl CornerContext<'static> {
    /// Record for the root node at the grid origin
    pub fn root(level: i32, verts: [f32; 4]) -> Self {
        Self {
            parent: None,
            node: None,
            child_index: 0,
            level,
            xorg: 0,
            zorg: 0,
            verts,
        }
    }
}

impl<'a> CornerContext<'a> {
    pub fn half(&self) -> i32 {
        1 << self.level
    }

    pub fn whole(&self) -> i32 {
        2 << self.level
    }

    /// Record for child quadrant `index` of `node`, which this record describes.
    /// The child's corners are this node's corner, center and two edge midpoints.
    pub fn child(&'a self, node: &TerrainNode, index: usize) -> CornerContext<'a> {
        let half = self.half();
        let v = &node.vertex;
        let (xorg, zorg, verts) = match index {
            0 => (
                self.xorg + half,
                self.zorg,
                [self.verts[0], v[2], v[0], v[1]],
            ),
            1 => (self.xorg, self.zorg, [v[2], self.verts[1], v[3], v[0]]),
            2 => (
                self.xorg,
                self.zorg + half,
                [v[0], v[3], self.verts[2], v[4]],
            ),
            _ => (
                self.xorg + half,
                self.zorg + half,
                [v[1], v[0], v[4], self.verts[3]],
            ),
        };

        CornerContext {
            parent: Some(self),
            node: node.children[index],
            child_index: index,
            level: self.level - 1,
            xorg,
            zorg,
            verts,
        }
    }
}
