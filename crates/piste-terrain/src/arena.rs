//! Node storage and the structural tree operations
//!
//! Everything here only touches node links, flags and counters. Nothing needs
//! the height grid, so the arena can be mutated while the grid is borrowed.

use std::ops::{Index, IndexMut};

use piste_core::{PisteError, Result};
use slab::Slab;

use crate::corner::CornerContext;
use crate::grid::HeightPatch;
use crate::node::{NodeFlags, NodeId, TerrainNode, EAST, NORTH, NW, SOUTH, SW, WEST};

/// Deepest ancestor walk an edge enable can take; grids are capped well below this
const MAX_WALK: usize = 32;

#[derive(Debug, Clone, Default)]
pub struct NodeArena {
    nodes: Slab<TerrainNode>,
    budget: Option<usize>,
}

impl Index<NodeId> for NodeArena {
    type Output = TerrainNode;

    fn index(&self, id: NodeId) -> &TerrainNode {
        &self.nodes[id.0]
    }
}

impl IndexMut<NodeId> for NodeArena {
    fn index_mut(&mut self, id: NodeId) -> &mut TerrainNode {
        &mut self.nodes[id.0]
    }
}

impl NodeArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap the number of nodes. Inserts past the cap fail with
    /// [`PisteError::NodeBudgetExceeded`].
    pub fn set_budget(&mut self, budget: Option<usize>) {
        self.budget = budget;
    }

    /// Make room for `additional` more nodes, failing instead of aborting when
    /// the budget or the allocator cannot provide them.
    pub fn try_reserve(&mut self, additional: usize) -> Result<()> {
        let wanted = self.nodes.len().saturating_add(additional);
        if let Some(budget) = self.budget {
            if wanted > budget {
                return Err(PisteError::NodeBudgetExceeded { budget });
            }
        }
        if wanted <= self.nodes.capacity() {
            return Ok(());
        }

        // Slab has no fallible reserve. Check that storage of the grown size
        // can be had before asking the slab for it.
        let grown = wanted.max(self.nodes.capacity().saturating_mul(2));
        let mut scratch: Vec<TerrainNode> = Vec::new();
        scratch.try_reserve_exact(grown).map_err(|e| {
            PisteError::Allocation(format!("room for {} terrain nodes: {}", grown, e))
        })?;
        drop(scratch);

        self.nodes.reserve_exact(grown - self.nodes.len());
        Ok(())
    }

    pub fn insert(&mut self, node: TerrainNode) -> Result<NodeId> {
        self.try_reserve(1)?;
        Ok(NodeId(self.nodes.insert(node)))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Same-level node adjacent in direction `dir` (east, north, west, south).
    /// `None` when it lies outside the tree or has not been created.
    pub fn neighbor(&self, dir: usize, cd: &CornerContext<'_>) -> Option<NodeId> {
        let parent = cd.parent?;
        let index = cd.child_index ^ 1 ^ ((dir & 1) << 1);
        let same_parent = ((dir as i32 - cd.child_index as i32) & 2) != 0;

        let p = if same_parent {
            parent.node?
        } else {
            self.neighbor(dir, parent)?
        };
        self[p].children[index]
    }

    /// Create child `index` of `id` from interpolated corners if it is missing.
    pub fn create_child(
        &mut self,
        id: NodeId,
        index: usize,
        cd: &CornerContext<'_>,
    ) -> Result<NodeId> {
        if let Some(child) = self[id].children[index] {
            return Ok(child);
        }
        let q = cd.child(&self[id], index);
        let child = self.insert(TerrainNode::new(&q))?;
        self[id].children[index] = Some(child);
        Ok(child)
    }

    /// Turn on child `index` and the two edge vertices it depends on.
    pub fn enable_child(
        &mut self,
        id: NodeId,
        index: usize,
        cd: &CornerContext<'_>,
    ) -> Result<()> {
        if self[id].flags.has_child(index) {
            return Ok(());
        }
        self.create_child(id, index, cd)?;
        self[id].flags |= NodeFlags::child(index);
        self.enable_edge_vertex(id, index, true, cd)?;
        self.enable_edge_vertex(id, (index + 1) & 3, true, cd)
    }

    /// Turn on edge vertex `index` of `id` and its alias on the neighbour,
    /// creating the neighbour (and any missing ancestors of it) on the way.
    ///
    /// With `increment` the owning side's sub-enabled counter is bumped, which
    /// pins the vertex until the child that needed it is disabled.
    ///
    /// A failed node creation can leave the edge raised on this side only;
    /// callers discard the enable state when that happens.
    pub fn enable_edge_vertex(
        &mut self,
        id: NodeId,
        index: usize,
        increment: bool,
        cd: &CornerContext<'_>,
    ) -> Result<()> {
        let flag = NodeFlags::edge(index);
        if self[id].flags.contains(flag) && !increment {
            return Ok(());
        }
        self.raise_edge(id, index, increment);

        // Climb to the ancestor shared with the neighbour, remembering the
        // mirrored child indices for the way back down.
        let mut path = [0usize; MAX_WALK];
        let mut depth = 0;
        let mut pcd = cd;
        loop {
            let ci = pcd.child_index;
            let Some(parent) = pcd.parent else {
                return Ok(());
            };
            if parent.node.is_none() || depth == MAX_WALK {
                return Ok(());
            }
            pcd = parent;

            let same_parent = ((index as i32 - ci as i32) & 2) != 0;
            path[depth] = ci ^ 1 ^ ((index & 1) << 1);
            depth += 1;
            if same_parent {
                break;
            }
        }

        let Some(ancestor) = pcd.node else {
            return Ok(());
        };
        let neighbor = self.enable_descendant(ancestor, &path[..depth], pcd)?;
        self.raise_edge(neighbor, index ^ 2, increment);
        Ok(())
    }

    fn raise_edge(&mut self, id: NodeId, index: usize, increment: bool) {
        let node = &mut self[id];
        node.flags |= NodeFlags::edge(index);
        if increment && (index == EAST || index == SOUTH) {
            node.sub_enabled_count[index & 1] += 1;
        }
    }

    /// Enable (creating as needed) the descendant reached by following `path`
    /// from its last entry to its first.
    fn enable_descendant(
        &mut self,
        id: NodeId,
        path: &[usize],
        cd: &CornerContext<'_>,
    ) -> Result<NodeId> {
        let Some((&child_index, rest)) = path.split_last() else {
            return Ok(id);
        };
        if !self[id].flags.has_child(child_index) {
            self.enable_child(id, child_index, cd)?;
        }
        let child = self.create_child(id, child_index, cd)?;
        if rest.is_empty() {
            return Ok(child);
        }
        let q = cd.child(&self[id], child_index);
        self.enable_descendant(child, rest, &q)
    }

    /// Clear child `index` of `id` and release the edge vertices it pinned.
    /// The child node itself is kept.
    pub fn notify_child_disable(&mut self, id: NodeId, index: usize, cd: &CornerContext<'_>) {
        self[id].flags.remove(NodeFlags::child(index));

        let south_owner = if index & 2 != 0 {
            Some(id)
        } else {
            self.neighbor(NORTH, cd)
        };
        if let Some(s) = south_owner {
            let count = &mut self[s].sub_enabled_count[1];
            *count = count.saturating_sub(1);
        }

        let east_owner = if index == NW || index == SW {
            self.neighbor(WEST, cd)
        } else {
            Some(id)
        };
        if let Some(s) = east_owner {
            let count = &mut self[s].sub_enabled_count[0];
            *count = count.saturating_sub(1);
        }
    }

    /// Mark `id` and all of its ancestors as holding real height data.
    pub fn set_static(&mut self, id: NodeId, cd: &CornerContext<'_>) {
        if self[id].is_static {
            return;
        }
        self[id].is_static = true;

        let mut up = cd.parent;
        while let Some(ctx) = up {
            let Some(pid) = ctx.node else {
                break;
            };
            if self[pid].is_static {
                break;
            }
            self[pid].is_static = true;
            up = ctx.parent;
        }
    }

    /// Add the deltas of `patch` into the subtree at `id`, subdividing down to
    /// the patch's resolution.
    ///
    /// Every node the patch needs is created before any height changes, so a
    /// failed creation leaves the heights as they were. The enable state and
    /// dynamic nodes below `id` are dropped in that case.
    pub fn add_height_map(
        &mut self,
        id: NodeId,
        cd: &CornerContext<'_>,
        patch: &HeightPatch<'_>,
    ) -> Result<()> {
        if let Err(e) = self.inject_patch(id, cd, patch, false) {
            self.reset_tree(id);
            return Err(e);
        }
        self.inject_patch(id, cd, patch, true)
    }

    fn inject_patch(
        &mut self,
        id: NodeId,
        cd: &CornerContext<'_>,
        patch: &HeightPatch<'_>,
        apply: bool,
    ) -> Result<()> {
        if patch.misses(cd.xorg, cd.zorg, cd.whole()) {
            return Ok(());
        }

        if let Some(parent) = cd.parent {
            if let Some(pid) = parent.node {
                self.enable_child(pid, cd.child_index, parent)?;
            }
        }

        for i in 0..4 {
            if self[id].children[i].is_none() && cd.level > patch.scale() {
                self.create_child(id, i, cd)?;
            }
            if let Some(child) = self[id].children[i] {
                let q = cd.child(&self[id], i);
                self.inject_patch(child, &q, patch, apply)?;
            }
        }

        if !apply {
            return Ok(());
        }

        let (x, z, half) = (cd.xorg, cd.zorg, cd.half());
        let samples = [
            patch.sample(x + half, z + half),
            patch.sample(x + 2 * half, z + half),
            patch.sample(x + half, z),
            patch.sample(x, z + half),
            patch.sample(x + half, z + 2 * half),
        ];

        let mut dirty = self[id].dirty;
        {
            let node = &mut self[id];
            for (vertex, delta) in node.vertex.iter_mut().zip(samples) {
                if delta != 0.0 {
                    *vertex += delta;
                    dirty = true;
                }
            }
        }
        if !dirty {
            dirty = self[id]
                .children
                .iter()
                .flatten()
                .any(|&child| self[child].dirty);
        }
        self[id].dirty = dirty;

        if dirty {
            self.set_static(id, cd);
        }
        Ok(())
    }

    /// Drop every non-static node below `id` and clear all enable state.
    pub fn reset_tree(&mut self, id: NodeId) {
        for i in 0..4 {
            let Some(child) = self[id].children[i] else {
                continue;
            };
            self.reset_tree(child);
            if !self[child].is_static {
                self.remove_subtree(child);
                self[id].children[i] = None;
            }
        }
        let node = &mut self[id];
        node.flags = NodeFlags::empty();
        node.sub_enabled_count = [0; 2];
        node.dirty = true;
    }

    /// Free `id` and everything below it. The caller clears the parent link.
    pub fn remove_subtree(&mut self, id: NodeId) {
        let children = self[id].children;
        for child in children.into_iter().flatten() {
            self.remove_subtree(child);
        }
        self.nodes.remove(id.0);
    }

    /// Number of nodes in the subtree at `id`
    pub fn count_nodes(&self, id: NodeId) -> usize {
        1 + self[id]
            .children
            .iter()
            .flatten()
            .map(|&child| self.count_nodes(child))
            .sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NE, SE};

    fn root_tree(level: i32) -> (NodeArena, NodeId) {
        let mut arena = NodeArena::new();
        let cd = CornerContext::root(level, [0.0; 4]);
        let root = arena.insert(TerrainNode::new(&cd)).unwrap();
        (arena, root)
    }

    fn root_context(level: i32, root: NodeId) -> CornerContext<'static> {
        let mut cd = CornerContext::root(level, [0.0; 4]);
        cd.node = Some(root);
        cd
    }

    #[test]
    fn neighbours_within_one_parent() {
        let (mut arena, root) = root_tree(1);
        let cd = root_context(1, root);
        for i in 0..4 {
            arena.create_child(root, i, &cd).unwrap();
        }
        let ne = cd.child(&arena[root], NE);
        assert_eq!(arena.neighbor(WEST, &ne), arena[root].child(NW));
        assert_eq!(arena.neighbor(SOUTH, &ne), arena[root].child(SE));
        // Outside the tree
        assert_eq!(arena.neighbor(EAST, &ne), None);
        assert_eq!(arena.neighbor(NORTH, &ne), None);
        assert_eq!(arena.neighbor(EAST, &cd), None);
    }

    #[test]
    fn neighbour_across_parents() {
        let (mut arena, root) = root_tree(2);
        let cd = root_context(2, root);
        for i in 0..4 {
            arena.create_child(root, i, &cd).unwrap();
        }
        let nw = arena[root].child(NW).unwrap();
        let ne = arena[root].child(NE).unwrap();
        let nw_cd = cd.child(&arena[root], NW);
        let nw_ne = arena.create_child(nw, NE, &nw_cd).unwrap();
        let ne_cd = cd.child(&arena[root], NE);
        let ne_nw = arena.create_child(ne, NW, &ne_cd).unwrap();

        let ctx = nw_cd.child(&arena[nw], NE);
        assert_eq!(ctx.node, Some(nw_ne));
        assert_eq!(arena.neighbor(EAST, &ctx), Some(ne_nw));
        let back = ne_cd.child(&arena[ne], NW);
        assert_eq!(arena.neighbor(WEST, &back), Some(nw_ne));
    }

    #[test]
    fn enabling_a_child_creates_the_neighbour_alias() {
        let (mut arena, root) = root_tree(2);
        let cd = root_context(2, root);
        arena.enable_child(root, NW, &cd).unwrap();
        let nw = arena[root].child(NW).unwrap();
        let nw_cd = cd.child(&arena[root], NW);

        // NE grandchild of NW needs its east edge, owned by NW's NE child,
        // whose alias lives in the NW child of the root's NE quadrant.
        arena.enable_child(nw, NE, &nw_cd).unwrap();
        let flags = arena[nw].flags();
        assert!(flags.has_child(NE));
        assert!(flags.has_edge(EAST));
        assert!(flags.has_edge(NORTH));
        assert_eq!(arena[nw].sub_enabled_count(), [1, 0]);

        let ne = arena[root].child(NE).expect("neighbour quadrant created");
        assert!(arena[ne].flags().has_edge(WEST));
        assert!(arena[root].flags().has_child(NE));
    }

    #[test]
    fn child_disable_releases_edge_counts() {
        let (mut arena, root) = root_tree(1);
        let cd = root_context(1, root);
        arena.enable_child(root, SE, &cd).unwrap();
        assert_eq!(arena[root].sub_enabled_count(), [1, 1]);
        arena.notify_child_disable(root, SE, &cd);
        assert_eq!(arena[root].sub_enabled_count(), [0, 0]);
        assert!(!arena[root].flags().has_child(SE));
        // Node stays allocated
        assert!(arena[root].child(SE).is_some());

        arena.notify_child_disable(root, SE, &cd);
        assert_eq!(arena[root].sub_enabled_count(), [0, 0]);
    }

    #[test]
    fn height_map_builds_static_full_tree() {
        let data: Vec<f64> = (0..25).map(|i| f64::from(i % 5)).collect();
        let patch = HeightPatch::new(&data, 0, 0, 5, 5, 5, 0).unwrap();
        let (mut arena, root) = root_tree(1);
        let cd = root_context(1, root);
        arena.add_height_map(root, &cd, &patch).unwrap();

        assert_eq!(arena.count_nodes(root), 5);
        assert!(arena[root].is_static());
        // Center of the root at (2, 2), east mid at (4, 2)
        assert_eq!(arena[root].vertex(0), 2.0);
        assert_eq!(arena[root].vertex(1), 4.0);
        let se = arena[root].child(SE).unwrap();
        assert!(arena[se].is_static());
        assert_eq!(arena[se].vertex(0), 3.0);
    }

    #[test]
    fn reset_drops_dynamic_nodes_only() {
        let (mut arena, root) = root_tree(2);
        let cd = root_context(2, root);
        arena.enable_child(root, NE, &cd).unwrap();
        let ne = arena[root].child(NE).unwrap();
        let ne_cd = cd.child(&arena[root], NE);
        arena.set_static(ne, &ne_cd);
        arena.enable_child(root, SW, &cd).unwrap();
        assert_eq!(arena.count_nodes(root), 3);

        arena.reset_tree(root);
        assert_eq!(arena.count_nodes(root), 2);
        assert_eq!(arena.len(), 2);
        assert!(arena[root].flags().is_empty());
        assert_eq!(arena[root].sub_enabled_count(), [0, 0]);
        assert!(arena[root].is_dirty());
    }

    #[test]
    fn inserts_past_the_budget_fail() {
        let (mut arena, root) = root_tree(2);
        let cd = root_context(2, root);
        arena.set_budget(Some(3));
        arena.create_child(root, NE, &cd).unwrap();
        arena.create_child(root, NW, &cd).unwrap();

        let err = arena.create_child(root, SW, &cd).unwrap_err();
        assert!(matches!(err, PisteError::NodeBudgetExceeded { budget: 3 }));
        assert_eq!(arena.len(), 3);
        assert!(arena[root].child(SW).is_none());

        arena.set_budget(None);
        arena.create_child(root, SW, &cd).unwrap();
        assert_eq!(arena.len(), 4);
    }

    #[test]
    fn failed_height_map_leaves_heights_alone() {
        let data = vec![1.0; 25];
        let patch = HeightPatch::new(&data, 0, 0, 5, 5, 5, 0).unwrap();
        let (mut arena, root) = root_tree(1);
        let cd = root_context(1, root);
        arena.set_budget(Some(3));

        let err = arena.add_height_map(root, &cd, &patch).unwrap_err();
        assert!(matches!(err, PisteError::NodeBudgetExceeded { budget: 3 }));
        assert_eq!(arena.count_nodes(root), 1);
        assert_eq!(arena[root].vertex(0), 0.0);
        assert!(!arena[root].is_static());
        assert!(arena[root].flags().is_empty());
    }
}
