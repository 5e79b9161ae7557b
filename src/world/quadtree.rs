//! Quadtree spatial index over the world rectangle.
//!
//! The tick pipeline clears and rebuilds the tree once per tick from the
//! entity store snapshot, then runs the per-observer radius queries against
//! it. Incremental `update_position` exists for callers that move a single
//! entity between rebuilds.

use crate::config::WorldBounds;
use crate::util::vec2::Vec2;
use crate::world::entity::EntityId;

/// Axis-aligned bounding rectangle, closed on all edges.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec2,
    pub max: Vec2,
}

impl Aabb {
    pub fn new(min: Vec2, max: Vec2) -> Self {
        Self { min, max }
    }

    pub fn from_bounds(bounds: &WorldBounds) -> Self {
        Self::new(
            Vec2::new(bounds.min_x, bounds.min_y),
            Vec2::new(bounds.max_x, bounds.max_y),
        )
    }

    #[inline]
    pub fn contains(&self, p: Vec2) -> bool {
        p.x >= self.min.x && p.x <= self.max.x && p.y >= self.min.y && p.y <= self.max.y
    }

    #[inline]
    pub fn center(&self) -> Vec2 {
        Vec2::new(
            (self.min.x + self.max.x) * 0.5,
            (self.min.y + self.max.y) * 0.5,
        )
    }

    pub fn intersects(&self, other: &Aabb) -> bool {
        !(self.max.x < other.min.x
            || self.min.x > other.max.x
            || self.max.y < other.min.y
            || self.min.y > other.max.y)
    }

    /// Closest-point rectangle/circle test, inclusive at the boundary so a
    /// query never prunes a node holding an entity at exactly `radius`.
    pub fn intersects_circle(&self, center: Vec2, radius: f64) -> bool {
        let closest = Vec2::new(
            center.x.clamp(self.min.x, self.max.x),
            center.y.clamp(self.min.y, self.max.y),
        );
        center.distance_sq_to(closest) <= radius * radius
    }
}

/// Entity reference stored in the tree. The store owns the entity; the
/// index never outlives a tick's snapshot of it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuadEntry {
    pub id: EntityId,
    pub position: Vec2,
}

// Child slots in fixed NW, NE, SW, SE order.
const NW: usize = 0;
const NE: usize = 1;
const SW: usize = 2;
const SE: usize = 3;

/// Quadrant assignment by half-open intervals: left and bottom edges
/// inclusive, right and top exclusive, so a point on a shared edge lands
/// in exactly one child.
#[inline]
fn quadrant(center: Vec2, p: Vec2) -> usize {
    match (p.x >= center.x, p.y >= center.y) {
        (false, true) => NW,
        (true, true) => NE,
        (false, false) => SW,
        (true, false) => SE,
    }
}

#[derive(Debug)]
struct Node {
    bounds: Aabb,
    depth: usize,
    entries: Vec<QuadEntry>,
    children: Option<Box<[Node; 4]>>,
}

impl Node {
    fn new(bounds: Aabb, depth: usize, capacity: usize) -> Self {
        Self {
            bounds,
            depth,
            entries: Vec::with_capacity(capacity),
            children: None,
        }
    }

    fn subdivide(&mut self, capacity: usize) {
        let c = self.bounds.center();
        let Aabb { min, max } = self.bounds;
        let depth = self.depth + 1;
        let children = Box::new([
            Node::new(
                Aabb::new(Vec2::new(min.x, c.y), Vec2::new(c.x, max.y)),
                depth,
                capacity,
            ),
            Node::new(Aabb::new(c, max), depth, capacity),
            Node::new(Aabb::new(min, c), depth, capacity),
            Node::new(
                Aabb::new(Vec2::new(c.x, min.y), Vec2::new(max.x, c.y)),
                depth,
                capacity,
            ),
        ]);
        self.children = Some(children);

        // Re-insert current contents into the new quadrants.
        let entries = std::mem::take(&mut self.entries);
        let children = self.children.as_mut().unwrap();
        for entry in entries {
            children[quadrant(c, entry.position)].entries.push(entry);
        }
    }

    fn insert(&mut self, entry: QuadEntry, capacity: usize, max_depth: usize) {
        if let Some(children) = &mut self.children {
            let idx = quadrant(self.bounds.center(), entry.position);
            children[idx].insert(entry, capacity, max_depth);
            return;
        }

        // Leaves at the depth bound absorb overflow instead of splitting.
        if self.entries.len() < capacity || self.depth >= max_depth {
            self.entries.push(entry);
            return;
        }

        self.subdivide(capacity);
        let idx = quadrant(self.bounds.center(), entry.position);
        self.children.as_mut().unwrap()[idx].insert(entry, capacity, max_depth);
    }

    /// Search by id: this node's entries first, then children in fixed
    /// NW, NE, SW, SE order. A hint position front-runs the child the
    /// entry was assigned to.
    fn remove(&mut self, id: EntityId, hint: Option<Vec2>) -> bool {
        if let Some(i) = self.entries.iter().position(|e| e.id == id) {
            self.entries.swap_remove(i);
            return true;
        }

        let center = self.bounds.center();
        if let Some(children) = &mut self.children {
            let hinted = hint.map(|p| quadrant(center, p));
            if let Some(h) = hinted {
                if children[h].remove(id, hint) {
                    return true;
                }
            }
            for i in [NW, NE, SW, SE] {
                if Some(i) == hinted {
                    continue;
                }
                if children[i].remove(id, hint) {
                    return true;
                }
            }
        }
        false
    }

    fn query_circle(&self, center: Vec2, radius: f64, out: &mut Vec<QuadEntry>) {
        if !self.bounds.intersects_circle(center, radius) {
            return;
        }
        let r_sq = radius * radius;
        for entry in &self.entries {
            if entry.position.distance_sq_to(center) <= r_sq {
                out.push(*entry);
            }
        }
        if let Some(children) = &self.children {
            for child in children.iter() {
                child.query_circle(center, radius, out);
            }
        }
    }

    fn query_rect(&self, rect: &Aabb, out: &mut Vec<QuadEntry>) {
        if !self.bounds.intersects(rect) {
            return;
        }
        for entry in &self.entries {
            if rect.contains(entry.position) {
                out.push(*entry);
            }
        }
        if let Some(children) = &self.children {
            for child in children.iter() {
                child.query_rect(rect, out);
            }
        }
    }

    fn len(&self) -> usize {
        let mut n = self.entries.len();
        if let Some(children) = &self.children {
            for child in children.iter() {
                n += child.len();
            }
        }
        n
    }
}

/// Point quadtree with bounded subdivision depth.
pub struct Quadtree {
    root: Node,
    capacity: usize,
    max_depth: usize,
}

impl Quadtree {
    pub fn new(bounds: Aabb, capacity: usize, max_depth: usize) -> Self {
        Self {
            root: Node::new(bounds, 0, capacity),
            capacity,
            max_depth,
        }
    }

    /// Insert an entity reference. Returns false if the position lies
    /// outside the world rectangle.
    pub fn insert(&mut self, entry: QuadEntry) -> bool {
        if !self.root.bounds.contains(entry.position) {
            return false;
        }
        self.root.insert(entry, self.capacity, self.max_depth);
        true
    }

    /// Remove by id, scanning children in fixed NW, NE, SW, SE order.
    pub fn remove(&mut self, id: EntityId) -> bool {
        self.root.remove(id, None)
    }

    /// Remove-then-insert for a moved entity. `old_position` is the
    /// pre-move position; the straddle case may have left the entry at a
    /// non-leaf, so removal still falls back to a full id scan.
    pub fn update_position(&mut self, entry: QuadEntry, old_position: Vec2) -> bool {
        if !self.root.remove(entry.id, Some(old_position)) {
            return false;
        }
        self.insert(entry)
    }

    /// Entities within `radius` of `center` (Euclidean, inclusive).
    pub fn query_radius(&self, center: Vec2, radius: f64) -> Vec<QuadEntry> {
        let mut out = Vec::new();
        self.root.query_circle(center, radius, &mut out);
        out
    }

    /// Entities whose positions lie within the rectangle (closed).
    pub fn query_rect(&self, rect: &Aabb) -> Vec<QuadEntry> {
        let mut out = Vec::new();
        self.root.query_rect(rect, &mut out);
        out
    }

    pub fn clear(&mut self) {
        self.root = Node::new(self.root.bounds, 0, self.capacity);
    }

    /// Clear and re-insert. Called once per tick from the store snapshot.
    pub fn rebuild(&mut self, entries: impl Iterator<Item = QuadEntry>) {
        self.clear();
        for entry in entries {
            self.insert(entry);
        }
    }

    pub fn len(&self) -> usize {
        self.root.len()
    }

    pub fn is_empty(&self) -> bool {
        self.root.len() == 0
    }

    pub fn bounds(&self) -> Aabb {
        self.root.bounds
    }
}
