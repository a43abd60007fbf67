//! Point quad-tree for rectangular range queries.
//!
//! Built once per query corpus (detected star positions or projected
//! catalog positions) and then queried read-only; there is no deletion
//! or rebalancing. Query rectangles use inclusive bounds, and results
//! are independent of the order points were supplied in.

use nalgebra::Point2;

/// Points per leaf before it subdivides.
const LEAF_CAPACITY: usize = 16;

/// Subdivision depth cap; guards stacks of coincident points.
const MAX_DEPTH: usize = 16;

/// Axis-aligned query rectangle with inclusive bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

impl Bounds {
    pub fn new(x0: f64, y0: f64, x1: f64, y1: f64) -> Self {
        Self { x0, y0, x1, y1 }
    }

    /// Square of half-width `tolerance` centered on `center`; the shape
    /// used for channel-to-channel and catalog matching.
    pub fn around(center: Point2<f64>, tolerance: f64) -> Self {
        Self {
            x0: center.x - tolerance,
            y0: center.y - tolerance,
            x1: center.x + tolerance,
            y1: center.y + tolerance,
        }
    }

    pub fn contains(&self, p: &Point2<f64>) -> bool {
        p.x >= self.x0 && p.x <= self.x1 && p.y >= self.y0 && p.y <= self.y1
    }

    fn intersects(&self, other: &Bounds) -> bool {
        self.x0 <= other.x1 && self.x1 >= other.x0 && self.y0 <= other.y1 && self.y1 >= other.y0
    }

    fn quadrant(&self, which: usize) -> Bounds {
        let cx = (self.x0 + self.x1) / 2.0;
        let cy = (self.y0 + self.y1) / 2.0;
        match which {
            0 => Bounds::new(self.x0, self.y0, cx, cy),
            1 => Bounds::new(cx, self.y0, self.x1, cy),
            2 => Bounds::new(self.x0, cy, cx, self.y1),
            _ => Bounds::new(cx, cy, self.x1, self.y1),
        }
    }

    /// Which quadrant a point descends into; points on a split line go
    /// east/south so every point has exactly one home.
    fn child_for(&self, p: &Point2<f64>) -> usize {
        let cx = (self.x0 + self.x1) / 2.0;
        let cy = (self.y0 + self.y1) / 2.0;
        let east = p.x >= cx;
        let south = p.y >= cy;
        (south as usize) * 2 + east as usize
    }
}

enum Node {
    Leaf(Vec<u32>),
    Branch(Box<[Node; 4]>),
}

/// Read-only spatial index over a set of 2-D points.
pub struct QuadTree {
    points: Vec<Point2<f64>>,
    bounds: Bounds,
    root: Node,
}

impl QuadTree {
    /// Build an index over `points`. Point identity is the index into
    /// the input slice.
    pub fn build(points: &[Point2<f64>]) -> Self {
        let bounds = enclosing_bounds(points);
        let mut root = Node::Leaf(Vec::new());
        for (index, point) in points.iter().enumerate() {
            insert(&mut root, &bounds, 0, index as u32, point, points);
        }
        Self {
            points: points.to_vec(),
            bounds,
            root,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Indices of all points inside `rect` (inclusive boundaries),
    /// in ascending index order.
    pub fn search(&self, rect: &Bounds) -> Vec<usize> {
        let mut hits = Vec::new();
        if !self.points.is_empty() && rect.intersects(&self.bounds) {
            collect(&self.root, &self.bounds, rect, &self.points, &mut hits);
        }
        hits.sort_unstable();
        hits
    }

    /// The point inside `rect` closest to `target` by squared Euclidean
    /// distance.
    ///
    /// Exact distance ties are broken by the lower point index, i.e. by
    /// the order of the build slice; for a fixed input this is stable
    /// and deterministic.
    pub fn nearest_in_rect(&self, target: Point2<f64>, rect: &Bounds) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for index in self.search(rect) {
            let d = (self.points[index] - target).norm_squared();
            if best.map_or(true, |(_, bd)| d < bd) {
                best = Some((index, d));
            }
        }
        best.map(|(index, _)| index)
    }
}

fn enclosing_bounds(points: &[Point2<f64>]) -> Bounds {
    let mut bounds = Bounds::new(0.0, 0.0, 0.0, 0.0);
    let mut first = true;
    for p in points {
        if first {
            bounds = Bounds::new(p.x, p.y, p.x, p.y);
            first = false;
        } else {
            bounds.x0 = bounds.x0.min(p.x);
            bounds.y0 = bounds.y0.min(p.y);
            bounds.x1 = bounds.x1.max(p.x);
            bounds.y1 = bounds.y1.max(p.y);
        }
    }
    bounds
}

fn insert(
    node: &mut Node,
    node_bounds: &Bounds,
    depth: usize,
    index: u32,
    point: &Point2<f64>,
    points: &[Point2<f64>],
) {
    match node {
        Node::Leaf(items) => {
            items.push(index);
            if items.len() > LEAF_CAPACITY && depth < MAX_DEPTH {
                let moved = std::mem::take(items);
                let mut children = Box::new([
                    Node::Leaf(Vec::new()),
                    Node::Leaf(Vec::new()),
                    Node::Leaf(Vec::new()),
                    Node::Leaf(Vec::new()),
                ]);
                for item in moved {
                    let p = &points[item as usize];
                    let which = node_bounds.child_for(p);
                    insert(
                        &mut children[which],
                        &node_bounds.quadrant(which),
                        depth + 1,
                        item,
                        p,
                        points,
                    );
                }
                *node = Node::Branch(children);
            }
        }
        Node::Branch(children) => {
            let which = node_bounds.child_for(point);
            insert(
                &mut children[which],
                &node_bounds.quadrant(which),
                depth + 1,
                index,
                point,
                points,
            );
        }
    }
}

fn collect(
    node: &Node,
    node_bounds: &Bounds,
    rect: &Bounds,
    points: &[Point2<f64>],
    hits: &mut Vec<usize>,
) {
    match node {
        Node::Leaf(items) => {
            for &item in items {
                if rect.contains(&points[item as usize]) {
                    hits.push(item as usize);
                }
            }
        }
        Node::Branch(children) => {
            for (which, child) in children.iter().enumerate() {
                let child_bounds = node_bounds.quadrant(which);
                if rect.intersects(&child_bounds) {
                    collect(child, &child_bounds, rect, points, hits);
                }
            }
        }
    }
}
