use log::debug;

use crate::{Error, PeriodicBox, Vector3D};
use super::query::{NeighborQuery, NeighborBond, QueryArgs, QueryMode, QueryStatus};
use super::query::{NearestCollector, nearest_by_growing_ball, default_r_guess};

/// Maximal number of points stored in a single leaf of the tree
const LEAF_CAPACITY: usize = 8;

/// Marker for leaf nodes, which do not have children
const NO_CHILD: usize = usize::MAX;

/// Axis-aligned bounding box
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    /// lower corner of the box
    pub lower: Vector3D,
    /// upper corner of the box
    pub upper: Vector3D,
}

impl BoundingBox {
    fn empty() -> BoundingBox {
        BoundingBox {
            lower: Vector3D::new(f64::INFINITY, f64::INFINITY, f64::INFINITY),
            upper: Vector3D::new(f64::NEG_INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY),
        }
    }

    fn include(&mut self, point: Vector3D) {
        self.lower = self.lower.component_min(point);
        self.upper = self.upper.component_max(point);
    }

    /// Squared distance between `point` and the closest point of this box,
    /// zero if the point is inside.
    pub fn distance2(&self, point: Vector3D) -> f64 {
        let mut distance2 = 0.0;
        for axis in 0..3 {
            let delta = if point[axis] < self.lower[axis] {
                self.lower[axis] - point[axis]
            } else if point[axis] > self.upper[axis] {
                point[axis] - self.upper[axis]
            } else {
                0.0
            };
            distance2 += delta * delta;
        }
        return distance2;
    }

    /// Get the axis along which this box is the longest
    pub fn longest_axis(&self) -> usize {
        let extent = self.upper - self.lower;
        if extent[0] >= extent[1] && extent[0] >= extent[2] {
            0
        } else if extent[1] >= extent[2] {
            1
        } else {
            2
        }
    }
}

/// A node in the tree. Nodes reference a contiguous range of the tree
/// permutation array, and their children by index in the node array.
#[derive(Debug, Clone)]
struct Node {
    bounds: BoundingBox,
    start: usize,
    end: usize,
    left: usize,
    right: usize,
}

impl Node {
    fn is_leaf(&self) -> bool {
        self.left == NO_CHILD
    }
}

/// Bounding volume hierarchy over a set of points.
///
/// The tree is built by recursively splitting the points at the median of
/// the longest axis of their bounding box, until at most `LEAF_CAPACITY`
/// points remain in a node. All nodes are stored in a single array, and
/// reference their points as ranges of a single permutation of the point
/// indices.
#[derive(Debug, Clone)]
pub struct AabbTree {
    nodes: Vec<Node>,
    permutation: Vec<usize>,
    positions: Vec<Vector3D>,
}

impl AabbTree {
    /// Build a new tree containing the given `positions`
    #[time_graph::instrument(name = "AabbTree::new")]
    pub fn new(positions: Vec<Vector3D>) -> AabbTree {
        let mut tree = AabbTree {
            nodes: Vec::new(),
            permutation: (0..positions.len()).collect(),
            positions: positions,
        };

        if !tree.positions.is_empty() {
            // reserve enough nodes for a balanced tree
            let n_leaves = (tree.positions.len() + LEAF_CAPACITY - 1) / LEAF_CAPACITY;
            tree.nodes.reserve(2 * n_leaves.next_power_of_two());
            tree.build_node(0, tree.positions.len());
        }

        debug!("built AABB tree with {} nodes and depth {}", tree.nodes.len(), tree.depth());

        return tree;
    }

    /// Build the node containing the points in `permutation[start..end]`,
    /// returning its index
    fn build_node(&mut self, start: usize, end: usize) -> usize {
        let mut bounds = BoundingBox::empty();
        for &point in &self.permutation[start..end] {
            bounds.include(self.positions[point]);
        }

        let index = self.nodes.len();
        self.nodes.push(Node {
            bounds: bounds,
            start: start,
            end: end,
            left: NO_CHILD,
            right: NO_CHILD,
        });

        if end - start <= LEAF_CAPACITY {
            return index;
        }

        let axis = bounds.longest_axis();
        let middle = start + (end - start) / 2;

        // split at the median, using the point index to break ties so that
        // the tree only depends on the order of the points
        let positions = &self.positions;
        self.permutation[start..end].select_nth_unstable_by(middle - start, |&a, &b| {
            positions[a][axis].total_cmp(&positions[b][axis]).then(a.cmp(&b))
        });

        let left = self.build_node(start, middle);
        let right = self.build_node(middle, end);

        let node = &mut self.nodes[index];
        node.left = left;
        node.right = right;

        return index;
    }

    /// Get the number of points in this tree
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Check if this tree contains no points
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Get the positions of the points in this tree
    pub fn positions(&self) -> &[Vector3D] {
        &self.positions
    }

    /// Get the bounding box of all points in this tree
    pub fn bounds(&self) -> Option<BoundingBox> {
        self.nodes.first().map(|node| node.bounds)
    }

    /// Get the depth of this tree, i.e. the number of nodes on the longest
    /// path from the root to a leaf
    pub fn depth(&self) -> usize {
        if self.nodes.is_empty() {
            return 0;
        }

        let mut depth = 0;
        let mut stack = vec![(0, 1)];
        while let Some((index, level)) = stack.pop() {
            let node = &self.nodes[index];
            depth = usize::max(depth, level);
            if !node.is_leaf() {
                stack.push((node.left, level + 1));
                stack.push((node.right, level + 1));
            }
        }
        return depth;
    }

    /// Call `callback` with the index of all points in leaves whose bounding
    /// box intersects the sphere of radius `radius` around `center`. Points
    /// further than `radius` from the center can be included, and should be
    /// filtered by the caller.
    pub fn for_each_candidate(&self, center: Vector3D, radius: f64, mut callback: impl FnMut(usize)) {
        if self.nodes.is_empty() {
            return;
        }

        let radius2 = radius * radius;
        let mut stack = Vec::with_capacity(64);
        stack.push(0);

        while let Some(index) = stack.pop() {
            let node = &self.nodes[index];
            if node.bounds.distance2(center) >= radius2 {
                continue;
            }

            if node.is_leaf() {
                for &point in &self.permutation[node.start..node.end] {
                    callback(point);
                }
            } else {
                stack.push(node.right);
                stack.push(node.left);
            }
        }
    }
}

/// Spatial queries using an [`AabbTree`], with periodic boundary conditions.
///
/// Periodic boundary conditions are handled by searching the tree around
/// all periodic images of the query point that can contain neighbors, and
/// then computing the minimum image distance for all candidates.
#[derive(Debug, Clone)]
pub struct AabbQuery {
    periodic_box: PeriodicBox,
    tree: AabbTree,
    /// image flags and the corresponding lattice translations to apply to
    /// query points to get their periodic images
    image_shifts: Vec<([i32; 3], Vector3D)>,
    /// distances between opposite faces of the box
    plane_distances: Vector3D,
}

impl AabbQuery {
    /// Build a new `AabbQuery` for the given `points`, which will be wrapped
    /// inside the box.
    pub fn new(periodic_box: &PeriodicBox, points: &[Vector3D]) -> Result<AabbQuery, Error> {
        let mut positions = Vec::with_capacity(points.len());
        for (i, &point) in points.iter().enumerate() {
            if !point.is_finite() {
                return Err(Error::InvalidParameter(format!(
                    "point {} has non-finite coordinates", i
                )));
            }
            positions.push(periodic_box.wrap_position(point));
        }

        let a1 = periodic_box.lattice_vector(0);
        let a2 = periodic_box.lattice_vector(1);
        let a3 = periodic_box.lattice_vector(2);
        let z_range = if periodic_box.is_2d() { 0..=0 } else { -1..=1 };

        let mut image_shifts = Vec::new();
        for i in -1..=1 {
            for j in -1..=1 {
                for k in z_range.clone() {
                    let shift = i as f64 * a1 + j as f64 * a2 + k as f64 * a3;
                    image_shifts.push(([i, j, k], shift));
                }
            }
        }

        Ok(AabbQuery {
            periodic_box: *periodic_box,
            tree: AabbTree::new(positions),
            image_shifts: image_shifts,
            plane_distances: periodic_box.nearest_plane_distance(),
        })
    }

    /// Get the tree used by this query
    pub fn tree(&self) -> &AabbTree {
        &self.tree
    }

    /// Get the lattice translations giving the periodic images of
    /// `position` which can have points closer than `r_max`. An image
    /// shifted along a lattice vector is only needed when the sphere around
    /// `position` crosses the corresponding face of the box.
    fn image_shifts(&self, position: Vector3D, r_max: f64) -> impl Iterator<Item = Vector3D> + '_ {
        let fractional = self.periodic_box.make_fractional(position);
        // slack for positions rounded just outside of the box
        let reach = Vector3D::new(
            r_max / self.plane_distances[0] + 1e-9,
            r_max / self.plane_distances[1] + 1e-9,
            r_max / self.plane_distances[2] + 1e-9,
        );

        self.image_shifts.iter()
            .filter(move |(image, _)| (0..3).all(|axis| match image[axis] {
                1 => fractional[axis] < reach[axis],
                -1 => 1.0 - fractional[axis] < reach[axis],
                _ => true,
            }))
            .map(|&(_, shift)| shift)
    }

    /// Add all points closer than `r_max` from `position` to the collector,
    /// skipping `excluded`. `position` must be wrapped inside the box.
    fn ball(&self, ref_index: usize, position: Vector3D, r_max: f64, excluded: Option<usize>, mut push: impl FnMut(NeighborBond)) {
        let positions = self.tree.positions();
        let r_max2 = r_max * r_max;

        // the same point can be found through multiple images when the
        // radius is large compared to the box
        let mut found = Vec::new();
        for shift in self.image_shifts(position, r_max) {
            self.tree.for_each_candidate(position + shift, r_max, |target| {
                if Some(target) != excluded {
                    found.push(target);
                }
            });
        }
        found.sort_unstable();
        found.dedup();

        for target in found {
            let vector = self.periodic_box.wrap(positions[target] - position);
            let distance2 = vector.norm2();
            if distance2 < r_max2 {
                push(NeighborBond {
                    ref_index: ref_index,
                    target_index: target,
                    distance: distance2.sqrt(),
                });
            }
        }
    }
}

impl NeighborQuery for AabbQuery {
    fn periodic_box(&self) -> &PeriodicBox {
        &self.periodic_box
    }

    fn points(&self) -> &[Vector3D] {
        self.tree.positions()
    }

    fn query_point(&self, ref_index: usize, position: Vector3D, args: &QueryArgs, output: &mut Vec<NeighborBond>) -> QueryStatus {
        let position = self.periodic_box.wrap_position(position);
        let excluded = if args.exclude_ii { Some(ref_index) } else { None };

        match args.mode {
            QueryMode::Ball => {
                let start = output.len();
                self.ball(ref_index, position, args.r_max, excluded, |bond| output.push(bond));
                output[start..].sort_unstable_by(NeighborBond::cmp_by_distance);
                QueryStatus::complete()
            }
            QueryMode::Nearest => {
                let r_guess = args.r_guess.unwrap_or_else(|| default_r_guess(&self.periodic_box));
                nearest_by_growing_ball(
                    &self.periodic_box,
                    args.num_neighbors,
                    r_guess,
                    args.scale,
                    |r, collector: &mut NearestCollector| {
                        self.ball(ref_index, position, r, excluded, |bond| collector.push(bond));
                    },
                    output,
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::neighbors::QueryWarning;

    fn grid(n: usize, spacing: f64) -> Vec<Vector3D> {
        let mut points = Vec::new();
        for i in 0..n {
            for j in 0..n {
                for k in 0..n {
                    points.push(Vector3D::new(i as f64, j as f64, k as f64) * spacing);
                }
            }
        }
        return points;
    }

    #[test]
    fn tree_structure() {
        let points = grid(6, 1.0);
        let tree = AabbTree::new(points.clone());
        assert_eq!(tree.len(), 216);

        // 216 points split in halves down to leaves of at most 8 points
        assert_eq!(tree.depth(), 6);

        let bounds = tree.bounds().unwrap();
        assert_eq!(bounds.lower, Vector3D::new(0.0, 0.0, 0.0));
        assert_eq!(bounds.upper, Vector3D::new(5.0, 5.0, 5.0));

        // all points are reachable exactly once with a large radius
        let mut seen = Vec::new();
        tree.for_each_candidate(Vector3D::zero(), 100.0, |i| seen.push(i));
        seen.sort_unstable();
        assert_eq!(seen, (0..216).collect::<Vec<_>>());

        // building twice gives the same tree
        let other = AabbTree::new(points);
        assert_eq!(other.permutation, tree.permutation);

        let empty = AabbTree::new(Vec::new());
        assert!(empty.is_empty());
        assert_eq!(empty.depth(), 0);
        empty.for_each_candidate(Vector3D::zero(), 1.0, |_| panic!("empty tree"));
    }

    #[test]
    fn bounding_box() {
        let mut bounds = BoundingBox::empty();
        bounds.include(Vector3D::new(0.0, 0.0, 0.0));
        bounds.include(Vector3D::new(1.0, 3.0, 2.0));

        assert_eq!(bounds.longest_axis(), 1);
        assert_eq!(bounds.distance2(Vector3D::new(0.5, 0.5, 0.5)), 0.0);
        assert_eq!(bounds.distance2(Vector3D::new(2.0, 4.0, 2.0)), 2.0);
    }

    #[test]
    fn periodic_ball() {
        let periodic_box = PeriodicBox::cube(10.0).unwrap();
        let points = [Vector3D::new(0.0, 0.0, 0.0), Vector3D::new(9.0, 9.0, 9.0)];
        let query = AabbQuery::new(&periodic_box, &points).unwrap();

        let bonds = query.query_ball(&points, 2.0, true).unwrap().collect::<Vec<_>>();
        assert_eq!(bonds.len(), 2);
        assert_eq!((bonds[0].ref_index, bonds[0].target_index), (0, 1));
        assert_eq!((bonds[1].ref_index, bonds[1].target_index), (1, 0));
        assert_relative_eq!(bonds[0].distance, f64::sqrt(3.0), max_relative = 1e-12);

        // including self pairs
        let bonds = query.query_ball(&points, 2.0, false).unwrap().collect::<Vec<_>>();
        assert_eq!(bonds.len(), 4);
        assert_eq!(bonds[0].target_index, 0);
        assert_eq!(bonds[0].distance, 0.0);
    }

    #[test]
    fn large_radius() {
        // radius larger than half the box: every pair is found exactly once
        let periodic_box = PeriodicBox::cube(2.0).unwrap();
        let points = grid(2, 1.0);
        let query = AabbQuery::new(&periodic_box, &points).unwrap();

        let (list, status) = query.query_ball(&points, 1.9, true).unwrap().to_bond_list();
        assert!(status.is_complete());
        assert_eq!(list.len(), 8 * 7);
        assert_eq!(list.neighbor_counts(), [7; 8]);
    }

    #[test]
    fn image_shifts() {
        let periodic_box = PeriodicBox::cube(10.0).unwrap();
        let points = [Vector3D::new(4.5, 4.5, 4.5), Vector3D::new(-4.5, -4.5, -4.5)];
        let query = AabbQuery::new(&periodic_box, &points).unwrap();

        let count = |position, r_max| query.image_shifts(position, r_max).count();
        assert_eq!(count(Vector3D::new(0.0, 0.0, 0.0), 1.0), 1);
        assert_eq!(count(Vector3D::new(-4.5, 0.0, 0.0), 1.0), 2);
        assert_eq!(count(Vector3D::new(4.5, 4.5, 4.5), 1.0), 8);
        assert_eq!(count(Vector3D::new(0.0, 0.0, 0.0), 6.0), 27);

        // neighbors across the corner of the box are still found
        let bonds = query.query_ball(&points, 2.0, true).unwrap().collect::<Vec<_>>();
        assert_eq!(bonds.len(), 2);
        assert_relative_eq!(bonds[0].distance, f64::sqrt(3.0), max_relative = 1e-12);

        let periodic_box = PeriodicBox::square(10.0).unwrap();
        let query = AabbQuery::new(&periodic_box, &points).unwrap();
        assert_eq!(query.image_shifts(Vector3D::new(4.5, 4.5, 0.0), 1.0).count(), 4);
        assert_eq!(query.image_shifts(Vector3D::new(0.0, 0.0, 0.0), 6.0).count(), 9);
    }

    #[test]
    fn nearest() {
        let periodic_box = PeriodicBox::cube(10.0).unwrap();
        let points = [
            Vector3D::new(0.0, 0.0, 0.0),
            Vector3D::new(1.0, 0.0, 0.0),
            Vector3D::new(0.0, 2.0, 0.0),
            Vector3D::new(-3.0, 0.0, 0.0),
            Vector3D::new(4.0, 4.0, 4.0),
        ];
        let query = AabbQuery::new(&periodic_box, &points).unwrap();

        let bonds = query.query_knn(&points[..1], 3, true).unwrap().collect::<Vec<_>>();
        let targets = bonds.iter().map(|b| b.target_index).collect::<Vec<_>>();
        assert_eq!(targets, [1, 2, 3]);

        // equal distances are sorted by index
        let center = [Vector3D::new(0.5, 1.0, 0.0)];
        let bonds = query.query_knn(&center, 2, false).unwrap().collect::<Vec<_>>();
        assert_eq!(bonds[0].target_index, 0);
        assert_eq!(bonds[1].target_index, 1);
        assert_eq!(bonds[0].distance, bonds[1].distance);
    }

    #[test]
    fn nearest_truncated() {
        let periodic_box = PeriodicBox::cube(10.0).unwrap();
        let points = [Vector3D::new(1.0, 1.0, 1.0)];
        let query = AabbQuery::new(&periodic_box, &points).unwrap();

        let mut results = query.query_knn(&points, 1, true).unwrap();
        assert!(results.next().is_none());
        assert_eq!(results.status().warning(), Some(QueryWarning::TruncatedResult { missing: 1 }));

        let (list, status) = query.query_knn(&points, 3, false).unwrap().to_bond_list();
        assert_eq!(list.len(), 1);
        assert_eq!(status.warning(), Some(QueryWarning::TruncatedResult { missing: 2 }));
    }

    #[test]
    fn two_dimensional() {
        let periodic_box = PeriodicBox::square(10.0).unwrap();
        let points = [
            Vector3D::new(4.5, 0.0, 0.0),
            Vector3D::new(-4.5, 0.0, 3.0),
            Vector3D::new(0.0, 0.0, 0.0),
        ];
        let query = AabbQuery::new(&periodic_box, &points).unwrap();

        let bonds = query.query_ball(&points[..1], 1.5, true).unwrap().collect::<Vec<_>>();
        assert_eq!(bonds.len(), 1);
        assert_eq!(bonds[0].target_index, 1);
        // the z coordinate is ignored in 2D
        assert_relative_eq!(bonds[0].distance, 1.0, max_relative = 1e-12);
    }

    #[test]
    fn invalid_points() {
        let periodic_box = PeriodicBox::cube(10.0).unwrap();
        let points = [Vector3D::new(f64::NAN, 0.0, 0.0)];
        assert!(matches!(AabbQuery::new(&periodic_box, &points), Err(Error::InvalidParameter(_))));
    }
}
