use log::debug;

use crate::{Error, PeriodicBox, Vector3D};
use super::query::{NeighborQuery, NeighborBond, QueryArgs, QueryMode, QueryStatus};
use super::knn::{AdaptiveKnn, KnnParameters};

/// Maximal number of cells, we need to use this to prevent having too many
/// cells with a large box and a small cell width
const MAX_NUMBER_OF_CELLS: f64 = 1e5;

/// The cell list sorts points inside a regular grid of cells covering the
/// periodic box.
///
/// Each cell is at least `cell_width` wide in all directions, so all the
/// neighbors of a point closer than `cell_width` are in the cell containing
/// the point or in one of the directly neighboring cells. The members of all
/// cells are stored contiguously in a single array, sorted by cell.
#[derive(Debug, Clone)]
pub struct CellList {
    periodic_box: PeriodicBox,
    cell_width: f64,
    /// number of cells along each lattice vector
    dimensions: [usize; 3],
    /// `members[cell_starts[c]..cell_starts[c + 1]]` are the points in cell `c`
    cell_starts: Vec<usize>,
    members: Vec<usize>,
    /// positions of the points, wrapped inside the box
    positions: Vec<Vector3D>,
}

impl CellList {
    /// Create a new `CellList` for the given `points`, using cells at least
    /// `cell_width` wide.
    #[time_graph::instrument(name = "CellList::new")]
    pub fn new(periodic_box: &PeriodicBox, points: &[Vector3D], cell_width: f64) -> Result<CellList, Error> {
        if !(cell_width > 0.0 && cell_width.is_finite()) {
            return Err(Error::InvalidParameter(format!(
                "cell width must be positive and finite, got {}", cell_width
            )));
        }

        let mut positions = Vec::with_capacity(points.len());
        for (i, &point) in points.iter().enumerate() {
            if !point.is_finite() {
                return Err(Error::InvalidParameter(format!(
                    "point {} has non-finite coordinates", i
                )));
            }
            positions.push(periodic_box.wrap_position(point));
        }

        let dimensions = grid_dimensions(periodic_box, cell_width);
        let n_cells = dimensions[0] * dimensions[1] * dimensions[2];
        debug!(
            "cell list with {}x{}x{} cells for a cell width of {}",
            dimensions[0], dimensions[1], dimensions[2], cell_width
        );

        let mut cell_list = CellList {
            periodic_box: *periodic_box,
            cell_width: cell_width,
            dimensions: dimensions,
            cell_starts: vec![0; n_cells + 1],
            members: vec![0; positions.len()],
            positions: Vec::new(),
        };

        // first pass: count the points in each cell
        let cells = positions.iter()
            .map(|&position| cell_list.cell_of(position))
            .collect::<Vec<_>>();
        for &cell in &cells {
            cell_list.cell_starts[cell + 1] += 1;
        }
        for cell in 0..n_cells {
            cell_list.cell_starts[cell + 1] += cell_list.cell_starts[cell];
        }

        // second pass: scatter the points to their cell
        let mut next = cell_list.cell_starts.clone();
        for (point, &cell) in cells.iter().enumerate() {
            cell_list.members[next[cell]] = point;
            next[cell] += 1;
        }

        cell_list.positions = positions;
        return Ok(cell_list);
    }

    /// Get the number of cells along each lattice vector
    pub fn dimensions(&self) -> [usize; 3] {
        self.dimensions
    }

    /// Get the total number of cells
    pub fn num_cells(&self) -> usize {
        self.cell_starts.len() - 1
    }

    /// Get the minimal cell width requested when creating this cell list
    pub fn cell_width(&self) -> f64 {
        self.cell_width
    }

    /// Is there a single cell along each lattice vector?
    pub fn is_degenerate(&self) -> bool {
        self.dimensions == [1, 1, 1]
    }

    /// Get the largest radius that can be used for ball queries with this
    /// cell list. This is at least the cell width, and infinite when there
    /// are less than three cells along all lattice vectors.
    pub fn max_query_radius(&self) -> f64 {
        let distances = self.periodic_box.nearest_plane_distance();
        let mut radius = f64::INFINITY;
        for axis in 0..3 {
            // with less than three cells, all cells along this axis are
            // already searched
            if self.dimensions[axis] >= 3 {
                radius = f64::min(radius, distances[axis] / self.dimensions[axis] as f64);
            }
        }
        return radius;
    }

    /// Get the index of the cell containing `position`
    pub fn cell_of(&self, position: Vector3D) -> usize {
        let fractional = self.periodic_box.make_fractional(position);

        let mut coordinates = [0; 3];
        for axis in 0..3 {
            let n_cells = self.dimensions[axis];
            let index = f64::floor(fractional[axis] * n_cells as f64) as i64;
            // wrap positions outside of the box, and clamp values affected by
            // rounding errors at the boundaries
            let (_, index) = divmod(index, n_cells);
            coordinates[axis] = usize::min(index, n_cells - 1);
        }

        return self.linear_index(coordinates);
    }

    /// Get the coordinates in the grid of the given `cell`
    pub fn cell_coordinates(&self, cell: usize) -> [usize; 3] {
        assert!(cell < self.num_cells(), "cell index out of range");
        let [_, ny, nz] = self.dimensions;
        [cell / (ny * nz), (cell / nz) % ny, cell % nz]
    }

    fn linear_index(&self, coordinates: [usize; 3]) -> usize {
        let [_, ny, nz] = self.dimensions;
        (coordinates[0] * ny + coordinates[1]) * nz + coordinates[2]
    }

    /// Get the cells neighboring `cell`, including `cell` itself, using
    /// periodic boundary conditions. Each cell is only included once, even
    /// when there are less than three cells along some direction.
    pub fn neighbor_cells(&self, cell: usize) -> Vec<usize> {
        let center = self.cell_coordinates(cell);
        let search_z = if self.periodic_box.is_2d() { 0..=0 } else { -1..=1 };

        let mut cells = Vec::with_capacity(27);
        for delta_x in -1..=1 {
            for delta_y in -1..=1 {
                for delta_z in search_z.clone() {
                    let mut coordinates = [0; 3];
                    for (axis, delta) in [delta_x, delta_y, delta_z].into_iter().enumerate() {
                        let (_, index) = divmod(center[axis] as i64 + delta, self.dimensions[axis]);
                        coordinates[axis] = index;
                    }
                    cells.push(self.linear_index(coordinates));
                }
            }
        }

        cells.sort_unstable();
        cells.dedup();
        return cells;
    }

    /// Get an iterator over the points in the given `cell`
    pub fn cell_members(&self, cell: usize) -> CellMembers<'_> {
        let members = &self.members[self.cell_starts[cell]..self.cell_starts[cell + 1]];
        CellMembers {
            inner: members.iter(),
        }
    }

    /// Call `callback` with all points closer than `r_max` to `position`,
    /// and their distance. If `everything` is true, the distance check is
    /// skipped and all points in the neighboring cells are used.
    pub(crate) fn for_each_neighbor(
        &self,
        position: Vector3D,
        r_max: f64,
        everything: bool,
        excluded: Option<usize>,
        mut callback: impl FnMut(usize, f64),
    ) {
        let r_max2 = r_max * r_max;
        for cell in self.neighbor_cells(self.cell_of(position)) {
            for target in self.cell_members(cell) {
                if Some(target) == excluded {
                    continue;
                }

                let distance2 = self.periodic_box.wrap(self.positions[target] - position).norm2();
                if everything || distance2 < r_max2 {
                    callback(target, distance2.sqrt());
                }
            }
        }
    }
}

/// Iterator over the points in a single cell of a [`CellList`], created by
/// [`CellList::cell_members`]
#[derive(Debug, Clone)]
pub struct CellMembers<'a> {
    inner: std::slice::Iter<'a, usize>,
}

impl<'a> Iterator for CellMembers<'a> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        self.inner.next().copied()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<'a> ExactSizeIterator for CellMembers<'a> {}

impl NeighborQuery for CellList {
    fn periodic_box(&self) -> &PeriodicBox {
        &self.periodic_box
    }

    fn points(&self) -> &[Vector3D] {
        &self.positions
    }

    fn check_args(&self, args: &QueryArgs) -> Result<(), Error> {
        args.validate()?;

        if args.mode == QueryMode::Ball && args.r_max > self.max_query_radius() {
            return Err(Error::InvalidParameter(format!(
                "can not use a radius of {} with a cell list built for a cell width of {}",
                args.r_max, self.cell_width
            )));
        }

        Ok(())
    }

    fn query_point(&self, ref_index: usize, position: Vector3D, args: &QueryArgs, output: &mut Vec<NeighborBond>) -> QueryStatus {
        // nearest neighbors queries go through `query_nearest_batch`
        debug_assert_eq!(args.mode, QueryMode::Ball);

        let position = self.periodic_box.wrap_position(position);
        let excluded = if args.exclude_ii { Some(ref_index) } else { None };

        let start = output.len();
        self.for_each_neighbor(position, args.r_max, false, excluded, |target, distance| {
            output.push(NeighborBond {
                ref_index: ref_index,
                target_index: target,
                distance: distance,
            });
        });
        output[start..].sort_unstable_by(NeighborBond::cmp_by_distance);

        return QueryStatus::complete();
    }

    fn query_nearest_batch(&self, query_points: &[Vector3D], args: &QueryArgs) -> Option<Result<(Vec<NeighborBond>, QueryStatus), Error>> {
        let parameters = KnnParameters {
            r_max: args.r_guess.unwrap_or(self.cell_width),
            num_neighbors: args.num_neighbors,
            scale: args.scale,
            strict_cut: false,
        };

        let result = AdaptiveKnn::new(parameters).and_then(|mut knn| {
            let status = knn.compute(&self.periodic_box, query_points, &self.positions, args.exclude_ii)?;
            Ok((knn.neighbor_bonds(), status))
        });

        return Some(result);
    }
}

/// Get the number of cells along each lattice vector for cells at least
/// `cell_width` wide
fn grid_dimensions(periodic_box: &PeriodicBox, cell_width: f64) -> [usize; 3] {
    let distances = periodic_box.nearest_plane_distance();
    let mut n_cells = [
        f64::max(f64::floor(distances[0] / cell_width), 1.0),
        f64::max(f64::floor(distances[1] / cell_width), 1.0),
        f64::max(f64::floor(distances[2] / cell_width), 1.0),
    ];
    if periodic_box.is_2d() {
        n_cells[2] = 1.0;
    }

    // limit memory consumption by ensuring we have less than
    // `MAX_NUMBER_OF_CELLS` cells, while keeping roughly the ratio of cells
    // in each direction. This only makes the cells larger.
    let n_cells_total = n_cells[0] * n_cells[1] * n_cells[2];
    if n_cells_total > MAX_NUMBER_OF_CELLS {
        let factor = if periodic_box.is_2d() {
            f64::sqrt(n_cells_total / MAX_NUMBER_OF_CELLS)
        } else {
            f64::cbrt(n_cells_total / MAX_NUMBER_OF_CELLS)
        };

        for value in &mut n_cells {
            *value = f64::max(f64::floor(*value / factor), 1.0);
        }
    }

    return [n_cells[0] as usize, n_cells[1] as usize, n_cells[2] as usize];
}

/// Compute both quotient and remainder of the division of `a` by `b`,
/// making sure the remainder is positive.
fn divmod(a: i64, b: usize) -> (i64, usize) {
    debug_assert!(b < (i64::MAX as usize));
    let b = b as i64;
    let mut quotient = a / b;
    let mut remainder = a % b;
    if remainder < 0 {
        remainder += b;
        quotient -= 1;
    }
    return (quotient, remainder as usize);
}
