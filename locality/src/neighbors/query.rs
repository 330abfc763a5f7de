use std::cmp::Ordering;
use std::collections::BinaryHeap;

use log::warn;
use rayon::prelude::*;

use crate::{Error, PeriodicBox, Vector3D};
use super::BondList;

/// A neighbor found by a spatial query: the point `target_index` of the
/// queried point set is at a distance `distance` (using the minimum image
/// convention) of the query point `ref_index`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NeighborBond {
    /// index of the query point
    pub ref_index: usize,
    /// index of the neighbor in the queried point set
    pub target_index: usize,
    /// minimum image distance between the two points
    pub distance: f64,
}

impl NeighborBond {
    /// Compare two bonds by distance, and then by target index
    pub fn cmp_by_distance(&self, other: &NeighborBond) -> Ordering {
        self.distance.total_cmp(&other.distance)
            .then(self.target_index.cmp(&other.target_index))
    }
}

/// Soft failure of a neighbor search: the search completed, but some query
/// points did not get all the neighbors they asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryWarning {
    /// A k-nearest neighbors query ran out of points before finding `k`
    /// neighbors for some points. `missing` is the total number of missing
    /// neighbors.
    TruncatedResult {
        missing: usize,
    },
    /// The adaptive k-nearest neighbors search could not find `k` neighbors
    /// for some points, and padded the output. `missing` is the total number
    /// of padded entries.
    InsufficientNeighbors {
        missing: usize,
    },
}

impl std::fmt::Display for QueryWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryWarning::TruncatedResult { missing } => write!(
                f, "truncated result: {} neighbors could not be found", missing
            ),
            QueryWarning::InsufficientNeighbors { missing } => write!(
                f, "insufficient neighbors: {} entries are padded", missing
            ),
        }
    }
}

/// Status of a neighbor search, flagging results that are incomplete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[must_use]
pub struct QueryStatus {
    warning: Option<QueryWarning>,
}

impl QueryStatus {
    /// Status of a search that found everything it was asked for
    pub fn complete() -> QueryStatus {
        QueryStatus { warning: None }
    }

    /// Status of a search with incomplete results
    pub fn incomplete(warning: QueryWarning) -> QueryStatus {
        QueryStatus { warning: Some(warning) }
    }

    /// Did the search find everything it was asked for?
    pub fn is_complete(&self) -> bool {
        self.warning.is_none()
    }

    /// Get the warning associated with this status, if any
    pub fn warning(&self) -> Option<QueryWarning> {
        self.warning
    }

    /// Combine this status with the status of another part of the same
    /// search, adding up missing neighbors.
    ///
    /// A single backend only ever reports one kind of warning. If the two
    /// kinds are merged anyway, the result is `InsufficientNeighbors` with
    /// the total count.
    pub fn merge(&mut self, other: QueryStatus) {
        use QueryWarning::{TruncatedResult, InsufficientNeighbors};

        self.warning = match (self.warning, other.warning) {
            (None, warning) | (warning, None) => warning,
            (Some(TruncatedResult { missing: a }), Some(TruncatedResult { missing: b })) => {
                Some(TruncatedResult { missing: a + b })
            }
            (Some(InsufficientNeighbors { missing: a }), Some(InsufficientNeighbors { missing: b })) |
            (Some(TruncatedResult { missing: a }), Some(InsufficientNeighbors { missing: b })) |
            (Some(InsufficientNeighbors { missing: a }), Some(TruncatedResult { missing: b })) => {
                Some(InsufficientNeighbors { missing: a + b })
            }
        };
    }
}

fn default_scale() -> f64 { 1.1 }

/// Kind of spatial query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum QueryMode {
    /// Find all neighbors closer than `r_max`
    Ball,
    /// Find the `num_neighbors` closest neighbors
    Nearest,
}

/// Parameters of a spatial query
#[derive(Debug, Clone, Copy, PartialEq)]
#[derive(serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct QueryArgs {
    /// Kind of query to run
    pub mode: QueryMode,
    /// Search radius for ball queries
    #[serde(default)]
    pub r_max: f64,
    /// Number of neighbors to find for nearest neighbors queries
    #[serde(default)]
    pub num_neighbors: usize,
    /// Initial search radius for nearest neighbors queries. Defaults to 10%
    /// of the smallest box dimension.
    #[serde(default)]
    pub r_guess: Option<f64>,
    /// Growth factor of the search radius for nearest neighbors queries
    #[serde(default = "default_scale")]
    pub scale: f64,
    /// Skip pairs between points with the same index in the query points and
    /// the queried points. This should be used when both sets are the same.
    #[serde(default)]
    pub exclude_ii: bool,
}

impl QueryArgs {
    /// Arguments for a ball query with the given radius
    pub fn ball(r_max: f64) -> QueryArgs {
        QueryArgs {
            mode: QueryMode::Ball,
            r_max: r_max,
            num_neighbors: 0,
            r_guess: None,
            scale: default_scale(),
            exclude_ii: false,
        }
    }

    /// Arguments for a query of the `num_neighbors` nearest neighbors
    pub fn nearest(num_neighbors: usize) -> QueryArgs {
        QueryArgs {
            mode: QueryMode::Nearest,
            r_max: 0.0,
            num_neighbors: num_neighbors,
            r_guess: None,
            scale: default_scale(),
            exclude_ii: false,
        }
    }

    /// Set the `exclude_ii` flag
    #[must_use]
    pub fn exclude_ii(mut self, exclude_ii: bool) -> QueryArgs {
        self.exclude_ii = exclude_ii;
        self
    }

    /// Set the initial search radius for nearest neighbors queries
    #[must_use]
    pub fn with_r_guess(mut self, r_guess: f64) -> QueryArgs {
        self.r_guess = Some(r_guess);
        self
    }

    /// Set the growth factor of the search radius for nearest neighbors
    /// queries
    #[must_use]
    pub fn with_scale(mut self, scale: f64) -> QueryArgs {
        self.scale = scale;
        self
    }

    /// Check that these arguments make sense
    pub fn validate(&self) -> Result<(), Error> {
        match self.mode {
            QueryMode::Ball => {
                if !(self.r_max > 0.0 && self.r_max.is_finite()) {
                    return Err(Error::InvalidParameter(format!(
                        "r_max must be positive and finite for ball queries, got {}", self.r_max
                    )));
                }
            }
            QueryMode::Nearest => {
                if self.num_neighbors == 0 {
                    return Err(Error::InvalidParameter(
                        "num_neighbors must be at least 1 for nearest neighbors queries".into()
                    ));
                }

                if !(self.scale > 1.0 && self.scale.is_finite()) {
                    return Err(Error::InvalidParameter(format!(
                        "scale must be larger than 1, got {}", self.scale
                    )));
                }

                if let Some(r_guess) = self.r_guess {
                    if !(r_guess > 0.0 && r_guess.is_finite()) {
                        return Err(Error::InvalidParameter(format!(
                            "r_guess must be positive and finite, got {}", r_guess
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

/// Interface shared by the spatial indexes built over a fixed set of points.
///
/// Implementations only need to find the neighbors of a single query point
/// in [`NeighborQuery::query_point`]; the iteration over query points and the
/// packaging of the results is shared through [`QueryResults`].
pub trait NeighborQuery: Sync {
    /// Get the box used for periodic boundary conditions
    fn periodic_box(&self) -> &PeriodicBox;

    /// Get the points in this index, wrapped inside the box
    fn points(&self) -> &[Vector3D];

    /// Check that this index can run a query with the given `args`
    fn check_args(&self, args: &QueryArgs) -> Result<(), Error> {
        args.validate()
    }

    /// Find the neighbors of the query point `ref_index` at `position`
    /// according to `args`, and add them to `output` sorted by distance.
    fn query_point(&self, ref_index: usize, position: Vector3D, args: &QueryArgs, output: &mut Vec<NeighborBond>) -> QueryStatus;

    /// Run a nearest neighbors query for all query points at once. Indexes
    /// that can not answer nearest neighbors queries one point at the time
    /// should override this and return `Some`.
    fn query_nearest_batch(&self, _query_points: &[Vector3D], _args: &QueryArgs) -> Option<Result<(Vec<NeighborBond>, QueryStatus), Error>> {
        None
    }

    /// Start a query for all `query_points`, according to `args`
    fn query<'a>(&'a self, query_points: &'a [Vector3D], args: QueryArgs) -> Result<QueryResults<'a, Self>, Error> where Self: Sized {
        self.check_args(&args)?;

        if args.mode == QueryMode::Nearest {
            if let Some(result) = self.query_nearest_batch(query_points, &args) {
                let (bonds, status) = result?;
                return Ok(QueryResults::precomputed(bonds, status, query_points.len(), self.points().len()));
            }
        }

        return Ok(QueryResults::new(self, query_points, args));
    }

    /// Find all neighbors of `query_points` closer than `r_max`
    fn query_ball<'a>(&'a self, query_points: &'a [Vector3D], r_max: f64, exclude_ii: bool) -> Result<QueryResults<'a, Self>, Error> where Self: Sized {
        self.query(query_points, QueryArgs::ball(r_max).exclude_ii(exclude_ii))
    }

    /// Find the `num_neighbors` nearest neighbors of `query_points`
    fn query_knn<'a>(&'a self, query_points: &'a [Vector3D], num_neighbors: usize, exclude_ii: bool) -> Result<QueryResults<'a, Self>, Error> where Self: Sized {
        self.query(query_points, QueryArgs::nearest(num_neighbors).exclude_ii(exclude_ii))
    }
}

enum Cursor<'a, Q> {
    Lazy {
        query: &'a Q,
        query_points: &'a [Vector3D],
        next_point: usize,
    },
    Precomputed(std::vec::IntoIter<NeighborBond>),
}

/// Lazy sequence of [`NeighborBond`] produced by a spatial query.
///
/// The neighbors are computed one query point at the time while iterating,
/// and the sequence can only be consumed once. Use
/// [`QueryResults::to_bond_list`] to compute all the remaining neighbors in
/// parallel and store them in a [`BondList`].
pub struct QueryResults<'a, Q> {
    cursor: Cursor<'a, Q>,
    args: QueryArgs,
    buffer: Vec<NeighborBond>,
    buffer_position: usize,
    status: QueryStatus,
    num_ref: usize,
    num_target: usize,
}

impl<'a, Q: NeighborQuery> QueryResults<'a, Q> {
    fn new(query: &'a Q, query_points: &'a [Vector3D], args: QueryArgs) -> QueryResults<'a, Q> {
        QueryResults {
            cursor: Cursor::Lazy {
                query: query,
                query_points: query_points,
                next_point: 0,
            },
            args: args,
            buffer: Vec::new(),
            buffer_position: 0,
            status: QueryStatus::complete(),
            num_ref: query_points.len(),
            num_target: query.points().len(),
        }
    }

    fn precomputed(bonds: Vec<NeighborBond>, status: QueryStatus, num_ref: usize, num_target: usize) -> QueryResults<'a, Q> {
        QueryResults {
            cursor: Cursor::Precomputed(bonds.into_iter()),
            args: QueryArgs::nearest(1),
            buffer: Vec::new(),
            buffer_position: 0,
            status: status,
            num_ref: num_ref,
            num_target: num_target,
        }
    }

    /// Get the status of the query for the points processed so far. This is
    /// only the final status once the sequence has been fully consumed.
    pub fn status(&self) -> QueryStatus {
        self.status
    }

    /// Compute all the remaining neighbors and store them in a `BondList`,
    /// with all weights set to 1. The per-point work runs in parallel.
    #[time_graph::instrument(name = "QueryResults::to_bond_list")]
    pub fn to_bond_list(self) -> (BondList, QueryStatus) {
        let num_ref = self.num_ref;
        let num_target = self.num_target;
        let (bonds, status) = self.collect_remaining();
        return (bond_list_from(num_ref, num_target, &bonds), status);
    }

    /// Compute all the remaining neighbors, and return them with their
    /// distances together with the final status of the query.
    pub fn collect_remaining(self) -> (Vec<NeighborBond>, QueryStatus) {
        let mut status = self.status;
        let mut bonds = self.buffer[self.buffer_position..].to_vec();

        match self.cursor {
            Cursor::Precomputed(remaining) => bonds.extend(remaining),
            Cursor::Lazy { query, query_points, next_point } => {
                let args = self.args;
                let per_point = crate::parallel::install(|| {
                    query_points[next_point..].par_iter()
                        .enumerate()
                        .map(|(i, &position)| {
                            let mut output = Vec::new();
                            let status = query.query_point(next_point + i, position, &args, &mut output);
                            (output, status)
                        })
                        .collect::<Vec<_>>()
                });

                let total = per_point.iter().map(|(output, _)| output.len()).sum::<usize>();
                bonds.reserve(total);
                for (output, point_status) in per_point {
                    bonds.extend(output);
                    status.merge(point_status);
                }
            }
        }

        if let Some(warning) = status.warning() {
            warn!("incomplete neighbor search: {}", warning);
        }

        return (bonds, status);
    }
}

impl<'a, Q: NeighborQuery> Iterator for QueryResults<'a, Q> {
    type Item = NeighborBond;

    fn next(&mut self) -> Option<NeighborBond> {
        loop {
            if self.buffer_position < self.buffer.len() {
                let bond = self.buffer[self.buffer_position];
                self.buffer_position += 1;
                return Some(bond);
            }

            match self.cursor {
                Cursor::Precomputed(ref mut remaining) => return remaining.next(),
                Cursor::Lazy { query, query_points, ref mut next_point } => {
                    if *next_point >= query_points.len() {
                        return None;
                    }

                    self.buffer.clear();
                    self.buffer_position = 0;
                    let status = query.query_point(
                        *next_point, query_points[*next_point], &self.args, &mut self.buffer
                    );
                    self.status.merge(status);
                    *next_point += 1;

                    if *next_point == query_points.len() {
                        if let Some(warning) = self.status.warning() {
                            warn!("incomplete neighbor search: {}", warning);
                        }
                    }
                }
            }
        }
    }
}

/// Store `bonds`, which must be sorted by reference index, in a `BondList`
/// with all weights set to 1
pub(crate) fn bond_list_from(num_ref: usize, num_target: usize, bonds: &[NeighborBond]) -> BondList {
    let mut ref_indices = Vec::with_capacity(bonds.len());
    let mut target_indices = Vec::with_capacity(bonds.len());
    for bond in bonds {
        ref_indices.push(bond.ref_index);
        target_indices.push(bond.target_index);
    }
    let weights = vec![1.0; bonds.len()];

    return BondList::from_sorted_parts(num_ref, num_target, ref_indices, target_indices, weights);
}

/// Entry in a [`NearestCollector`], ordered by distance then index
#[derive(Debug, Clone, Copy)]
struct Candidate(NeighborBond);

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp_by_distance(&other.0)
    }
}

/// Bounded max-heap keeping the `k` closest candidates seen so far
pub(crate) struct NearestCollector {
    k: usize,
    heap: BinaryHeap<Candidate>,
}

impl NearestCollector {
    pub(crate) fn new(k: usize) -> NearestCollector {
        NearestCollector {
            k: k,
            heap: BinaryHeap::with_capacity(k + 1),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    pub(crate) fn clear(&mut self) {
        self.heap.clear();
    }

    pub(crate) fn push(&mut self, bond: NeighborBond) {
        if self.heap.len() < self.k {
            self.heap.push(Candidate(bond));
        } else if let Some(mut farthest) = self.heap.peek_mut() {
            if Candidate(bond) < *farthest {
                *farthest = Candidate(bond);
            }
        }
    }

    /// Add the collected candidates to `output`, sorted by distance
    pub(crate) fn drain_sorted(&mut self, output: &mut Vec<NeighborBond>) {
        let heap = std::mem::take(&mut self.heap);
        output.extend(heap.into_sorted_vec().into_iter().map(|candidate| candidate.0));
    }
}

/// Find the `k` nearest neighbors of a single point, by running ball
/// searches with a growing radius. `ball` must add all neighbors closer than
/// the given radius to the collector.
///
/// The search stops when `k` neighbors are found, or when the radius is
/// larger than any minimum image distance in the box. In the latter case the
/// search returns the neighbors it found with a `TruncatedResult` warning.
pub(crate) fn nearest_by_growing_ball(
    periodic_box: &PeriodicBox,
    k: usize,
    r_guess: f64,
    scale: f64,
    mut ball: impl FnMut(f64, &mut NearestCollector),
    output: &mut Vec<NeighborBond>,
) -> QueryStatus {
    // make sure the last search includes points exactly at the largest
    // possible distance
    let r_limit = periodic_box.max_image_distance() * (1.0 + 1e-6);

    let mut collector = NearestCollector::new(k);
    let mut r = f64::min(r_guess, r_limit);
    loop {
        collector.clear();
        ball(r, &mut collector);

        if collector.len() >= k || r >= r_limit {
            break;
        }

        r = f64::min(r * scale, r_limit);
    }

    let found = collector.len();
    collector.drain_sorted(output);

    if found < k {
        return QueryStatus::incomplete(QueryWarning::TruncatedResult { missing: k - found });
    }
    return QueryStatus::complete();
}

/// Default initial radius for nearest neighbors searches: 10% of the
/// smallest box dimension
pub(crate) fn default_r_guess(periodic_box: &PeriodicBox) -> f64 {
    let distances = periodic_box.nearest_plane_distance();
    let smallest = if periodic_box.is_2d() {
        f64::min(distances[0], distances[1])
    } else {
        distances.min_component()
    };
    return 0.1 * smallest;
}
