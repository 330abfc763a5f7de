use log::warn;

use crate::{Error, PeriodicBox, Vector3D};
use super::query::{NeighborQuery, NeighborBond, QueryArgs, QueryResults, QueryStatus, bond_list_from};
use super::{AabbQuery, BondList, CellList};

/// Spatial index used to search for neighbors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Bounding volume hierarchy, see [`AabbQuery`]
    Aabb,
    /// Regular grid of cells, see [`CellList`]
    CellList,
}

/// Options for the creation of a [`NeighborEngine`]
#[derive(Debug, Clone, Copy, PartialEq)]
#[derive(serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct EngineOptions {
    /// Which spatial index to use
    pub backend: Backend,
    /// Minimal width of the cells, required for queryable cell lists
    #[serde(default)]
    pub cell_width: Option<f64>,
    /// Create a compute-only engine, which searches neighbors between two
    /// sets of points given at each call instead of indexing a fixed set of
    /// points
    #[serde(default)]
    pub compute_only: bool,
    /// Cutoff radius, required for compute-only engines
    #[serde(default)]
    pub r_max: Option<f64>,
}

/// Spatial index over a fixed set of points, using any of the available
/// backends.
///
/// The backend is selected once per call, so batch operations such as
/// [`QueryEngine::to_bond_list`] do not pay for the dispatch on every point.
#[derive(Debug, Clone)]
pub enum QueryEngine {
    /// Bounding volume hierarchy backend
    Aabb(AabbQuery),
    /// Cell list backend
    CellList(CellList),
}

impl QueryEngine {
    /// Index `points` with a bounding volume hierarchy
    pub fn aabb(periodic_box: &PeriodicBox, points: &[Vector3D]) -> Result<QueryEngine, Error> {
        AabbQuery::new(periodic_box, points).map(QueryEngine::Aabb)
    }

    /// Index `points` with a cell list, using cells at least `cell_width`
    /// wide
    pub fn cell_list(periodic_box: &PeriodicBox, points: &[Vector3D], cell_width: f64) -> Result<QueryEngine, Error> {
        CellList::new(periodic_box, points, cell_width).map(QueryEngine::CellList)
    }

    /// Get the backend used by this engine
    pub fn backend(&self) -> Backend {
        match self {
            QueryEngine::Aabb(_) => Backend::Aabb,
            QueryEngine::CellList(_) => Backend::CellList,
        }
    }

    /// Run a query for all `query_points`, and store the results in a
    /// `BondList`
    pub fn to_bond_list(&self, query_points: &[Vector3D], args: QueryArgs) -> Result<(BondList, QueryStatus), Error> {
        match self {
            QueryEngine::Aabb(query) => Ok(query.query(query_points, args)?.to_bond_list()),
            QueryEngine::CellList(query) => Ok(query.query(query_points, args)?.to_bond_list()),
        }
    }
}

impl NeighborQuery for QueryEngine {
    fn periodic_box(&self) -> &PeriodicBox {
        match self {
            QueryEngine::Aabb(query) => query.periodic_box(),
            QueryEngine::CellList(query) => query.periodic_box(),
        }
    }

    fn points(&self) -> &[Vector3D] {
        match self {
            QueryEngine::Aabb(query) => query.points(),
            QueryEngine::CellList(query) => query.points(),
        }
    }

    fn check_args(&self, args: &QueryArgs) -> Result<(), Error> {
        match self {
            QueryEngine::Aabb(query) => query.check_args(args),
            QueryEngine::CellList(query) => query.check_args(args),
        }
    }

    fn query_point(&self, ref_index: usize, position: Vector3D, args: &QueryArgs, output: &mut Vec<NeighborBond>) -> QueryStatus {
        match self {
            QueryEngine::Aabb(query) => query.query_point(ref_index, position, args, output),
            QueryEngine::CellList(query) => query.query_point(ref_index, position, args, output),
        }
    }

    fn query_nearest_batch(&self, query_points: &[Vector3D], args: &QueryArgs) -> Option<Result<(Vec<NeighborBond>, QueryStatus), Error>> {
        match self {
            QueryEngine::Aabb(query) => query.query_nearest_batch(query_points, args),
            QueryEngine::CellList(query) => query.query_nearest_batch(query_points, args),
        }
    }
}

/// Pairs closer than this are reported as coincident points
const COINCIDENT_DISTANCE: f64 = 1e-3;

/// Compute-only neighbor search: each call to [`PairCompute::compute`]
/// builds a new spatial index over the given points, and searches all the
/// neighbors of the reference points inside a fixed cutoff.
#[derive(Debug, Clone)]
pub struct PairCompute {
    backend: Backend,
    r_max: f64,
    nlist: Option<BondList>,
    status: QueryStatus,
}

impl PairCompute {
    /// Create a new `PairCompute` using the given `backend` and cutoff
    pub fn new(backend: Backend, r_max: f64) -> Result<PairCompute, Error> {
        QueryArgs::ball(r_max).validate()?;

        Ok(PairCompute {
            backend: backend,
            r_max: r_max,
            nlist: None,
            status: QueryStatus::complete(),
        })
    }

    /// Get the backend used by this `PairCompute`
    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Get the cutoff used by this `PairCompute`
    pub fn r_max(&self) -> f64 {
        self.r_max
    }

    /// Find all pairs between `ref_points` and `points` closer than the
    /// cutoff, and store them in the neighbor list of this `PairCompute`.
    pub fn compute(
        &mut self,
        periodic_box: &PeriodicBox,
        ref_points: &[Vector3D],
        points: &[Vector3D],
        exclude_ii: bool,
    ) -> Result<&BondList, Error> {
        let engine = match self.backend {
            Backend::Aabb => QueryEngine::aabb(periodic_box, points)?,
            Backend::CellList => QueryEngine::cell_list(periodic_box, points, self.r_max)?,
        };

        let args = QueryArgs::ball(self.r_max).exclude_ii(exclude_ii);
        let (bonds, status) = engine.query(ref_points, args)?.collect_remaining();

        if exclude_ii {
            for bond in &bonds {
                if bond.distance < COINCIDENT_DISTANCE {
                    warn!(
                        "points {} and {} are very close to one another ({})",
                        bond.ref_index, bond.target_index, bond.distance
                    );
                }
            }
        }

        self.status = status;
        let nlist = self.nlist.insert(bond_list_from(ref_points.len(), points.len(), &bonds));
        return Ok(&*nlist);
    }

    /// Get the neighbor list created by the last call to `compute`, if any
    pub fn nlist(&self) -> Option<&BondList> {
        self.nlist.as_ref()
    }

    /// Get the status of the last call to `compute`
    pub fn status(&self) -> QueryStatus {
        self.status
    }
}

/// Neighbor search engine configured with JSON options.
///
/// An engine is either queryable, indexing a fixed set of points given at
/// construction, or compute-only, searching for neighbors between the
/// points given to each call of [`NeighborEngine::compute`]. Using an
/// engine in the other mode fails with [`Error::NotQueryable`].
#[derive(Debug, Clone)]
pub enum NeighborEngine {
    /// Engine indexing a fixed set of points
    Query(QueryEngine),
    /// Compute-only engine
    Compute(PairCompute),
}

impl NeighborEngine {
    /// Create a new engine from JSON options (see [`EngineOptions`]).
    /// `periodic_box` and `points` are indexed by queryable engines, and not
    /// used by compute-only engines.
    pub fn new(options: &str, periodic_box: &PeriodicBox, points: &[Vector3D]) -> Result<NeighborEngine, Error> {
        let options = serde_json::from_str::<EngineOptions>(options)?;
        return NeighborEngine::with_options(options, periodic_box, points);
    }

    /// Create a new engine from already parsed `options`
    pub fn with_options(options: EngineOptions, periodic_box: &PeriodicBox, points: &[Vector3D]) -> Result<NeighborEngine, Error> {
        if options.compute_only {
            let r_max = options.r_max.ok_or_else(|| Error::InvalidParameter(
                "r_max is required for compute-only engines".into()
            ))?;
            return PairCompute::new(options.backend, r_max).map(NeighborEngine::Compute);
        }

        let engine = match options.backend {
            Backend::Aabb => QueryEngine::aabb(periodic_box, points)?,
            Backend::CellList => {
                let cell_width = options.cell_width.ok_or_else(|| Error::InvalidParameter(
                    "cell_width is required for cell list engines".into()
                ))?;
                QueryEngine::cell_list(periodic_box, points, cell_width)?
            }
        };

        return Ok(NeighborEngine::Query(engine));
    }

    /// Is this engine compute-only?
    pub fn is_compute_only(&self) -> bool {
        matches!(self, NeighborEngine::Compute(_))
    }

    fn query_engine(&self) -> Result<&QueryEngine, Error> {
        match self {
            NeighborEngine::Query(engine) => Ok(engine),
            NeighborEngine::Compute(_) => Err(Error::NotQueryable(
                "this engine was created in compute-only mode and can not run queries".into()
            )),
        }
    }

    /// Start a query for all `query_points`, according to `args`
    pub fn query<'a>(&'a self, query_points: &'a [Vector3D], args: QueryArgs) -> Result<QueryResults<'a, QueryEngine>, Error> {
        self.query_engine()?.query(query_points, args)
    }

    /// Find all neighbors of `query_points` closer than `r_max`
    pub fn query_ball<'a>(&'a self, query_points: &'a [Vector3D], r_max: f64, exclude_ii: bool) -> Result<QueryResults<'a, QueryEngine>, Error> {
        self.query_engine()?.query_ball(query_points, r_max, exclude_ii)
    }

    /// Find the `num_neighbors` nearest neighbors of `query_points`
    pub fn query_knn<'a>(&'a self, query_points: &'a [Vector3D], num_neighbors: usize, exclude_ii: bool) -> Result<QueryResults<'a, QueryEngine>, Error> {
        self.query_engine()?.query_knn(query_points, num_neighbors, exclude_ii)
    }

    /// Find all pairs between `ref_points` and `points` closer than the
    /// cutoff of this compute-only engine
    pub fn compute(
        &mut self,
        periodic_box: &PeriodicBox,
        ref_points: &[Vector3D],
        points: &[Vector3D],
        exclude_ii: bool,
    ) -> Result<&BondList, Error> {
        match self {
            NeighborEngine::Compute(compute) => compute.compute(periodic_box, ref_points, points, exclude_ii),
            NeighborEngine::Query(_) => Err(Error::NotQueryable(
                "this engine indexes a fixed set of points, use queries instead of compute".into()
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn points() -> Vec<Vector3D> {
        vec![
            Vector3D::new(0.0, 0.0, 0.0),
            Vector3D::new(1.0, 0.0, 0.0),
            Vector3D::new(0.0, 1.5, 0.0),
            Vector3D::new(4.0, 4.0, 4.0),
        ]
    }

    #[test]
    fn options() {
        let options: EngineOptions = serde_json::from_str(r#"{"backend": "cell_list", "cell_width": 2.0}"#).unwrap();
        assert_eq!(options.backend, Backend::CellList);
        assert_eq!(options.cell_width, Some(2.0));
        assert!(!options.compute_only);

        assert!(serde_json::from_str::<EngineOptions>(r#"{"backend": "kd_tree"}"#).is_err());
        assert!(serde_json::from_str::<EngineOptions>(r#"{"backend": "aabb", "cutoff": 3}"#).is_err());

        let schema = schemars::schema_for!(EngineOptions);
        let schema = serde_json::to_string(&schema).unwrap();
        assert!(schema.contains("cell_width"));
        assert!(schema.contains("compute_only"));
    }

    #[test]
    fn dispatch() {
        let periodic_box = PeriodicBox::cube(10.0).unwrap();
        let points = points();

        let aabb = QueryEngine::aabb(&periodic_box, &points).unwrap();
        let cells = QueryEngine::cell_list(&periodic_box, &points, 2.0).unwrap();
        assert_eq!(aabb.backend(), Backend::Aabb);
        assert_eq!(cells.backend(), Backend::CellList);
        assert_eq!(cells.points().len(), 4);

        let args = QueryArgs::ball(2.0).exclude_ii(true);
        let (aabb_list, _) = aabb.to_bond_list(&points, args).unwrap();
        let (cells_list, _) = cells.to_bond_list(&points, args).unwrap();
        assert_eq!(aabb_list, cells_list);
        assert_eq!(aabb_list.neighbor_counts(), [2, 2, 2, 0]);

        // radius too large for this cell list
        assert!(matches!(cells.to_bond_list(&points, QueryArgs::ball(4.0)), Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn compute_only() {
        let periodic_box = PeriodicBox::cube(10.0).unwrap();
        let points = points();

        for backend in ["aabb", "cell_list"] {
            let options = format!(r#"{{"backend": "{}", "compute_only": true, "r_max": 1.2}}"#, backend);
            let mut engine = NeighborEngine::new(&options, &periodic_box, &[]).unwrap();
            assert!(engine.is_compute_only());

            let nlist = engine.compute(&periodic_box, &points, &points, true).unwrap();
            assert_eq!(nlist.ref_indices(), [0, 1]);
            assert_eq!(nlist.target_indices(), [1, 0]);
            assert_eq!(nlist.weights(), [1.0, 1.0]);

            // different reference points
            let ref_points = [Vector3D::new(0.0, 1.0, 0.0)];
            let nlist = engine.compute(&periodic_box, &ref_points, &points, false).unwrap();
            assert_eq!(nlist.num_ref(), 1);
            assert_eq!(nlist.target_indices(), [2, 0]);

            assert!(matches!(engine.query_ball(&points, 1.0, true), Err(Error::NotQueryable(_))));
            assert!(matches!(engine.query_knn(&points, 1, true), Err(Error::NotQueryable(_))));
        }

        let result = NeighborEngine::new(r#"{"backend": "aabb", "compute_only": true}"#, &periodic_box, &[]);
        assert!(matches!(result, Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn queryable() {
        let periodic_box = PeriodicBox::cube(10.0).unwrap();
        let points = points();

        let mut engine = NeighborEngine::new(r#"{"backend": "aabb"}"#, &periodic_box, &points).unwrap();
        assert!(!engine.is_compute_only());

        let bonds = engine.query_knn(&points, 1, true).unwrap().collect::<Vec<_>>();
        let targets = bonds.iter().map(|b| b.target_index).collect::<Vec<_>>();
        assert_eq!(targets, [1, 0, 0, 2]);

        let result = engine.compute(&periodic_box, &points, &points, true);
        assert!(matches!(result, Err(Error::NotQueryable(_))));

        let result = NeighborEngine::new(r#"{"backend": "cell_list"}"#, &periodic_box, &points);
        assert!(matches!(result, Err(Error::InvalidParameter(_))));

        let result = NeighborEngine::new(r#"{"backend": "cell_list""#, &periodic_box, &points);
        assert!(matches!(result, Err(Error::Json(_))));
    }
}
