use log::{debug, warn};
use ndarray::{Array2, Axis};
use rayon::prelude::*;

use crate::{Error, PeriodicBox, Vector3D};
use super::query::{NearestCollector, NeighborBond, QueryStatus, QueryWarning, bond_list_from};
use super::{BondList, CellList};

/// Marker used in [`AdaptiveKnn::neighbors`] for entries without a neighbor
pub const NO_NEIGHBOR: usize = usize::MAX;

fn default_scale() -> f64 { 1.1 }

/// Parameters for [`AdaptiveKnn`]
#[derive(Debug, Clone, Copy, PartialEq)]
#[derive(serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct KnnParameters {
    /// Initial search radius
    pub r_max: f64,
    /// Number of neighbors to find for each point
    pub num_neighbors: usize,
    /// Growth factor of the search radius, used when some points have less
    /// than `num_neighbors` neighbors inside the current radius
    #[serde(default = "default_scale")]
    pub scale: f64,
    /// Never grow the search radius, padding the results of points with not
    /// enough neighbors instead
    #[serde(default)]
    pub strict_cut: bool,
}

impl KnnParameters {
    /// Check that these parameters make sense
    pub fn validate(&self) -> Result<(), Error> {
        if !(self.r_max > 0.0 && self.r_max.is_finite()) {
            return Err(Error::InvalidParameter(format!(
                "r_max must be positive and finite, got {}", self.r_max
            )));
        }

        if self.num_neighbors == 0 {
            return Err(Error::InvalidParameter(
                "num_neighbors must be at least 1".into()
            ));
        }

        if !(self.scale > 1.0 && self.scale.is_finite()) {
            return Err(Error::InvalidParameter(format!(
                "scale must be larger than 1, got {}", self.scale
            )));
        }

        Ok(())
    }
}

/// Fixed-size nearest neighbors search, using a [`CellList`] and growing the
/// search radius until all points have enough neighbors.
///
/// The results are stored in dense tables with exactly `num_neighbors`
/// entries for each reference point, sorted by distance. Entries for which
/// no neighbor could be found contain [`NO_NEIGHBOR`] and an infinite
/// distance.
#[derive(Debug, Clone)]
pub struct AdaptiveKnn {
    parameters: KnnParameters,
    neighbors: Array2<usize>,
    distances: Array2<f64>,
    /// search radius used for the last computation
    r_max: f64,
    status: QueryStatus,
    /// number of points in the last computation
    num_points: usize,
}

impl AdaptiveKnn {
    /// Create a new `AdaptiveKnn` with the given parameters
    pub fn new(parameters: KnnParameters) -> Result<AdaptiveKnn, Error> {
        parameters.validate()?;

        Ok(AdaptiveKnn {
            parameters: parameters,
            neighbors: Array2::from_elem((0, parameters.num_neighbors), NO_NEIGHBOR),
            distances: Array2::from_elem((0, parameters.num_neighbors), f64::INFINITY),
            r_max: parameters.r_max,
            status: QueryStatus::complete(),
            num_points: 0,
        })
    }

    /// Create a new `AdaptiveKnn` with parameters given as JSON
    pub fn from_json(parameters: &str) -> Result<AdaptiveKnn, Error> {
        let parameters = serde_json::from_str::<KnnParameters>(parameters)?;
        return AdaptiveKnn::new(parameters);
    }

    /// Get the parameters of this `AdaptiveKnn`
    pub fn parameters(&self) -> &KnnParameters {
        &self.parameters
    }

    /// Find the `num_neighbors` nearest neighbors in `points` of all the
    /// `ref_points`.
    ///
    /// If some reference points have less than `num_neighbors` neighbors
    /// inside the current radius, the radius is multiplied by `scale` and the
    /// whole search starts again, until either all points have enough
    /// neighbors or the cell list has a single cell. In the latter case, and
    /// when using `strict_cut`, the missing neighbors are padded and the
    /// returned status contains an `InsufficientNeighbors` warning.
    ///
    /// `exclude_ii` should be set when `ref_points` and `points` are the same
    /// set of points, to remove each point from its own neighbors.
    #[time_graph::instrument(name = "AdaptiveKnn::compute")]
    pub fn compute(
        &mut self,
        periodic_box: &PeriodicBox,
        ref_points: &[Vector3D],
        points: &[Vector3D],
        exclude_ii: bool,
    ) -> Result<QueryStatus, Error> {
        if let Some(i) = ref_points.iter().position(|point| !point.is_finite()) {
            return Err(Error::InvalidParameter(format!(
                "reference point {} has non-finite coordinates", i
            )));
        }

        let k = self.parameters.num_neighbors;
        let mut neighbors = Array2::from_elem((ref_points.len(), k), NO_NEIGHBOR);
        let mut distances = Array2::from_elem((ref_points.len(), k), f64::INFINITY);

        let mut r_max = self.parameters.r_max;
        let mut iteration = 0;
        loop {
            if !r_max.is_finite() {
                return Err(Error::RadiusExpansionExhausted {
                    r_max: r_max,
                    iterations: iteration,
                });
            }

            let cell_list = CellList::new(periodic_box, points, r_max)?;
            // with a single cell, all points are neighbors of all the others
            let everything = !self.parameters.strict_cut && cell_list.is_degenerate();

            let missing = crate::parallel::install(|| {
                neighbors.axis_iter_mut(Axis(0)).into_par_iter()
                    .zip(distances.axis_iter_mut(Axis(0)).into_par_iter())
                    .enumerate()
                    .map_init(|| (NearestCollector::new(k), Vec::<NeighborBond>::with_capacity(k)), |(collector, found), (i, (mut neighbors, mut distances))| {
                        let position = periodic_box.wrap_position(ref_points[i]);
                        let excluded = if exclude_ii { Some(i) } else { None };

                        collector.clear();
                        cell_list.for_each_neighbor(position, r_max, everything, excluded, |target, distance| {
                            collector.push(NeighborBond {
                                ref_index: i,
                                target_index: target,
                                distance: distance,
                            });
                        });

                        found.clear();
                        collector.drain_sorted(found);
                        for (j, slot) in neighbors.iter_mut().enumerate() {
                            *slot = found.get(j).map_or(NO_NEIGHBOR, |bond| bond.target_index);
                        }
                        for (j, slot) in distances.iter_mut().enumerate() {
                            *slot = found.get(j).map_or(f64::INFINITY, |bond| bond.distance);
                        }

                        k - found.len()
                    })
                    .sum::<usize>()
            });

            if missing == 0 || self.parameters.strict_cut || everything {
                self.neighbors = neighbors;
                self.distances = distances;
                self.r_max = r_max;
                self.num_points = points.len();

                self.status = if missing == 0 {
                    QueryStatus::complete()
                } else {
                    let warning = QueryWarning::InsufficientNeighbors { missing };
                    warn!("{} (search radius {})", warning, r_max);
                    QueryStatus::incomplete(warning)
                };

                return Ok(self.status);
            }

            debug!(
                "{} neighbors are missing with a radius of {} (iteration {}), growing the radius",
                missing, r_max, iteration
            );
            r_max *= self.parameters.scale;
            iteration += 1;
        }
    }

    /// Get the indices of the neighbors of each reference point, as an array
    /// of shape `(ref_points, num_neighbors)`.
    pub fn neighbors(&self) -> &Array2<usize> {
        &self.neighbors
    }

    /// Get the distances to the neighbors of each reference point, as an
    /// array of shape `(ref_points, num_neighbors)`.
    pub fn distances(&self) -> &Array2<f64> {
        &self.distances
    }

    /// Get the search radius used by the last call to `compute`, after
    /// growth
    pub fn r_max(&self) -> f64 {
        self.r_max
    }

    /// Get the status of the last call to `compute`
    pub fn status(&self) -> QueryStatus {
        self.status
    }

    /// Get the minimum image vectors from each reference point to its
    /// neighbors. Padded entries contain a zero vector.
    pub fn wrapped_vectors(&self, periodic_box: &PeriodicBox, ref_points: &[Vector3D], points: &[Vector3D]) -> Result<Array2<Vector3D>, Error> {
        if ref_points.len() != self.neighbors.nrows() || points.len() != self.num_points {
            return Err(Error::SizeMismatch(format!(
                "expected {} reference points and {} points, got {} and {}",
                self.neighbors.nrows(), self.num_points, ref_points.len(), points.len()
            )));
        }

        let mut vectors = Array2::from_elem(self.neighbors.raw_dim(), Vector3D::zero());
        for ((i, j), &neighbor) in self.neighbors.indexed_iter() {
            if neighbor != NO_NEIGHBOR {
                vectors[[i, j]] = periodic_box.wrap(points[neighbor] - ref_points[i]);
            }
        }

        return Ok(vectors);
    }

    /// Get all the neighbors found by the last call to `compute`, skipping
    /// padded entries
    pub fn neighbor_bonds(&self) -> Vec<NeighborBond> {
        self.neighbors.indexed_iter()
            .filter(|(_, &neighbor)| neighbor != NO_NEIGHBOR)
            .map(|((i, j), &neighbor)| NeighborBond {
                ref_index: i,
                target_index: neighbor,
                distance: self.distances[[i, j]],
            })
            .collect()
    }

    /// Store the neighbors found by the last call to `compute` in a
    /// `BondList`, skipping padded entries
    pub fn to_bond_list(&self) -> BondList {
        return bond_list_from(self.neighbors.nrows(), self.num_points, &self.neighbor_bonds());
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use crate::neighbors::{NeighborQuery, QueryArgs};
    use super::*;

    fn parameters(r_max: f64, num_neighbors: usize) -> KnnParameters {
        KnnParameters {
            r_max: r_max,
            num_neighbors: num_neighbors,
            scale: 1.1,
            strict_cut: false,
        }
    }

    #[test]
    fn parameters_validation() {
        assert!(AdaptiveKnn::new(parameters(1.0, 3)).is_ok());
        assert!(matches!(AdaptiveKnn::new(parameters(0.0, 3)), Err(Error::InvalidParameter(_))));
        assert!(matches!(AdaptiveKnn::new(parameters(1.0, 0)), Err(Error::InvalidParameter(_))));

        let mut invalid = parameters(1.0, 3);
        invalid.scale = 1.0;
        assert!(matches!(AdaptiveKnn::new(invalid), Err(Error::InvalidParameter(_))));

        let knn = AdaptiveKnn::from_json(r#"{"r_max": 2.0, "num_neighbors": 4}"#).unwrap();
        assert_eq!(knn.parameters(), &parameters(2.0, 4));

        let knn = AdaptiveKnn::from_json(r#"{"r_max": 2.0, "num_neighbors": 4, "strict_cut": true, "scale": 2}"#).unwrap();
        assert!(knn.parameters().strict_cut);
        assert_eq!(knn.parameters().scale, 2.0);

        assert!(matches!(AdaptiveKnn::from_json(r#"{"r_max": 2.0}"#), Err(Error::Json(_))));
    }

    #[test]
    fn growing_radius() {
        let periodic_box = PeriodicBox::cube(10.0).unwrap();
        let points = [
            Vector3D::new(0.0, 0.0, 0.0),
            Vector3D::new(1.0, 0.0, 0.0),
            Vector3D::new(0.0, 1.5, 0.0),
            Vector3D::new(0.0, 0.0, 2.0),
            Vector3D::new(3.0, 3.0, 3.0),
        ];

        let mut knn = AdaptiveKnn::new(parameters(0.5, 2)).unwrap();
        let status = knn.compute(&periodic_box, &points, &points, true).unwrap();
        assert!(status.is_complete());
        assert!(knn.r_max() > 0.5);

        assert_eq!(knn.neighbors().shape(), [5, 2]);
        assert_eq!(knn.neighbors().row(0).to_vec(), [1, 2]);
        assert_eq!(knn.neighbors().row(1).to_vec(), [0, 2]);
        assert_relative_eq!(knn.distances()[[0, 1]], 1.5, max_relative = 1e-12);

        let list = knn.to_bond_list();
        assert_eq!(list.len(), 10);
        assert_eq!(list.neighbor_counts(), [2; 5]);

        let vectors = knn.wrapped_vectors(&periodic_box, &points, &points).unwrap();
        assert_relative_eq!(vectors[[0, 0]], Vector3D::new(1.0, 0.0, 0.0), epsilon = 1e-12);
        assert_relative_eq!(vectors[[1, 0]], Vector3D::new(-1.0, 0.0, 0.0), epsilon = 1e-12);

        assert!(matches!(
            knn.wrapped_vectors(&periodic_box, &points[..2], &points),
            Err(Error::SizeMismatch(_))
        ));
    }

    #[test]
    fn insufficient_neighbors() {
        let periodic_box = PeriodicBox::cube(10.0).unwrap();
        let points = [
            Vector3D::new(0.0, 0.0, 0.0),
            Vector3D::new(0.5, 0.0, 0.0),
            Vector3D::new(0.0, 0.5, 0.0),
        ];

        let mut knn = AdaptiveKnn::new(parameters(0.1, 4)).unwrap();
        let status = knn.compute(&periodic_box, &points, &points, false).unwrap();
        assert_eq!(status.warning(), Some(QueryWarning::InsufficientNeighbors { missing: 3 }));
        assert_eq!(knn.status(), status);

        // the radius grew until there is a single cell
        assert!(knn.r_max() > 5.0);
        for i in 0..3 {
            assert_eq!(knn.neighbors()[[i, 0]], i);
            assert_eq!(knn.neighbors()[[i, 3]], NO_NEIGHBOR);
            assert_eq!(knn.distances()[[i, 3]], f64::INFINITY);
        }

        let list = knn.to_bond_list();
        assert_eq!(list.len(), 9);
    }

    #[test]
    fn strict_cut() {
        let periodic_box = PeriodicBox::cube(10.0).unwrap();
        let points = [
            Vector3D::new(0.0, 0.0, 0.0),
            Vector3D::new(1.0, 0.0, 0.0),
            Vector3D::new(4.0, 0.0, 0.0),
        ];

        let mut parameters = parameters(2.0, 2);
        parameters.strict_cut = true;
        let mut knn = AdaptiveKnn::new(parameters).unwrap();
        let status = knn.compute(&periodic_box, &points, &points, true).unwrap();

        assert_eq!(status.warning(), Some(QueryWarning::InsufficientNeighbors { missing: 4 }));
        assert_eq!(knn.r_max(), 2.0);
        assert_eq!(knn.neighbors().row(0).to_vec(), [1, NO_NEIGHBOR]);
        assert_eq!(knn.neighbors().row(1).to_vec(), [0, NO_NEIGHBOR]);
        assert_eq!(knn.neighbors().row(2).to_vec(), [NO_NEIGHBOR, NO_NEIGHBOR]);

        let vectors = knn.wrapped_vectors(&periodic_box, &points, &points).unwrap();
        assert_eq!(vectors[[2, 0]], Vector3D::zero());
    }

    #[test]
    fn slow_radius_growth() {
        let periodic_box = PeriodicBox::cube(10.0).unwrap();
        let points = [Vector3D::new(0.0, 0.0, 0.0), Vector3D::new(3.0, 0.0, 0.0)];

        // more than a thousand growth steps are needed to reach r = 3
        let mut parameters = parameters(0.5, 1);
        parameters.scale = 1.001;
        let mut knn = AdaptiveKnn::new(parameters).unwrap();
        let status = knn.compute(&periodic_box, &points, &points, true).unwrap();

        assert!(status.is_complete());
        assert!(knn.r_max() > 3.0);
        assert_eq!(knn.neighbors().row(0).to_vec(), [1]);
        assert_eq!(knn.neighbors().row(1).to_vec(), [0]);
        assert_relative_eq!(knn.distances()[[0, 0]], 3.0, max_relative = 1e-12);

        // the cell list nearest neighbors search uses the same radius growth
        let cells = CellList::new(&periodic_box, &points, 0.5).unwrap();
        let args = QueryArgs::nearest(1).exclude_ii(true).with_r_guess(0.5).with_scale(1.001);
        let bonds = cells.query(&points, args).unwrap().collect::<Vec<_>>();
        assert_eq!(bonds.len(), 2);
        assert_eq!((bonds[0].ref_index, bonds[0].target_index), (0, 1));
        assert_eq!((bonds[1].ref_index, bonds[1].target_index), (1, 0));
    }
}
