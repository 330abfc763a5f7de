//! Neighbor searches with periodic boundary conditions.
//!
//! Spatial indexes ([`AabbQuery`], [`CellList`]) are built once over a set of
//! points, and implement the [`NeighborQuery`] trait to find the neighbors of
//! other points inside a radius or among the k nearest. The results can be
//! iterated over directly, or stored in a [`BondList`].

mod bond_list;
pub use self::bond_list::{Bond, BondList};

mod query;
pub use self::query::{NeighborQuery, NeighborBond, QueryResults};
pub use self::query::{QueryArgs, QueryMode, QueryStatus, QueryWarning};

mod aabb;
pub use self::aabb::{AabbTree, AabbQuery, BoundingBox};

mod cells;
pub use self::cells::{CellList, CellMembers};

mod knn;
pub use self::knn::{AdaptiveKnn, KnnParameters, NO_NEIGHBOR};

mod engine;
pub use self::engine::{Backend, EngineOptions, QueryEngine, PairCompute, NeighborEngine};
