use approx::assert_relative_eq;

use locality::{BondList, Error, NeighborQuery, PeriodicBox, Vector3D};
use locality::neighbors::{AabbQuery, AdaptiveKnn, CellList, KnnParameters, QueryWarning, NO_NEIGHBOR};

#[test]
fn find_first_index() {
    let list = BondList::from_arrays(
        6, 4,
        &[0, 0, 2, 2, 2, 5],
        &[1, 2, 0, 1, 3, 0],
        None,
    ).unwrap();

    assert_eq!(list.find_first_index(0), 0);
    // reference points without bonds give the position of the next one
    assert_eq!(list.find_first_index(1), 2);
    assert_eq!(list.find_first_index(2), 2);
    assert_eq!(list.find_first_index(3), 5);
    assert_eq!(list.find_first_index(4), 5);
    assert_eq!(list.find_first_index(5), 5);
    assert_eq!(list.find_first_index(6), 6);

    for r in 0..6 {
        let range = list.bonds_for(r);
        assert_eq!(range.len(), list.neighbor_counts()[r]);
        assert!(list.ref_indices()[range].iter().all(|&i| i == r));
    }
}

#[test]
fn unsorted_indices() {
    let result = BondList::from_arrays(3, 3, &[0, 2, 1], &[1, 0, 2], None);
    assert!(matches!(result, Err(Error::UnsortedIndex { .. })));

    let result = BondList::from_arrays(3, 3, &[0, 1, 3], &[1, 0, 2], None);
    assert!(matches!(result, Err(Error::IndexOutOfRange { .. })));
}

#[test]
fn filter_by_distance_is_idempotent() {
    let periodic_box = PeriodicBox::cube(10.0).unwrap();
    let points = (0..20)
        .map(|i| Vector3D::new(0.45 * i as f64 - 4.5, 0.1 * i as f64, 0.0))
        .collect::<Vec<_>>();

    let query = AabbQuery::new(&periodic_box, &points).unwrap();
    let (mut list, _) = query.query_ball(&points, 3.0, true).unwrap().to_bond_list();
    let before = list.len();

    list.filter_by_distance(&periodic_box, &points, &points, 2.0, 0.5).unwrap();
    let filtered = list.clone();
    assert!(list.len() < before);

    for bond in list.iter() {
        let distance = periodic_box.distance(points[bond.ref_index], points[bond.target_index]);
        assert!((0.5..2.0).contains(&distance));
    }

    list.filter_by_distance(&periodic_box, &points, &points, f64::INFINITY, 0.0).unwrap();
    assert_eq!(list, filtered);

    // mismatched points leave the list untouched
    let result = list.filter_by_distance(&periodic_box, &points[..3], &points, 2.0, 0.0);
    assert!(matches!(result, Err(Error::SizeMismatch(_))));
    assert_eq!(list, filtered);
}

#[test]
fn single_point_nearest() {
    let periodic_box = PeriodicBox::cube(5.0).unwrap();
    let points = [Vector3D::new(1.0, 2.0, 0.5)];

    let aabb = AabbQuery::new(&periodic_box, &points).unwrap();
    assert_eq!(aabb.query_knn(&points, 1, true).unwrap().count(), 0);

    let cells = CellList::new(&periodic_box, &points, 1.0).unwrap();
    let mut results = cells.query_knn(&points, 1, true).unwrap();
    assert!(results.next().is_none());
    assert_eq!(results.status().warning(), Some(QueryWarning::InsufficientNeighbors { missing: 1 }));
}

#[test]
fn minimum_image_ball() {
    let periodic_box = PeriodicBox::orthorhombic(10.0, 10.0, 10.0).unwrap();
    let points = [Vector3D::new(0.0, 0.0, 0.0), Vector3D::new(9.0, 9.0, 9.0)];

    let aabb = AabbQuery::new(&periodic_box, &points).unwrap();
    let cells = CellList::new(&periodic_box, &points, 2.0).unwrap();

    for bonds in [
        aabb.query_ball(&points, 2.0, false).unwrap().collect::<Vec<_>>(),
        cells.query_ball(&points, 2.0, false).unwrap().collect::<Vec<_>>(),
    ] {
        let bond = bonds.iter().find(|b| b.ref_index == 0 && b.target_index == 1).unwrap();
        assert_relative_eq!(bond.distance, f64::sqrt(3.0), max_relative = 1e-12);
    }
}

#[test]
fn adaptive_knn_small_cluster() {
    let periodic_box = PeriodicBox::cube(10.0).unwrap();
    let points = [
        Vector3D::new(0.0, 0.0, 0.0),
        Vector3D::new(0.3, 0.0, 0.0),
        Vector3D::new(0.0, 0.3, 0.2),
    ];

    let mut knn = AdaptiveKnn::new(KnnParameters {
        r_max: 0.5,
        num_neighbors: 4,
        scale: 1.5,
        strict_cut: false,
    }).unwrap();

    let status = knn.compute(&periodic_box, &points, &points, false).unwrap();
    assert!(matches!(status.warning(), Some(QueryWarning::InsufficientNeighbors { .. })));

    for i in 0..3 {
        let row = knn.neighbors().row(i);
        assert_eq!(row.iter().filter(|&&j| j == NO_NEIGHBOR).count(), 1);
        assert_eq!(row[3], NO_NEIGHBOR);
    }

    let list = knn.to_bond_list();
    assert_eq!(list.len(), 9);
    list.validate(3, 3).unwrap();
}
