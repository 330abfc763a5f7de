use std::ops::Range;

use crate::{Error, PeriodicBox, Vector3D};

/// A single bond in a [`BondList`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bond {
    /// index of the reference (center) point
    pub ref_index: usize,
    /// index of the target (neighbor) point
    pub target_index: usize,
    /// weight associated with this bond
    pub weight: f64,
}

/// A `BondList` stores directed bonds between a set of `num_ref` reference
/// points and a set of `num_target` target points, sorted by reference index.
///
/// This is the canonical format used to exchange neighbors between the
/// spatial queries and their consumers. The bonds for a given reference point
/// are stored contiguously, and can be found in `O(log N)` with
/// [`BondList::find_first_index`] or [`BondList::bonds_for`].
#[derive(Debug, Clone, PartialEq)]
pub struct BondList {
    num_ref: usize,
    num_target: usize,
    ref_indices: Vec<usize>,
    target_indices: Vec<usize>,
    weights: Vec<f64>,
    /// index of the first bond of each reference point
    segments: Vec<usize>,
    /// number of bonds for each reference point
    counts: Vec<usize>,
}

impl BondList {
    /// Create an empty bond list between `num_ref` reference points and
    /// `num_target` target points
    pub fn new(num_ref: usize, num_target: usize) -> BondList {
        BondList {
            num_ref: num_ref,
            num_target: num_target,
            ref_indices: Vec::new(),
            target_indices: Vec::new(),
            weights: Vec::new(),
            segments: vec![0; num_ref],
            counts: vec![0; num_ref],
        }
    }

    /// Create a bond list from externally computed bonds.
    ///
    /// `ref_indices` must be sorted, and all indices must be smaller than the
    /// corresponding number of points. If `weights` is `None`, all bonds get a
    /// weight of 1.
    pub fn from_arrays(
        num_ref: usize,
        num_target: usize,
        ref_indices: &[usize],
        target_indices: &[usize],
        weights: Option<&[f64]>,
    ) -> Result<BondList, Error> {
        if ref_indices.len() != target_indices.len() {
            return Err(Error::SizeMismatch(format!(
                "got {} reference indices but {} target indices",
                ref_indices.len(), target_indices.len()
            )));
        }

        if let Some(weights) = weights {
            if weights.len() != ref_indices.len() {
                return Err(Error::SizeMismatch(format!(
                    "got {} weights for {} bonds", weights.len(), ref_indices.len()
                )));
            }
        }

        for (position, window) in ref_indices.windows(2).enumerate() {
            if window[1] < window[0] {
                return Err(Error::UnsortedIndex { position: position + 1 });
            }
        }

        for (&ref_index, &target_index) in ref_indices.iter().zip(target_indices) {
            if ref_index >= num_ref {
                return Err(Error::IndexOutOfRange { kind: "reference", index: ref_index, bound: num_ref });
            }

            if target_index >= num_target {
                return Err(Error::IndexOutOfRange { kind: "target", index: target_index, bound: num_target });
            }
        }

        let weights = match weights {
            Some(weights) => weights.to_vec(),
            None => vec![1.0; ref_indices.len()],
        };

        return Ok(BondList::from_sorted_parts(
            num_ref,
            num_target,
            ref_indices.to_vec(),
            target_indices.to_vec(),
            weights,
        ));
    }

    /// Create a bond list from storage produced by one of the neighbor
    /// searches in this crate, which is already known to be valid.
    pub(crate) fn from_sorted_parts(
        num_ref: usize,
        num_target: usize,
        ref_indices: Vec<usize>,
        target_indices: Vec<usize>,
        weights: Vec<f64>,
    ) -> BondList {
        debug_assert_eq!(ref_indices.len(), target_indices.len());
        debug_assert_eq!(ref_indices.len(), weights.len());
        debug_assert!(ref_indices.windows(2).all(|w| w[0] <= w[1]));
        debug_assert!(ref_indices.iter().all(|&i| i < num_ref));
        debug_assert!(target_indices.iter().all(|&i| i < num_target));

        let mut list = BondList {
            num_ref: num_ref,
            num_target: num_target,
            ref_indices: ref_indices,
            target_indices: target_indices,
            weights: weights,
            segments: Vec::new(),
            counts: Vec::new(),
        };
        list.update_segments();
        return list;
    }

    /// Get the number of reference points
    pub fn num_ref(&self) -> usize {
        self.num_ref
    }

    /// Get the number of target points
    pub fn num_target(&self) -> usize {
        self.num_target
    }

    /// Get the number of bonds in this list
    pub fn len(&self) -> usize {
        self.ref_indices.len()
    }

    /// Check if this list contains no bonds
    pub fn is_empty(&self) -> bool {
        self.ref_indices.is_empty()
    }

    /// Get the reference index of all bonds, sorted in ascending order
    pub fn ref_indices(&self) -> &[usize] {
        &self.ref_indices
    }

    /// Get the target index of all bonds
    pub fn target_indices(&self) -> &[usize] {
        &self.target_indices
    }

    /// Get the weight of all bonds
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Get mutable access to the weight of all bonds
    pub fn weights_mut(&mut self) -> &mut [f64] {
        &mut self.weights
    }

    /// Get the index of the first bond of each reference point. Reference
    /// points without bonds point to the position of the next bond.
    pub fn segments(&self) -> &[usize] {
        &self.segments
    }

    /// Get the number of bonds of each reference point
    pub fn neighbor_counts(&self) -> &[usize] {
        &self.counts
    }

    /// Get the bond at the given `index`
    pub fn bond(&self, index: usize) -> Bond {
        Bond {
            ref_index: self.ref_indices[index],
            target_index: self.target_indices[index],
            weight: self.weights[index],
        }
    }

    /// Iterate over all bonds in this list
    pub fn iter(&self) -> impl ExactSizeIterator<Item = Bond> + '_ {
        (0..self.len()).map(|index| self.bond(index))
    }

    /// Find the index of the first bond with a reference index larger or
    /// equal to `ref_index`, or the number of bonds if there is none.
    pub fn find_first_index(&self, ref_index: usize) -> usize {
        self.ref_indices.partition_point(|&i| i < ref_index)
    }

    /// Get the range of bonds associated with the reference point `ref_index`
    pub fn bonds_for(&self, ref_index: usize) -> Range<usize> {
        let start = self.find_first_index(ref_index);
        let end = start + self.ref_indices[start..].partition_point(|&i| i == ref_index);
        return start..end;
    }

    /// Check that this list can be used with `num_ref` reference points and
    /// `num_target` target points.
    pub fn validate(&self, num_ref: usize, num_target: usize) -> Result<(), Error> {
        if num_ref != self.num_ref {
            return Err(Error::SizeMismatch(format!(
                "bond list was built for {} reference points, got {}", self.num_ref, num_ref
            )));
        }

        if num_target != self.num_target {
            return Err(Error::SizeMismatch(format!(
                "bond list was built for {} target points, got {}", self.num_target, num_target
            )));
        }

        Ok(())
    }

    /// Only keep the bonds for which `predicate` returns `true`, preserving
    /// the order of the remaining bonds.
    pub fn filter(&mut self, mut predicate: impl FnMut(&Bond) -> bool) -> &mut BondList {
        let mut kept = 0;
        for index in 0..self.len() {
            let bond = self.bond(index);
            if predicate(&bond) {
                self.ref_indices[kept] = bond.ref_index;
                self.target_indices[kept] = bond.target_index;
                self.weights[kept] = bond.weight;
                kept += 1;
            }
        }

        self.ref_indices.truncate(kept);
        self.target_indices.truncate(kept);
        self.weights.truncate(kept);
        self.update_segments();

        return self;
    }

    /// Only keep the bonds with a minimum image distance in `[r_min, r_max)`
    /// between the reference and target points.
    pub fn filter_by_distance(
        &mut self,
        periodic_box: &PeriodicBox,
        ref_points: &[Vector3D],
        target_points: &[Vector3D],
        r_max: f64,
        r_min: f64,
    ) -> Result<&mut BondList, Error> {
        if ref_points.len() != self.num_ref {
            return Err(Error::SizeMismatch(format!(
                "got {} reference points, but this bond list was built for {}",
                ref_points.len(), self.num_ref
            )));
        }

        if target_points.len() != self.num_target {
            return Err(Error::SizeMismatch(format!(
                "got {} target points, but this bond list was built for {}",
                target_points.len(), self.num_target
            )));
        }

        if r_min.is_nan() || r_max.is_nan() || r_min < 0.0 || r_max < r_min {
            return Err(Error::InvalidParameter(format!(
                "invalid distance window [{}, {})", r_min, r_max
            )));
        }

        return Ok(self.filter(|bond| {
            let distance = periodic_box.distance(
                ref_points[bond.ref_index],
                target_points[bond.target_index],
            );
            r_min <= distance && distance < r_max
        }));
    }

    /// Make this list a copy of `other`, re-using the existing allocations
    pub fn copy_from(&mut self, other: &BondList) {
        self.clone_from(other);
    }

    fn update_segments(&mut self) {
        self.segments.clear();
        self.segments.resize(self.num_ref, 0);
        self.counts.clear();
        self.counts.resize(self.num_ref, 0);

        for &ref_index in &self.ref_indices {
            self.counts[ref_index] += 1;
        }

        let mut start = 0;
        for (segment, count) in self.segments.iter_mut().zip(&self.counts) {
            *segment = start;
            start += count;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example() -> BondList {
        BondList::from_arrays(
            5, 4,
            &[0, 0, 1, 3, 3, 3],
            &[1, 2, 0, 0, 1, 2],
            Some(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
        ).unwrap()
    }

    #[test]
    fn construction() {
        let list = example();
        assert_eq!(list.len(), 6);
        assert_eq!(list.num_ref(), 5);
        assert_eq!(list.num_target(), 4);
        assert_eq!(list.segments(), [0, 2, 3, 3, 6]);
        assert_eq!(list.neighbor_counts(), [2, 1, 0, 3, 0]);

        let list = BondList::from_arrays(2, 2, &[0, 1], &[1, 0], None).unwrap();
        assert_eq!(list.weights(), [1.0, 1.0]);

        let empty = BondList::new(3, 3);
        assert!(empty.is_empty());
        assert_eq!(empty.segments(), [0, 0, 0]);
        assert_eq!(empty.find_first_index(1), 0);
    }

    #[test]
    fn construction_errors() {
        let result = BondList::from_arrays(3, 3, &[0, 2, 1], &[0, 0, 0], None);
        assert!(matches!(result, Err(Error::UnsortedIndex { position: 2 })));

        let result = BondList::from_arrays(3, 3, &[0, 1, 3], &[0, 0, 0], None);
        assert!(matches!(result, Err(Error::IndexOutOfRange { kind: "reference", index: 3, bound: 3 })));

        let result = BondList::from_arrays(3, 2, &[0, 1, 2], &[0, 2, 0], None);
        assert!(matches!(result, Err(Error::IndexOutOfRange { kind: "target", index: 2, bound: 2 })));

        let result = BondList::from_arrays(3, 3, &[0, 1], &[0], None);
        assert!(matches!(result, Err(Error::SizeMismatch(_))));

        let result = BondList::from_arrays(3, 3, &[0, 1], &[0, 1], Some(&[1.0]));
        assert!(matches!(result, Err(Error::SizeMismatch(_))));
    }

    #[test]
    fn find_first_index() {
        let list = example();
        assert_eq!(list.find_first_index(0), 0);
        assert_eq!(list.find_first_index(1), 2);
        // no bonds for 2, this gives the position of the next bonds
        assert_eq!(list.find_first_index(2), 3);
        assert_eq!(list.find_first_index(3), 3);
        // no bonds after this one
        assert_eq!(list.find_first_index(4), 6);
        assert_eq!(list.find_first_index(42), 6);

        assert_eq!(list.bonds_for(0), 0..2);
        assert_eq!(list.bonds_for(2), 3..3);
        assert_eq!(list.bonds_for(3), 3..6);
        assert_eq!(list.bonds_for(4), 6..6);

        for r in 0..list.num_ref() {
            assert_eq!(list.find_first_index(r), list.segments()[r]);
        }
    }

    #[test]
    fn filter() {
        let mut list = example();
        list.filter(|bond| bond.weight > 2.5 && bond.target_index != 1);

        assert_eq!(list.ref_indices(), [1, 3, 3]);
        assert_eq!(list.target_indices(), [0, 0, 2]);
        assert_eq!(list.weights(), [3.0, 4.0, 6.0]);
        assert_eq!(list.segments(), [0, 0, 1, 1, 3]);
        assert_eq!(list.neighbor_counts(), [0, 1, 0, 2, 0]);

        list.filter(|_| false);
        assert!(list.is_empty());
        assert_eq!(list.neighbor_counts(), [0; 5]);
    }

    #[test]
    fn filter_by_distance() {
        let periodic_box = PeriodicBox::cube(10.0).unwrap();
        let ref_points = [Vector3D::new(0.0, 0.0, 0.0), Vector3D::new(4.0, 0.0, 0.0)];
        let target_points = [
            Vector3D::new(1.0, 0.0, 0.0),
            Vector3D::new(-4.5, 0.0, 0.0),
            Vector3D::new(0.0, 3.0, 0.0),
        ];

        let mut list = BondList::from_arrays(
            2, 3, &[0, 0, 0, 1, 1, 1], &[0, 1, 2, 0, 1, 2], None
        ).unwrap();

        // distances are 1, 4.5, 3 for the first point, 3, 1.5, 5 for the
        // second one
        list.filter_by_distance(&periodic_box, &ref_points, &target_points, 4.0, 1.2).unwrap();
        assert_eq!(list.ref_indices(), [0, 1, 1]);
        assert_eq!(list.target_indices(), [2, 0, 1]);

        // filtering again with the full window does not change anything
        let before = list.clone();
        list.filter_by_distance(&periodic_box, &ref_points, &target_points, f64::INFINITY, 0.0).unwrap();
        assert_eq!(list, before);

        let result = list.filter_by_distance(&periodic_box, &ref_points, &target_points[..2], 4.0, 0.0);
        assert!(matches!(result, Err(Error::SizeMismatch(_))));
        assert_eq!(list, before);

        let result = list.filter_by_distance(&periodic_box, &ref_points, &target_points, 1.0, 2.0);
        assert!(matches!(result, Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn copy() {
        let list = example();
        let mut other = BondList::new(1, 1);
        other.copy_from(&list);
        assert_eq!(other, list);

        other.weights_mut()[0] = 42.0;
        assert_eq!(list.weights()[0], 1.0);

        other.validate(5, 4).unwrap();
        assert!(matches!(other.validate(4, 4), Err(Error::SizeMismatch(_))));
        assert!(matches!(other.validate(5, 5), Err(Error::SizeMismatch(_))));
    }
}
