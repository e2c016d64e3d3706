use crate::error::{ReconstructionError, Result};
use crate::{Real, Scalar};
use na::{Point3, Vector3};
use parry::bounding_volume::Aabb;

/// Oriented points: one normal per position.
///
/// Normals are used as given; nothing in the core re-normalizes them.
#[derive(Clone, Debug, PartialEq)]
pub struct PointSet<T: na::Scalar = Real> {
    positions: Vec<Point3<T>>,
    normals: Vec<Vector3<T>>,
}

impl<T: Scalar> PointSet<T> {
    /// Pairs `positions` with `normals`.
    ///
    /// Fails if the two do not have the same length.
    pub fn new(positions: Vec<Point3<T>>, normals: Vec<Vector3<T>>) -> Result<Self> {
        if positions.len() != normals.len() {
            return Err(ReconstructionError::input(format!(
                "exactly one normal per point must be provided ({} points, {} normals)",
                positions.len(),
                normals.len()
            )));
        }

        Ok(Self { positions, normals })
    }

    /// Number of oriented points.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Is this set empty?
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// The point positions.
    pub fn positions(&self) -> &[Point3<T>] {
        &self.positions
    }

    /// The point normals.
    pub fn normals(&self) -> &[Vector3<T>] {
        &self.normals
    }

    /// Copies the points at `indices`, in that order.
    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            positions: indices.iter().map(|i| self.positions[*i]).collect(),
            normals: indices.iter().map(|i| self.normals[*i]).collect(),
        }
    }

    /// Converts every coordinate to another precision.
    pub fn cast<U: Scalar>(&self) -> PointSet<U> {
        PointSet {
            positions: self
                .positions
                .iter()
                .map(|p| p.map(|e| U::from_geometry(e.to_geometry())))
                .collect(),
            normals: self
                .normals
                .iter()
                .map(|n| n.map(|e| U::from_geometry(e.to_geometry())))
                .collect(),
        }
    }

    /// The constraint points of the regression with their target values.
    ///
    /// Each point `x` with normal `n` yields `x` (target `0`), `x + εn` (target `+ε`) and
    /// `x - εn` (target `-ε`), in that order.
    pub fn triples(&self, epsilon: T) -> (Vec<Point3<T>>, Vec<T>) {
        let mut points = Vec::with_capacity(self.len() * 3);
        let mut occupancies = Vec::with_capacity(self.len() * 3);

        for (p, n) in self.positions.iter().zip(self.normals.iter()) {
            points.push(*p);
            points.push(p + n * epsilon);
            points.push(p - n * epsilon);
            occupancies.push(na::zero());
            occupancies.push(epsilon);
            occupancies.push(-epsilon);
        }

        (points, occupancies)
    }

    /// The constraint points of [`Self::triples`] as an oriented point set.
    ///
    /// Each shifted copy keeps the normal of the point it was generated from.
    pub fn constraint_points(&self, epsilon: T) -> Self {
        let (positions, _) = self.triples(epsilon);
        let normals = self
            .normals
            .iter()
            .flat_map(|n| std::iter::repeat(*n).take(3))
            .collect();

        Self { positions, normals }
    }
}

impl PointSet<Real> {
    /// The smallest AABB containing every position.
    pub fn aabb(&self) -> Aabb {
        Aabb::from_points(&self.positions)
    }

    /// Applies `transform` to the positions. Normals are unchanged (the scaling is uniform).
    pub fn transformed(&self, transform: &NormalizationTransform) -> Self {
        Self {
            positions: self.positions.iter().map(|p| transform.apply(p)).collect(),
            normals: self.normals.clone(),
        }
    }
}

/// Uniform scaling and translation mapping the input into a unit box centered at the origin.
///
/// The kernels are not translation invariant, so fitting always happens in this frame.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serde-serialize",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct NormalizationTransform {
    center: Point3<Real>,
    scale: Real,
}

impl NormalizationTransform {
    /// The transform centering `aabb` and scaling its longest side to `1`.
    pub fn from_aabb(aabb: &Aabb) -> Self {
        let max_extent = aabb.extents().max();
        let scale = if max_extent > 0.0 {
            1.0 / max_extent
        } else {
            1.0
        };

        Self {
            center: aabb.center(),
            scale,
        }
    }

    /// Multiplicative factor applied to lengths.
    pub fn scale(&self) -> Real {
        self.scale
    }

    /// Maps an input-space point to the normalized frame.
    pub fn apply(&self, pt: &Point3<Real>) -> Point3<Real> {
        Point3::from((pt - self.center) * self.scale)
    }

    /// The transform mapping normalized-frame points back to input space.
    pub fn inverted(&self) -> Self {
        Self {
            center: Point3::from(-self.center.coords * self.scale),
            scale: 1.0 / self.scale,
        }
    }

    /// Maps a normalized-frame point back to input space.
    pub fn inverse(&self, pt: &Point3<Real>) -> Point3<Real> {
        self.center + pt.coords / self.scale
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mismatched_lengths_are_rejected() {
        let err = PointSet::<Real>::new(vec![Point3::origin()], vec![]).unwrap_err();
        assert!(matches!(err, ReconstructionError::InvalidInput(_)));
    }

    #[test]
    fn triples_follow_the_normals() {
        let set = PointSet::new(
            vec![Point3::new(1.0, 2.0, 3.0)],
            vec![Vector3::new(0.0, 0.0, 1.0)],
        )
        .unwrap();
        let (points, occupancies) = set.triples(0.5);
        assert_eq!(points[1], Point3::new(1.0, 2.0, 3.5));
        assert_eq!(points[2], Point3::new(1.0, 2.0, 2.5));
        assert_eq!(occupancies, vec![0.0, 0.5, -0.5]);
    }

    #[test]
    fn constraint_points_keep_their_normal() {
        let set = PointSet::new(
            vec![Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 0.0, 0.0)],
            vec![Vector3::new(0.0, 1.0, 0.0), Vector3::new(0.0, 0.0, -1.0)],
        )
        .unwrap();
        let constraints = set.constraint_points(0.25);
        assert_eq!(constraints.len(), 6);
        assert_eq!(constraints.positions()[4], Point3::new(1.0, 0.0, -0.25));
        assert_eq!(constraints.positions()[5], Point3::new(1.0, 0.0, 0.25));
        assert_eq!(constraints.normals()[2], Vector3::y());
        assert_eq!(constraints.normals()[3], -Vector3::z());
    }

    #[test]
    fn normalization_round_trip() {
        let aabb = Aabb::new(Point3::new(-1.0, 0.0, 2.0), Point3::new(3.0, 1.0, 4.0));
        let tx = NormalizationTransform::from_aabb(&aabb);
        let mapped = tx.apply(&aabb.maxs);
        assert!((mapped.x - 0.5).abs() < 1.0e-12);
        assert!((tx.inverse(&mapped) - aabb.maxs).norm() < 1.0e-12);
        assert!((tx.inverted().apply(&mapped) - aabb.maxs).norm() < 1.0e-12);
    }

    #[test]
    fn cast_preserves_values() {
        let set = PointSet::new(
            vec![Point3::new(0.25, 0.5, 1.0)],
            vec![Vector3::new(1.0, 0.0, 0.0)],
        )
        .unwrap();
        let single = set.cast::<f32>();
        assert_eq!(single.positions()[0], Point3::new(0.25f32, 0.5, 1.0));
    }
}
