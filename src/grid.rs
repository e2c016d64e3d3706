use crate::error::{try_zeroed, ReconstructionError, Result};
use crate::field::ImplicitField;
use crate::{Real, Scalar};
use itertools::iproduct;
use na::{Point3, Vector3};
use parry::bounding_volume::Aabb;

/// An axis-aligned grid of cubic-ish voxels, sampled at the voxel centers.
///
/// Samples are laid out in C order over `(x, y, z)`: `z` varies fastest.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serde-serialize",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct VoxelGrid {
    origin: Point3<Real>,
    voxel_size: Vector3<Real>,
    dims: Vector3<usize>,
}

impl VoxelGrid {
    /// The grid covering `aabb` enlarged by `scale` around its center, with `grid_size`
    /// voxels along its longest side.
    ///
    /// Other sides get a proportional, rounded number of voxels (at least one), so voxels
    /// are only approximately cubic.
    pub fn new(aabb: &Aabb, scale: Real, grid_size: usize) -> Result<Self> {
        let extents = aabb.extents() * scale;
        let longest = extents.max();

        if !(longest > 0.0 && longest.is_finite()) {
            return Err(ReconstructionError::input(
                "the input points span a degenerate bounding box",
            ));
        }
        if grid_size == 0 {
            return Err(ReconstructionError::config("grid size must be at least 1"));
        }

        let dims = extents.map(|e| ((e / longest * grid_size as Real).round() as usize).max(1));
        if dims.x.checked_mul(dims.y).and_then(|n| n.checked_mul(dims.z)).is_none() {
            return Err(ReconstructionError::ResourceExhausted {
                what: "voxel grid",
                elements: usize::MAX,
            });
        }
        let voxel_size = extents.component_div(&dims.cast::<Real>());

        Ok(Self {
            origin: aabb.center() - extents / 2.0,
            voxel_size,
            dims,
        })
    }

    /// Minimum corner of the grid.
    pub fn origin(&self) -> Point3<Real> {
        self.origin
    }

    /// Size of one voxel along each axis.
    pub fn voxel_size(&self) -> Vector3<Real> {
        self.voxel_size
    }

    /// Number of voxels along each axis.
    pub fn dims(&self) -> Vector3<usize> {
        self.dims
    }

    /// Total number of voxels. Cannot overflow: [`Self::new`] rejects such grids.
    pub fn num_voxels(&self) -> usize {
        self.dims.x * self.dims.y * self.dims.z
    }

    /// The box covered by the grid.
    pub fn aabb(&self) -> Aabb {
        Aabb::new(
            self.origin,
            self.origin + self.voxel_size.component_mul(&self.dims.cast::<Real>()),
        )
    }

    /// Linear index of voxel `(i, j, k)`.
    #[inline]
    pub fn linear_index(&self, i: usize, j: usize, k: usize) -> usize {
        (i * self.dims.y + j) * self.dims.z + k
    }

    /// The center of voxel `(i, j, k)`.
    #[inline]
    pub fn voxel_center(&self, i: usize, j: usize, k: usize) -> Point3<Real> {
        let ijk = Vector3::new(i as Real, j as Real, k as Real);
        self.origin + (ijk + Vector3::repeat(0.5)).component_mul(&self.voxel_size)
    }

    /// Evaluates `field` at every voxel center, one x-slab at a time.
    pub fn sample<T: Scalar>(&self, field: &ImplicitField<T>) -> Result<VoxelGridSamples> {
        let mut values = try_zeroed(self.num_voxels(), 1, 0.0, "voxel grid")?;
        let slab_len = self.dims.y * self.dims.z;
        let mut slab = Vec::with_capacity(slab_len);

        tracing::info!(
            "Evaluating the field on a {}x{}x{} grid",
            self.dims.x,
            self.dims.y,
            self.dims.z
        );

        for (i, out) in values.chunks_mut(slab_len).enumerate() {
            slab.clear();
            slab.extend(
                iproduct!(0..self.dims.y, 0..self.dims.z).map(|(j, k)| self.voxel_center(i, j, k)),
            );

            for (val, sample) in out.iter_mut().zip(field.eval_batch(&slab)?) {
                *val = sample.to_geometry();
            }
        }

        Ok(VoxelGridSamples { grid: *self, values })
    }
}

/// Field values at the voxel centers of a [`VoxelGrid`].
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serde-serialize",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct VoxelGridSamples {
    grid: VoxelGrid,
    values: Vec<Real>,
}

impl VoxelGridSamples {
    /// Wraps values laid out as described in [`VoxelGrid`].
    pub fn new(grid: VoxelGrid, values: Vec<Real>) -> Result<Self> {
        if values.len() != grid.num_voxels() {
            return Err(ReconstructionError::input(format!(
                "{} values given for a grid of {} voxels",
                values.len(),
                grid.num_voxels()
            )));
        }

        Ok(Self { grid, values })
    }

    /// The sampled grid.
    pub fn grid(&self) -> &VoxelGrid {
        &self.grid
    }

    /// All the values, `z` varying fastest.
    pub fn values(&self) -> &[Real] {
        &self.values
    }

    /// The value at voxel `(i, j, k)`.
    #[inline]
    pub fn value(&self, i: usize, j: usize, k: usize) -> Real {
        self.values[self.grid.linear_index(i, j, k)]
    }
}
