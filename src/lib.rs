/*!
Surface reconstruction from oriented point clouds with Nystrom-approximate kernel ridge
regression, following the [Neural Splines](https://arxiv.org/abs/2006.13782) approach by
Williams et al.

An implicit scalar field is fitted to the input points and normals as a weighted sum of
neural-spline (or spherical-Laplace) kernel basis functions centered at a reduced set of
landmark points, then sampled on a voxel grid and meshed at its zero level set.
*/

#![allow(clippy::type_complexity, clippy::too_many_arguments)]
#![warn(missing_docs)]

/// Floating-point type used for geometry preprocessing and I/O.
pub type Real = f64;

extern crate nalgebra as na;
extern crate parry3d_f64 as parry;

pub use self::config::{
    Dtype, KernelConfig, KernelKind, NystromConfig, NystromMode, ReconstructionConfig,
    SolverConfig,
};
pub use self::conjugate_gradient::{solve_conjugate_gradient, CgSolution, SolveDiagnostics};
pub use self::downsample::downsample_voxel_grid;
pub use self::error::{ReconstructionError, Result};
pub use self::field::ImplicitField;
pub use self::grid::{VoxelGrid, VoxelGridSamples};
pub use self::isosurface::{extract_isosurface, TriangleMesh};
pub use self::kernel::KernelEvaluator;
pub use self::nystrom::{NystromBasis, NystromSampler};
pub use self::operator::{LinearOperator, NystromNormalOperator};
pub use self::point_set::{NormalizationTransform, PointSet};
pub use self::preconditioner::{IdentityPreconditioner, NystromPreconditioner, Preconditioner};
pub use self::reconstruction::{Reconstruction, ReconstructionPipeline};

mod conjugate_gradient;
mod config;
mod downsample;
mod error;
mod field;
mod grid;
mod hgrid;
pub mod io;
mod isosurface;
mod kernel;
mod nystrom;
mod operator;
mod point_set;
mod preconditioner;
mod reconstruction;

/// Scalar type the kernel math, solver and field evaluation run in.
///
/// Implemented for `f32` and `f64` only; a reconstruction picks one and never mixes them.
pub trait Scalar: na::RealField + Copy + Send + Sync {
    /// Converts from the geometry precision.
    fn from_geometry(value: Real) -> Self;
    /// Converts to the geometry precision.
    fn to_geometry(self) -> Real;
}

impl Scalar for f32 {
    #[inline]
    fn from_geometry(value: Real) -> Self {
        value as f32
    }

    #[inline]
    fn to_geometry(self) -> Real {
        self as Real
    }
}

impl Scalar for f64 {
    #[inline]
    fn from_geometry(value: Real) -> Self {
        value
    }

    #[inline]
    fn to_geometry(self) -> Real {
        self
    }
}
