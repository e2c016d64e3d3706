use crate::error::{try_zeroed, ReconstructionError, Result};
use crate::kernel::KernelEvaluator;
use crate::nystrom::NystromBasis;
use crate::{Real, Scalar};
use na::linalg::Cholesky;
use na::{DMatrix, DVector, Dyn};

/// Factor applied to the jitter before the single factorization retry.
const JITTER_RETRY_FACTOR: Real = 1.0e4;

/// An approximation of the inverse of a [`LinearOperator`](crate::LinearOperator).
pub trait Preconditioner<T: Scalar> {
    /// Writes the preconditioned residual `P⁻¹ r` into `out`.
    fn solve(&self, r: &DVector<T>, out: &mut DVector<T>);
}

/// The identity, i.e., plain unpreconditioned conjugate gradient.
#[derive(Copy, Clone, Debug, Default)]
pub struct IdentityPreconditioner;

impl<T: Scalar> Preconditioner<T> for IdentityPreconditioner {
    fn solve(&self, r: &DVector<T>, out: &mut DVector<T>) {
        out.copy_from(r);
    }
}

/// Cholesky factorization of a landmark-only estimate of the normal equations.
///
/// The landmarks are themselves constraint points, so the landmark-landmark kernel block
/// `K` is a row subset of `A`. With `R` constraint rows and `M` landmarks, `AᵀA` is
/// approximated by `(R / M) KᵀK`.
#[derive(Clone, Debug)]
pub struct NystromPreconditioner<T: Scalar> {
    cholesky: Cholesky<T, Dyn>,
    jitter: T,
}

impl<T: Scalar> NystromPreconditioner<T> {
    /// Builds and factors `(R / M) KᵀK + λI`, `R` being `num_constraints`.
    ///
    /// `relative_jitter` overrides the default diagonal shift, expressed relative to the
    /// mean diagonal entry.
    pub fn build(
        kernel: &KernelEvaluator<T>,
        basis: &NystromBasis<T>,
        num_constraints: usize,
        regularization: T,
        relative_jitter: Option<Real>,
    ) -> Result<Self> {
        let m = basis.len();
        if m == 0 {
            return Err(ReconstructionError::input(
                "cannot build a preconditioner without landmarks",
            ));
        }

        let block = kernel.value_block(basis.positions(), basis.positions())?;
        let data = try_zeroed(m, m, na::zero(), "preconditioner")?;
        let mut matrix = DMatrix::from_vec(m, m, data);

        let weight = T::from_geometry(num_constraints as Real / m as Real);
        matrix.gemm_tr(weight, &block, &block, na::zero());

        for i in 0..m {
            matrix[(i, i)] += regularization;
        }

        Self::from_matrix(matrix, relative_jitter)
    }

    /// Factors a symmetric positive semi-definite matrix after shifting its diagonal.
    ///
    /// If the first factorization fails, the shift is multiplied by `10⁴` and the
    /// factorization retried once.
    pub fn from_matrix(matrix: DMatrix<T>, relative_jitter: Option<Real>) -> Result<Self> {
        let m = matrix.nrows();
        let relative = match relative_jitter {
            Some(jitter) => T::from_geometry(jitter),
            None => T::default_epsilon() * T::from_geometry(m as Real),
        };
        let mean_diag = matrix.trace() / T::from_geometry(m.max(1) as Real);
        let first = if mean_diag > na::zero() {
            relative * mean_diag
        } else {
            relative
        };

        let mut jitter = first;
        for attempt in 0..2 {
            if attempt > 0 {
                jitter = first * T::from_geometry(JITTER_RETRY_FACTOR);
                tracing::warn!(
                    "Preconditioner factorization failed, retrying with jitter {:e}",
                    jitter.to_geometry()
                );
            }

            let mut shifted = matrix.clone();
            for i in 0..m {
                shifted[(i, i)] += jitter;
            }

            if let Some(cholesky) = shifted.cholesky() {
                tracing::debug!(
                    "Factored {m}x{m} preconditioner with jitter {:e}",
                    jitter.to_geometry()
                );
                return Ok(Self { cholesky, jitter });
            }
        }

        Err(ReconstructionError::NumericalInstability {
            size: m,
            jitter: jitter.to_geometry(),
        })
    }

    /// The diagonal shift that made the factorization succeed.
    pub fn jitter(&self) -> T {
        self.jitter
    }

    /// Size of the factored matrix.
    pub fn dim(&self) -> usize {
        self.cholesky.l_dirty().nrows()
    }
}

impl<T: Scalar> Preconditioner<T> for NystromPreconditioner<T> {
    fn solve(&self, r: &DVector<T>, out: &mut DVector<T>) {
        out.copy_from(r);
        self.cholesky.solve_mut(out);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{KernelKind, NystromConfig, NystromMode};
    use crate::nystrom::NystromSampler;
    use crate::point_set::PointSet;
    use na::{Point3, Vector3};

    #[test]
    fn solves_the_factored_system() {
        let matrix = DMatrix::from_row_slice(3, 3, &[4.0, 1.0, 0.0, 1.0, 3.0, 1.0, 0.0, 1.0, 2.0]);
        let precond = NystromPreconditioner::from_matrix(matrix.clone(), Some(1.0e-14)).unwrap();
        let x = DVector::from_vec(vec![1.0, -2.0, 0.5]);
        let mut out = DVector::zeros(3);
        precond.solve(&(&matrix * &x), &mut out);
        assert!((out - x).norm() < 1.0e-10);
        assert_eq!(precond.dim(), 3);
    }

    #[test]
    fn singular_matrix_is_rescued_by_jitter() {
        // Two identical rows: rank deficient, but positive semi-definite.
        let v = DMatrix::from_row_slice(2, 3, &[1.0, 2.0, 3.0, 1.0, 2.0, 3.0]);
        let matrix = &v * v.transpose();
        let precond = NystromPreconditioner::from_matrix(matrix, None).unwrap();
        assert!(precond.jitter() > 0.0);
    }

    #[test]
    fn indefinite_matrix_is_a_numerical_error() {
        let matrix = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, -1.0]);
        let err = NystromPreconditioner::from_matrix(matrix, None).unwrap_err();
        assert!(matches!(
            err,
            ReconstructionError::NumericalInstability { size: 2, .. }
        ));
    }

    #[test]
    fn landmark_preconditioner_is_symmetric_positive_definite() {
        let positions: Vec<_> = (0..30)
            .map(|i| {
                let t = i as Real * 0.2;
                Point3::new(0.3 * t.cos(), 0.3 * t.sin(), 0.01 * i as Real - 0.15)
            })
            .collect();
        let normals = positions.iter().map(|p| Vector3::new(p.x, p.y, 0.0).normalize()).collect();
        let points = PointSet::new(positions, normals).unwrap();
        let basis = NystromSampler::new(NystromConfig {
            mode: NystromMode::KMeans,
            num_samples: 8,
            seed: 3,
            kmeans_iterations: 5,
        })
        .sample(&points.constraint_points(0.01))
        .unwrap();

        let kernel = KernelEvaluator::new(KernelKind::NeuralSpline, 1.0, 0.01);
        let precond = NystromPreconditioner::build(&kernel, &basis, 90, 1.0e-7, None).unwrap();
        assert_eq!(precond.dim(), basis.len());

        let r = DVector::from_fn(basis.len(), |i, _| 1.0 + i as Real);
        let mut z = DVector::zeros(basis.len());
        precond.solve(&r, &mut z);
        assert!(r.dot(&z) > 0.0);
    }
}
