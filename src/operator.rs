use crate::error::Result;
use crate::kernel::{KernelEvaluator, ROWS_PER_POINT};
use crate::nystrom::NystromBasis;
use crate::point_set::PointSet;
use crate::Scalar;
use na::{DMatrix, DVector};

/// A symmetric positive-definite linear map, only accessible through its action on vectors.
pub trait LinearOperator<T: Scalar> {
    /// Size of the (square) operator.
    fn dim(&self) -> usize;

    /// Writes `self * x` into `out`.
    fn apply(&self, x: &DVector<T>, out: &mut DVector<T>) -> Result<()>;
}

impl<T: Scalar> LinearOperator<T> for DMatrix<T> {
    fn dim(&self) -> usize {
        self.nrows()
    }

    fn apply(&self, x: &DVector<T>, out: &mut DVector<T>) -> Result<()> {
        out.gemv(na::one(), self, x, na::zero());
        Ok(())
    }
}

/// The regularized normal equations `(AᵀA + λI)` of the Nystrom kernel ridge regression.
///
/// `A` maps the coefficients of the landmark basis functions to the field values at the
/// constraint points of every input point (see [`PointSet::triples`]). It is never stored:
/// each application rebuilds it batch by batch, so peak memory stays at
/// `3 * batch_size * M` scalars. Batches are accumulated in order, which makes the result
/// independent of the thread count.
pub struct NystromNormalOperator<'a, T: Scalar> {
    points: &'a PointSet<T>,
    basis: &'a NystromBasis<T>,
    kernel: KernelEvaluator<T>,
    regularization: T,
    batch_size: usize,
}

impl<'a, T: Scalar> NystromNormalOperator<'a, T> {
    /// The operator fitting `basis` to the constraints generated by `points`.
    pub fn new(
        points: &'a PointSet<T>,
        basis: &'a NystromBasis<T>,
        kernel: KernelEvaluator<T>,
        regularization: T,
        batch_size: usize,
    ) -> Self {
        Self {
            points,
            basis,
            kernel,
            regularization,
            batch_size: batch_size.max(1),
        }
    }

    /// Number of rows of `A`.
    pub fn num_constraints(&self) -> usize {
        self.points.len() * ROWS_PER_POINT
    }

    /// The kernel used for every block.
    pub fn kernel(&self) -> &KernelEvaluator<T> {
        &self.kernel
    }

    fn for_each_block(&self, mut f: impl FnMut(&DMatrix<T>)) -> Result<()> {
        let positions = self.points.positions().chunks(self.batch_size);
        let normals = self.points.normals().chunks(self.batch_size);

        for (pos, nrm) in positions.zip(normals) {
            let block = self
                .kernel
                .constraint_block(pos, nrm, self.basis.positions())?;
            f(&block);
        }

        Ok(())
    }

    /// The constraint targets of a block: `0` at each point, `±ε` at its shifted copies.
    fn targets(&self, block: &DMatrix<T>) -> DVector<T> {
        let eps = self.kernel.epsilon();
        DVector::from_fn(block.nrows(), |i, _| {
            match i % ROWS_PER_POINT {
                0 => na::zero(),
                1 => eps,
                _ => -eps,
            }
        })
    }

    /// The right-hand side `Aᵀy` of the normal equations.
    pub fn project_targets(&self) -> Result<DVector<T>> {
        let mut rhs = DVector::zeros(self.basis.len());

        self.for_each_block(|block| {
            let y = self.targets(block);
            rhs.gemv_tr(na::one(), block, &y, na::one());
        })?;

        Ok(rhs)
    }
}

impl<T: Scalar> LinearOperator<T> for NystromNormalOperator<'_, T> {
    fn dim(&self) -> usize {
        self.basis.len()
    }

    fn apply(&self, x: &DVector<T>, out: &mut DVector<T>) -> Result<()> {
        out.fill(na::zero());

        self.for_each_block(|block| {
            let u = block * x;
            out.gemv_tr(na::one(), block, &u, na::one());
        })?;

        out.axpy(self.regularization, x, na::one());
        Ok(())
    }
}
