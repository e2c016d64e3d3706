use crate::error::{ReconstructionError, Result};
use crate::kernel::KernelEvaluator;
use crate::nystrom::NystromBasis;
use crate::point_set::NormalizationTransform;
use crate::{Real, Scalar};
use na::{DVector, Point3, Vector3};

/// The fitted implicit function `f(q) = Σ_m c_m k(q, l_m)`.
///
/// Queries are given in input coordinates; the field maps them into the normalized frame
/// the regression was solved in. The surface is the zero level set, with positive values
/// on the side the normals point to.
#[derive(Clone, Debug)]
pub struct ImplicitField<T: Scalar> {
    basis: NystromBasis<T>,
    coefficients: DVector<T>,
    kernel: KernelEvaluator<T>,
    transform: NormalizationTransform,
    batch_size: usize,
}

impl<T: Scalar> ImplicitField<T> {
    /// Combines one coefficient per landmark with the kernel they were fitted with.
    pub fn new(
        basis: NystromBasis<T>,
        coefficients: DVector<T>,
        kernel: KernelEvaluator<T>,
        transform: NormalizationTransform,
        batch_size: usize,
    ) -> Result<Self> {
        if basis.len() != coefficients.len() {
            return Err(ReconstructionError::input(format!(
                "{} coefficients were given for {} landmarks",
                coefficients.len(),
                basis.len()
            )));
        }

        Ok(Self {
            basis,
            coefficients,
            kernel,
            transform,
            batch_size: batch_size.max(1),
        })
    }

    /// The landmarks, in the normalized frame.
    pub fn basis(&self) -> &NystromBasis<T> {
        &self.basis
    }

    /// One weight per landmark.
    pub fn coefficients(&self) -> &DVector<T> {
        &self.coefficients
    }

    /// The kernel of every basis function.
    pub fn kernel(&self) -> &KernelEvaluator<T> {
        &self.kernel
    }

    /// The map from input coordinates to the frame of the basis.
    pub fn transform(&self) -> &NormalizationTransform {
        &self.transform
    }

    fn to_local(&self, pt: &Point3<Real>) -> Point3<T> {
        self.transform.apply(pt).map(T::from_geometry)
    }

    /// The field value at `pt`.
    pub fn eval(&self, pt: &Point3<Real>) -> T {
        let q = self.to_local(pt);
        self.basis
            .positions()
            .iter()
            .zip(self.coefficients.iter())
            .fold(na::zero::<T>(), |acc, (landmark, c)| {
                acc + *c * self.kernel.eval(&q, landmark)
            })
    }

    /// The field values at every point of `pts`, evaluated by blocks of `batch_size`.
    pub fn eval_batch(&self, pts: &[Point3<Real>]) -> Result<Vec<T>> {
        let mut values = Vec::with_capacity(pts.len());

        for chunk in pts.chunks(self.batch_size) {
            let local: Vec<_> = chunk.iter().map(|pt| self.to_local(pt)).collect();
            let block = self.kernel.value_block(&local, self.basis.positions())?;
            values.extend((block * &self.coefficients).iter().copied());
        }

        Ok(values)
    }

    /// The gradient of the field at `pt`, with respect to input coordinates.
    ///
    /// Each component is the finite-difference derivative of the basis functions along
    /// one axis.
    pub fn eval_gradient(&self, pt: &Point3<Real>) -> Vector3<T> {
        let q = self.to_local(pt);
        let mut gradient = Vector3::zeros();

        for (landmark, c) in self.basis.positions().iter().zip(self.coefficients.iter()) {
            for axis in 0..3 {
                let dir = Vector3::ith(axis, na::one());
                gradient[axis] += *c * self.kernel.eval_normal_derivative(landmark, &q, &dir);
            }
        }

        gradient * T::from_geometry(self.transform.scale())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{KernelKind, NystromConfig, NystromMode};
    use crate::nystrom::NystromSampler;
    use crate::point_set::PointSet;
    use parry::bounding_volume::Aabb;

    fn field(batch_size: usize) -> ImplicitField<Real> {
        let positions: Vec<_> = (0..12)
            .map(|i| {
                let t = i as Real * 0.5;
                Point3::new(0.4 * t.cos(), 0.4 * t.sin(), 0.05 * t - 0.15)
            })
            .collect();
        let normals = vec![Vector3::z(); positions.len()];
        let points = PointSet::new(positions, normals).unwrap();
        let basis = NystromSampler::new(NystromConfig {
            mode: NystromMode::Random,
            num_samples: 0,
            seed: 0,
            kmeans_iterations: 0,
        })
        .sample(&points)
        .unwrap();

        let coefficients = DVector::from_fn(basis.len(), |i, _| (i as Real * 1.3).sin());
        let kernel = KernelEvaluator::new(KernelKind::NeuralSpline, 1.0, 1.0e-4);
        let transform = NormalizationTransform::from_aabb(&Aabb::new(
            Point3::new(-1.0, 0.0, 0.0),
            Point3::new(1.0, 1.0, 1.0),
        ));
        ImplicitField::new(basis, coefficients, kernel, transform, batch_size).unwrap()
    }

    #[test]
    fn batched_and_pointwise_evaluation_agree() {
        let queries: Vec<_> = (0..23)
            .map(|i| Point3::new(i as Real * 0.07 - 0.8, 0.3, 0.1 * (i % 5) as Real))
            .collect();

        for batch_size in [1, 4, 100] {
            let field = field(batch_size);
            let batched = field.eval_batch(&queries).unwrap();
            for (q, v) in queries.iter().zip(batched.iter()) {
                assert!((field.eval(q) - v).abs() < 1.0e-12);
            }
        }
    }

    #[test]
    fn gradient_matches_finite_differences_in_input_space() {
        let field = field(8);
        let pt = Point3::new(0.2, 0.7, 0.4);
        let gradient = field.eval_gradient(&pt);
        let h = 1.0e-5;

        for axis in 0..3 {
            let dir = Vector3::ith(axis, h);
            let fd = (field.eval(&(pt + dir)) - field.eval(&(pt - dir))) / (2.0 * h);
            assert!(
                (gradient[axis] - fd).abs() < 1.0e-4 * fd.abs().max(1.0),
                "axis {axis}: {} vs {fd}",
                gradient[axis]
            );
        }
    }

    #[test]
    fn coefficient_count_must_match() {
        let f = field(8);
        let err = ImplicitField::new(
            f.basis().clone(),
            DVector::zeros(3),
            *f.kernel(),
            *f.transform(),
            8,
        );
        assert!(err.is_err());
    }
}
