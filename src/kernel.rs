use crate::config::{KernelConfig, KernelKind};
use crate::error::{try_zeroed, ReconstructionError, Result};
use crate::{Real, Scalar};
use na::{DMatrix, Point3, Vector3, Vector4};
use rayon::prelude::*;

/// Number of constraint rows contributed by each oriented input point.
pub(crate) const ROWS_PER_POINT: usize = 3;

/// A point lifted to homogeneous coordinates `(x, y, z, 1)`, with its cached norm.
#[derive(Copy, Clone, Debug)]
struct Lifted<T> {
    coords: Vector4<T>,
    norm: T,
}

impl<T: Scalar> Lifted<T> {
    #[inline]
    fn new(pt: &Point3<T>) -> Self {
        let coords = Vector4::new(pt.x, pt.y, pt.z, na::one());
        Self {
            norm: coords.norm(),
            coords,
        }
    }
}

/// Evaluates the kernel and its finite-difference derivatives between point sets.
///
/// Both kernel families act on points lifted to `(x, y, z, 1)` and only depend on the
/// norms of, and the angle between, the lifted vectors.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct KernelEvaluator<T> {
    kind: KernelKind,
    variance: T,
    epsilon: T,
}

impl<T: Scalar> KernelEvaluator<T> {
    /// A kernel of the given family with finite-difference step `epsilon`.
    pub fn new(kind: KernelKind, outer_layer_variance: T, epsilon: T) -> Self {
        Self {
            kind,
            variance: outer_layer_variance,
            epsilon,
        }
    }

    /// The kernel described by `config`, for points scaled by `length_scale`.
    pub fn from_config(config: &KernelConfig, length_scale: Real) -> Self {
        Self::new(
            config.kind,
            T::from_geometry(config.outer_layer_variance),
            T::from_geometry(config.epsilon * length_scale),
        )
    }

    /// The kernel family.
    pub fn kind(&self) -> KernelKind {
        self.kind
    }

    /// The finite-difference step.
    pub fn epsilon(&self) -> T {
        self.epsilon
    }

    #[inline]
    fn eval_lifted(&self, x: &Lifted<T>, y: &Lifted<T>) -> T {
        match self.kind {
            KernelKind::NeuralSpline => neural_spline(x, y, self.variance),
            KernelKind::SphericalLaplace => spherical_laplace(x, y),
        }
    }

    /// The kernel value `k(a, b)`.
    pub fn eval(&self, a: &Point3<T>, b: &Point3<T>) -> T {
        self.eval_lifted(&Lifted::new(a), &Lifted::new(b))
    }

    /// Derivative of `k(a, ·)` at `b` along `normal_b`, by central differences.
    pub fn eval_normal_derivative(
        &self,
        a: &Point3<T>,
        b: &Point3<T>,
        normal_b: &Vector3<T>,
    ) -> T {
        let shift = normal_b * self.epsilon;
        let two = T::from_geometry(2.0);
        (self.eval(a, &(b + shift)) - self.eval(a, &(b - shift))) / (two * self.epsilon)
    }

    /// The `queries.len() × basis.len()` matrix of kernel values.
    ///
    /// Columns are filled in parallel.
    pub fn value_block(&self, queries: &[Point3<T>], basis: &[Point3<T>]) -> Result<DMatrix<T>> {
        let queries: Vec<_> = queries.iter().map(Lifted::new).collect();
        self.lifted_block(&queries, basis)
    }

    /// The kernel values between the constraint points of an oriented batch and the basis.
    ///
    /// Point `i` owns rows `3i` (the point itself), `3i + 1` (shifted by `+εn`) and
    /// `3i + 2` (shifted by `-εn`). The difference of the last two rows divided by `2ε` is
    /// the normal derivative given by [`Self::eval_normal_derivative`].
    pub fn constraint_block(
        &self,
        positions: &[Point3<T>],
        normals: &[Vector3<T>],
        basis: &[Point3<T>],
    ) -> Result<DMatrix<T>> {
        if positions.len() != normals.len() {
            return Err(ReconstructionError::input(format!(
                "{} positions but {} normals in a constraint batch",
                positions.len(),
                normals.len()
            )));
        }

        let mut constraints = Vec::with_capacity(positions.len() * ROWS_PER_POINT);

        for (p, n) in positions.iter().zip(normals.iter()) {
            let shift = n * self.epsilon;
            constraints.push(Lifted::new(p));
            constraints.push(Lifted::new(&(p + shift)));
            constraints.push(Lifted::new(&(p - shift)));
        }

        self.lifted_block(&constraints, basis)
    }

    fn lifted_block(&self, rows: &[Lifted<T>], basis: &[Point3<T>]) -> Result<DMatrix<T>> {
        let nrows = rows.len();
        let mut data = try_zeroed(nrows, basis.len(), na::zero(), "kernel block")?;

        if nrows > 0 {
            data.par_chunks_mut(nrows)
                .zip(basis.par_iter())
                .for_each(|(column, landmark)| {
                    let landmark = Lifted::new(landmark);
                    for (val, row) in column.iter_mut().zip(rows.iter()) {
                        *val = self.eval_lifted(row, &landmark);
                    }
                });
        }

        Ok(DMatrix::from_vec(nrows, basis.len(), data))
    }
}

/// Closed form of the neural-spline kernel.
///
/// The angle is computed with the `atan2` formulation, which stays accurate for nearly
/// parallel vectors where `acos` of the normalized dot product does not.
#[inline]
fn neural_spline<T: Scalar>(x: &Lifted<T>, y: &Lifted<T>, variance: T) -> T {
    let two = T::from_geometry(2.0);
    let a1 = x.coords * y.norm - y.coords * x.norm;
    let a2 = x.coords * y.norm + y.coords * x.norm;
    let angle = two * a1.norm().atan2(a2.norm());
    let pi = T::pi();
    let one: T = na::one();

    x.norm * y.norm * (angle.sin() + (one + variance) * (pi - angle) * angle.cos()) / pi
}

/// Closed form of the spherical Laplace kernel `|x||y| exp(-sqrt(1 - cos θ))`.
#[inline]
fn spherical_laplace<T: Scalar>(x: &Lifted<T>, y: &Lifted<T>) -> T {
    let one: T = na::one();
    let norms = x.norm * y.norm;
    let cos = (x.coords.dot(&y.coords) / norms).clamp(-one, one);
    norms * (-(one - cos).sqrt()).exp()
}

#[cfg(test)]
mod test {
    use super::*;

    fn kernels() -> [KernelEvaluator<f64>; 2] {
        [
            KernelEvaluator::new(KernelKind::NeuralSpline, 1.0, 1.0e-3),
            KernelEvaluator::new(KernelKind::SphericalLaplace, 1.0, 1.0e-3),
        ]
    }

    #[test]
    fn diagonal_values() {
        let origin = Point3::origin();
        let [ns, sl] = kernels();
        // At zero angle the neural spline reduces to (1 + variance) |x|^2.
        assert!((ns.eval(&origin, &origin) - 2.0).abs() < 1.0e-12);
        let pt = Point3::new(1.0, 2.0, 2.0);
        assert!((ns.eval(&pt, &pt) - 20.0).abs() < 1.0e-9);
        // sqrt(1 - cos) amplifies the rounding of the normalized dot product.
        assert!((sl.eval(&pt, &pt) - 10.0).abs() < 1.0e-6);
    }

    #[test]
    fn kernels_are_symmetric() {
        let a = Point3::new(0.1, -0.3, 0.25);
        let b = Point3::new(-0.4, 0.2, 0.05);
        for kernel in kernels() {
            assert_eq!(kernel.eval(&a, &b), kernel.eval(&b, &a));
        }
    }

    #[test]
    fn normal_derivative_converges() {
        let a = Point3::new(0.1, 0.2, 0.3);
        let b = Point3::new(-0.2, 0.1, 0.0);
        let n = Vector3::new(0.0, 0.6, 0.8);

        for kernel in kernels() {
            let fine = KernelEvaluator::new(kernel.kind(), 1.0, 1.0e-5);
            let coarse = kernel.eval_normal_derivative(&a, &b, &n);
            let reference = fine.eval_normal_derivative(&a, &b, &n);
            assert!(
                (coarse - reference).abs() < 1.0e-4,
                "{:?}: {coarse} vs {reference}",
                kernel.kind()
            );
        }
    }

    #[test]
    fn constraint_block_layout() {
        let positions: [Point3<f64>; 2] =
            [Point3::new(0.1, 0.0, 0.0), Point3::new(0.0, -0.2, 0.1)];
        let normals = [Vector3::new(0.0, 1.0, 0.0), Vector3::new(0.0, 0.0, -1.0)];
        let basis = [
            Point3::new(0.3, 0.3, 0.3),
            Point3::new(-0.1, 0.2, 0.0),
            Point3::new(0.0, 0.0, -0.4),
        ];
        let kernel = KernelEvaluator::new(KernelKind::NeuralSpline, 1.0, 0.05);
        let block = kernel.constraint_block(&positions, &normals, &basis).unwrap();
        assert_eq!(block.shape(), (6, 3));

        for (i, (p, n)) in positions.iter().zip(normals.iter()).enumerate() {
            for (m, l) in basis.iter().enumerate() {
                assert_eq!(block[(3 * i, m)], kernel.eval(p, l));
                let diff = (block[(3 * i + 1, m)] - block[(3 * i + 2, m)]) / 0.1;
                let expected = kernel.eval_normal_derivative(l, p, n);
                assert!((diff - expected).abs() < 1.0e-12);
            }
        }
    }

    #[test]
    fn mismatched_normals_are_rejected() {
        let [kernel, _] = kernels();
        let positions = [Point3::origin(); 2];
        let err = kernel
            .constraint_block(&positions, &[Vector3::x()], &positions)
            .unwrap_err();
        assert!(matches!(err, ReconstructionError::InvalidInput(_)));
    }

    #[test]
    fn single_precision_agrees_with_double() {
        let a = Point3::new(0.1, 0.2, 0.3);
        let b = Point3::new(-0.2, 0.1, 0.4);
        let k64 = KernelEvaluator::new(KernelKind::NeuralSpline, 1.0, 0.01);
        let k32 = KernelEvaluator::<f32>::new(KernelKind::NeuralSpline, 1.0, 0.01);
        let v64 = k64.eval(&a, &b);
        let v32 = k32.eval(&a.cast::<f32>(), &b.cast::<f32>());
        assert!((v64 - v32 as f64).abs() < 1.0e-5);
    }
}
