use crate::config::ReconstructionConfig;
use crate::conjugate_gradient::{solve_conjugate_gradient, SolveDiagnostics};
use crate::downsample::downsample_voxel_grid;
use crate::error::{ReconstructionError, Result};
use crate::field::ImplicitField;
use crate::grid::{VoxelGrid, VoxelGridSamples};
use crate::isosurface::{extract_isosurface, TriangleMesh};
use crate::kernel::KernelEvaluator;
use crate::nystrom::{NystromBasis, NystromSampler};
use crate::operator::NystromNormalOperator;
use crate::point_set::{NormalizationTransform, PointSet};
use crate::preconditioner::NystromPreconditioner;
use crate::{Real, Scalar};
use na::{Point3, Vector3};
use rayon::prelude::*;

/// Runs a whole reconstruction: downsampling, landmark selection, fitting.
#[derive(Copy, Clone, Debug)]
pub struct ReconstructionPipeline {
    config: ReconstructionConfig,
}

impl ReconstructionPipeline {
    /// A pipeline with the given parameters, validated once here.
    pub fn new(config: ReconstructionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// The parameters of this pipeline.
    pub fn config(&self) -> &ReconstructionConfig {
        &self.config
    }

    /// Fits an implicit field to `points`, with all the kernel math running in `T`.
    #[tracing::instrument(skip_all, fields(num_points = points.len()))]
    pub fn run<T: Scalar>(&self, points: &PointSet<Real>) -> Result<Reconstruction<T>> {
        if points.is_empty() {
            return Err(ReconstructionError::input("the point cloud is empty"));
        }

        let config = &self.config;
        let aabb = points.aabb();
        let grid = VoxelGrid::new(&aabb, config.scale, config.grid_size)?;

        let points = if points.len() > config.voxel_downsample_threshold {
            tracing::info!(
                "Downsampling {} points to the voxel grid resolution",
                points.len()
            );
            downsample_voxel_grid(points, grid.origin(), grid.voxel_size().max())?
        } else {
            points.clone()
        };

        let transform = NormalizationTransform::from_aabb(&aabb);
        let normalized = points.transformed(&transform);
        let constraints = normalized.constraint_points(config.kernel.epsilon * transform.scale());
        let basis = NystromSampler::new(config.nystrom).sample(&constraints)?;

        let (field, diagnostics) = self.fit::<T>(&normalized, basis.cast(), transform)?;

        Ok(Reconstruction {
            field,
            diagnostics,
            grid,
            points,
            epsilon: config.kernel.epsilon,
        })
    }

    fn fit<T: Scalar>(
        &self,
        normalized: &PointSet<Real>,
        basis: NystromBasis<T>,
        transform: NormalizationTransform,
    ) -> Result<(ImplicitField<T>, SolveDiagnostics)> {
        let solver = &self.config.solver;
        let points = normalized.cast::<T>();
        let kernel = KernelEvaluator::<T>::from_config(&self.config.kernel, transform.scale());
        let regularization = T::from_geometry(solver.regularization);

        let operator =
            NystromNormalOperator::new(&points, &basis, kernel, regularization, solver.batch_size);
        tracing::info!(
            "Fitting {} landmarks to {} constraints",
            basis.len(),
            operator.num_constraints()
        );

        let rhs = operator.project_targets()?;
        let preconditioner = NystromPreconditioner::build(
            &kernel,
            &basis,
            operator.num_constraints(),
            regularization,
            solver.jitter,
        )?;
        let solution = solve_conjugate_gradient(
            &operator,
            &rhs,
            &preconditioner,
            solver.max_iterations,
            solver.stop_threshold,
        )?;

        let field = ImplicitField::new(
            basis,
            solution.coefficients,
            kernel,
            transform,
            solver.batch_size,
        )?;
        Ok((field, solution.diagnostics))
    }
}

/// The result of a [`ReconstructionPipeline`] run.
#[derive(Clone, Debug)]
pub struct Reconstruction<T: Scalar> {
    field: ImplicitField<T>,
    diagnostics: SolveDiagnostics,
    grid: VoxelGrid,
    points: PointSet<Real>,
    epsilon: Real,
}

impl<T: Scalar> Reconstruction<T> {
    /// The fitted field.
    pub fn field(&self) -> &ImplicitField<T> {
        &self.field
    }

    /// Convergence report of the solver.
    pub fn diagnostics(&self) -> &SolveDiagnostics {
        &self.diagnostics
    }

    /// The voxel grid the field is meshed on.
    pub fn grid(&self) -> &VoxelGrid {
        &self.grid
    }

    /// The points the field was fitted to, after downsampling.
    pub fn points(&self) -> &PointSet<Real> {
        &self.points
    }

    /// The field value at `pt`. Negative inside, positive outside.
    pub fn eval(&self, pt: &Point3<Real>) -> T {
        self.field.eval(pt)
    }

    /// The field gradient at `pt`.
    pub fn eval_gradient(&self, pt: &Point3<Real>) -> Vector3<T> {
        self.field.eval_gradient(pt)
    }

    /// The landmarks, in input coordinates.
    pub fn landmarks(&self) -> PointSet<Real> {
        self.field
            .basis()
            .points()
            .cast::<Real>()
            .transformed(&self.field.transform().inverted())
    }

    /// The constraint points and their target values, in input coordinates.
    pub fn triples(&self) -> (Vec<Point3<Real>>, Vec<Real>) {
        self.points.triples(self.epsilon)
    }

    /// Evaluates the field on the voxel grid.
    pub fn sample_grid(&self) -> Result<VoxelGridSamples> {
        self.grid.sample(&self.field)
    }

    /// Samples the field on the voxel grid and extracts its zero level set.
    pub fn reconstruct_mesh(&self) -> Result<TriangleMesh> {
        let samples = self.sample_grid()?;
        Ok(self.mesh_from_samples(&samples))
    }

    /// Extracts the zero level set of already sampled values.
    ///
    /// Vertex normals are taken from the field gradient where it does not vanish.
    pub fn mesh_from_samples(&self, samples: &VoxelGridSamples) -> TriangleMesh {
        let mut mesh = extract_isosurface(samples, 0.0);

        mesh.normals
            .par_iter_mut()
            .zip(mesh.vertices.par_iter())
            .for_each(|(normal, vertex)| {
                let gradient = self.field.eval_gradient(vertex).map(|e| e.to_geometry());
                if let Some(n) = gradient.try_normalize(1.0e-12) {
                    *normal = n;
                }
            });

        mesh
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{KernelKind, NystromMode};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn sphere(center: Point3<Real>, radius: Real, n: usize, seed: u64) -> PointSet<Real> {
        let mut rng = StdRng::seed_from_u64(seed);
        let (positions, normals) = (0..n)
            .map(|_| {
                let dir = loop {
                    let v = Vector3::new(
                        rng.random_range(-1.0..1.0),
                        rng.random_range(-1.0..1.0),
                        rng.random_range(-1.0..1.0),
                    );
                    if let Some(dir) = v.try_normalize(1.0e-3).filter(|_| v.norm() <= 1.0) {
                        break dir;
                    }
                };
                (center + dir * radius, dir)
            })
            .unzip();
        PointSet::new(positions, normals).unwrap()
    }

    fn unit_sphere(n: usize, seed: u64) -> PointSet<Real> {
        sphere(Point3::origin(), 1.0, n, seed)
    }

    fn config() -> ReconstructionConfig {
        let mut config = ReconstructionConfig::default();
        config.kernel.kind = KernelKind::NeuralSpline;
        config.kernel.epsilon = 0.01;
        config.nystrom.mode = NystromMode::KMeans;
        config.nystrom.num_samples = 200;
        config.nystrom.seed = 4;
        config.solver.regularization = 1.0e-7;
        config.solver.max_iterations = 20;
        config.solver.stop_threshold = 1.0e-5;
        config.solver.batch_size = 256;
        config.grid_size = 24;
        config
    }

    fn check_sign_changes<T: Scalar>(
        recon: &Reconstruction<T>,
        center: Point3<Real>,
        radius: Real,
    ) {
        let dirs = [
            Vector3::x(),
            -Vector3::y(),
            Vector3::z(),
            Vector3::new(1.0, 1.0, -1.0).normalize(),
        ];

        for dir in dirs {
            let inside = recon.eval(&(center + dir * 0.5 * radius)).to_geometry();
            let outside = recon.eval(&(center + dir * 2.0 * radius)).to_geometry();
            assert!(inside < 0.0, "{dir:?}: inside value {inside}");
            assert!(outside > 0.0, "{dir:?}: outside value {outside}");
        }
    }

    #[test]
    fn unit_sphere_converges_and_separates_inside_from_outside() {
        let pipeline = ReconstructionPipeline::new(config()).unwrap();
        let recon = pipeline.run::<f64>(&unit_sphere(1000, 0)).unwrap();

        let diagnostics = recon.diagnostics();
        assert!(diagnostics.converged, "residual {}", diagnostics.residual);
        assert!(diagnostics.iterations <= 20);
        let num_landmarks = recon.field().basis().len();
        assert!(num_landmarks > 150 && num_landmarks <= 200);

        let center = recon.eval(&Point3::origin());
        let far = recon.eval(&Point3::new(10.0, 0.0, 0.0));
        assert!(center < 0.0, "center value {center}");
        assert!(far > 0.0, "far value {far}");

        check_sign_changes(&recon, Point3::origin(), 1.0);

        // The gradient points outward on the surface.
        assert!(recon.eval_gradient(&Point3::new(0.0, 1.0, 0.0)).y > 0.0);
    }

    #[test]
    fn landmarks_include_shifted_constraint_points() {
        let pipeline = ReconstructionPipeline::new(config()).unwrap();
        let recon = pipeline.run::<f64>(&unit_sphere(1000, 0)).unwrap();

        let off_surface = recon
            .landmarks()
            .positions()
            .iter()
            .filter(|pt| (pt.coords.norm() - 1.0).abs() > 0.005)
            .count();
        assert!(off_surface > 0);
    }

    #[test]
    fn repeated_runs_give_identical_fields() {
        let points = unit_sphere(400, 6);
        let mut config = config();
        config.nystrom.num_samples = 80;
        let pipeline = ReconstructionPipeline::new(config).unwrap();

        let a = pipeline.run::<f64>(&points).unwrap();
        let b = pipeline.run::<f64>(&points).unwrap();
        assert_eq!(a.field().basis(), b.field().basis());
        assert_eq!(a.field().coefficients(), b.field().coefficients());
        assert_eq!(a.diagnostics(), b.diagnostics());

        let queries: Vec<_> = (0..50)
            .map(|i| Point3::new(i as Real * 0.05 - 1.25, 0.1, -0.2))
            .collect();
        let first = a.field().eval_batch(&queries).unwrap();
        assert_eq!(first, a.field().eval_batch(&queries).unwrap());
        assert_eq!(first, b.field().eval_batch(&queries).unwrap());
    }

    #[test]
    fn sphere_mesh_is_close_to_the_input() {
        let center = Point3::new(0.3, -0.2, 0.5);
        let radius = 2.0;
        let mut config = config();
        config.kernel.epsilon = 0.01 * radius;
        let pipeline = ReconstructionPipeline::new(config).unwrap();
        let recon = pipeline.run::<f64>(&sphere(center, radius, 1000, 1)).unwrap();
        let mesh = recon.reconstruct_mesh().unwrap();
        assert!(!mesh.is_empty());

        let mean_error = mesh
            .vertices
            .iter()
            .map(|v| ((v - center).norm() - radius).abs())
            .sum::<Real>()
            / mesh.vertices.len() as Real;
        assert!(mean_error < 0.1 * radius, "mean error {mean_error}");

        let outward = mesh
            .vertices
            .iter()
            .zip(mesh.normals.iter())
            .filter(|(v, n)| n.dot(&(*v - center)) > 0.0)
            .count();
        assert!(outward as Real >= 0.95 * mesh.vertices.len() as Real);
    }

    #[test]
    fn single_precision_and_other_modes() {
        let points = unit_sphere(600, 2);
        for (kind, mode) in [
            (KernelKind::NeuralSpline, NystromMode::BlueNoise),
            (KernelKind::SphericalLaplace, NystromMode::Random),
        ] {
            let mut config = config();
            config.kernel.kind = kind;
            config.nystrom.mode = mode;
            config.nystrom.num_samples = 150;
            let recon = ReconstructionPipeline::new(config)
                .unwrap()
                .run::<f32>(&points)
                .unwrap();
            check_sign_changes(&recon, Point3::origin(), 1.0);
        }
    }

    #[test]
    fn large_inputs_are_downsampled() {
        let mut config = config();
        config.voxel_downsample_threshold = 500;
        config.grid_size = 16;
        let recon = ReconstructionPipeline::new(config)
            .unwrap()
            .run::<f64>(&unit_sphere(3000, 3))
            .unwrap();

        assert!(recon.points().len() < 3000);
        let (triples, occupancies) = recon.triples();
        assert_eq!(triples.len(), 3 * recon.points().len());
        assert_eq!(occupancies[1], 0.01);

        let landmarks = recon.landmarks();
        assert!(landmarks.len() > 150 && landmarks.len() <= 200);
        for pt in landmarks.positions() {
            assert!((pt.coords.norm() - 1.0).abs() < 0.2);
        }
    }

    #[test]
    fn empty_input_and_bad_config_are_rejected() {
        let pipeline = ReconstructionPipeline::new(config()).unwrap();
        let empty = PointSet::new(vec![], vec![]).unwrap();
        assert!(matches!(
            pipeline.run::<f64>(&empty).unwrap_err(),
            ReconstructionError::InvalidInput(_)
        ));

        let mut bad = config();
        bad.solver.batch_size = 0;
        assert!(matches!(
            ReconstructionPipeline::new(bad).unwrap_err(),
            ReconstructionError::Configuration(_)
        ));
    }
}
