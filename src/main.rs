//! Command-line surface reconstruction of an oriented point cloud.

use anyhow::Context;
use clap::Parser;
use neural_splines::io::{read_point_cloud, write_file, write_grid_npy, write_mesh_ply, write_points_ply};
use neural_splines::{
    Dtype, KernelConfig, KernelKind, NystromConfig, NystromMode, PointSet, Real,
    ReconstructionConfig, ReconstructionPipeline, Scalar, SolverConfig,
};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "neural-splines")]
#[command(about = "Reconstruct a surface from an oriented point cloud with Neural Splines")]
struct Cli {
    /// Point cloud with normals (PLY, or text with `x y z nx ny nz` per line)
    input_point_cloud: PathBuf,

    /// Finite-difference step along the normals, in input units.
    /// Half the minimum distance between two points is a reasonable value.
    eps: Real,

    /// Number of Nystrom samples (basis functions). Non-positive uses every constraint point
    #[arg(allow_negative_numbers = true)]
    num_nystrom_samples: i64,

    /// Number of voxels along the longest side of the bounding box
    grid_size: usize,

    /// Reconstruct in a bounding box this many times larger than the input's
    #[arg(long, default_value_t = 1.1)]
    scale: Real,

    /// Regularization penalty of the kernel ridge regression
    #[arg(long, default_value_t = 1.0e-7)]
    regularization: Real,

    /// Nystrom sample selection: random, blue-noise or k-means
    #[arg(long, default_value_t = NystromMode::KMeans)]
    nystrom_mode: NystromMode,

    /// Inputs with more points than this are downsampled to the voxel grid resolution
    #[arg(long, default_value_t = 150_000)]
    voxel_downsample_threshold: usize,

    /// Kernel: neural-spline or spherical-laplace
    #[arg(long, default_value_t = KernelKind::NeuralSpline)]
    kernel: KernelKind,

    /// Seed of the random number generator. Negative draws a random seed
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    seed: i64,

    /// Path of the reconstructed mesh
    #[arg(long, default_value = "recon.ply")]
    out: PathBuf,

    /// Save the field sampled on the voxel grid to {out}.grid.npy
    #[arg(long)]
    save_grid: bool,

    /// Save the tripled input points with their occupancies to {out}.pts.ply and the
    /// Nystrom samples to {out}.nystrom.ply
    #[arg(long)]
    save_points: bool,

    /// Maximum number of conjugate gradient iterations
    #[arg(long, default_value_t = 20)]
    cg_max_iters: usize,

    /// Relative residual at which conjugate gradient stops
    #[arg(long, default_value_t = 1.0e-5)]
    cg_stop_thresh: Real,

    /// Scalar type of the computation: float32 or float64
    #[arg(long, default_value_t = Dtype::Float64)]
    dtype: Dtype,

    /// Variance of the outer layer of the network the neural-spline kernel arises from
    #[arg(long, default_value_t = 1.0)]
    outer_layer_variance: Real,

    /// Number of points per kernel block (trades memory for speed, not accuracy)
    #[arg(long, default_value_t = 1024)]
    batch_size: usize,

    /// Lloyd iterations of the k-means Nystrom sampler
    #[arg(long, default_value_t = 15)]
    kmeans_iterations: usize,

    /// Log debug information
    #[arg(long)]
    verbose: bool,
}

impl Cli {
    fn config(&self, seed: u64) -> ReconstructionConfig {
        ReconstructionConfig {
            kernel: KernelConfig {
                kind: self.kernel,
                epsilon: self.eps,
                outer_layer_variance: self.outer_layer_variance,
            },
            nystrom: NystromConfig {
                mode: self.nystrom_mode,
                num_samples: usize::try_from(self.num_nystrom_samples).unwrap_or(0),
                seed,
                kmeans_iterations: self.kmeans_iterations,
            },
            solver: SolverConfig {
                regularization: self.regularization,
                max_iterations: self.cg_max_iters,
                stop_threshold: self.cg_stop_thresh,
                batch_size: self.batch_size,
                jitter: None,
            },
            grid_size: self.grid_size,
            scale: self.scale,
            voxel_downsample_threshold: self.voxel_downsample_threshold,
        }
    }

    fn artifact_path(&self, suffix: &str) -> PathBuf {
        let mut path = self.out.clone().into_os_string();
        path.push(suffix);
        path.into()
    }
}

fn reconstruct<T: Scalar>(
    cli: &Cli,
    pipeline: &ReconstructionPipeline,
    points: &PointSet<Real>,
) -> anyhow::Result<()> {
    let recon = pipeline.run::<T>(points).context("reconstruction failed")?;

    let diagnostics = recon.diagnostics();
    info!(
        "Solver finished after {} iterations, relative residual {:e}",
        diagnostics.iterations, diagnostics.residual
    );

    let samples = recon.sample_grid()?;
    let mesh = recon.mesh_from_samples(&samples);
    write_file(&cli.out, |out| write_mesh_ply(out, &mesh))
        .with_context(|| format!("cannot write {}", cli.out.display()))?;

    if cli.save_grid {
        let path = cli.artifact_path(".grid.npy");
        write_file(&path, |out| write_grid_npy(out, &samples))
            .with_context(|| format!("cannot write {}", path.display()))?;
    }

    if cli.save_points {
        let (triples, occupancies) = recon.triples();
        let path = cli.artifact_path(".pts.ply");
        write_file(&path, |out| {
            write_points_ply(out, &triples, None, Some(("occupancy", occupancies.as_slice())))
        })
        .with_context(|| format!("cannot write {}", path.display()))?;

        let landmarks = recon.landmarks();
        let path = cli.artifact_path(".nystrom.ply");
        write_file(&path, |out| {
            write_points_ply(out, landmarks.positions(), Some(landmarks.normals()), None)
        })
        .with_context(|| format!("cannot write {}", path.display()))?;
    }

    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        "neural_splines=debug"
    } else {
        "neural_splines=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let seed = u64::try_from(cli.seed).unwrap_or_else(|_| rand::random());
    info!("Using seed {}", seed);

    let pipeline = ReconstructionPipeline::new(cli.config(seed))?;
    let points = read_point_cloud(&cli.input_point_cloud)
        .with_context(|| format!("cannot read {}", cli.input_point_cloud.display()))?;

    match cli.dtype {
        Dtype::Float32 => reconstruct::<f32>(&cli, &pipeline, &points),
        Dtype::Float64 => reconstruct::<f64>(&cli, &pipeline, &points),
    }
}
