use crate::error::ReconstructionError;
use crate::Real;
use std::fmt;
use std::str::FromStr;

/// The kernel family used as basis functions.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serde-serialize",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum KernelKind {
    /// Infinite-width limit of a two-layer ReLU network.
    #[default]
    NeuralSpline,
    /// Cheaper closed-form approximation of the neural-spline kernel.
    SphericalLaplace,
}

/// Landmark selection strategy.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serde-serialize",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum NystromMode {
    /// Uniform sampling without replacement.
    Random,
    /// Spatially even subsampling (Poisson-disk style).
    BlueNoise,
    /// Points nearest to k-means centroids.
    #[default]
    KMeans,
}

/// Scalar precision of a run.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serde-serialize",
    derive(serde::Serialize, serde::Deserialize)
)]
pub enum Dtype {
    /// Single precision.
    Float32,
    /// Double precision.
    #[default]
    Float64,
}

macro_rules! cli_enum {
    ($ty: ident, $what: literal, $($variant: ident => $name: literal),+) => {
        impl FromStr for $ty {
            type Err = ReconstructionError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok(Self::$variant),)+
                    other => Err(ReconstructionError::config(format!(
                        concat!("unsupported ", $what, " '{}', expected one of: {}"),
                        other,
                        [$($name),+].join(", ")
                    ))),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let name = match self {
                    $(Self::$variant => $name,)+
                };
                f.write_str(name)
            }
        }
    };
}

cli_enum!(KernelKind, "kernel", NeuralSpline => "neural-spline", SphericalLaplace => "spherical-laplace");
cli_enum!(NystromMode, "nystrom mode", Random => "random", BlueNoise => "blue-noise", KMeans => "k-means");
cli_enum!(Dtype, "dtype", Float32 => "float32", Float64 => "float64");

/// Kernel hyperparameters.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serde-serialize",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct KernelConfig {
    /// Kernel family.
    pub kind: KernelKind,
    /// Finite-difference step along the normals, in input units.
    ///
    /// Should be small relative to the local point spacing. Not validated beyond positivity.
    pub epsilon: Real,
    /// Variance of the outer layer of the network the neural-spline kernel arises from.
    pub outer_layer_variance: Real,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            kind: KernelKind::NeuralSpline,
            epsilon: 0.01,
            outer_layer_variance: 1.0,
        }
    }
}

/// Landmark selection parameters.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serde-serialize",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct NystromConfig {
    /// Selection strategy.
    pub mode: NystromMode,
    /// Requested landmark count. `0` selects every distinct input point.
    pub num_samples: usize,
    /// Seed of every random choice made during selection.
    pub seed: u64,
    /// Lloyd iterations of the k-means strategy.
    pub kmeans_iterations: usize,
}

impl Default for NystromConfig {
    fn default() -> Self {
        Self {
            mode: NystromMode::KMeans,
            num_samples: 1024,
            seed: 0,
            kmeans_iterations: 15,
        }
    }
}

/// Regression and conjugate-gradient parameters.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serde-serialize",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct SolverConfig {
    /// Tikhonov penalty λ.
    pub regularization: Real,
    /// Maximum number of conjugate-gradient iterations.
    pub max_iterations: usize,
    /// Relative residual below which the solver stops.
    pub stop_threshold: Real,
    /// Number of input points (or query points) per kernel block.
    ///
    /// Bounds peak memory to `3 * batch_size * M` scalars; does not affect results.
    pub batch_size: usize,
    /// Relative diagonal jitter of the preconditioner. `None` derives it from the precision.
    pub jitter: Option<Real>,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            regularization: 1.0e-7,
            max_iterations: 20,
            stop_threshold: 1.0e-5,
            batch_size: 1024,
            jitter: None,
        }
    }
}

/// Full configuration of one reconstruction.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serde-serialize",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct ReconstructionConfig {
    /// Kernel hyperparameters.
    pub kernel: KernelConfig,
    /// Landmark selection.
    pub nystrom: NystromConfig,
    /// Solver parameters.
    pub solver: SolverConfig,
    /// Number of voxels along the longest side of the sampling box.
    pub grid_size: usize,
    /// Expansion factor of the input bounding box used for sampling.
    pub scale: Real,
    /// Inputs with more points than this are voxel-downsampled first.
    pub voxel_downsample_threshold: usize,
}

impl Default for ReconstructionConfig {
    fn default() -> Self {
        Self {
            kernel: KernelConfig::default(),
            nystrom: NystromConfig::default(),
            solver: SolverConfig::default(),
            grid_size: 128,
            scale: 1.1,
            voxel_downsample_threshold: 150_000,
        }
    }
}

impl ReconstructionConfig {
    /// Checks every parameter that would otherwise fail deep inside the pipeline.
    pub fn validate(&self) -> crate::Result<()> {
        let positive = |value: Real, name: &str| {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(ReconstructionError::config(format!(
                    "{name} must be positive and finite, got {value}"
                )))
            }
        };

        positive(self.kernel.epsilon, "epsilon")?;
        positive(self.scale, "scale")?;
        positive(self.solver.stop_threshold, "cg stop threshold")?;

        if !(self.solver.regularization.is_finite() && self.solver.regularization >= 0.0) {
            return Err(ReconstructionError::config(format!(
                "regularization must be non-negative, got {}",
                self.solver.regularization
            )));
        }
        if !(self.kernel.outer_layer_variance.is_finite()
            && self.kernel.outer_layer_variance >= 0.0)
        {
            return Err(ReconstructionError::config(
                "outer layer variance must be non-negative",
            ));
        }
        if let Some(jitter) = self.solver.jitter {
            positive(jitter, "jitter")?;
        }
        if self.grid_size == 0 {
            return Err(ReconstructionError::config("grid size must be at least 1"));
        }
        if self.solver.batch_size == 0 {
            return Err(ReconstructionError::config("batch size must be at least 1"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_cli_spellings() {
        assert_eq!(
            "spherical-laplace".parse::<KernelKind>().unwrap(),
            KernelKind::SphericalLaplace
        );
        assert_eq!("blue-noise".parse::<NystromMode>().unwrap(), NystromMode::BlueNoise);
        assert_eq!("float32".parse::<Dtype>().unwrap(), Dtype::Float32);
        assert_eq!(NystromMode::KMeans.to_string(), "k-means");
    }

    #[test]
    fn unsupported_values_are_configuration_errors() {
        for err in [
            "arccosine".parse::<KernelKind>().unwrap_err(),
            "lloyd".parse::<NystromMode>().unwrap_err(),
            "float16".parse::<Dtype>().unwrap_err(),
        ] {
            assert!(matches!(err, ReconstructionError::Configuration(_)));
        }
    }

    #[test]
    fn defaults_are_valid() {
        let config = ReconstructionConfig::default();
        config.validate().unwrap();
        assert_eq!(config.solver.regularization, 1.0e-7);
        assert_eq!(config.solver.max_iterations, 20);
        assert_eq!(config.voxel_downsample_threshold, 150_000);
    }

    #[test]
    fn reject_non_positive_epsilon() {
        let mut config = ReconstructionConfig::default();
        config.kernel.epsilon = 0.0;
        assert!(config.validate().is_err());
    }
}
