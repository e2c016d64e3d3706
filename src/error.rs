//! Errors surfaced by the reconstruction pipeline.
//!
//! Numerical failures inside the kernel, operator and preconditioner are never swallowed:
//! they propagate up to the caller, which decides how to report them. Solver
//! non-convergence is not an error and is reported through
//! [`CgSolution`](crate::CgSolution) instead.

use thiserror::Error;

/// Result type alias for fallible reconstruction operations.
pub type Result<T> = std::result::Result<T, ReconstructionError>;

/// Everything that can abort a reconstruction.
#[derive(Debug, Error)]
pub enum ReconstructionError {
    /// Unsupported kernel, Nystrom mode or dtype, or an out-of-range parameter.
    ///
    /// Raised before any computation starts.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The input points are unusable (empty, or positions and normals disagree in length).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The landmark block could not be factored, even after the jitter retry.
    ///
    /// Usually caused by duplicate or nearly coincident landmarks.
    #[error(
        "preconditioner factorization of the {size}x{size} landmark block failed \
         with diagonal jitter {jitter:e}"
    )]
    NumericalInstability {
        /// Number of landmarks.
        size: usize,
        /// The largest jitter that was tried.
        jitter: f64,
    },

    /// An allocation for a kernel block, the preconditioner or the voxel grid failed.
    #[error(
        "not enough memory for {what} ({elements} elements); \
         reduce the Nystrom sample count or the batch size"
    )]
    ResourceExhausted {
        /// The structure being allocated.
        what: &'static str,
        /// Number of scalar elements requested.
        elements: usize,
    },

    /// I/O failure while reading or writing an artifact.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Malformed PLY content.
    #[error("PLY error: {0}")]
    Ply(String),
}

impl ReconstructionError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub(crate) fn input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}

/// Allocates a zeroed buffer of `rows * cols` scalars, reporting failure instead of aborting.
pub(crate) fn try_zeroed<T: Clone>(
    rows: usize,
    cols: usize,
    zero: T,
    what: &'static str,
) -> Result<Vec<T>> {
    let elements = rows
        .checked_mul(cols)
        .ok_or(ReconstructionError::ResourceExhausted {
            what,
            elements: usize::MAX,
        })?;
    let mut data = Vec::new();
    data.try_reserve_exact(elements)
        .map_err(|_| ReconstructionError::ResourceExhausted { what, elements })?;
    data.resize(elements, zero);
    Ok(data)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn overflowing_allocation_is_reported() {
        let err = try_zeroed(usize::MAX, 2, 0.0f64, "kernel block").unwrap_err();
        match err {
            ReconstructionError::ResourceExhausted { what, .. } => assert_eq!(what, "kernel block"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn small_allocation_is_zeroed() {
        let data = try_zeroed(3, 4, 0.0f32, "test").unwrap();
        assert_eq!(data.len(), 12);
        assert!(data.iter().all(|v| *v == 0.0));
    }
}
