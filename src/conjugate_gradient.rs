use crate::error::{ReconstructionError, Result};
use crate::operator::LinearOperator;
use crate::preconditioner::Preconditioner;
use crate::{Real, Scalar};
use na::DVector;

/// Convergence report of one solve.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serde-serialize",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct SolveDiagnostics {
    /// Relative residual `‖b - Ax‖ / ‖b‖` reached (as tracked by the CG recurrence).
    pub residual: Real,
    /// Number of operator applications performed.
    pub iterations: usize,
    /// Whether `residual` went below the stop threshold.
    pub converged: bool,
    /// Relative residual before each iteration, then after the last one.
    pub residual_history: Vec<Real>,
}

/// The output of [`solve_conjugate_gradient`].
#[derive(Clone, Debug)]
pub struct CgSolution<T: Scalar> {
    /// The approximate solution, even when the solver did not converge.
    pub coefficients: DVector<T>,
    /// Convergence report.
    pub diagnostics: SolveDiagnostics,
}

/// Solves `a * x = b` by preconditioned conjugate gradient, starting from `x = 0`.
///
/// Stops once the relative residual drops below `stop_threshold` or after
/// `max_iterations` iterations. Running out of iterations is not an error: the last
/// iterate is returned and the shortfall is logged.
pub fn solve_conjugate_gradient<T: Scalar>(
    a: &impl LinearOperator<T>,
    b: &DVector<T>,
    preconditioner: &impl Preconditioner<T>,
    max_iterations: usize,
    stop_threshold: Real,
) -> Result<CgSolution<T>> {
    let dim = a.dim();
    if b.len() != dim {
        return Err(ReconstructionError::input(format!(
            "right-hand side of size {} for an operator of size {}",
            b.len(),
            dim
        )));
    }

    let mut x = DVector::zeros(dim);
    let b_norm = b.norm().to_geometry();

    if b_norm == 0.0 {
        return Ok(CgSolution {
            coefficients: x,
            diagnostics: SolveDiagnostics {
                residual: 0.0,
                iterations: 0,
                converged: true,
                residual_history: vec![0.0],
            },
        });
    }

    let mut r = b.clone();
    let mut z = DVector::zeros(dim);
    let mut ap = DVector::zeros(dim);
    preconditioner.solve(&r, &mut z);
    let mut p = z.clone();
    let mut rz = r.dot(&z);

    let mut residual = 1.0;
    let mut history = vec![residual];
    let mut iterations = 0;

    while residual >= stop_threshold && iterations < max_iterations {
        a.apply(&p, &mut ap)?;
        let pap = p.dot(&ap);

        if !(pap > na::zero()) {
            tracing::warn!(
                "Conjugate gradient broke down at iteration {} (pᵀAp = {:e})",
                iterations,
                pap.to_geometry()
            );
            break;
        }

        let alpha = rz / pap;
        x.axpy(alpha, &p, na::one());
        r.axpy(-alpha, &ap, na::one());
        iterations += 1;

        residual = r.norm().to_geometry() / b_norm;
        history.push(residual);
        tracing::debug!("CG iteration {}: relative residual {:e}", iterations, residual);

        preconditioner.solve(&r, &mut z);
        let new_rz = r.dot(&z);
        let beta = new_rz / rz;
        rz = new_rz;
        p.axpy(na::one(), &z, beta);
    }

    let converged = residual < stop_threshold;
    if converged {
        tracing::info!(
            "Conjugate gradient converged in {} iterations (residual {:e})",
            iterations,
            residual
        );
    } else {
        tracing::warn!(
            "Conjugate gradient stopped after {} iterations with relative residual {:e} \
             (threshold {:e})",
            iterations,
            residual,
            stop_threshold
        );
    }

    Ok(CgSolution {
        coefficients: x,
        diagnostics: SolveDiagnostics {
            residual,
            iterations,
            converged,
            residual_history: history,
        },
    })
}
