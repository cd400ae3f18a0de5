use thiserror::Error;

/// Errors surfaced by a solve attempt. All are synchronous and fatal to the
/// current solve; the circuit stays usable for a subsequent attempt.
#[derive(Debug, Error)]
pub enum Error {
    /// The Newton loop exhausted its iteration cap without meeting both the
    /// step and residual tolerances.
    #[error(
        "failed to converge after {iterations} iterations \
         (step norm {step_norm:.3e}, residual norm {residual_norm:.3e})"
    )]
    NonConvergence {
        iterations: usize,
        /// Infinity norm of the last Newton step.
        step_norm: f64,
        /// Infinity norm of the last Kirchhoff residual A*x - z.
        residual_norm: f64,
    },

    /// LU factorization refused the system matrix. Indicates a topology
    /// defect that gmin anchoring could not compensate for.
    #[error("singular system matrix ({size} x {size})")]
    SingularMatrix { size: usize },
}

pub type Result<T> = std::result::Result<T, Error>;
