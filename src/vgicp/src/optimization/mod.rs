//! Scan-to-map optimization.
//!
//! The cost is minimized with damped Gauss-Newton over SE(3) using the
//! right-perturbation increment `[rho, phi]`.

pub mod linearize;
pub mod newton;
pub mod solver;
pub mod types;

pub use linearize::{evaluate_error, linearize, Linearization};
pub use newton::damped_step;
pub use solver::GaussNewtonSolver;
pub use types::{apply_increment, skew, ConvergenceStatus, RegistrationResult, SolverConfig};
