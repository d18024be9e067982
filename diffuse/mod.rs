//! Label propagation over the neighbor graph and its self-validation.

pub mod diffusion;
pub mod solver;
pub mod validation;

pub use diffusion::{Convergence, DiffusionEngine, DiffusionError, DiffusionResult, ResultRow, laplacian};
pub use solver::{
    CsrMatrix, DirectSolver, Gmres, LinearSolver, Solution, SolverError, SolverKind, SolverSettings, solve,
};
pub use validation::{
    CrossValidation, RocPoint, ValidationError, auc, leave_one_out, leave_one_out_named, roc_curve,
};
