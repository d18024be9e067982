//! Sparse linear algebra for the diffusion system.
//!
//! The diffusion system `(I + alpha * L) f = y` is solved behind the
//! [`LinearSolver`] trait. The default is restarted GMRES, which makes no
//! symmetry or definiteness assumption about the operator. A dense LU solver
//! backed by `ndarray-linalg` is available for small networks and as a
//! reference in tests.

use log::debug;
use ndarray::{Array1, Array2};
use ndarray_linalg::Solve;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SolverError {
    #[error("Matrix is {matrix}x{matrix}, but the right-hand side has length {rhs}.")]
    DimensionMismatch { matrix: usize, rhs: usize },

    #[error("Matrix entry ({row}, {col}) lies outside a {n}x{n} matrix.")]
    IndexOutOfRange { row: usize, col: usize, n: usize },

    #[error("The right-hand side contains non-finite values.")]
    NonFiniteInput,

    #[error("Invalid solver settings: {0}")]
    InvalidSettings(String),

    #[error("Dense solve failed: {0}")]
    Linalg(#[from] ndarray_linalg::error::LinalgError),
}

// ========================================================================================
//                                 Compressed sparse rows
// ========================================================================================

/// Square sparse matrix in compressed sparse row layout.
#[derive(Debug, Clone, PartialEq)]
pub struct CsrMatrix {
    n: usize,
    row_ptr: Vec<usize>,
    col_idx: Vec<usize>,
    values: Vec<f64>,
}

impl CsrMatrix {
    /// Builds an `n x n` matrix from `(row, col, value)` entries. Repeated
    /// coordinates are summed.
    pub fn from_triplets<I>(n: usize, triplets: I) -> Result<Self, SolverError>
    where
        I: IntoIterator<Item = (usize, usize, f64)>,
    {
        let mut rows: Vec<Vec<(usize, f64)>> = vec![Vec::new(); n];
        for (row, col, value) in triplets {
            if row >= n || col >= n {
                return Err(SolverError::IndexOutOfRange { row, col, n });
            }
            rows[row].push((col, value));
        }
        Ok(Self::compress(rows))
    }

    /// Packs per-row `(col, value)` lists, summing repeated columns.
    fn compress(rows: Vec<Vec<(usize, f64)>>) -> Self {
        let n = rows.len();
        let mut row_ptr = Vec::with_capacity(n + 1);
        let mut col_idx: Vec<usize> = Vec::new();
        let mut values: Vec<f64> = Vec::new();
        row_ptr.push(0);
        for mut entries in rows {
            entries.sort_unstable_by_key(|&(col, _)| col);
            let start = col_idx.len();
            for (col, value) in entries {
                if col_idx.len() > start && col_idx.last() == Some(&col) {
                    let last = values.len() - 1;
                    values[last] += value;
                } else {
                    col_idx.push(col);
                    values.push(value);
                }
            }
            row_ptr.push(col_idx.len());
        }
        Self {
            n,
            row_ptr,
            col_idx,
            values,
        }
    }

    pub fn identity(n: usize) -> Self {
        Self {
            n,
            row_ptr: (0..=n).collect(),
            col_idx: (0..n).collect(),
            values: vec![1.0; n],
        }
    }

    pub fn dim(&self) -> usize {
        self.n
    }

    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    fn row(&self, i: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let range = self.row_ptr[i]..self.row_ptr[i + 1];
        self.col_idx[range.clone()]
            .iter()
            .copied()
            .zip(self.values[range].iter().copied())
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.row(row)
            .find(|&(c, _)| c == col)
            .map_or(0.0, |(_, value)| value)
    }

    pub fn matvec(&self, x: &Array1<f64>) -> Array1<f64> {
        Array1::from_shape_fn(self.n, |i| self.row(i).map(|(j, value)| value * x[j]).sum())
    }

    /// Largest column sum of absolute values (the matrix 1-norm).
    pub fn max_abs_column_sum(&self) -> f64 {
        let mut sums = vec![0.0f64; self.n];
        for (&col, &value) in self.col_idx.iter().zip(&self.values) {
            sums[col] += value.abs();
        }
        sums.into_iter().fold(0.0, f64::max)
    }

    /// `I + scale * self`.
    pub fn scaled_plus_identity(&self, scale: f64) -> Self {
        let scaled = (0..self.n).flat_map(|i| self.row(i).map(move |(j, value)| (i, j, scale * value)));
        let diagonal = (0..self.n).map(|i| (i, i, 1.0));
        let mut rows: Vec<Vec<(usize, f64)>> = vec![Vec::new(); self.n];
        for (i, j, value) in scaled.chain(diagonal) {
            rows[i].push((j, value));
        }
        Self::compress(rows)
    }

    pub fn to_dense(&self) -> Array2<f64> {
        let mut dense = Array2::zeros((self.n, self.n));
        for i in 0..self.n {
            for (j, value) in self.row(i) {
                dense[[i, j]] += value;
            }
        }
        dense
    }
}

// ========================================================================================
//                                  Solver interface
// ========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolverSettings {
    /// Convergence threshold on the relative residual `||b - Ax|| / ||b||`.
    pub tolerance: f64,
    /// Cap on the total number of Krylov iterations across restarts.
    pub max_iterations: usize,
    /// Krylov subspace size between restarts.
    pub restart: usize,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            tolerance: 1e-10,
            max_iterations: 1000,
            restart: 30,
        }
    }
}

impl SolverSettings {
    pub fn validate(&self) -> Result<(), SolverError> {
        if !(self.tolerance > 0.0 && self.tolerance.is_finite()) {
            return Err(SolverError::InvalidSettings(format!(
                "tolerance must be a positive number, got {}",
                self.tolerance
            )));
        }
        if self.max_iterations == 0 {
            return Err(SolverError::InvalidSettings(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if self.restart == 0 {
            return Err(SolverError::InvalidSettings(
                "restart must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Solution {
    pub x: Array1<f64>,
    pub converged: bool,
    pub iterations: usize,
    /// Relative residual of the returned `x`.
    pub residual_norm: f64,
}

pub trait LinearSolver: Send + Sync {
    fn name(&self) -> &'static str;

    fn solve(
        &self,
        matrix: &CsrMatrix,
        rhs: &Array1<f64>,
        settings: &SolverSettings,
    ) -> Result<Solution, SolverError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SolverKind {
    #[default]
    Gmres,
    Direct,
}

impl SolverKind {
    pub fn build(self) -> Box<dyn LinearSolver> {
        match self {
            SolverKind::Gmres => Box::new(Gmres),
            SolverKind::Direct => Box::new(DirectSolver),
        }
    }
}

fn check_inputs(matrix: &CsrMatrix, rhs: &Array1<f64>) -> Result<(), SolverError> {
    if matrix.dim() != rhs.len() {
        return Err(SolverError::DimensionMismatch {
            matrix: matrix.dim(),
            rhs: rhs.len(),
        });
    }
    if rhs.iter().any(|v| !v.is_finite()) {
        return Err(SolverError::NonFiniteInput);
    }
    Ok(())
}

fn relative_residual(matrix: &CsrMatrix, x: &Array1<f64>, rhs: &Array1<f64>) -> f64 {
    let rhs_norm = norm(rhs);
    if rhs_norm == 0.0 {
        return norm(x);
    }
    norm(&(rhs - &matrix.matvec(x))) / rhs_norm
}

fn norm(v: &Array1<f64>) -> f64 {
    v.dot(v).sqrt()
}

/// Solves `matrix * x = rhs` with restarted GMRES and default restart length.
/// Returns the solution and whether the relative residual reached `tolerance`
/// within `max_iterations`.
pub fn solve(
    matrix: &CsrMatrix,
    rhs: &Array1<f64>,
    tolerance: f64,
    max_iterations: usize,
) -> Result<(Array1<f64>, bool), SolverError> {
    let settings = SolverSettings {
        tolerance,
        max_iterations,
        ..SolverSettings::default()
    };
    let solution = Gmres.solve(matrix, rhs, &settings)?;
    Ok((solution.x, solution.converged))
}

// ========================================================================================
//                                   Restarted GMRES
// ========================================================================================

/// GMRES(m) with modified Gram-Schmidt Arnoldi and Givens rotations.
#[derive(Debug, Clone, Copy, Default)]
pub struct Gmres;

/// Rotation `(c, s)` that zeroes `b` in the vector `(a, b)`.
fn givens(a: f64, b: f64) -> (f64, f64) {
    if b == 0.0 {
        (1.0, 0.0)
    } else {
        let r = a.hypot(b);
        (a / r, b / r)
    }
}

impl LinearSolver for Gmres {
    fn name(&self) -> &'static str {
        "gmres"
    }

    fn solve(
        &self,
        matrix: &CsrMatrix,
        rhs: &Array1<f64>,
        settings: &SolverSettings,
    ) -> Result<Solution, SolverError> {
        settings.validate()?;
        check_inputs(matrix, rhs)?;
        let n = matrix.dim();
        let mut x = Array1::<f64>::zeros(n);

        let rhs_norm = norm(rhs);
        if rhs_norm == 0.0 {
            return Ok(Solution {
                x,
                converged: true,
                iterations: 0,
                residual_norm: 0.0,
            });
        }
        let target = settings.tolerance * rhs_norm;
        let m = settings.restart.min(n).max(1);
        let mut iterations = 0usize;

        loop {
            let r = rhs - &matrix.matvec(&x);
            let beta = norm(&r);
            if beta <= target || iterations >= settings.max_iterations {
                let converged = beta <= target;
                debug!(
                    "GMRES finished after {iterations} iterations, relative residual {:.3e}, converged: {converged}",
                    beta / rhs_norm
                );
                return Ok(Solution {
                    x,
                    converged,
                    iterations,
                    residual_norm: beta / rhs_norm,
                });
            }

            let mut basis: Vec<Array1<f64>> = Vec::with_capacity(m + 1);
            basis.push(r / beta);
            let mut h = Array2::<f64>::zeros((m + 1, m));
            let mut cs = vec![0.0f64; m];
            let mut sn = vec![0.0f64; m];
            let mut g = vec![0.0f64; m + 1];
            g[0] = beta;
            let mut steps = 0usize;

            for j in 0..m {
                iterations += 1;
                let mut w = matrix.matvec(&basis[j]);
                for (i, v) in basis.iter().enumerate() {
                    let hij = w.dot(v);
                    h[[i, j]] = hij;
                    w.scaled_add(-hij, v);
                }
                let w_norm = norm(&w);
                h[[j + 1, j]] = w_norm;

                for i in 0..j {
                    let upper = cs[i] * h[[i, j]] + sn[i] * h[[i + 1, j]];
                    h[[i + 1, j]] = -sn[i] * h[[i, j]] + cs[i] * h[[i + 1, j]];
                    h[[i, j]] = upper;
                }
                let (c, s) = givens(h[[j, j]], h[[j + 1, j]]);
                cs[j] = c;
                sn[j] = s;
                h[[j, j]] = c * h[[j, j]] + s * h[[j + 1, j]];
                h[[j + 1, j]] = 0.0;
                g[j + 1] = -s * g[j];
                g[j] *= c;
                steps = j + 1;

                let breakdown = w_norm <= f64::EPSILON * beta;
                if g[j + 1].abs() <= target || iterations >= settings.max_iterations || breakdown {
                    break;
                }
                basis.push(w / w_norm);
            }

            // Back substitution on the leading `steps x steps` triangle.
            let mut y = vec![0.0f64; steps];
            for i in (0..steps).rev() {
                let tail: f64 = ((i + 1)..steps).map(|k| h[[i, k]] * y[k]).sum();
                let diagonal = h[[i, i]];
                y[i] = if diagonal.abs() > f64::MIN_POSITIVE {
                    (g[i] - tail) / diagonal
                } else {
                    0.0
                };
            }
            for (yi, v) in y.iter().zip(&basis) {
                x.scaled_add(*yi, v);
            }
        }
    }
}

// ========================================================================================
//                                    Dense solver
// ========================================================================================

/// Dense LU factorization through LAPACK. Cubic in the network size.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectSolver;

impl LinearSolver for DirectSolver {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn solve(
        &self,
        matrix: &CsrMatrix,
        rhs: &Array1<f64>,
        settings: &SolverSettings,
    ) -> Result<Solution, SolverError> {
        check_inputs(matrix, rhs)?;
        if matrix.dim() == 0 {
            return Ok(Solution {
                x: Array1::zeros(0),
                converged: true,
                iterations: 0,
                residual_norm: 0.0,
            });
        }
        let x = matrix.to_dense().solve(rhs)?;
        let residual_norm = relative_residual(matrix, &x, rhs);
        Ok(Solution {
            converged: residual_norm <= settings.tolerance.max(1e-8),
            x,
            iterations: 1,
            residual_norm,
        })
    }
}
