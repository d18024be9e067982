//! # Label Diffusion
//!
//! A binary label vector `y` is spread across the network by solving
//! `(I + alpha * L) f = y`, where `L = D - A` is the graph Laplacian and
//! `alpha = 1 / ||L||_1` (the largest absolute column sum of `L`).
//!
//! Scores of unlabeled entities are standardized against each other only;
//! seeds keep their raw score and get neither a z-score nor a rank.

use log::{debug, info, warn};
use ndarray::Array1;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

use super::solver::{CsrMatrix, Gmres, LinearSolver, SolverError, SolverSettings};
use crate::network::Network;

#[derive(Error, Debug)]
pub enum DiffusionError {
    #[error("Seed entity '{0}' is not part of the network.")]
    UnknownSeed(String),

    #[error("Seed index {index} is out of range for a network of {len} entities.")]
    SeedOutOfRange { index: usize, len: usize },

    #[error(transparent)]
    Solver(#[from] SolverError),
}

/// Graph Laplacian `D - A` of an unweighted network.
pub fn laplacian(network: &Network) -> Result<CsrMatrix, SolverError> {
    let n = network.len();
    let triplets = (0..n).flat_map(|i| {
        let diagonal = std::iter::once((i, i, network.degree(i) as f64));
        let off_diagonal = network.neighbor_indices(i).iter().map(move |&j| (i, j, -1.0));
        diagonal.chain(off_diagonal)
    });
    CsrMatrix::from_triplets(n, triplets)
}

/// How the linear solve behind a diffusion ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Convergence {
    pub converged: bool,
    pub iterations: usize,
    pub residual_norm: f64,
}

/// Holds the assembled diffusion system for one network.
pub struct DiffusionEngine<'n> {
    network: &'n Network,
    system: CsrMatrix,
    alpha: f64,
    solver: Box<dyn LinearSolver>,
    settings: SolverSettings,
}

impl<'n> DiffusionEngine<'n> {
    pub fn new(
        network: &'n Network,
        solver: Box<dyn LinearSolver>,
        settings: SolverSettings,
    ) -> Result<Self, DiffusionError> {
        settings.validate()?;
        let laplacian = laplacian(network)?;
        let norm = laplacian.max_abs_column_sum();
        // An edgeless network has L = 0, and the system reduces to I.
        let alpha = if norm > 0.0 { 1.0 / norm } else { 0.0 };
        let system = laplacian.scaled_plus_identity(alpha);
        debug!(
            "Diffusion system assembled: {} entities, {} non-zeros, alpha = {alpha:.6}, solver = {}",
            network.len(),
            system.nnz(),
            solver.name()
        );
        Ok(Self {
            network,
            system,
            alpha,
            solver,
            settings,
        })
    }

    pub fn with_gmres(network: &'n Network) -> Result<Self, DiffusionError> {
        Self::new(network, Box::new(Gmres), SolverSettings::default())
    }

    pub fn network(&self) -> &'n Network {
        self.network
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn system(&self) -> &CsrMatrix {
        &self.system
    }

    /// Maps seed names to network indices, case-insensitively.
    pub fn resolve_seeds<S: AsRef<str>>(&self, seeds: &[S]) -> Result<Vec<usize>, DiffusionError> {
        seeds
            .iter()
            .map(|seed| {
                let seed = seed.as_ref();
                self.network
                    .index_of(seed)
                    .ok_or_else(|| DiffusionError::UnknownSeed(seed.to_string()))
            })
            .collect()
    }

    pub fn diffuse<S: AsRef<str>>(&self, seeds: &[S]) -> Result<DiffusionResult, DiffusionError> {
        self.diffuse_indices(&self.resolve_seeds(seeds)?)
    }

    pub fn diffuse_indices(&self, seeds: &[usize]) -> Result<DiffusionResult, DiffusionError> {
        let labels = self.label_vector(seeds)?;
        let (scores, convergence) = self.solve_labels(&labels)?;
        info!(
            "Diffused {} seeds over {} entities in {} iterations",
            labels.iter().filter(|&&l| l > 0.0).count(),
            self.network.len(),
            convergence.iterations
        );
        Ok(DiffusionResult {
            entities: self.network.shared_entities(),
            labels: labels.iter().map(|&l| l as u8).collect(),
            scores,
            convergence,
        })
    }

    pub(crate) fn label_vector(&self, seeds: &[usize]) -> Result<Array1<f64>, DiffusionError> {
        let len = self.network.len();
        let mut labels = Array1::<f64>::zeros(len);
        for &index in seeds {
            if index >= len {
                return Err(DiffusionError::SeedOutOfRange { index, len });
            }
            labels[index] = 1.0;
        }
        Ok(labels)
    }

    /// Solves the system for one label vector. Non-convergence is reported
    /// through the returned [`Convergence`] and logged, not raised.
    pub(crate) fn solve_labels(&self, labels: &Array1<f64>) -> Result<(Array1<f64>, Convergence), DiffusionError> {
        let solution = self.solver.solve(&self.system, labels, &self.settings)?;
        let convergence = Convergence {
            converged: solution.converged,
            iterations: solution.iterations,
            residual_norm: solution.residual_norm,
        };
        if !convergence.converged {
            warn!(
                "Diffusion solve did not converge after {} iterations (relative residual {:.3e}); scores are a best-effort approximation",
                convergence.iterations, convergence.residual_norm
            );
        }
        Ok((solution.x, convergence))
    }
}

/// One row of a diffusion or cross-validation table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultRow {
    pub entity: String,
    pub initial_label: u8,
    pub final_score: f64,
    pub z_score: Option<f64>,
    pub rank: Option<usize>,
}

/// Population z-scores and descending 1-based ranks over the entries selected
/// by `include`. Entries outside the selection get `None`. Ties in score are
/// ranked by index.
pub(crate) fn standardize(
    scores: &Array1<f64>,
    include: impl Fn(usize) -> bool,
) -> (Vec<Option<f64>>, Vec<Option<usize>>) {
    let members: Vec<usize> = (0..scores.len()).filter(|&i| include(i)).collect();
    let mut z_scores = vec![None; scores.len()];
    let mut ranks = vec![None; scores.len()];
    if members.is_empty() {
        return (z_scores, ranks);
    }

    let count = members.len() as f64;
    let mean = members.iter().map(|&i| scores[i]).sum::<f64>() / count;
    let variance = members
        .iter()
        .map(|&i| (scores[i] - mean).powi(2))
        .sum::<f64>()
        / count;
    let std_dev = variance.sqrt();
    for &i in &members {
        z_scores[i] = Some(if std_dev > 0.0 {
            (scores[i] - mean) / std_dev
        } else {
            0.0
        });
    }

    let mut order = members;
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]).then(a.cmp(&b)));
    for (position, &i) in order.iter().enumerate() {
        ranks[i] = Some(position + 1);
    }
    (z_scores, ranks)
}

/// Final diffusion scores for every entity of a network.
#[derive(Debug, Clone)]
pub struct DiffusionResult {
    entities: Arc<[String]>,
    labels: Vec<u8>,
    scores: Array1<f64>,
    convergence: Convergence,
}

impl DiffusionResult {
    pub fn entities(&self) -> &[String] {
        &self.entities
    }

    pub fn labels(&self) -> &[u8] {
        &self.labels
    }

    pub fn scores(&self) -> &Array1<f64> {
        &self.scores
    }

    pub fn convergence(&self) -> Convergence {
        self.convergence
    }

    pub fn seeds(&self) -> Vec<&str> {
        self.labels
            .iter()
            .zip(self.entities.iter())
            .filter(|&(&label, _)| label == 1)
            .map(|(_, entity)| entity.as_str())
            .collect()
    }

    pub fn score_of(&self, entity: &str) -> Option<f64> {
        self.entities
            .iter()
            .position(|e| e.eq_ignore_ascii_case(entity.trim()))
            .map(|idx| self.scores[idx])
    }

    /// Every entity in network order. Unlabeled rows carry a z-score and rank
    /// computed among unlabeled entities only.
    pub fn table(&self) -> Vec<ResultRow> {
        let (z_scores, ranks) = standardize(&self.scores, |i| self.labels[i] == 0);
        self.entities
            .iter()
            .enumerate()
            .map(|(i, entity)| ResultRow {
                entity: entity.clone(),
                initial_label: self.labels[i],
                final_score: self.scores[i],
                z_score: z_scores[i],
                rank: ranks[i],
            })
            .collect()
    }

    /// Unlabeled rows, best first.
    pub fn ranked(&self) -> Vec<ResultRow> {
        let mut rows: Vec<ResultRow> = self.table().into_iter().filter(|row| row.rank.is_some()).collect();
        rows.sort_by_key(|row| row.rank);
        rows
    }

    /// Unlabeled rows with a z-score at or above `cutoff`, best first.
    pub fn top_hits(&self, cutoff: f64) -> Vec<ResultRow> {
        self.ranked()
            .into_iter()
            .filter(|row| row.z_score.is_some_and(|z| z >= cutoff))
            .collect()
    }
}
