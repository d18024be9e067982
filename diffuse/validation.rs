//! Leave-one-out cross-validation of a diffusion ranking.
//!
//! Every seed is withheld in turn and the remaining seeds are diffused. The
//! per-run score vectors are averaged, and each seed's entry is then replaced
//! by the score it received in the run that withheld it. Seeds are positives
//! and all other entities negatives for the ROC analysis.

use log::{info, warn};
use ndarray::Array1;
use rayon::prelude::*;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

use super::diffusion::{DiffusionEngine, DiffusionError, ResultRow, standardize};

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error(
        "Insufficient labels for cross-validation: at least 2 distinct seeds are required, but {0} were supplied."
    )]
    InsufficientLabels(usize),

    #[error("ROC analysis needs at least one positive and one negative entity.")]
    DegenerateLabels,

    #[error("Got {scores} scores but {labels} labels.")]
    LengthMismatch { scores: usize, labels: usize },

    #[error(transparent)]
    Diffusion(#[from] DiffusionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RocPoint {
    pub fpr: f64,
    pub tpr: f64,
    /// Score at or above which entities are called positive. Infinite for the
    /// leading `(0, 0)` point.
    pub threshold: f64,
}

/// Points at every distinct score threshold, from `(0, 0)` to `(1, 1)`.
pub fn roc_curve(scores: &[f64], labels: &[u8]) -> Result<Vec<RocPoint>, ValidationError> {
    if scores.len() != labels.len() {
        return Err(ValidationError::LengthMismatch {
            scores: scores.len(),
            labels: labels.len(),
        });
    }
    let positives = labels.iter().filter(|&&l| l == 1).count();
    let negatives = labels.len() - positives;
    if positives == 0 || negatives == 0 {
        return Err(ValidationError::DegenerateLabels);
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));

    let mut points = vec![RocPoint {
        fpr: 0.0,
        tpr: 0.0,
        threshold: f64::INFINITY,
    }];
    let (mut tp, mut fp) = (0usize, 0usize);
    for (position, &i) in order.iter().enumerate() {
        if labels[i] == 1 {
            tp += 1;
        } else {
            fp += 1;
        }
        let last_of_threshold = order
            .get(position + 1)
            .is_none_or(|&next| scores[next] != scores[i]);
        if last_of_threshold {
            points.push(RocPoint {
                fpr: fp as f64 / negatives as f64,
                tpr: tp as f64 / positives as f64,
                threshold: scores[i],
            });
        }
    }
    Ok(points)
}

/// Trapezoidal area under a curve whose points are ordered by `fpr`.
pub fn auc(points: &[RocPoint]) -> f64 {
    points
        .windows(2)
        .map(|pair| (pair[1].fpr - pair[0].fpr) * (pair[1].tpr + pair[0].tpr) / 2.0)
        .sum()
}

/// Collapsed leave-one-out scores with their ROC summary.
#[derive(Debug, Clone)]
pub struct CrossValidation {
    entities: Arc<[String]>,
    labels: Vec<u8>,
    scores: Array1<f64>,
    roc: Vec<RocPoint>,
    auc: f64,
    non_converged: Vec<String>,
}

impl CrossValidation {
    pub fn entities(&self) -> &[String] {
        &self.entities
    }

    pub fn labels(&self) -> &[u8] {
        &self.labels
    }

    pub fn scores(&self) -> &Array1<f64> {
        &self.scores
    }

    pub fn roc(&self) -> &[RocPoint] {
        &self.roc
    }

    pub fn auc(&self) -> f64 {
        self.auc
    }

    /// Seeds whose withheld run hit the solver's iteration cap.
    pub fn non_converged(&self) -> &[String] {
        &self.non_converged
    }

    /// Every entity with z-score and rank computed over all rows, seeds
    /// included.
    pub fn table(&self) -> Vec<ResultRow> {
        let (z_scores, ranks) = standardize(&self.scores, |_| true);
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
}

/// Runs leave-one-out over `seeds` (network indices). Duplicates are ignored.
pub fn leave_one_out(engine: &DiffusionEngine<'_>, seeds: &[usize]) -> Result<CrossValidation, ValidationError> {
    let mut seeds = seeds.to_vec();
    seeds.sort_unstable();
    seeds.dedup();
    if seeds.len() < 2 {
        return Err(ValidationError::InsufficientLabels(seeds.len()));
    }
    let labels_full = engine.label_vector(&seeds)?;
    info!("Running leave-one-out validation over {} seeds", seeds.len());

    let runs = seeds
        .par_iter()
        .map(|&withheld| {
            let remaining: Vec<usize> = seeds.iter().copied().filter(|&s| s != withheld).collect();
            let labels = engine.label_vector(&remaining)?;
            let (scores, convergence) = engine.solve_labels(&labels)?;
            Ok((withheld, scores, convergence.converged))
        })
        .collect::<Result<Vec<_>, DiffusionError>>()?;

    let network = engine.network();
    let mut collapsed = Array1::<f64>::zeros(network.len());
    for (_, scores, _) in &runs {
        collapsed += scores;
    }
    collapsed /= runs.len() as f64;
    let mut non_converged = Vec::new();
    for (withheld, scores, converged) in &runs {
        collapsed[*withheld] = scores[*withheld];
        if !converged {
            non_converged.push(network.entities()[*withheld].clone());
        }
    }
    if !non_converged.is_empty() {
        warn!(
            "{} of {} leave-one-out runs did not converge",
            non_converged.len(),
            runs.len()
        );
    }

    let labels: Vec<u8> = labels_full.iter().map(|&l| l as u8).collect();
    let scores_slice: Vec<f64> = collapsed.to_vec();
    let roc = roc_curve(&scores_slice, &labels)?;
    let auc = auc(&roc);
    info!("Leave-one-out AUC: {auc:.4}");

    Ok(CrossValidation {
        entities: network.shared_entities(),
        labels,
        scores: collapsed,
        roc,
        auc,
        non_converged,
    })
}

/// [`leave_one_out`] with seeds given by name.
pub fn leave_one_out_named<S: AsRef<str>>(
    engine: &DiffusionEngine<'_>,
    seeds: &[S],
) -> Result<CrossValidation, ValidationError> {
    let indices = engine.resolve_seeds(seeds)?;
    leave_one_out(engine, &indices)
}
