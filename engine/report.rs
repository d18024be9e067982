//! Output writers: tab-separated result tables, ROC points and the JSON
//! cluster view consumed by the graph renderer.

use ahash::AHashSet;
use log::info;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

use crate::diffuse::{CrossValidation, DiffusionResult, ResultRow, RocPoint};
use crate::network::Network;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to write report file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to write tab-separated report: {0}")]
    Csv(#[from] csv::Error),
    #[error("Failed to serialize cluster view to JSON: {0}")]
    Json(#[from] serde_json::Error),
}

fn write_tsv<T: Serialize>(path: &Path, rows: &[T]) -> Result<(), ReportError> {
    let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    info!("Wrote {} rows to '{}'", rows.len(), path.display());
    Ok(())
}

/// Writes `entity, initial_label, final_score, z_score, rank`. Missing
/// z-scores and ranks are left empty.
pub fn write_result_table(path: &Path, rows: &[ResultRow]) -> Result<(), ReportError> {
    write_tsv(path, rows)
}

pub fn write_roc(path: &Path, points: &[RocPoint]) -> Result<(), ReportError> {
    write_tsv(path, points)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterNode {
    pub id: String,
    pub seed: bool,
    pub z_score: Option<f64>,
    pub rank: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterEdge {
    pub source: String,
    pub target: String,
}

/// Seeds plus top hits, with only the edges that run between them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterView {
    pub nodes: Vec<ClusterNode>,
    pub edges: Vec<ClusterEdge>,
}

impl ClusterView {
    pub fn new(result: &DiffusionResult, network: &Network, zscore_cutoff: f64) -> Self {
        Self::from_rows(result.table(), network, zscore_cutoff)
    }

    /// Cluster from leave-one-out scores, where seeds carry a z-score and rank.
    pub fn from_cross_validation(cv: &CrossValidation, network: &Network, zscore_cutoff: f64) -> Self {
        Self::from_rows(cv.table(), network, zscore_cutoff)
    }

    /// Seeds in row order, then non-seed rows at or above `zscore_cutoff` by rank.
    pub fn from_rows(rows: Vec<ResultRow>, network: &Network, zscore_cutoff: f64) -> Self {
        let (seeds, others): (Vec<ResultRow>, Vec<ResultRow>) =
            rows.into_iter().partition(|row| row.initial_label == 1);
        let mut hits: Vec<ResultRow> = others
            .into_iter()
            .filter(|row| row.rank.is_some() && row.z_score.is_some_and(|z| z >= zscore_cutoff))
            .collect();
        hits.sort_by_key(|row| row.rank);

        let mut nodes: Vec<ClusterNode> = seeds
            .into_iter()
            .map(|row| ClusterNode {
                id: row.entity,
                seed: true,
                z_score: row.z_score,
                rank: row.rank,
            })
            .collect();
        nodes.extend(hits.into_iter().map(|row| ClusterNode {
            id: row.entity,
            seed: false,
            z_score: row.z_score,
            rank: row.rank,
        }));

        let member_set: AHashSet<usize> = nodes
            .iter()
            .filter_map(|node| network.index_of(&node.id))
            .collect();
        let entities = network.entities();
        let edges = network
            .edges()
            .into_iter()
            .filter(|(a, b)| member_set.contains(a) && member_set.contains(b))
            .map(|(a, b)| ClusterEdge {
                source: entities[a].clone(),
                target: entities[b].clone(),
            })
            .collect();

        Self { nodes, edges }
    }

    pub fn write_json(&self, path: &Path) -> Result<(), ReportError> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        info!(
            "Wrote cluster view with {} nodes and {} edges to '{}'",
            self.nodes.len(),
            self.edges.len(),
            path.display()
        );
        Ok(())
    }
}
