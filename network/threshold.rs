//! Top-k sparsification of a similarity matrix into an undirected,
//! unweighted neighbor graph.
//!
//! Each row keeps its `k` strongest positive entries. Ties are broken by the
//! column index, lower first, so a row never keeps more than `k` entries and
//! the result does not depend on thread scheduling. The kept entries are then
//! symmetrized with a logical OR, which can raise an entity's degree above
//! `k` when it is chosen by many others.

use ahash::AHashMap;
use log::{debug, info};
use ndarray::Array2;
use rayon::prelude::*;
use std::cmp::Ordering;
use std::sync::Arc;
use thiserror::Error;

use super::similarity::{SimilarityError, SimilarityMatrix};

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Cannot build a network from an empty similarity matrix.")]
    EmptyMatrix,

    #[error("The neighbor count must be at least 1.")]
    ZeroDegree,

    #[error("Entity '{0}' is not part of the network.")]
    UnknownEntity(String),

    #[error("Entity '{0}' appears more than once in the network.")]
    DuplicateEntity(String),

    #[error("Edge ({a}, {b}) is invalid for a network of {len} entities.")]
    InvalidEdge { a: usize, b: usize, len: usize },

    #[error(transparent)]
    Similarity(#[from] SimilarityError),
}

/// `ceil(sqrt(n))`, the neighbor count used when none is configured.
pub fn default_degree(entity_count: usize) -> usize {
    (entity_count as f64).sqrt().ceil() as usize
}

/// Keeps the top `k` positive entries of every row and symmetrizes.
///
/// `k` defaults to [`default_degree`] and is capped at `n - 1`.
pub fn threshold(matrix: &SimilarityMatrix, k: Option<usize>) -> Result<Network, NetworkError> {
    let n = matrix.len();
    if n == 0 {
        return Err(NetworkError::EmptyMatrix);
    }
    let requested = k.unwrap_or_else(|| default_degree(n));
    if requested == 0 {
        return Err(NetworkError::ZeroDegree);
    }
    let k = requested.min(n - 1);
    info!("Thresholding {n} entities to {k} neighbors per row");

    let values = matrix.values();
    let kept: Vec<Vec<usize>> = (0..n)
        .into_par_iter()
        .map(|i| top_k(values.row(i).iter().copied(), i, k))
        .collect();

    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, row) in kept.into_iter().enumerate() {
        for j in row {
            adjacency[i].push(j);
            adjacency[j].push(i);
        }
    }
    let network = Network::from_adjacency(matrix.shared_entities(), adjacency)?;
    debug!(
        "Network has {} edges, maximum degree {}",
        network.edge_count(),
        network.max_degree()
    );
    Ok(network)
}

/// Column indices of the `k` largest positive values, excluding `skip`.
fn top_k(row: impl Iterator<Item = f64>, skip: usize, k: usize) -> Vec<usize> {
    let mut candidates: Vec<(usize, f64)> = row
        .enumerate()
        .filter(|&(j, value)| j != skip && value > 0.0)
        .collect();
    let strongest_first =
        |a: &(usize, f64), b: &(usize, f64)| -> Ordering { b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)) };
    if k == 0 {
        return Vec::new();
    }
    if candidates.len() > k {
        candidates.select_nth_unstable_by(k - 1, strongest_first);
        candidates.truncate(k);
    }
    candidates.into_iter().map(|(j, _)| j).collect()
}

/// Undirected, unweighted graph over a fixed entity list.
#[derive(Debug, Clone)]
pub struct Network {
    entities: Arc<[String]>,
    /// Sorted, distinct neighbor indices per entity.
    adjacency: Vec<Vec<usize>>,
    /// Uppercased name -> index.
    lookup: AHashMap<String, usize>,
}

impl Network {
    /// Builds a network from undirected edges given as index pairs.
    pub fn from_edges<I>(entities: Vec<String>, edges: I) -> Result<Self, NetworkError>
    where
        I: IntoIterator<Item = (usize, usize)>,
    {
        let len = entities.len();
        let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); len];
        for (a, b) in edges {
            if a >= len || b >= len || a == b {
                return Err(NetworkError::InvalidEdge { a, b, len });
            }
            adjacency[a].push(b);
            adjacency[b].push(a);
        }
        Self::from_adjacency(entities.into(), adjacency)
    }

    fn from_adjacency(entities: Arc<[String]>, mut adjacency: Vec<Vec<usize>>) -> Result<Self, NetworkError> {
        let mut lookup = AHashMap::with_capacity(entities.len());
        for (idx, name) in entities.iter().enumerate() {
            if lookup.insert(name.to_ascii_uppercase(), idx).is_some() {
                return Err(NetworkError::DuplicateEntity(name.clone()));
            }
        }
        for neighbors in &mut adjacency {
            neighbors.sort_unstable();
            neighbors.dedup();
        }
        Ok(Self {
            entities,
            adjacency,
            lookup,
        })
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn entities(&self) -> &[String] {
        &self.entities
    }

    pub fn shared_entities(&self) -> Arc<[String]> {
        Arc::clone(&self.entities)
    }

    /// Case-insensitive entity lookup.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.lookup.get(&name.trim().to_ascii_uppercase()).copied()
    }

    /// Names of the entities adjacent to `entity`, in entity order.
    pub fn neighbors(&self, entity: &str) -> Result<Vec<&str>, NetworkError> {
        let idx = self
            .index_of(entity)
            .ok_or_else(|| NetworkError::UnknownEntity(entity.to_string()))?;
        Ok(self.adjacency[idx]
            .iter()
            .map(|&j| self.entities[j].as_str())
            .collect())
    }

    pub fn neighbor_indices(&self, idx: usize) -> &[usize] {
        &self.adjacency[idx]
    }

    pub fn degree(&self, idx: usize) -> usize {
        self.adjacency[idx].len()
    }

    pub fn max_degree(&self) -> usize {
        self.adjacency.iter().map(Vec::len).max().unwrap_or(0)
    }

    pub fn edge_count(&self) -> usize {
        self.adjacency.iter().map(Vec::len).sum::<usize>() / 2
    }

    pub fn has_edge(&self, a: usize, b: usize) -> bool {
        self.adjacency
            .get(a)
            .is_some_and(|neighbors| neighbors.binary_search(&b).is_ok())
    }

    /// Every undirected edge once, as `(low, high)` index pairs in order.
    pub fn edges(&self) -> Vec<(usize, usize)> {
        self.adjacency
            .iter()
            .enumerate()
            .flat_map(|(i, neighbors)| neighbors.iter().filter(move |&&j| j > i).map(move |&j| (i, j)))
            .collect()
    }

    /// Dense 0/1 adjacency matrix.
    pub fn adjacency_matrix(&self) -> Array2<f64> {
        let n = self.len();
        let mut matrix = Array2::zeros((n, n));
        for (i, neighbors) in self.adjacency.iter().enumerate() {
            for &j in neighbors {
                matrix[[i, j]] = 1.0;
            }
        }
        matrix
    }

    /// The adjacency matrix as a similarity matrix, for re-thresholding.
    pub fn to_similarity_matrix(&self) -> Result<SimilarityMatrix, NetworkError> {
        Ok(SimilarityMatrix::from_parts(
            self.entities.to_vec(),
            self.adjacency_matrix(),
        )?)
    }
}
