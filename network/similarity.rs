//! # Semantic Similarity
//!
//! Term-pair similarity is the specificity of the most informative common
//! ancestor (MICA) of the two terms, where either term counts as its own
//! ancestor. Entity-pair similarity aggregates the term-pair scores with the
//! best-match-average (BMA) rule.
//!
//! The all-pairs matrix is computed one row per rayon task. Every entry is a
//! pure function of the two entities' term lists, so the result does not
//! depend on how the work is split across threads.

use ahash::RandomState;
use dashmap::DashMap;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, info, warn};
use ndarray::Array2;
use rayon::prelude::*;
use std::io::IsTerminal;
use std::sync::Arc;
use thiserror::Error;

use crate::onto::{AnnotationCorpus, SpecificityTable, TermHierarchy};

/// Symmetry is checked with this absolute tolerance when a matrix is supplied
/// from outside the engine.
const SYMMETRY_TOLERANCE: f64 = 1e-9;

#[derive(Error, Debug)]
pub enum SimilarityError {
    #[error("Similarity matrix must be square, but has shape {rows}x{cols}.")]
    NotSquare { rows: usize, cols: usize },

    #[error("Similarity matrix has {rows} rows, but {labels} entity names were supplied.")]
    LabelMismatch { rows: usize, labels: usize },

    #[error("Similarity matrix entry ({row}, {col}) is {value}; entries must be finite and non-negative.")]
    InvalidEntry { row: usize, col: usize, value: f64 },

    #[error("Similarity matrix is not symmetric at ({row}, {col}).")]
    Asymmetric { row: usize, col: usize },

    #[error("Entity '{0}' appears more than once in the similarity matrix.")]
    DuplicateEntity(String),

    #[error("Entity '{0}' is not part of the similarity matrix.")]
    UnknownEntity(String),
}

// ========================================================================================
//                                   MICA memo cache
// ========================================================================================

/// Memoized term-pair similarities, keyed by the ordered pair of term indices.
///
/// Safe to share across threads. Two threads that miss on the same key both
/// compute the value and the second insert overwrites the first with an
/// identical number.
#[derive(Debug)]
pub struct MicaCache {
    entries: DashMap<(usize, usize), f64, RandomState>,
}

impl Default for MicaCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MicaCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::with_hasher(RandomState::new()),
        }
    }

    pub fn get_or_compute(&self, a: usize, b: usize, compute: impl FnOnce() -> f64) -> f64 {
        let key = if a <= b { (a, b) } else { (b, a) };
        if let Some(hit) = self.entries.get(&key) {
            return *hit;
        }
        let value = compute();
        self.entries.insert(key, value);
        value
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ========================================================================================
//                                 Entity preparation
// ========================================================================================

/// One entity and the hierarchy indices of its explicit terms, sorted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityTerms {
    pub name: String,
    pub terms: Vec<usize>,
}

/// Entities left out of the similarity matrix, by reason.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExclusionReport {
    /// No usable annotations at all.
    pub not_annotated: Vec<String>,
    /// Some annotations, but fewer distinct terms than the configured minimum.
    pub under_annotated: Vec<String>,
}

impl ExclusionReport {
    pub fn total(&self) -> usize {
        self.not_annotated.len() + self.under_annotated.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct PreparedEntities {
    /// Sorted by name.
    pub entities: Vec<EntityTerms>,
    pub excluded: ExclusionReport,
}

/// Resolves `candidates` against the corpus and keeps those with at least
/// `min_terms` distinct terms known to the hierarchy. Candidate names are
/// matched case-insensitively and kept in their given spelling. Case variants
/// of one name collapse to a single entity.
pub fn prepare_entities<'c, I>(
    corpus: &AnnotationCorpus,
    hierarchy: &TermHierarchy,
    candidates: I,
    min_terms: usize,
) -> PreparedEntities
where
    I: IntoIterator<Item = &'c str>,
{
    let mut names: Vec<&str> = candidates.into_iter().collect();
    names.sort_unstable_by(|a, b| {
        a.to_ascii_uppercase()
            .cmp(&b.to_ascii_uppercase())
            .then_with(|| a.cmp(b))
    });
    names.dedup_by(|later, kept| later.eq_ignore_ascii_case(kept));

    let mut prepared = PreparedEntities::default();
    for name in names {
        let mut terms: Vec<usize> = corpus
            .find_entity(name)
            .and_then(|stored| corpus.terms_of(stored))
            .map(|ids| ids.iter().filter_map(|id| hierarchy.index_of(id)).collect())
            .unwrap_or_default();
        terms.sort_unstable();
        terms.dedup();

        if terms.is_empty() {
            prepared.excluded.not_annotated.push(name.to_string());
        } else if terms.len() < min_terms {
            prepared.excluded.under_annotated.push(name.to_string());
        } else {
            prepared.entities.push(EntityTerms {
                name: name.to_string(),
                terms,
            });
        }
    }

    if !prepared.excluded.is_empty() {
        warn!(
            "Excluded {} entities from the network: {} not annotated, {} with fewer than {} terms",
            prepared.excluded.total(),
            prepared.excluded.not_annotated.len(),
            prepared.excluded.under_annotated.len(),
            min_terms
        );
    }
    info!("{} entities qualify for the similarity network", prepared.entities.len());
    prepared
}

// ========================================================================================
//                                  Similarity engine
// ========================================================================================

/// Computes term-pair and entity-pair similarities against one specificity
/// table, memoizing MICA lookups.
#[derive(Debug)]
pub struct SimilarityEngine<'a> {
    table: &'a SpecificityTable<'a>,
    cache: MicaCache,
}

impl<'a> SimilarityEngine<'a> {
    pub fn new(table: &'a SpecificityTable<'a>) -> Self {
        Self {
            table,
            cache: MicaCache::new(),
        }
    }

    pub fn cache(&self) -> &MicaCache {
        &self.cache
    }

    /// Specificity of the most informative common ancestor of two terms, or
    /// 0 when they share no scored ancestor.
    pub fn term_similarity(&self, a: usize, b: usize) -> f64 {
        self.cache.get_or_compute(a, b, || self.mica_specificity(a, b))
    }

    fn mica_specificity(&self, a: usize, b: usize) -> f64 {
        let hierarchy = self.table.hierarchy();
        std::iter::once(a)
            .chain(hierarchy.closure_of(a).iter().copied())
            .filter(|&candidate| hierarchy.subsumes(candidate, b))
            .filter_map(|candidate| self.table.of_index(candidate))
            .fold(0.0, f64::max)
    }

    /// Best-match average of two term sets: the mean of every row maximum and
    /// every column maximum of the term-pair similarity grid.
    pub fn entity_similarity(&self, a: &[usize], b: &[usize]) -> f64 {
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }
        let mut column_max = vec![0.0f64; b.len()];
        let mut row_sum = 0.0;
        for &ta in a {
            let mut row_max = 0.0f64;
            for (j, &tb) in b.iter().enumerate() {
                let s = self.term_similarity(ta, tb);
                row_max = row_max.max(s);
                column_max[j] = column_max[j].max(s);
            }
            row_sum += row_max;
        }
        let column_sum: f64 = column_max.iter().sum();
        (row_sum + column_sum) / (a.len() + b.len()) as f64
    }

    /// Specificity of the most specific of the entity's own terms.
    pub fn self_similarity(&self, terms: &[usize]) -> f64 {
        terms
            .iter()
            .filter_map(|&t| self.table.of_index(t))
            .fold(0.0, f64::max)
    }

    /// All-pairs BMA similarity over `prepared.entities`, zero diagonal.
    pub fn build_matrix(&self, prepared: &PreparedEntities, show_progress: bool) -> SimilarityMatrix {
        let entities = &prepared.entities;
        let n = entities.len();
        info!("Computing pairwise similarity for {n} entities");

        let pb = progress_bar(n as u64, "similarity rows", show_progress);
        let upper: Vec<Vec<f64>> = (0..n)
            .into_par_iter()
            .map(|i| {
                let row = entities[i + 1..]
                    .iter()
                    .map(|other| self.entity_similarity(&entities[i].terms, &other.terms))
                    .collect();
                pb.inc(1);
                row
            })
            .collect();
        pb.finish_and_clear();

        let mut values = Array2::<f64>::zeros((n, n));
        for (i, row) in upper.into_iter().enumerate() {
            for (offset, value) in row.into_iter().enumerate() {
                let j = i + 1 + offset;
                values[[i, j]] = value;
                values[[j, i]] = value;
            }
        }
        debug!("MICA cache holds {} term pairs", self.cache.len());

        SimilarityMatrix {
            entities: entities.iter().map(|e| e.name.clone()).collect(),
            values,
        }
    }
}

fn progress_bar(len: u64, message: &str, visible: bool) -> ProgressBar {
    let draw_target = if visible && std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };
    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) =
        ProgressStyle::with_template("> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
    {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(message.to_string());
    pb
}

// ========================================================================================
//                                  Similarity matrix
// ========================================================================================

/// Dense, symmetric, zero-diagonal similarity over a fixed entity list.
#[derive(Debug, Clone)]
pub struct SimilarityMatrix {
    entities: Arc<[String]>,
    values: Array2<f64>,
}

impl SimilarityMatrix {
    /// Validates a matrix supplied from outside the engine. The diagonal is
    /// forced to zero.
    pub fn from_parts(entities: Vec<String>, mut values: Array2<f64>) -> Result<Self, SimilarityError> {
        let (rows, cols) = values.dim();
        if rows != cols {
            return Err(SimilarityError::NotSquare { rows, cols });
        }
        if entities.len() != rows {
            return Err(SimilarityError::LabelMismatch {
                rows,
                labels: entities.len(),
            });
        }
        let mut seen = ahash::AHashSet::with_capacity(entities.len());
        for name in &entities {
            if !seen.insert(name.to_ascii_uppercase()) {
                return Err(SimilarityError::DuplicateEntity(name.clone()));
            }
        }
        for ((row, col), &value) in values.indexed_iter() {
            if !value.is_finite() || value < 0.0 {
                return Err(SimilarityError::InvalidEntry { row, col, value });
            }
            if row < col && (value - values[[col, row]]).abs() > SYMMETRY_TOLERANCE {
                return Err(SimilarityError::Asymmetric { row, col });
            }
        }
        values.diag_mut().fill(0.0);
        Ok(Self {
            entities: entities.into(),
            values,
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

    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    /// Case-insensitive entity lookup.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.entities
            .iter()
            .position(|entity| entity.eq_ignore_ascii_case(name.trim()))
    }

    pub fn get(&self, a: &str, b: &str) -> Option<f64> {
        Some(self.values[[self.index_of(a)?, self.index_of(b)?]])
    }

    /// Similarity of `entity` to every other entity, most similar first.
    pub fn similarity_vector(&self, entity: &str) -> Result<Vec<(&str, f64)>, SimilarityError> {
        let idx = self
            .index_of(entity)
            .ok_or_else(|| SimilarityError::UnknownEntity(entity.to_string()))?;
        let mut row: Vec<(&str, f64)> = self
            .values
            .row(idx)
            .iter()
            .enumerate()
            .filter(|&(j, _)| j != idx)
            .map(|(j, &value)| (self.entities[j].as_str(), value))
            .collect();
        row.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::threshold;
    use crate::onto::{HierarchyBuilder, Term, specificity};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    /// R is the root, X and Y are children of R, Z is a child of X.
    fn hierarchy() -> TermHierarchy {
        let mut builder = HierarchyBuilder::new();
        builder.add(Term::new("R")).unwrap();
        builder.add(Term::new("X").with_parents(["R"])).unwrap();
        builder.add(Term::new("Y").with_parents(["R"])).unwrap();
        builder.add(Term::new("Z").with_parents(["X"])).unwrap();
        builder.build().unwrap()
    }

    fn corpus() -> AnnotationCorpus {
        AnnotationCorpus::from_pairs([("P1", "X"), ("P2", "Z"), ("P3", "Y"), ("P4", "R")])
    }

    fn terms(h: &TermHierarchy, ids: &[&str]) -> Vec<usize> {
        let mut idx: Vec<usize> = ids.iter().map(|id| h.index_of(id).unwrap()).collect();
        idx.sort_unstable();
        idx
    }

    #[test]
    fn mica_of_parent_and_child_is_the_parent() {
        let h = hierarchy();
        let corpus = corpus();
        let table = specificity(&corpus, &h);
        let engine = SimilarityEngine::new(&table);
        let p1 = terms(&h, &["X"]);
        let p2 = terms(&h, &["Z"]);
        assert_abs_diff_eq!(
            engine.entity_similarity(&p1, &p2),
            table.get("X").unwrap(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn siblings_meet_at_the_root() {
        let h = hierarchy();
        let corpus = corpus();
        let table = specificity(&corpus, &h);
        let engine = SimilarityEngine::new(&table);
        let x = h.index_of("X").unwrap();
        let y = h.index_of("Y").unwrap();
        assert_abs_diff_eq!(
            engine.term_similarity(x, y),
            table.get("R").unwrap(),
            epsilon = 1e-12
        );
        assert_eq!(engine.cache().len(), 1);
        assert_eq!(engine.term_similarity(y, x), engine.term_similarity(x, y));
        assert_eq!(engine.cache().len(), 1);
    }

    #[test]
    fn disconnected_terms_have_zero_similarity() {
        let mut builder = HierarchyBuilder::new();
        builder.add(Term::new("A")).unwrap();
        builder.add(Term::new("B")).unwrap();
        let h = builder.build().unwrap();
        let corpus = AnnotationCorpus::from_pairs([("P1", "A"), ("P2", "B")]);
        let table = specificity(&corpus, &h);
        let engine = SimilarityEngine::new(&table);
        assert_eq!(engine.term_similarity(0, 1), 0.0);
        assert_eq!(engine.entity_similarity(&[0], &[1]), 0.0);
        assert_eq!(engine.entity_similarity(&[], &[1]), 0.0);
    }

    #[test]
    fn bma_averages_row_and_column_maxima() {
        let h = hierarchy();
        let corpus = corpus();
        let table = specificity(&corpus, &h);
        let engine = SimilarityEngine::new(&table);
        let a = terms(&h, &["Z", "Y"]);
        let b = terms(&h, &["X"]);
        let sx = table.get("X").unwrap();
        let sr = table.get("R").unwrap();
        let sy_row = engine.term_similarity(h.index_of("Y").unwrap(), h.index_of("X").unwrap());
        assert_abs_diff_eq!(sy_row, sr, epsilon = 1e-12);
        // Rows: Z->X = sX, Y->X = sR. Column: X->{Z,Y} = sX.
        let expected = (sx + sr + sx) / 3.0;
        assert_abs_diff_eq!(engine.entity_similarity(&a, &b), expected, epsilon = 1e-12);
        assert_abs_diff_eq!(
            engine.entity_similarity(&b, &a),
            engine.entity_similarity(&a, &b),
            epsilon = 1e-15
        );
    }

    #[test]
    fn self_similarity_uses_most_specific_own_term() {
        let h = hierarchy();
        let corpus = corpus();
        let table = specificity(&corpus, &h);
        let engine = SimilarityEngine::new(&table);
        let own = terms(&h, &["R", "Z"]);
        assert_abs_diff_eq!(
            engine.self_similarity(&own),
            table.get("Z").unwrap(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn preparation_reports_both_exclusion_kinds() {
        let h = hierarchy();
        let corpus = AnnotationCorpus::from_pairs([
            ("P1", "X"),
            ("P1", "Z"),
            ("P2", "Y"),
            ("P3", "Z"),
            ("P3", "Y"),
            ("P4", "UNKNOWN"),
        ]);
        let prepared = prepare_entities(&corpus, &h, ["p3", "P1", "P2", "P4", "P9", "P1"], 2);
        let names: Vec<&str> = prepared.entities.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["P1", "p3"]);
        assert_eq!(prepared.excluded.under_annotated, vec!["P2".to_string()]);
        assert_eq!(
            prepared.excluded.not_annotated,
            vec!["P4".to_string(), "P9".to_string()]
        );
    }

    #[test]
    fn case_variants_collapse_to_one_entity() {
        let h = hierarchy();
        let corpus = AnnotationCorpus::from_pairs([
            ("CDK1", "X"),
            ("CDK1", "Y"),
            ("CDK2", "X"),
            ("CDK2", "Z"),
            ("CDK3", "Y"),
            ("CDK3", "Z"),
        ]);
        let prepared = prepare_entities(&corpus, &h, ["CDK1", "cdk1", "CDK2", "CDK3"], 1);
        let names: Vec<&str> = prepared.entities.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["CDK1", "CDK2", "CDK3"]);
        assert!(prepared.excluded.is_empty());

        let table = specificity(&corpus, &h);
        let matrix = SimilarityEngine::new(&table).build_matrix(&prepared, false);
        let network = threshold(&matrix, None).unwrap();
        assert_eq!(network.len(), 3);
    }

    #[test]
    fn matrix_is_symmetric_with_zero_diagonal() {
        let h = hierarchy();
        let corpus = AnnotationCorpus::from_pairs([
            ("A", "X"),
            ("A", "Y"),
            ("B", "Z"),
            ("C", "Y"),
            ("D", "Z"),
            ("D", "Y"),
        ]);
        let table = specificity(&corpus, &h);
        let engine = SimilarityEngine::new(&table);
        let prepared = prepare_entities(&corpus, &h, corpus.entities(), 1);
        let matrix = engine.build_matrix(&prepared, false);
        assert_eq!(matrix.entities(), &["A", "B", "C", "D"]);
        for i in 0..4 {
            assert_eq!(matrix.values()[[i, i]], 0.0);
            for j in 0..4 {
                assert_eq!(matrix.values()[[i, j]], matrix.values()[[j, i]]);
                assert!(matrix.values()[[i, j]] >= 0.0);
            }
        }
        assert_eq!(matrix.get("a", "B"), matrix.get("b", "a"));
    }

    #[test]
    fn parallel_matrix_matches_sequential_pairs() {
        let h = hierarchy();
        let corpus = AnnotationCorpus::from_pairs([
            ("A", "X"),
            ("A", "Y"),
            ("B", "Z"),
            ("C", "Y"),
            ("C", "R"),
        ]);
        let table = specificity(&corpus, &h);
        let prepared = prepare_entities(&corpus, &h, corpus.entities(), 1);
        let matrix = SimilarityEngine::new(&table).build_matrix(&prepared, false);
        let fresh = SimilarityEngine::new(&table);
        for (i, a) in prepared.entities.iter().enumerate() {
            for (j, b) in prepared.entities.iter().enumerate() {
                if i != j {
                    assert_eq!(
                        matrix.values()[[i, j]],
                        fresh.entity_similarity(&a.terms, &b.terms)
                    );
                }
            }
        }
    }

    #[test]
    fn similarity_vector_excludes_self_and_sorts_descending() {
        let matrix = SimilarityMatrix::from_parts(
            vec!["A".into(), "B".into(), "C".into()],
            array![[5.0, 1.0, 2.0], [1.0, 0.0, 3.0], [2.0, 3.0, 0.0]],
        )
        .unwrap();
        assert_eq!(matrix.values()[[0, 0]], 0.0);
        let vector = matrix.similarity_vector("a").unwrap();
        assert_eq!(vector, vec![("C", 2.0), ("B", 1.0)]);
        assert!(matches!(
            matrix.similarity_vector("Z"),
            Err(SimilarityError::UnknownEntity(_))
        ));
    }

    #[test]
    fn external_matrices_are_validated() {
        assert!(matches!(
            SimilarityMatrix::from_parts(vec!["A".into()], Array2::zeros((1, 2))),
            Err(SimilarityError::NotSquare { rows: 1, cols: 2 })
        ));
        assert!(matches!(
            SimilarityMatrix::from_parts(
                vec!["A".into(), "B".into()],
                array![[0.0, 1.0], [2.0, 0.0]]
            ),
            Err(SimilarityError::Asymmetric { row: 0, col: 1 })
        ));
        assert!(matches!(
            SimilarityMatrix::from_parts(
                vec!["A".into(), "B".into()],
                array![[0.0, f64::NAN], [f64::NAN, 0.0]]
            ),
            Err(SimilarityError::InvalidEntry { .. })
        ));
        assert!(matches!(
            SimilarityMatrix::from_parts(vec!["A".into(), "a".into()], Array2::zeros((2, 2))),
            Err(SimilarityError::DuplicateEntity(_))
        ));
    }
}
