//! Term specificity (information content).
//!
//! An annotation to a term implies an annotation to every one of its
//! ancestors. The implied count of a term is therefore its own explicit count
//! plus the explicit counts of all of its descendants, and its specificity is
//! `-ln(implied / total implied)`.
//!
//! Terms with an implied count of zero have no specificity. They are never
//! annotated, directly or through a descendant, so they cannot appear as a
//! common ancestor of two annotations and are skipped during MICA search.

use log::{debug, info};
use std::collections::BTreeMap;

use super::annotations::AnnotationCorpus;
use super::hierarchy::TermHierarchy;

/// Per-term specificity, bound to the hierarchy it was computed against.
#[derive(Debug, Clone)]
pub struct SpecificityTable<'h> {
    hierarchy: &'h TermHierarchy,
    implied: Vec<u64>,
    values: Vec<Option<f64>>,
    total: u64,
}

/// Computes the specificity of every term in `hierarchy` from the explicit
/// counts in `corpus`. Corpus terms absent from the hierarchy are ignored.
pub fn specificity<'h>(corpus: &AnnotationCorpus, hierarchy: &'h TermHierarchy) -> SpecificityTable<'h> {
    let mut implied = vec![0u64; hierarchy.len()];
    let mut unknown = 0u64;

    for (term, count) in corpus.explicit_counts() {
        let Some(idx) = hierarchy.index_of(term) else {
            unknown += count;
            continue;
        };
        implied[idx] += count;
        for &ancestor in hierarchy.closure_of(idx) {
            implied[ancestor] += count;
        }
    }
    if unknown > 0 {
        debug!("{unknown} annotation records name terms outside the hierarchy and were not counted");
    }

    let total: u64 = implied.iter().sum();
    let values: Vec<Option<f64>> = implied
        .iter()
        .map(|&count| {
            if count == 0 {
                None
            } else {
                // count <= total, so the ratio is in (0, 1] and the value is >= 0.
                Some(-(count as f64 / total as f64).ln().min(0.0))
            }
        })
        .collect();

    let scored = values.iter().filter(|v| v.is_some()).count();
    info!(
        "Specificity computed for {scored} of {} terms ({} implied annotations)",
        hierarchy.len(),
        total
    );

    SpecificityTable {
        hierarchy,
        implied,
        values,
        total,
    }
}

impl<'h> SpecificityTable<'h> {
    pub fn hierarchy(&self) -> &'h TermHierarchy {
        self.hierarchy
    }

    /// `None` for unknown terms and for terms with no implied annotations.
    pub fn get(&self, id: &str) -> Option<f64> {
        self.hierarchy.index_of(id).and_then(|idx| self.values[idx])
    }

    pub fn of_index(&self, idx: usize) -> Option<f64> {
        self.values[idx]
    }

    pub fn implied_count(&self, id: &str) -> u64 {
        self.hierarchy
            .index_of(id)
            .map_or(0, |idx| self.implied[idx])
    }

    /// Sum of implied counts over all terms.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Term id -> specificity for every term that has one.
    pub fn to_map(&self) -> BTreeMap<String, f64> {
        self.values
            .iter()
            .enumerate()
            .filter_map(|(idx, value)| value.map(|v| (self.hierarchy.term(idx).id.clone(), v)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onto::hierarchy::{HierarchyBuilder, Term};
    use approx::assert_abs_diff_eq;

    /// R is the root, X and Y are children of R, Z is a child of X.
    fn small_hierarchy() -> TermHierarchy {
        let mut builder = HierarchyBuilder::new();
        builder.add(Term::new("R")).unwrap();
        builder.add(Term::new("X").with_parents(["R"])).unwrap();
        builder.add(Term::new("Y").with_parents(["R"])).unwrap();
        builder.add(Term::new("Z").with_parents(["X"])).unwrap();
        builder.build().unwrap()
    }

    #[test]
    fn implied_counts_flow_up_the_hierarchy() {
        let hierarchy = small_hierarchy();
        let corpus = AnnotationCorpus::from_pairs([("P1", "X"), ("P2", "X"), ("P3", "Z")]);
        let table = specificity(&corpus, &hierarchy);
        assert_eq!(table.implied_count("X"), 3);
        assert_eq!(table.implied_count("Z"), 1);
        assert_eq!(table.implied_count("R"), 3);
        assert_eq!(table.implied_count("Y"), 0);
        assert_eq!(table.total(), 7);
    }

    #[test]
    fn values_follow_negative_log_frequency() {
        let hierarchy = small_hierarchy();
        let corpus = AnnotationCorpus::from_pairs([("P1", "X"), ("P2", "X"), ("P3", "Z")]);
        let table = specificity(&corpus, &hierarchy);
        assert_abs_diff_eq!(table.get("Z").unwrap(), (7.0f64).ln(), epsilon = 1e-12);
        assert_abs_diff_eq!(
            table.get("X").unwrap(),
            -(3.0f64 / 7.0).ln(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn zero_count_terms_have_no_specificity() {
        let hierarchy = small_hierarchy();
        let corpus = AnnotationCorpus::from_pairs([("P1", "Z")]);
        let table = specificity(&corpus, &hierarchy);
        assert!(table.get("Y").is_none());
        assert!(table.get("missing").is_none());
        assert!(!table.to_map().contains_key("Y"));
        assert_eq!(table.to_map().len(), 3);
    }

    #[test]
    fn specificity_is_non_negative_and_grows_towards_leaves() {
        let hierarchy = small_hierarchy();
        let corpus = AnnotationCorpus::from_pairs([
            ("P1", "R"),
            ("P2", "X"),
            ("P3", "Y"),
            ("P4", "Z"),
            ("P5", "Z"),
        ]);
        let table = specificity(&corpus, &hierarchy);
        let root = table.get("R").unwrap();
        for (term, value) in table.to_map() {
            assert!(value >= 0.0, "{term} has negative specificity {value}");
            assert!(root <= value, "root is more specific than {term}");
        }
        assert!(table.get("X").unwrap() <= table.get("Z").unwrap());
    }

    #[test]
    fn empty_corpus_scores_nothing() {
        let hierarchy = small_hierarchy();
        let table = specificity(&AnnotationCorpus::default(), &hierarchy);
        assert_eq!(table.total(), 0);
        assert!(table.to_map().is_empty());
    }
}
