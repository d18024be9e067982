//! # Annotation Corpus
//!
//! Reads a GAF (Gene Association File) and keeps, for every entity, the
//! distinct set of terms explicitly assigned to it, together with the number
//! of annotation records that name each term.
//!
//! Entities are keyed by the `DB_Object_Symbol` column. Only explicit
//! assignments are stored; implied (ancestor) assignments are the business of
//! the specificity model.

use ahash::AHashMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

use super::hierarchy::TermHierarchy;
use crate::shared::files::open_text;

const SYMBOL_COLUMN: usize = 2;
const QUALIFIER_COLUMN: usize = 3;
const TERM_COLUMN: usize = 4;
const EVIDENCE_COLUMN: usize = 6;
const ASPECT_COLUMN: usize = 8;
/// GAF 1.0 rows carry 15 columns, GAF 2.x rows 17. Everything read here lives
/// in the first nine.
const MIN_COLUMNS: usize = 15;

#[derive(Error, Debug)]
pub enum AnnotationError {
    #[error("I/O error while reading the annotation corpus: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse the annotation corpus: {0}")]
    Csv(#[from] csv::Error),

    #[error(
        "Annotation record at line {line} has {found} columns, but at least 15 are required."
    )]
    TooFewColumns { line: u64, found: usize },

    #[error("Annotation record at line {line} has an empty '{column}' field.")]
    EmptyField { line: u64, column: &'static str },

    #[error("Unknown ontology aspect '{0}'. Expected one of P, F or C.")]
    UnknownAspect(String),
}

/// The three GO namespaces, as coded in GAF column 9.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Aspect {
    #[serde(rename = "P")]
    Process,
    #[serde(rename = "F")]
    Function,
    #[serde(rename = "C")]
    Component,
}

impl Aspect {
    pub fn code(self) -> &'static str {
        match self {
            Aspect::Process => "P",
            Aspect::Function => "F",
            Aspect::Component => "C",
        }
    }
}

impl fmt::Display for Aspect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Aspect {
    type Err = AnnotationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "P" | "BP" | "BIOLOGICAL_PROCESS" => Ok(Aspect::Process),
            "F" | "MF" | "MOLECULAR_FUNCTION" => Ok(Aspect::Function),
            "C" | "CC" | "CELLULAR_COMPONENT" => Ok(Aspect::Component),
            _ => Err(AnnotationError::UnknownAspect(s.to_string())),
        }
    }
}

/// Row-level filters applied while reading a GAF.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationFilter {
    /// Keep only rows of this aspect. `None` keeps all three.
    pub aspect: Option<Aspect>,
    /// Drop rows whose qualifier contains `NOT`.
    pub skip_negated: bool,
    /// Evidence codes to drop, e.g. `IEA`.
    pub exclude_evidence: Vec<String>,
}

impl Default for AnnotationFilter {
    fn default() -> Self {
        Self {
            aspect: None,
            skip_negated: true,
            exclude_evidence: Vec::new(),
        }
    }
}

impl AnnotationFilter {
    fn excludes_evidence(&self, code: &str) -> bool {
        self.exclude_evidence
            .iter()
            .any(|excluded| excluded.eq_ignore_ascii_case(code))
    }
}

fn is_negated(qualifier: &str) -> bool {
    qualifier
        .split('|')
        .any(|q| q.trim().eq_ignore_ascii_case("NOT"))
}

#[derive(Debug, Default)]
struct SkipCounts {
    aspect: u64,
    negated: u64,
    evidence: u64,
}

/// Entity -> explicitly assigned terms, plus per-term record counts.
#[derive(Debug, Clone, Default)]
pub struct AnnotationCorpus {
    /// Sorted, distinct term ids per entity.
    entities: BTreeMap<String, Vec<String>>,
    explicit: AHashMap<String, u64>,
    /// Uppercased entity name -> stored entity name.
    folded: AHashMap<String, String>,
    records: u64,
}

impl AnnotationCorpus {
    pub fn from_gaf_path(path: &Path, filter: &AnnotationFilter) -> Result<Self, AnnotationError> {
        info!("Loading annotation corpus from '{}'", path.display());
        Self::from_gaf_reader(open_text(path)?, filter)
    }

    pub fn from_gaf_reader<R: Read>(reader: R, filter: &AnnotationFilter) -> Result<Self, AnnotationError> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .comment(Some(b'!'))
            .flexible(true)
            .quoting(false)
            .from_reader(reader);

        let mut corpus = AnnotationCorpus::default();
        let mut skipped = SkipCounts::default();
        let mut record = csv::StringRecord::new();

        while csv_reader.read_record(&mut record)? {
            let line = record.position().map_or(0, |p| p.line());
            if record.len() == 1 && record[0].trim().is_empty() {
                continue;
            }
            if record.len() < MIN_COLUMNS {
                return Err(AnnotationError::TooFewColumns {
                    line,
                    found: record.len(),
                });
            }

            if let Some(aspect) = filter.aspect {
                if record[ASPECT_COLUMN].trim() != aspect.code() {
                    skipped.aspect += 1;
                    continue;
                }
            }
            if filter.skip_negated && is_negated(&record[QUALIFIER_COLUMN]) {
                skipped.negated += 1;
                continue;
            }
            if filter.excludes_evidence(record[EVIDENCE_COLUMN].trim()) {
                skipped.evidence += 1;
                continue;
            }

            let symbol = record[SYMBOL_COLUMN].trim();
            if symbol.is_empty() {
                return Err(AnnotationError::EmptyField {
                    line,
                    column: "DB_Object_Symbol",
                });
            }
            let term = record[TERM_COLUMN].trim();
            if term.is_empty() {
                return Err(AnnotationError::EmptyField {
                    line,
                    column: "GO_ID",
                });
            }
            corpus.insert(symbol, term);
        }
        corpus.finish();

        debug!(
            "Skipped annotation records: {} outside the requested aspect, {} negated, {} by evidence code",
            skipped.aspect, skipped.negated, skipped.evidence
        );
        info!(
            "Annotation corpus loaded: {} records, {} entities, {} distinct terms",
            corpus.records,
            corpus.entities.len(),
            corpus.explicit.len()
        );
        Ok(corpus)
    }

    /// Builds a corpus from `(entity, term)` records. Each pair counts as one
    /// annotation record.
    pub fn from_pairs<I, E, T>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (E, T)>,
        E: AsRef<str>,
        T: AsRef<str>,
    {
        let mut corpus = AnnotationCorpus::default();
        for (entity, term) in pairs {
            corpus.insert(entity.as_ref(), term.as_ref());
        }
        corpus.finish();
        corpus
    }

    fn insert(&mut self, entity: &str, term: &str) {
        self.records += 1;
        *self.explicit.entry(term.to_string()).or_insert(0) += 1;
        self.entities
            .entry(entity.to_string())
            .or_default()
            .push(term.to_string());
    }

    fn finish(&mut self) {
        self.folded.clear();
        for (entity, terms) in &mut self.entities {
            terms.sort_unstable();
            terms.dedup();
            if let Some(previous) = self
                .folded
                .insert(entity.to_ascii_uppercase(), entity.clone())
            {
                warn!(
                    "Entities '{previous}' and '{entity}' differ only by case; case-insensitive lookups resolve to '{entity}'"
                );
            }
        }
    }

    /// Distinct terms explicitly assigned to `entity` (exact name).
    pub fn terms_of(&self, entity: &str) -> Option<&[String]> {
        self.entities.get(entity).map(Vec::as_slice)
    }

    /// Resolves an entity name case-insensitively to its stored spelling.
    pub fn find_entity(&self, name: &str) -> Option<&str> {
        if let Some((stored, _)) = self.entities.get_key_value(name) {
            return Some(stored.as_str());
        }
        self.folded
            .get(&name.trim().to_ascii_uppercase())
            .map(String::as_str)
    }

    /// Entity names in sorted order.
    pub fn entities(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Number of annotation records naming `term`.
    pub fn explicit_count(&self, term: &str) -> u64 {
        self.explicit.get(term).copied().unwrap_or(0)
    }

    pub fn explicit_counts(&self) -> impl Iterator<Item = (&str, u64)> {
        self.explicit.iter().map(|(term, &count)| (term.as_str(), count))
    }

    pub fn record_count(&self) -> u64 {
        self.records
    }

    /// Drops every record whose term is not part of `hierarchy` (obsolete or
    /// from a different release). Entities left without terms are removed.
    /// Returns the number of dropped records.
    pub fn retain_known_terms(&mut self, hierarchy: &TermHierarchy) -> u64 {
        let mut dropped = 0u64;
        let mut unknown_terms = 0usize;
        self.explicit.retain(|term, count| {
            let known = hierarchy.index_of(term).is_some();
            if !known {
                dropped += *count;
                unknown_terms += 1;
            }
            known
        });
        if dropped == 0 {
            return 0;
        }

        let explicit = &self.explicit;
        self.entities.retain(|_, terms| {
            terms.retain(|term| explicit.contains_key(term));
            !terms.is_empty()
        });
        self.records -= dropped;
        self.finish();

        warn!(
            "Dropped {dropped} annotation records referencing {unknown_terms} terms absent from the hierarchy"
        );
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onto::hierarchy::parse_obo;

    fn gaf_row(symbol: &str, qualifier: &str, term: &str, evidence: &str, aspect: &str) -> String {
        format!(
            "UniProtKB\tP{symbol}\t{symbol}\t{qualifier}\t{term}\tPMID:1\t{evidence}\t\t{aspect}\t{symbol} kinase\t\tprotein\ttaxon:9606\t20200101\tUniProt\t\t\n"
        )
    }

    fn sample_gaf() -> String {
        let mut text = String::from("!gaf-version: 2.2\n!generated-by: test\n");
        text.push_str(&gaf_row("CDK1", "enables", "GO:0000002", "IDA", "F"));
        text.push_str(&gaf_row("CDK1", "involved_in", "GO:0000003", "IEA", "P"));
        text.push_str(&gaf_row("CDK1", "enables", "GO:0000002", "IPI", "F"));
        text.push_str(&gaf_row("CDK2", "NOT|enables", "GO:0000004", "IDA", "F"));
        text.push_str(&gaf_row("CDK2", "enables", "GO:0000005", "TAS", "F"));
        text
    }

    #[test]
    fn reads_entities_and_explicit_counts() {
        let filter = AnnotationFilter {
            skip_negated: false,
            ..AnnotationFilter::default()
        };
        let corpus = AnnotationCorpus::from_gaf_reader(sample_gaf().as_bytes(), &filter).unwrap();
        assert_eq!(corpus.record_count(), 5);
        assert_eq!(corpus.entities().collect::<Vec<_>>(), vec!["CDK1", "CDK2"]);
        assert_eq!(
            corpus.terms_of("CDK1").unwrap(),
            &["GO:0000002".to_string(), "GO:0000003".to_string()]
        );
        assert_eq!(corpus.explicit_count("GO:0000002"), 2);
        assert_eq!(corpus.explicit_count("GO:0000004"), 1);
        assert_eq!(corpus.explicit_count("GO:9999999"), 0);
    }

    #[test]
    fn default_filter_skips_negated_rows() {
        let corpus =
            AnnotationCorpus::from_gaf_reader(sample_gaf().as_bytes(), &AnnotationFilter::default())
                .unwrap();
        assert_eq!(corpus.record_count(), 4);
        assert_eq!(corpus.terms_of("CDK2").unwrap(), &["GO:0000005".to_string()]);
    }

    #[test]
    fn aspect_and_evidence_filters_apply() {
        let filter = AnnotationFilter {
            aspect: Some(Aspect::Function),
            skip_negated: true,
            exclude_evidence: vec!["tas".to_string()],
        };
        let corpus = AnnotationCorpus::from_gaf_reader(sample_gaf().as_bytes(), &filter).unwrap();
        assert_eq!(corpus.entities().collect::<Vec<_>>(), vec!["CDK1"]);
        assert_eq!(corpus.terms_of("CDK1").unwrap(), &["GO:0000002".to_string()]);
        assert!(corpus.terms_of("CDK2").is_none());
    }

    #[test]
    fn short_rows_are_rejected_with_line_numbers() {
        let text = "UniProtKB\tP1\tCDK1\n";
        match AnnotationCorpus::from_gaf_reader(text.as_bytes(), &AnnotationFilter::default()) {
            Err(AnnotationError::TooFewColumns { line, found }) => {
                assert_eq!(line, 1);
                assert_eq!(found, 3);
            }
            other => panic!("expected TooFewColumns, got {other:?}"),
        }
    }

    #[test]
    fn entity_lookup_is_case_insensitive() {
        let corpus = AnnotationCorpus::from_pairs([("CDK1", "GO:1"), ("Mapk1", "GO:2")]);
        assert_eq!(corpus.find_entity("cdk1"), Some("CDK1"));
        assert_eq!(corpus.find_entity("MAPK1"), Some("Mapk1"));
        assert_eq!(corpus.find_entity("PLK1"), None);
    }

    #[test]
    fn unknown_terms_are_dropped_against_the_hierarchy() {
        let obo = "[Term]\nid: GO:1\n\n[Term]\nid: GO:2\nis_a: GO:1\n";
        let hierarchy = parse_obo(obo.as_bytes()).unwrap();
        let mut corpus = AnnotationCorpus::from_pairs([
            ("A", "GO:1"),
            ("A", "GO:9"),
            ("B", "GO:9"),
            ("B", "GO:9"),
            ("C", "GO:2"),
        ]);
        assert_eq!(corpus.retain_known_terms(&hierarchy), 3);
        assert_eq!(corpus.record_count(), 2);
        assert_eq!(corpus.entity_count(), 2);
        assert_eq!(corpus.entities().collect::<Vec<_>>(), vec!["A", "C"]);
        assert_eq!(corpus.explicit_count("GO:9"), 0);
        assert_eq!(corpus.find_entity("b"), None);
    }

    #[test]
    fn aspect_parses_codes_and_names() {
        assert_eq!("p".parse::<Aspect>().unwrap(), Aspect::Process);
        assert_eq!("MF".parse::<Aspect>().unwrap(), Aspect::Function);
        assert_eq!(
            "cellular_component".parse::<Aspect>().unwrap(),
            Aspect::Component
        );
        assert!("X".parse::<Aspect>().is_err());
    }
}
