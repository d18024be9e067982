//! Vocabulary side of the pipeline: the term hierarchy, the annotation corpus
//! and the specificity model derived from both.

pub mod annotations;
pub mod hierarchy;
pub mod specificity;

pub use annotations::{AnnotationCorpus, AnnotationError, AnnotationFilter, Aspect};
pub use hierarchy::{HierarchyBuilder, OntologyError, Term, TermHierarchy, parse_obo};
pub use specificity::{SpecificityTable, specificity};
