//! Entity similarity and the sparse neighbor graph built from it.

pub mod similarity;
pub mod threshold;

pub use similarity::{
    EntityTerms, ExclusionReport, MicaCache, PreparedEntities, SimilarityEngine, SimilarityError,
    SimilarityMatrix, prepare_entities,
};
pub use threshold::{Network, NetworkError, default_degree, threshold};
