//! End-to-end orchestration: load inputs, build the similarity network, run a
//! query and write the reports.

use log::{info, warn};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::{ConfigError, RunConfig};
use crate::diffuse::{
    CrossValidation, DiffusionEngine, DiffusionError, DiffusionResult, ValidationError, leave_one_out_named,
};
use crate::network::{
    ExclusionReport, Network, NetworkError, SimilarityEngine, SimilarityMatrix, prepare_entities, threshold,
};
use crate::onto::{AnnotationCorpus, AnnotationError, OntologyError, TermHierarchy, specificity};
use crate::query::{EntityVocabulary, QueryError, ValidatedQuery, parse_query, validate_query};
use crate::report::{ClusterView, ReportError, write_result_table, write_roc};
use crate::shared::files::output_path;

pub const DIFFUSION_TABLE: &str = "diffusion.tsv";
pub const VALIDATION_TABLE: &str = "validation.tsv";
pub const ROC_TABLE: &str = "roc.tsv";
pub const CLUSTER_JSON: &str = "cluster.json";

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Ontology(#[from] OntologyError),
    #[error(transparent)]
    Annotation(#[from] AnnotationError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Diffusion(#[from] DiffusionError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Report(#[from] ReportError),
    #[error("Failed to prepare the output directory: {0}")]
    Io(#[from] std::io::Error),
    #[error(
        "Only {0} entities have enough annotations to enter the network; at least 2 are required. Consider lowering corpus.min_terms."
    )]
    TooFewEntities(usize),
}

#[derive(Debug, Clone)]
pub struct InputPaths {
    pub ontology: PathBuf,
    pub annotations: PathBuf,
    /// Controlled vocabulary CSV. Without one, every corpus entity is allowed.
    pub vocabulary: Option<PathBuf>,
}

#[derive(Debug)]
pub struct LoadedInputs {
    pub hierarchy: TermHierarchy,
    pub corpus: AnnotationCorpus,
    pub vocabulary: EntityVocabulary,
    /// Annotation records dropped because their term is not in the hierarchy.
    pub dropped_records: u64,
}

pub fn load_inputs(paths: &InputPaths, config: &RunConfig) -> Result<LoadedInputs, PipelineError> {
    let hierarchy = TermHierarchy::from_obo_path(&paths.ontology)?;
    let mut corpus = AnnotationCorpus::from_gaf_path(&paths.annotations, &config.corpus.filter())?;
    let dropped_records = corpus.retain_known_terms(&hierarchy);
    info!(
        "{} annotated entities remain after matching terms to the hierarchy",
        corpus.entity_count()
    );
    let vocabulary = match &paths.vocabulary {
        Some(path) => EntityVocabulary::from_csv_path(path)?,
        None => EntityVocabulary::from_names(corpus.entities()),
    };
    Ok(LoadedInputs {
        hierarchy,
        corpus,
        vocabulary,
        dropped_records,
    })
}

#[derive(Debug)]
pub struct BuiltNetwork {
    pub network: Network,
    pub matrix: SimilarityMatrix,
    pub excluded: ExclusionReport,
}

/// Specificity, all-pairs similarity over the vocabulary's entities, then
/// top-k thresholding.
pub fn build_network(inputs: &LoadedInputs, config: &RunConfig) -> Result<BuiltNetwork, PipelineError> {
    let table = specificity(&inputs.corpus, &inputs.hierarchy);
    let prepared = prepare_entities(
        &inputs.corpus,
        &inputs.hierarchy,
        inputs.vocabulary.names(),
        config.corpus.min_terms,
    );
    if prepared.entities.len() < 2 {
        return Err(PipelineError::TooFewEntities(prepared.entities.len()));
    }
    let matrix = SimilarityEngine::new(&table).build_matrix(&prepared, config.network.progress);
    let network = threshold(&matrix, config.network.neighbors)?;
    info!(
        "Network built: {} entities, {} edges",
        network.len(),
        network.edge_count()
    );
    Ok(BuiltNetwork {
        network,
        matrix,
        excluded: prepared.excluded,
    })
}

pub fn diffusion_engine<'n>(network: &'n Network, config: &RunConfig) -> Result<DiffusionEngine<'n>, PipelineError> {
    Ok(DiffusionEngine::new(
        network,
        config.diffusion.solver.build(),
        config.diffusion.settings(),
    )?)
}

#[derive(Debug)]
pub struct QueryOutcome {
    pub query: ValidatedQuery,
    pub diffusion: DiffusionResult,
    pub cross_validation: Option<CrossValidation>,
    pub cluster: ClusterView,
}

/// Validates `query_text`, diffuses from the accepted entities and, when
/// `with_validation` is set, runs leave-one-out. Too few seeds, or no
/// non-seed entity left, is logged and skips validation rather than failing
/// the query. The cluster view uses the validation scores when they exist.
pub fn run_query(
    built: &BuiltNetwork,
    vocabulary: &EntityVocabulary,
    query_text: &str,
    config: &RunConfig,
    with_validation: bool,
) -> Result<QueryOutcome, PipelineError> {
    let tokens = parse_query(query_text);
    let query = validate_query(&tokens, vocabulary, &built.network)?;
    let engine = diffusion_engine(&built.network, config)?;
    let diffusion = engine.diffuse(&query.accepted)?;

    let cross_validation = if with_validation {
        match leave_one_out_named(&engine, &query.accepted) {
            Ok(cv) => Some(cv),
            Err(ValidationError::InsufficientLabels(count)) => {
                warn!(
                    "Skipping leave-one-out validation: {count} usable seed(s), at least 2 are required"
                );
                None
            }
            Err(ValidationError::DegenerateLabels) => {
                warn!(
                    "Skipping leave-one-out validation: every network entity is a seed, so there are no negatives"
                );
                None
            }
            Err(e) => return Err(e.into()),
        }
    } else {
        None
    };

    let cutoff = config.report.zscore_cutoff;
    let cluster = match &cross_validation {
        Some(cv) => ClusterView::from_cross_validation(cv, &built.network, cutoff),
        None => ClusterView::new(&diffusion, &built.network, cutoff),
    };
    Ok(QueryOutcome {
        query,
        diffusion,
        cross_validation,
        cluster,
    })
}

/// Writes every report of `outcome` into `dir` and returns the written paths.
pub fn write_outputs(outcome: &QueryOutcome, dir: &Path) -> Result<Vec<PathBuf>, PipelineError> {
    let mut written = Vec::new();

    let path = output_path(dir, DIFFUSION_TABLE)?;
    write_result_table(&path, &outcome.diffusion.table())?;
    written.push(path);

    if let Some(cv) = &outcome.cross_validation {
        let path = output_path(dir, VALIDATION_TABLE)?;
        write_result_table(&path, &cv.table())?;
        written.push(path);

        let path = output_path(dir, ROC_TABLE)?;
        write_roc(&path, cv.roc())?;
        written.push(path);
    }

    let path = output_path(dir, CLUSTER_JSON)?;
    outcome.cluster.write_json(&path)?;
    written.push(path);

    Ok(written)
}
