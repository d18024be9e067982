use flate2::Compression;
use flate2::write::GzEncoder;
use std::fmt::Write as FmtWrite;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use kinmap::config::RunConfig;
use kinmap::pipeline::{
    self, CLUSTER_JSON, DIFFUSION_TABLE, InputPaths, PipelineError, ROC_TABLE, VALIDATION_TABLE,
};
use kinmap::query::QueryError;

const ROOT: &str = "GO:0000001";
const BRANCH_A: &str = "GO:0000010";
const BRANCH_B: &str = "GO:0000020";

fn leaf(branch: char, i: usize) -> String {
    match branch {
        'A' => format!("GO:000011{i}"),
        _ => format!("GO:000012{i}"),
    }
}

fn obo_text() -> String {
    let mut text = String::from("format-version: 1.2\nontology: go\n\n");
    writeln!(
        text,
        "[Term]\nid: {ROOT}\nname: biological_process\nnamespace: biological_process\n"
    )
    .unwrap();
    for (branch, id) in [('A', BRANCH_A), ('B', BRANCH_B)] {
        writeln!(
            text,
            "[Term]\nid: {id}\nname: branch {branch}\nis_a: {ROOT} ! biological_process\n"
        )
        .unwrap();
        for i in 0..5 {
            writeln!(
                text,
                "[Term]\nid: {}\nname: leaf {branch}{i}\nis_a: {id} ! branch {branch}\n",
                leaf(branch, i)
            )
            .unwrap();
        }
    }
    text.push_str("[Typedef]\nid: part_of\nname: part of\n");
    text
}

fn gaf_line(symbol: &str, term: &str) -> String {
    format!(
        "UniProtKB\tP_{symbol}\t{symbol}\t\t{term}\tPMID:1\tIDA\t\tP\t{symbol} kinase\t\tprotein\ttaxon:9606\t20200101\tUniProt\n"
    )
}

/// Two groups of four kinases with overlapping leaf terms inside their own
/// branch, one kinase with a single term and one annotated to an unknown term.
fn gaf_text() -> String {
    let mut text = String::from("!gaf-version: 2.2\n");
    for branch in ['A', 'B'] {
        for i in 0..4 {
            let symbol = format!("K{branch}{i}");
            text.push_str(&gaf_line(&symbol, &leaf(branch, i)));
            text.push_str(&gaf_line(&symbol, &leaf(branch, i + 1)));
        }
    }
    text.push_str(&gaf_line("LONELY", &leaf('A', 0)));
    text.push_str(&gaf_line("GHOST", "GO:9999999"));
    text
}

struct Fixture {
    dir: TempDir,
    paths: InputPaths,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let ontology = dir.path().join("go.obo");
    std::fs::write(&ontology, obo_text()).unwrap();

    let annotations = dir.path().join("goa.gaf.gz");
    let mut encoder = GzEncoder::new(File::create(&annotations).unwrap(), Compression::default());
    encoder.write_all(gaf_text().as_bytes()).unwrap();
    encoder.finish().unwrap();

    let vocabulary = dir.path().join("kinases.csv");
    let mut csv = String::from("gene_symbol,uniprot\n");
    for branch in ['A', 'B'] {
        for i in 0..4 {
            writeln!(csv, "K{branch}{i},Q{branch}{i}").unwrap();
        }
    }
    csv.push_str("LONELY,QL\nGHOST,QG\n");
    std::fs::write(&vocabulary, csv).unwrap();

    Fixture {
        paths: InputPaths {
            ontology,
            annotations,
            vocabulary: Some(vocabulary),
        },
        dir,
    }
}

fn test_config() -> RunConfig {
    let mut config = RunConfig::default();
    config.corpus.min_terms = 2;
    config.network.neighbors = Some(2);
    config.network.progress = false;
    config
}

fn out_dir(dir: &Path) -> PathBuf {
    dir.join("results").join("run1")
}

#[test]
fn query_runs_end_to_end_and_writes_every_report() {
    let fixture = fixture();
    let config = test_config();

    let inputs = pipeline::load_inputs(&fixture.paths, &config).unwrap();
    assert_eq!(inputs.hierarchy.len(), 13);
    assert_eq!(inputs.dropped_records, 1);
    assert_eq!(inputs.vocabulary.len(), 10);

    let built = pipeline::build_network(&inputs, &config).unwrap();
    assert_eq!(built.network.len(), 8);
    assert_eq!(built.excluded.under_annotated, vec!["LONELY".to_string()]);
    assert_eq!(built.excluded.not_annotated, vec!["GHOST".to_string()]);
    for (a, b) in built.network.edges() {
        let entities = built.network.entities();
        assert_eq!(
            entities[a].chars().nth(1),
            entities[b].chars().nth(1),
            "edge {} - {} crosses branches",
            entities[a],
            entities[b]
        );
    }

    let outcome = pipeline::run_query(&built, &inputs.vocabulary, "ka0, qa1 unknown1", &config, true)
        .unwrap();
    assert_eq!(outcome.query.accepted, vec!["KA0", "KA1"]);
    assert_eq!(outcome.query.unrecognized, vec!["UNKNOWN1"]);
    assert!(outcome.diffusion.convergence().converged);

    let same_branch = outcome.diffusion.score_of("KA2").unwrap();
    let other_branch = outcome.diffusion.score_of("KB2").unwrap();
    assert!(same_branch > other_branch);
    let ranked = outcome.diffusion.ranked();
    assert!(ranked[0].entity.starts_with("KA"));
    assert!(ranked[1].entity.starts_with("KA"));

    let cv = outcome.cross_validation.as_ref().unwrap();
    assert!(cv.non_converged().is_empty());
    assert!(cv.auc() > 0.6, "auc = {}", cv.auc());

    let out = out_dir(fixture.dir.path());
    let written = pipeline::write_outputs(&outcome, &out).unwrap();
    let names: Vec<String> = written
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(
        names,
        vec![DIFFUSION_TABLE, VALIDATION_TABLE, ROC_TABLE, CLUSTER_JSON]
    );

    let diffusion = std::fs::read_to_string(out.join(DIFFUSION_TABLE)).unwrap();
    assert_eq!(diffusion.lines().count(), 9);
    assert!(diffusion.starts_with("entity\tinitial_label\tfinal_score\tz_score\trank\n"));

    let cluster: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(out.join(CLUSTER_JSON)).unwrap()).unwrap();
    let nodes = cluster["nodes"].as_array().unwrap();
    assert_eq!(nodes[0]["id"], "KA0");
    assert!(nodes.iter().all(|node| node["id"].as_str().unwrap().starts_with("KA")));
    for seed in nodes.iter().filter(|node| node["seed"] == true) {
        assert!(seed["z_score"].is_number(), "seed {} has no z-score", seed["id"]);
        assert!(seed["rank"].is_u64());
    }
    let seed_count = nodes.iter().filter(|node| node["seed"] == true).count();
    assert_eq!(seed_count, 2);
}

#[test]
fn single_seed_query_skips_validation_reports() {
    let fixture = fixture();
    let config = test_config();
    let inputs = pipeline::load_inputs(&fixture.paths, &config).unwrap();
    let built = pipeline::build_network(&inputs, &config).unwrap();

    let outcome = pipeline::run_query(&built, &inputs.vocabulary, "KB3", &config, true).unwrap();
    assert!(outcome.cross_validation.is_none());

    let out = out_dir(fixture.dir.path());
    let written = pipeline::write_outputs(&outcome, &out).unwrap();
    assert_eq!(written.len(), 2);
    assert!(!out.join(ROC_TABLE).exists());
}

#[test]
fn querying_every_network_entity_skips_validation() {
    let fixture = fixture();
    let config = test_config();
    let inputs = pipeline::load_inputs(&fixture.paths, &config).unwrap();
    let built = pipeline::build_network(&inputs, &config).unwrap();
    let everyone = built.network.entities().join(" ");

    let outcome = pipeline::run_query(&built, &inputs.vocabulary, &everyone, &config, true).unwrap();
    assert_eq!(outcome.query.accepted.len(), 8);
    assert!(outcome.cross_validation.is_none());
    assert!(outcome.cluster.nodes.iter().all(|node| node.seed));

    let out = out_dir(fixture.dir.path());
    let written = pipeline::write_outputs(&outcome, &out).unwrap();
    assert_eq!(written.len(), 2);
    assert!(!out.join(VALIDATION_TABLE).exists());
    let diffusion = std::fs::read_to_string(out.join(DIFFUSION_TABLE)).unwrap();
    assert_eq!(diffusion.lines().count(), 9);
}

#[test]
fn unusable_queries_and_sparse_corpora_fail_cleanly() {
    let fixture = fixture();
    let config = test_config();
    let inputs = pipeline::load_inputs(&fixture.paths, &config).unwrap();
    let built = pipeline::build_network(&inputs, &config).unwrap();

    match pipeline::run_query(&built, &inputs.vocabulary, "lonely nosuchkinase", &config, false) {
        Err(PipelineError::Query(QueryError::NoRecognizedEntities {
            unrecognized,
            not_in_network,
        })) => {
            assert_eq!(unrecognized, vec!["NOSUCHKINASE"]);
            assert_eq!(not_in_network, vec!["LONELY"]);
        }
        other => panic!("expected NoRecognizedEntities, got {other:?}"),
    }

    let mut strict = test_config();
    strict.corpus.min_terms = 3;
    assert!(matches!(
        pipeline::build_network(&inputs, &strict),
        Err(PipelineError::TooFewEntities(0))
    ));
}

#[test]
fn missing_inputs_surface_as_errors() {
    let fixture = fixture();
    let mut paths = fixture.paths.clone();
    paths.ontology = fixture.dir.path().join("missing.obo");
    assert!(matches!(
        pipeline::load_inputs(&paths, &test_config()),
        Err(PipelineError::Ontology(_))
    ));
}
