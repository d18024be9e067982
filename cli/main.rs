#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use env_logger::Env;
use log::{info, warn};
use std::path::PathBuf;
use std::process;

use kinmap::config::RunConfig;
use kinmap::diffuse::SolverKind;
use kinmap::onto::Aspect;
use kinmap::pipeline::{self, BuiltNetwork, InputPaths, LoadedInputs};

#[derive(Parser)]
#[command(
    name = "kinmap",
    version,
    about = "Annotation-similarity networks and label diffusion",
    long_about = "Builds a protein similarity network from shared Gene Ontology annotations, \
                  then ranks unlabeled proteins by network diffusion from a query set."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

/// Inputs and network options shared by every subcommand that builds a network.
#[derive(Args)]
struct NetworkArgs {
    /// OBO ontology file (plain or gzip-compressed)
    #[arg(value_name = "ONTOLOGY")]
    ontology: PathBuf,

    /// GAF annotation file (plain or gzip-compressed)
    #[arg(value_name = "ANNOTATIONS")]
    annotations: PathBuf,

    /// CSV with a gene_symbol column (and optional uniprot aliases) restricting the entity set
    #[arg(long)]
    vocabulary: Option<PathBuf>,

    /// TOML run configuration; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Restrict annotations to one aspect
    #[arg(long, value_parser = parse_aspect)]
    aspect: Option<Aspect>,

    /// Minimum distinct usable terms an entity needs to enter the network
    #[arg(long, value_name = "N")]
    min_terms: Option<usize>,

    /// Neighbors kept per entity (default: ceil(sqrt(entity count)))
    #[arg(long, value_name = "K")]
    neighbors: Option<usize>,

    /// Keep annotations carrying a NOT qualifier
    #[arg(long)]
    keep_negated: bool,

    /// Hide the similarity progress bar
    #[arg(long)]
    no_progress: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Diffuse a query set over the network and write the result tables
    #[command(about = "Rank entities by diffusion from a query set")]
    Diffuse {
        #[command(flatten)]
        network: NetworkArgs,

        /// Query entities, separated by whitespace, commas or semicolons
        #[arg(long, short)]
        query: String,

        /// Also run leave-one-out validation over the query set
        #[arg(long)]
        loo: bool,

        /// Directory receiving diffusion.tsv, validation.tsv, roc.tsv and cluster.json
        #[arg(long, default_value = "kinmap_out")]
        out: PathBuf,

        /// Linear solver for the diffusion system
        #[arg(long, value_enum)]
        solver: Option<SolverKind>,

        /// Z-score at or above which an unlabeled entity joins the cluster view
        #[arg(long, value_name = "Z")]
        zscore_cutoff: Option<f64>,
    },

    /// Print the network neighbors of one entity
    #[command(about = "List the neighbors of an entity")]
    Neighbors {
        #[command(flatten)]
        network: NetworkArgs,

        #[arg(value_name = "ENTITY")]
        entity: String,
    },

    /// Print one entity's similarity to every other entity, highest first
    #[command(about = "List similarities of an entity")]
    Similarity {
        #[command(flatten)]
        network: NetworkArgs,

        #[arg(value_name = "ENTITY")]
        entity: String,

        /// Print only the first N rows
        #[arg(long, value_name = "N")]
        limit: Option<usize>,
    },

    /// Show version information
    Version,
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Diffuse {
            network,
            query,
            loo,
            out,
            solver,
            zscore_cutoff,
        }) => run_diffuse(network, &query, loo, out, solver, zscore_cutoff),
        Some(Commands::Neighbors { network, entity }) => run_neighbors(network, &entity),
        Some(Commands::Similarity {
            network,
            entity,
            limit,
        }) => run_similarity(network, &entity, limit),
        Some(Commands::Version) => {
            print_version_info();
            Ok(())
        }
        None => Cli::command()
            .print_help()
            .map(|()| println!())
            .map_err(Into::into),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn parse_aspect(value: &str) -> Result<Aspect, String> {
    value.parse::<Aspect>().map_err(|e| e.to_string())
}

fn resolve_config(args: &NetworkArgs) -> Result<RunConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => RunConfig::load(path)?,
        None => RunConfig::default(),
    };
    if args.aspect.is_some() {
        config.corpus.aspect = args.aspect;
    }
    if let Some(min_terms) = args.min_terms {
        config.corpus.min_terms = min_terms;
    }
    if args.keep_negated {
        config.corpus.skip_negated = false;
    }
    if args.neighbors.is_some() {
        config.network.neighbors = args.neighbors;
    }
    if args.no_progress {
        config.network.progress = false;
    }
    Ok(config)
}

fn load_network(
    args: NetworkArgs,
    config: &RunConfig,
) -> Result<(LoadedInputs, BuiltNetwork), Box<dyn std::error::Error>> {
    let paths = InputPaths {
        ontology: args.ontology,
        annotations: args.annotations,
        vocabulary: args.vocabulary,
    };
    let inputs = pipeline::load_inputs(&paths, config)?;
    if inputs.dropped_records > 0 {
        warn!(
            "Dropped {} annotation records whose term is not in the ontology",
            inputs.dropped_records
        );
    }
    let built = pipeline::build_network(&inputs, config)?;
    if !built.excluded.is_empty() {
        warn!(
            "{} entities left out of the network: {} not annotated, {} under-annotated",
            built.excluded.total(),
            built.excluded.not_annotated.len(),
            built.excluded.under_annotated.len()
        );
    }
    Ok((inputs, built))
}

fn run_diffuse(
    network_args: NetworkArgs,
    query: &str,
    loo: bool,
    out: PathBuf,
    solver: Option<SolverKind>,
    zscore_cutoff: Option<f64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = resolve_config(&network_args)?;
    if let Some(solver) = solver {
        config.diffusion.solver = solver;
    }
    if let Some(cutoff) = zscore_cutoff {
        config.report.zscore_cutoff = cutoff;
    }
    config.validate()?;

    let (inputs, built) = load_network(network_args, &config)?;
    let outcome = pipeline::run_query(&built, &inputs.vocabulary, query, &config, loo)?;

    println!(
        "Seeds: {} accepted, {} unrecognized, {} not in network",
        outcome.query.accepted.len(),
        outcome.query.unrecognized.len(),
        outcome.query.not_in_network.len()
    );
    let convergence = outcome.diffusion.convergence();
    println!(
        "Diffusion: {} iterations, relative residual {:.3e}{}",
        convergence.iterations,
        convergence.residual_norm,
        if convergence.converged {
            ""
        } else {
            " (not converged)"
        }
    );
    if let Some(cv) = &outcome.cross_validation {
        println!("Leave-one-out AUC: {:.4}", cv.auc());
    }
    let hits: Vec<_> = outcome.cluster.nodes.iter().filter(|node| !node.seed).collect();
    println!(
        "Top hits (z >= {}): {}",
        config.report.zscore_cutoff,
        hits.len()
    );
    for node in hits.iter().take(20) {
        println!(
            "  {:>4}  {:<16} z = {:.3}",
            node.rank.unwrap_or(0),
            node.id,
            node.z_score.unwrap_or(0.0)
        );
    }

    let written = pipeline::write_outputs(&outcome, &out)?;
    for path in written {
        info!("Output written to '{}'", path.display());
    }
    Ok(())
}

fn run_neighbors(network_args: NetworkArgs, entity: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = resolve_config(&network_args)?;
    config.validate()?;
    let (_, built) = load_network(network_args, &config)?;
    let neighbors = built.network.neighbors(entity)?;
    println!("{} neighbors of {}:", neighbors.len(), entity.to_ascii_uppercase());
    for name in neighbors {
        let similarity = built.matrix.get(entity, name).unwrap_or(0.0);
        println!("  {name:<16} {similarity:.4}");
    }
    Ok(())
}

fn run_similarity(
    network_args: NetworkArgs,
    entity: &str,
    limit: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = resolve_config(&network_args)?;
    config.validate()?;
    let (_, built) = load_network(network_args, &config)?;
    let row = built.matrix.similarity_vector(entity)?;
    let shown = limit.unwrap_or(row.len()).min(row.len());
    for (name, similarity) in &row[..shown] {
        println!("{name}\t{similarity:.6}");
    }
    Ok(())
}

/// Format seconds into a human-readable duration like "2.4 hours ago"
fn format_duration_ago(seconds: u64) -> String {
    const MINUTE: u64 = 60;
    const HOUR: u64 = 60 * MINUTE;
    const DAY: u64 = 24 * HOUR;
    const YEAR: u64 = 365 * DAY;

    let (value, unit) = if seconds < MINUTE {
        return format!("{seconds} seconds ago");
    } else if seconds < HOUR {
        (seconds as f64 / MINUTE as f64, "minutes")
    } else if seconds < DAY {
        (seconds as f64 / HOUR as f64, "hours")
    } else if seconds < YEAR {
        (seconds as f64 / DAY as f64, "days")
    } else {
        (seconds as f64 / YEAR as f64, "years")
    };
    format!("{value:.1} {unit} ago")
}

fn print_version_info() {
    let version = env!("CARGO_PKG_VERSION");
    let build_timestamp: u64 = env!("KINMAP_BUILD_TIMESTAMP").parse().unwrap_or(0);

    println!("kinmap {version}");

    if build_timestamp > 0 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        if now > build_timestamp {
            println!("Built: {}", format_duration_ago(now - build_timestamp));
        } else {
            println!("Built: just now");
        }
    }
}
