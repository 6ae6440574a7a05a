//! Inspector for persisted graph-family artifacts.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use markov_estimator::graph::START_VERTEX;
use markov_estimator::{
    EstimatorConfig, GraphFamily, MarkovGraph, PathEstimate, ProcedureCatalog, Schema, VertexId,
};
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::EnvFilter;

const PROBABILITY_TOLERANCE: f64 = 1e-9;

#[derive(Parser, Debug)]
#[command(
    name = "markov-inspect",
    version,
    about = "Inspect and verify trained execution-path artifacts",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "MARKOV_CATALOG",
        value_name = "FILE",
        help = "TOML schema used to resolve procedure and statement keys"
    )]
    catalog: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_name = "FILE",
        help = "Estimator configuration supplying walk depth and confidence threshold"
    )]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for reports"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Summarize every graph in an artifact with its admission-time estimate.
    Summary {
        #[arg(value_name = "ARTIFACT")]
        artifact: PathBuf,
    },
    /// Load an artifact and check the probability invariant on every vertex.
    Verify {
        #[arg(value_name = "ARTIFACT")]
        artifact: PathBuf,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Serialize)]
struct GraphSummary {
    classification: i32,
    procedure: String,
    vertices: usize,
    edges: usize,
    observations: u64,
    quarantined: bool,
    estimate: PathEstimate,
}

#[derive(Debug, Serialize)]
struct SummaryReport {
    classifications: usize,
    graphs: Vec<GraphSummary>,
    feature_keys: Vec<(String, Vec<String>)>,
}

#[derive(Debug, Serialize)]
struct VerifyReport {
    success: bool,
    classifications: usize,
    graphs: usize,
    vertices: usize,
    edges: usize,
    problems: Vec<String>,
}

fn main() {
    init_tracing();
    match run() {
        Ok(true) => {}
        Ok(false) => std::process::exit(2),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
}

fn run() -> Result<bool, Box<dyn Error>> {
    let cli = Cli::parse();
    let schema = match &cli.catalog {
        Some(path) => Schema::load(path)?,
        None => return Err("a schema catalog is required (--catalog or MARKOV_CATALOG)".into()),
    };
    let config = match &cli.config {
        Some(path) => EstimatorConfig::load(path)?,
        None => EstimatorConfig::default(),
    };

    match cli.command {
        Command::Summary { artifact } => {
            let family = GraphFamily::load(&artifact, &schema)?;
            debug!(artifact = %artifact.display(), "inspect.summary");
            let report = summarize(&family, &schema, &config);
            emit(cli.format, &report, print_summary_text)?;
            Ok(true)
        }
        Command::Verify { artifact } => {
            let family = GraphFamily::load(&artifact, &schema)?;
            debug!(artifact = %artifact.display(), "inspect.verify");
            let report = verify(&family);
            emit(cli.format, &report, print_verify_text)?;
            Ok(report.success)
        }
    }
}

fn summarize(family: &GraphFamily, schema: &Schema, config: &EstimatorConfig) -> SummaryReport {
    let options = config.path_options();
    let graphs = family
        .graphs()
        .into_iter()
        .map(|(classification, graph)| GraphSummary {
            classification: classification.0,
            procedure: procedure_name(schema, &graph),
            vertices: graph.vertex_count(),
            edges: graph.edge_total(),
            observations: graph.outgoing(START_VERTEX).iter().map(|e| e.count).sum(),
            quarantined: graph.is_quarantined(),
            estimate: graph.estimate_path(START_VERTEX, &options),
        })
        .collect();
    let feature_keys = family
        .feature_keys()
        .into_iter()
        .map(|(procedure, keys)| {
            let name = schema
                .procedure_key(procedure)
                .map(str::to_string)
                .unwrap_or_else(|| procedure.to_string());
            (name, keys)
        })
        .collect();
    SummaryReport {
        classifications: family.len(),
        graphs,
        feature_keys,
    }
}

fn verify(family: &GraphFamily) -> VerifyReport {
    let mut problems = Vec::new();
    let mut vertices = 0;
    let mut edges = 0;
    let graphs = family.graphs();
    for (classification, graph) in &graphs {
        vertices += graph.vertex_count();
        edges += graph.edge_total();
        if graph.is_quarantined() {
            problems.push(format!(
                "classification {classification} procedure {}: quarantined",
                graph.procedure()
            ));
        }
        for index in 0..graph.vertex_count() {
            let vertex = VertexId(index as u32);
            let outgoing = graph.outgoing(vertex);
            if outgoing.iter().all(|e| e.count == 0) {
                continue;
            }
            let sum: f64 = outgoing.iter().map(|e| e.probability).sum();
            if (sum - 1.0).abs() > PROBABILITY_TOLERANCE {
                problems.push(format!(
                    "classification {classification} procedure {} vertex {vertex}: probabilities sum to {sum}",
                    graph.procedure()
                ));
            }
        }
    }
    VerifyReport {
        success: problems.is_empty(),
        classifications: family.len(),
        graphs: graphs.len(),
        vertices,
        edges,
        problems,
    }
}

fn procedure_name(schema: &Schema, graph: &MarkovGraph) -> String {
    schema
        .procedure_key(graph.procedure())
        .map(str::to_string)
        .unwrap_or_else(|| graph.procedure().to_string())
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: Serialize,
    F: Fn(&T),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(value),
    }
    Ok(())
}

fn print_summary_text(report: &SummaryReport) {
    println!(
        "Family: {} classification ids, {} graphs",
        report.classifications,
        report.graphs.len()
    );
    for g in &report.graphs {
        let partitions: Vec<String> = g.estimate.partitions.iter().map(|p| p.to_string()).collect();
        println!(
            "  [{}] {}: vertices={} edges={} observations={}{}",
            g.classification,
            g.procedure,
            g.vertices,
            g.edges,
            g.observations,
            if g.quarantined { " QUARANTINED" } else { "" }
        );
        println!(
            "      estimate partitions={{{}}} confidence={:.4} uncertain={} abort={:.4} read_only={}",
            partitions.join(","),
            g.estimate.confidence,
            g.estimate.uncertain,
            g.estimate.abort_probability,
            g.estimate.read_only
        );
    }
    for (procedure, keys) in &report.feature_keys {
        println!("  features {procedure}: {}", keys.join(","));
    }
}

fn print_verify_text(report: &VerifyReport) {
    println!(
        "Verify => success={} classifications={} graphs={} vertices={} edges={}",
        report.success, report.classifications, report.graphs, report.vertices, report.edges
    );
    for problem in &report.problems {
        println!("  problem: {problem}");
    }
}
