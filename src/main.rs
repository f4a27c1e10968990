use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use rayon::prelude::*;

use pactum::config::AnalysisConfig;
use pactum::errors::AnalysisError;
use pactum::facts::FactsReport;
use pactum::index::InMemoryEquationIndex;
use pactum::inference::infer_class;
use pactum::ir::ClassIr;
use pactum::keys::{Member, MemberId};
use pactum::lattice::Equations;
use pactum::persist;
use pactum::solve::QuerySession;
use pactum::telemetry::init_logging;

/// CLI arguments for pactum execution.
#[derive(Parser, Debug)]
#[command(
    name = "pactum",
    about = "Equation-based inference of JVM method contracts from decoded bytecode.",
    version
)]
struct Cli {
    /// Decoded classes, one JSON array of classes per file.
    #[arg(long, value_name = "PATH")]
    input: Vec<PathBuf>,
    /// Previously persisted equations to solve against.
    #[arg(long, value_name = "PATH")]
    equations: Vec<PathBuf>,
    /// Write inferred equations in the persisted binary format.
    #[arg(long, value_name = "PATH")]
    save_equations: Option<PathBuf>,
    /// Report destination; `-` or absent means stdout.
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,
    /// Members to query, `owner.name(descriptor)` form. All input
    /// methods when absent.
    #[arg(long, value_name = "MEMBER")]
    query: Vec<String>,
    /// Per-method worklist step budget.
    #[arg(long, value_name = "N")]
    steps_limit: Option<usize>,
    /// Dependency-literal budget per pending equation.
    #[arg(long, value_name = "N")]
    equation_size_limit: Option<usize>,
    /// Equation budget per global solve.
    #[arg(long, value_name = "N")]
    equations_per_query_limit: Option<usize>,
    #[arg(long)]
    quiet: bool,
    #[arg(long)]
    timing: bool,
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    run(cli)
}

fn run(cli: Cli) -> Result<()> {
    for path in cli.input.iter().chain(&cli.equations) {
        if !path.exists() {
            anyhow::bail!("input not found: {}", path.display());
        }
    }

    let started_at = Instant::now();
    let mut config = AnalysisConfig::default();
    if let Some(limit) = cli.steps_limit {
        config.steps_limit = limit;
    }
    if let Some(limit) = cli.equation_size_limit {
        config.equation_size_limit = limit;
    }
    if let Some(limit) = cli.equations_per_query_limit {
        config.equations_per_query_limit = limit;
    }

    let mut classes = Vec::new();
    for path in &cli.input {
        classes.extend(read_classes(path)?);
    }

    let infer_started_at = Instant::now();
    let inferred: Vec<Vec<Equations>> = classes
        .par_iter()
        .map(|class| infer_class(class, &config))
        .collect::<Result<_, AnalysisError>>()
        .context("inference cancelled")?;
    let infer_duration_ms = infer_started_at.elapsed().as_millis();

    let mut index = InMemoryEquationIndex::new();
    let mut equation_count = 0usize;
    for records in &inferred {
        equation_count += records.len();
        index.extend(records.iter().cloned());
    }
    for path in &cli.equations {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        match persist::decode(&bytes) {
            Ok(records) => index.extend(records),
            // Stale snapshots are not an error; the run proceeds without them.
            Err(err @ AnalysisError::WrongVersion { .. }) => {
                tracing::warn!(path = %path.display(), %err, "skipping equation file");
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to decode {}", path.display()));
            }
        }
    }

    if let Some(path) = &cli.save_equations {
        let records: Vec<Equations> = inferred.into_iter().flatten().collect();
        std::fs::write(path, persist::encode(&records))
            .with_context(|| format!("failed to write {}", path.display()))?;
    }

    let queried = query_members(&cli.query, &classes)?;
    let session = QuerySession::new(&index, &config);
    let solution = session
        .resolve(queried.iter().cloned().map(MemberId::from))
        .context("query failed")?;
    let report = FactsReport::build(queried.iter(), &solution).context("report failed")?;

    let mut writer = output_writer(cli.output.as_deref())?;
    serde_json::to_writer_pretty(&mut writer, &report).context("failed to serialize report")?;
    writer
        .write_all(b"\n")
        .context("failed to write report")?;

    if cli.timing && !cli.quiet {
        eprintln!(
            "timing: total_ms={} infer_ms={} classes={} equations={} facts={}",
            started_at.elapsed().as_millis(),
            infer_duration_ms,
            classes.len(),
            equation_count,
            report.methods.len()
        );
    }

    Ok(())
}

fn read_classes(path: &Path) -> Result<Vec<ClassIr>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut deserializer = serde_json::Deserializer::from_reader(BufReader::new(file));
    serde_path_to_error::deserialize(&mut deserializer)
        .with_context(|| format!("failed to decode {}", path.display()))
}

fn query_members(queries: &[String], classes: &[ClassIr]) -> Result<Vec<Member>> {
    if queries.is_empty() {
        let mut members = Vec::new();
        for class in classes {
            for method in &class.methods {
                members.push(Member::new(&class.name, &method.name, &method.descriptor));
            }
        }
        return Ok(members);
    }
    queries.iter().map(|query| parse_member(query)).collect()
}

/// Parses `owner.name(descriptor)` into a member, splitting the owner
/// from the name at the last dot before the descriptor.
fn parse_member(query: &str) -> Result<Member> {
    let paren = query
        .find('(')
        .with_context(|| format!("no descriptor in query: {query}"))?;
    let (head, descriptor) = query.split_at(paren);
    let (owner, name) = head
        .rsplit_once('.')
        .with_context(|| format!("no owner in query: {query}"))?;
    if owner.is_empty() || name.is_empty() {
        anyhow::bail!("malformed query: {query}");
    }
    Ok(Member::new(owner, name, descriptor))
}

fn output_writer(output: Option<&Path>) -> Result<Box<dyn Write>> {
    match output {
        Some(path) if path == Path::new("-") => Ok(Box::new(io::stdout())),
        Some(path) => Ok(Box::new(
            File::create(path).with_context(|| format!("failed to open {}", path.display()))?,
        )),
        None => Ok(Box::new(io::stdout())),
    }
}
