use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracemap_engine::{Addr2Line, CancelFlag, TranslationSession};
use tracemap_types::{ResolvedTrace, WorkspaceContext};
use tracing::info;

const USAGE: &str = "usage: tracemap --trace <trace.txt> --binary <image.elf> \
--workspace-name <name> --workspace-root <dir> \
[--line <n>]... [--path <rel-path>]... [--dump <out.json>] [--batch-size <n>]";

/// Environment override for the resolver executable.
const RESOLVER_ENV: &str = "TRACEMAP_ADDR2LINE";

fn main() {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
        .block_on(async {
            if let Err(err) = run().await {
                eprintln!("{err}");
                std::process::exit(1);
            }
        });
}

struct Cli {
    trace: PathBuf,
    binary: PathBuf,
    workspace_name: String,
    workspace_root: PathBuf,
    lines: Vec<u32>,
    paths: Vec<String>,
    dump: Option<PathBuf>,
    batch_size: Option<usize>,
}

fn parse_cli() -> Result<Cli, String> {
    let mut trace = None;
    let mut binary = None;
    let mut workspace_name = None;
    let mut workspace_root = None;
    let mut lines = Vec::new();
    let mut paths = Vec::new();
    let mut dump = None;
    let mut batch_size = None;

    let mut args = std::env::args().skip(1);
    while let Some(flag) = args.next() {
        let mut value = |flag: &str| {
            args.next()
                .ok_or_else(|| format!("missing value for {flag}; {USAGE}"))
        };
        match flag.as_str() {
            "--trace" => trace = Some(PathBuf::from(value("--trace")?)),
            "--binary" => binary = Some(PathBuf::from(value("--binary")?)),
            "--workspace-name" => workspace_name = Some(value("--workspace-name")?),
            "--workspace-root" => workspace_root = Some(PathBuf::from(value("--workspace-root")?)),
            "--line" => lines.push(
                value("--line")?
                    .parse()
                    .map_err(|e| format!("invalid --line value: {e}"))?,
            ),
            "--path" => paths.push(value("--path")?),
            "--dump" => dump = Some(PathBuf::from(value("--dump")?)),
            "--batch-size" => {
                batch_size = Some(
                    value("--batch-size")?
                        .parse()
                        .map_err(|e| format!("invalid --batch-size value: {e}"))?,
                )
            }
            other => return Err(format!("unexpected argument {other:?}; {USAGE}")),
        }
    }

    Ok(Cli {
        trace: trace.ok_or_else(|| format!("missing --trace; {USAGE}"))?,
        binary: binary.ok_or_else(|| format!("missing --binary; {USAGE}"))?,
        workspace_name: workspace_name.ok_or_else(|| format!("missing --workspace-name; {USAGE}"))?,
        workspace_root: workspace_root.ok_or_else(|| format!("missing --workspace-root; {USAGE}"))?,
        lines,
        paths,
        dump,
        batch_size,
    })
}

async fn run() -> Result<(), String> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = parse_cli()?;

    let trace_text = fs::read_to_string(&cli.trace)
        .map_err(|e| format!("failed to read trace {}: {e}", cli.trace.display()))?;
    let workspace = WorkspaceContext::new(cli.workspace_name.clone(), cli.workspace_root.clone())
        .map_err(|e| format!("invalid workspace: {e}"))?;

    let resolver = match std::env::var(RESOLVER_ENV) {
        Ok(program) => Addr2Line::with_program(program),
        Err(_) => Addr2Line::new(),
    };
    info!(
        resolver = resolver.program(),
        binary = %cli.binary.display(),
        workspace = %cli.workspace_name,
        "starting translation"
    );

    let mut session = TranslationSession::new(workspace);
    if let Some(batch_size) = cli.batch_size {
        session = session.with_batch_size(batch_size);
    }
    let report = session
        .translate(&trace_text, &cli.binary, &resolver, &CancelFlag::new())
        .await
        .map_err(|e| format!("translation failed: {e}"))?;

    println!(
        "translated {} of {} trace lines ({} matched the trace format, {} batches)",
        report.committed_samples, report.total_lines, report.matched_samples, report.batches
    );

    for line in &cli.lines {
        match session.lookup_by_trace_line(*line) {
            Some(resolved) => print_resolved(resolved),
            None => println!("trace line {line}: no in-workspace resolution"),
        }
    }

    for path in &cli.paths {
        let occurrences = session.lookup_by_source_path(path);
        if occurrences.is_empty() {
            println!("{path}: no trace lines");
            continue;
        }
        let listed: Vec<String> = occurrences
            .iter()
            .map(|occurrence| occurrence.line_number.to_string())
            .collect();
        println!(
            "{path}: {} trace lines [{}]",
            occurrences.len(),
            listed.join(", ")
        );
    }

    if let Some(out_path) = &cli.dump {
        write_dump(&session, &cli, out_path)?;
        println!("wrote index dump to {}", out_path.display());
    }

    Ok(())
}

fn print_resolved(resolved: &ResolvedTrace) {
    println!(
        "trace line {} (pc {}, cycle {}):",
        resolved.sample.line_number, resolved.sample.program_counter, resolved.sample.cycle_count
    );
    for (depth, location) in resolved.source_locations.iter().enumerate() {
        let path = location
            .workspace_relative_path
            .as_deref()
            .unwrap_or(&location.absolute_path);
        let role = if depth == 0 { "innermost" } else { "inlined by" };
        println!("  {role} {path}:{}", location.line_number);
    }
}

#[derive(Serialize)]
struct IndexDump {
    schema_version: u32,
    binary: String,
    workspace_name: String,
    samples: Vec<SampleRecord>,
    files: Vec<FileRecord>,
}

#[derive(Serialize)]
struct SampleRecord {
    trace_line: u32,
    program_counter: String,
    cycle_count: u64,
    locations: Vec<LocationRecord>,
}

#[derive(Serialize)]
struct LocationRecord {
    path: String,
    line: u32,
    uri: Option<String>,
}

#[derive(Serialize)]
struct FileRecord {
    path: String,
    occurrences: Vec<OccurrenceRecord>,
}

#[derive(Serialize)]
struct OccurrenceRecord {
    trace_line: u32,
    raw_length: u32,
}

fn write_dump(session: &TranslationSession, cli: &Cli, out_path: &Path) -> Result<(), String> {
    let samples = session
        .resolved_lines()
        .map(|resolved| SampleRecord {
            trace_line: resolved.sample.line_number,
            program_counter: resolved.sample.program_counter.to_string(),
            cycle_count: resolved.sample.cycle_count,
            locations: resolved
                .source_locations
                .iter()
                .map(|location| LocationRecord {
                    path: location
                        .workspace_relative_path
                        .as_deref()
                        .unwrap_or(&location.absolute_path)
                        .to_owned(),
                    line: location.line_number,
                    uri: location.canonical_uri.clone(),
                })
                .collect(),
        })
        .collect();
    let files = session
        .indexed_paths()
        .map(|path| FileRecord {
            path: path.to_owned(),
            occurrences: session
                .lookup_by_source_path(path)
                .iter()
                .map(|occurrence| OccurrenceRecord {
                    trace_line: occurrence.line_number,
                    raw_length: occurrence.raw_length,
                })
                .collect(),
        })
        .collect();

    let dump = IndexDump {
        schema_version: 1,
        binary: cli.binary.to_string_lossy().into_owned(),
        workspace_name: cli.workspace_name.clone(),
        samples,
        files,
    };
    let encoded = serde_json::to_string_pretty(&dump)
        .map_err(|e| format!("failed to encode index dump as JSON: {e}"))?;
    fs::write(out_path, encoded)
        .map_err(|e| format!("failed to write index dump to {}: {e}", out_path.display()))?;
    Ok(())
}
