use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

use ragdb_core::config::{Config, Settings};
use ragdb_core::filter::Filter;
use ragdb_core::types::{IndexKind, IngestRecord};
use ragdb_hybrid::{EngineStats, HybridSearchEngine, QueryRequest};

const USAGE: &str = "Usage:
  ragdb ingest [dir]
  ragdb query [dir] <text> [--top-k N] [--filter EXPR] [--overfetch N]
  ragdb admin [dir] [--delete-filter EXPR] [--compact]";

#[derive(Debug, Default)]
struct Args {
    positional: Vec<String>,
    top_k: Option<usize>,
    filter: Option<String>,
    overfetch: Option<usize>,
    delete_filter: Option<String>,
    compact: bool,
}

fn parse_args(raw: &[String]) -> anyhow::Result<Args> {
    let mut args = Args::default();
    let mut iter = raw.iter();
    while let Some(arg) = iter.next() {
        let mut value = |name: &str| -> anyhow::Result<String> {
            iter.next().cloned().with_context(|| format!("{name} requires a value"))
        };
        match arg.as_str() {
            "--top-k" | "-k" => args.top_k = Some(value("--top-k")?.parse().context("--top-k requires a number")?),
            "--overfetch" => args.overfetch = Some(value("--overfetch")?.parse().context("--overfetch requires a number")?),
            "--filter" | "-f" => args.filter = Some(value("--filter")?),
            "--delete-filter" => args.delete_filter = Some(value("--delete-filter")?),
            "--compact" => args.compact = true,
            flag if flag.starts_with('-') => bail!("unknown flag {flag}\n{USAGE}"),
            other => args.positional.push(other.to_string()),
        }
    }
    Ok(args)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

/// Every `.txt` / `.md` file under `root`, keyed by its path relative to `root`.
fn collect_records(root: &Path) -> anyhow::Result<Vec<IngestRecord>> {
    let mut records = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name().into_iter().filter_map(Result::ok) {
        let path = entry.path();
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        if !entry.file_type().is_file() || !matches!(ext, "txt" | "md") {
            continue;
        }
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable file");
                continue;
            }
        };
        let rel = path.strip_prefix(root).unwrap_or(path).to_string_lossy().replace('\\', "/");
        let category = Path::new(&rel).parent().and_then(Path::to_str).filter(|d| !d.is_empty()).map(str::to_string);
        let mut record = IngestRecord::new(rel, text)
            .with_metadata("ext", ext)
            .with_citation_url(format!("file://{}", path.display()));
        if let Some(category) = category {
            record = record.with_metadata("category", category);
        }
        records.push(record);
    }
    Ok(records)
}

fn build_engine(settings: &Settings, data_dir: &Path) -> anyhow::Result<HybridSearchEngine> {
    if !data_dir.is_dir() {
        bail!("data directory {} does not exist", data_dir.display());
    }
    let engine = HybridSearchEngine::from_settings(settings)?;
    let records = collect_records(data_dir)?;

    let pb = ProgressBar::new(records.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} documents ({percent}%) {msg}")?
            .progress_chars("#>-"),
    );
    let mut chunks = 0;
    for record in &records {
        pb.set_message(record.doc_id.clone());
        chunks += engine.ingest(record).with_context(|| format!("ingesting {}", record.doc_id))?.chunks;
        pb.inc(1);
    }
    pb.finish_with_message("done");
    info!(documents = records.len(), chunks, "ingested data directory");
    Ok(engine)
}

fn print_stats(stats: &EngineStats) {
    println!("epoch {}", stats.epoch);
    for s in [&stats.dense, &stats.sparse] {
        println!(
            "  {:<6} live {:>7}  tombstoned {:>6}  physical {:>7}  graph {:>7}  last compaction {}",
            s.kind.to_string(),
            s.live,
            s.tombstoned,
            s.physical,
            s.graph_size,
            s.last_compaction.map_or_else(|| "never".to_string(), |t| t.to_rfc3339()),
        );
    }
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let raw: Vec<String> = env::args().skip(1).collect();
    let Some((cmd, rest)) = raw.split_first() else {
        eprintln!("{USAGE}");
        std::process::exit(1);
    };
    let args = parse_args(rest)?;
    let settings = Config::load()?.settings()?;
    let default_dir = settings.data.raw_txt_path(&env::current_dir()?);
    let runtime = tokio::runtime::Runtime::new()?;

    match cmd.as_str() {
        "ingest" => {
            let data_dir = args.positional.first().map_or(default_dir, PathBuf::from);
            let engine = build_engine(&settings, &data_dir)?;
            println!("Ingested {}", data_dir.display());
            print_stats(&engine.stats()?);
        }
        "query" => {
            let (data_dir, text) = match args.positional.as_slice() {
                [text] => (default_dir, text.clone()),
                [dir, text] => (PathBuf::from(dir), text.clone()),
                _ => bail!("query needs the query text\n{USAGE}"),
            };
            let engine = build_engine(&settings, &data_dir)?;
            let mut request = QueryRequest::new(text);
            request.top_k = args.top_k;
            request.filter = args.filter;
            request.overfetch_factor = args.overfetch;

            let response = runtime.block_on(engine.query(&request))?;
            if let Some(d) = &response.degraded {
                println!("(degraded: {} search failed: {})", d.failed, d.reason);
            }
            if response.hits.is_empty() {
                println!("No results.");
            }
            for (i, hit) in response.hits.iter().enumerate() {
                let ranks: Vec<String> = hit.contributing_ranks.iter().map(|r| format!("{}#{}", r.source, r.rank)).collect();
                println!("{:>2}. {} score={:.5} [{}]", i + 1, hit.chunk_id, hit.combined_score, ranks.join(" "));
                println!("    {}", hit.citation_url);
                let preview: String = hit.text.split_whitespace().collect::<Vec<_>>().join(" ").chars().take(160).collect();
                println!("    {preview}");
            }
        }
        "admin" => {
            let data_dir = args.positional.first().map_or(default_dir, PathBuf::from);
            let engine = build_engine(&settings, &data_dir)?;
            if let Some(expr) = &args.delete_filter {
                let removed = engine.index().delete_by_filter(&Filter::parse(expr)?)?;
                println!("Deleted {removed} chunks matching `{expr}`");
            }
            if args.compact {
                for report in runtime.block_on(async {
                    let index = engine.index();
                    let dense = index.spawn_compaction(IndexKind::Dense);
                    let sparse = index.spawn_compaction(IndexKind::Sparse);
                    Ok::<_, anyhow::Error>([dense.await??, sparse.await??])
                })? {
                    println!("Compacted {}: {:?}, reclaimed {}, retained {}", report.kind, report.status, report.reclaimed, report.retained);
                }
            }
            let integrity = engine.index().verify_integrity()?;
            println!("Integrity ok ({} entries at epoch {})", integrity.checked, integrity.epoch);
            print_stats(&engine.stats()?);
        }
        other => {
            eprintln!("Unknown command: {other}\n{USAGE}");
            std::process::exit(1);
        }
    }
    Ok(())
}
