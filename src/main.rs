use anyhow::{bail, Context, Result};
use std::env;
use std::path::PathBuf;

use funding_harvester::{
    DateWindow, EntityRegistry, HttpTransport, Pipeline, RunStatus, SourceConfig, SourceId, Store,
    VERSION,
};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("run");

    match command {
        "run" => run_ingest(&args[2..]),
        "companies" => show_companies(&args[2..]),
        "runs" => show_runs(&args[2..]),
        "--help" | "help" => {
            print_usage();
            Ok(())
        }
        other => {
            print_usage();
            bail!("unknown command: {other}");
        }
    }
}

fn print_usage() {
    println!("funding-harvester {VERSION}");
    println!();
    println!("USAGE:");
    println!("  funding-harvester run [--sources usaspending,sec,sbir] [--window-years N] [--db PATH]");
    println!("  funding-harvester companies [--db PATH]");
    println!("  funding-harvester runs [--db PATH]");
}

/// Shared flags across subcommands.
struct Options {
    db_path: PathBuf,
    sources: Vec<SourceId>,
    window_years: i32,
}

fn parse_options(args: &[String]) -> Result<Options> {
    let mut options = Options {
        db_path: PathBuf::from("funding.db"),
        sources: vec![SourceId::UsaSpending],
        window_years: 3,
    };

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--db" => {
                i += 1;
                let value = args.get(i).context("--db needs a path")?;
                options.db_path = PathBuf::from(value);
            }
            "--sources" => {
                i += 1;
                let value = args.get(i).context("--sources needs a comma-separated list")?;
                options.sources = value
                    .split(',')
                    .map(|s| {
                        SourceId::parse(s.trim())
                            .with_context(|| format!("unknown source: {s}"))
                    })
                    .collect::<Result<Vec<_>>>()?;
            }
            "--window-years" => {
                i += 1;
                let value = args.get(i).context("--window-years needs a number")?;
                options.window_years = value
                    .parse()
                    .with_context(|| format!("invalid --window-years: {value}"))?;
            }
            other => bail!("unknown flag: {other}"),
        }
        i += 1;
    }

    if options.sources.is_empty() {
        bail!("--sources must name at least one source");
    }
    Ok(options)
}

fn run_ingest(args: &[String]) -> Result<()> {
    let options = parse_options(args)?;
    let window = DateWindow::last_years(options.window_years);

    println!("🌾 Funding Harvester v{VERSION}");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("📅 Window: {} → {}", window.start, window.end);
    println!(
        "🔌 Sources: {}",
        options
            .sources
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("💾 Database: {}", options.db_path.display());

    let store = Store::open(&options.db_path)
        .with_context(|| format!("opening database {}", options.db_path.display()))?;
    let transport = HttpTransport::new().context("building HTTP client")?;
    let mut pipeline = Pipeline::new(store, transport)?;

    let configs: Vec<SourceConfig> = options
        .sources
        .iter()
        .map(|&id| SourceConfig::defaults(id))
        .collect();

    let summaries = pipeline.run_sources(&configs, window);

    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    let mut any_failed = false;
    for summary in &summaries {
        let mark = match summary.status {
            RunStatus::Succeeded => "✓",
            RunStatus::Partial => "⚠",
            _ => "✗",
        };
        println!(
            "{} {}: {} - {} pages, {} fetched, {} mapped, {} rejected, {} new entities, {} merged",
            mark,
            summary.source.as_str(),
            summary.status.as_str(),
            summary.counts.pages_fetched,
            summary.counts.records_fetched,
            summary.counts.records_mapped,
            summary.counts.mapping_failures,
            summary.counts.entities_created,
            summary.counts.entities_merged,
        );
        if let Some(error) = &summary.error {
            println!("   error: {error}");
        }
        if summary.status == RunStatus::Failed {
            any_failed = true;
        }
    }
    println!("🏢 Total entities: {}", pipeline.registry().len());

    if any_failed {
        std::process::exit(1);
    }
    Ok(())
}

fn show_companies(args: &[String]) -> Result<()> {
    let options = parse_options(args)?;
    let store = Store::open(&options.db_path)
        .with_context(|| format!("opening database {}", options.db_path.display()))?;
    let registry: EntityRegistry = store.load_registry()?;

    println!("🏢 Companies: {}", registry.len());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for entity in registry.entities() {
        let events = store.events_for_company(&entity.id)?;
        let total: f64 = events.iter().map(|e| e.event.amount_usd).sum();
        println!(
            "{} ({} – {})",
            entity.canonical_name, entity.first_seen, entity.last_seen
        );
        if !entity.identifiers.is_empty() {
            let idents: Vec<String> = entity
                .identifiers
                .iter()
                .map(|i| format!("{}:{}", i.kind.as_str(), i.value))
                .collect();
            println!("   ids: {}", idents.join(", "));
        }
        for stored in &events {
            println!(
                "   {} {} ${:.2} [{}] {}",
                stored.event.event_date,
                stored.event.funding_type.as_str(),
                stored.event.amount_usd,
                stored.event.source_label,
                stored.event.source_record_id,
            );
        }
        println!("   total: ${total:.2}");
    }
    Ok(())
}

fn show_runs(args: &[String]) -> Result<()> {
    let options = parse_options(args)?;
    let store = Store::open(&options.db_path)
        .with_context(|| format!("opening database {}", options.db_path.display()))?;

    let runs = store.recent_runs(20)?;
    println!("📜 Recent runs: {}", runs.len());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for run in runs {
        println!(
            "{} {} [{}] {} → {} | pages {} fetched {} mapped {} rejected {}",
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            run.source.as_str(),
            run.status.as_str(),
            run.window.start,
            run.window.end,
            run.counts.pages_fetched,
            run.counts.records_fetched,
            run.counts.records_mapped,
            run.counts.mapping_failures,
        );
        if let Some(error) = run.error {
            println!("   error: {error}");
        }
    }
    Ok(())
}
