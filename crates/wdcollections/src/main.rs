use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::EnvFilter;
use wdcollections_core::cache::CacheMode;
use wdcollections_core::collection::{Collection, PipelineOptions, run_pipeline_with_api};
use wdcollections_core::config::{
    CollectionConfig, CollectionSettings, credentials_from_env, load_config, resolve_endpoints,
};
use wdcollections_core::harvest::{HarvestOptions, harvest_with_api};
use wdcollections_core::reconcile::{SyncOptions, sync_with_api, update_outdated_with_api};
use wdcollections_core::registry::PropertyRegistry;
use wdcollections_core::runtime::{
    InitOptions, PathOverrides, ResolutionContext, ResolvedPaths, ensure_runtime_ready,
    init_layout, inspect_runtime, resolve_paths,
};
use wdcollections_core::wikibase::{SparqlClient, WikibaseClient};
use wdcollections_core::wikipages::WikiPagesClient;
use wdcollections_core::writeback::{WriteBackOptions, write_back_with_api};

#[derive(Debug, Parser)]
#[command(
    name = "wdcollections",
    version,
    about = "Mirror a class of graph items locally, harvest missing values from wiki templates, write them back"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
    format: OutputFormat,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            data_dir: cli.data_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
            format: cli.format,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Create .wdcollections/ and a sample config")]
    Init(InitArgs),
    #[command(about = "Mirror the collection query result into the local store")]
    Sync(SyncArgs),
    #[command(name = "update-outdated", about = "Refresh items marked outdated from the graph")]
    UpdateOutdated,
    #[command(about = "Stage values found in wiki page templates")]
    Harvest(HarvestArgs),
    #[command(name = "write-back", about = "Write staged values to the graph")]
    WriteBack(WriteBackArgs),
    #[command(about = "sync, update-outdated, harvest, then write-back")]
    Run(RunArgs),
    #[command(about = "Row counts and pending work")]
    Status,
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
    #[arg(long, help = "Skip writing .wdcollections/config.toml")]
    no_config: bool,
}

#[derive(Debug, Args)]
struct SyncArgs {
    #[arg(long, value_name = "MODE", help = "skip-if-fresh | serve-if-fresh | refresh")]
    cache_mode: Option<String>,
}

#[derive(Debug, Args)]
struct HarvestArgs {
    #[arg(long, value_name = "SITE", help = "Harvest one site, e.g. frwiki")]
    site: Option<String>,
    #[arg(long, value_name = "N", help = "Maximum pages per site")]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
struct WriteBackArgs {
    #[arg(long, value_name = "PROPERTY", help = "Write one property, e.g. 373 or P373")]
    property: Option<String>,
    #[arg(long, help = "Report what would be written without writing")]
    dry_run: bool,
    #[arg(long, value_name = "N")]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long, value_name = "MODE")]
    cache_mode: Option<String>,
    #[arg(long, value_name = "SITE")]
    site: Option<String>,
    #[arg(long, value_name = "PROPERTY")]
    property: Option<String>,
    #[arg(long)]
    dry_run: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Sync(args)) => run_sync(&runtime, args),
        Some(Commands::UpdateOutdated) => run_update_outdated(&runtime),
        Some(Commands::Harvest(args)) => run_harvest(&runtime, args),
        Some(Commands::WriteBack(args)) => run_write_back(&runtime, args),
        Some(Commands::Run(args)) => run_all(&runtime, args),
        Some(Commands::Status) => run_status(&runtime),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(
        &paths,
        &InitOptions {
            materialize_config: !args.no_config,
            force: args.force,
        },
    )?;

    println!("Initialized wdcollections runtime layout");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("state_dir: {}", normalize_path(&paths.state_dir));
    println!("data_dir: {}", normalize_path(&paths.data_dir));
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("cache_dir: {}", normalize_path(&paths.cache_dir));
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_sync(runtime: &RuntimeOptions, args: SyncArgs) -> Result<()> {
    let (paths, config, mut collection) = open_collection(runtime)?;
    let endpoints = resolve_endpoints(&config.endpoints);
    let mut sparql = SparqlClient::new(&endpoints)?;
    let options = SyncOptions {
        cache_mode: parse_cache_mode(args.cache_mode.as_deref())?,
    };
    let report = sync_with_api(&mut collection, &options, &mut sparql)?;
    print_report(runtime, "sync", &report)?;
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_update_outdated(runtime: &RuntimeOptions) -> Result<()> {
    let (paths, config, mut collection) = open_collection(runtime)?;
    let endpoints = resolve_endpoints(&config.endpoints);
    let mut graph = WikibaseClient::new(&endpoints)?;
    let report = update_outdated_with_api(&mut collection, &mut graph)?;
    print_report(runtime, "update_outdated", &report)?;
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_harvest(runtime: &RuntimeOptions, args: HarvestArgs) -> Result<()> {
    let (paths, config, mut collection) = open_collection(runtime)?;
    let endpoints = resolve_endpoints(&config.endpoints);
    let pages = WikiPagesClient::new(&endpoints)?;
    let mut graph = WikibaseClient::new(&endpoints)?;
    let options = HarvestOptions {
        site: args.site,
        limit: args.limit,
    };
    let report = harvest_with_api(&mut collection, &options, &pages, &mut graph)?;
    print_report(runtime, "harvest", &report)?;
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_write_back(runtime: &RuntimeOptions, args: WriteBackArgs) -> Result<()> {
    let (paths, config, mut collection) = open_collection(runtime)?;
    let endpoints = resolve_endpoints(&config.endpoints);
    let pages = WikiPagesClient::new(&endpoints)?;
    let mut graph = WikibaseClient::new(&endpoints)?;
    let options = WriteBackOptions {
        property: parse_property(args.property.as_deref())?,
        dry_run: args.dry_run,
        limit: args.limit,
    };
    let credentials = credentials_from_env();
    let report = write_back_with_api(
        &mut collection,
        &options,
        &mut graph,
        &pages,
        credentials.as_ref(),
    )?;
    print_report(runtime, "write_back", &report)?;
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_all(runtime: &RuntimeOptions, args: RunArgs) -> Result<()> {
    let (paths, config, mut collection) = open_collection(runtime)?;
    let endpoints = resolve_endpoints(&config.endpoints);
    let mut sparql = SparqlClient::new(&endpoints)?;
    let mut graph = WikibaseClient::new(&endpoints)?;
    let pages = WikiPagesClient::new(&endpoints)?;
    let options = PipelineOptions {
        sync: SyncOptions {
            cache_mode: parse_cache_mode(args.cache_mode.as_deref())?,
        },
        harvest: HarvestOptions {
            site: args.site,
            limit: None,
        },
        write_back: WriteBackOptions {
            property: parse_property(args.property.as_deref())?,
            dry_run: args.dry_run,
            limit: None,
        },
    };
    let credentials = credentials_from_env();
    let report = run_pipeline_with_api(
        &mut collection,
        &options,
        &mut sparql,
        &mut graph,
        &pages,
        credentials.as_ref(),
    )?;
    print_report(runtime, "run", &report)?;
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_status(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;

    println!("runtime status");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("state_dir_exists: {}", format_flag(status.state_dir_exists));
    println!("data_dir_exists: {}", format_flag(status.data_dir_exists));
    println!("db_exists: {}", format_flag(status.db_exists));
    println!(
        "db_size_bytes: {}",
        status
            .db_size_bytes
            .map(|size| size.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    println!("cache_entries: {}", status.cache_entries);
    println!("config_exists: {}", format_flag(status.config_exists));
    if !status.warnings.is_empty() {
        println!("warnings:");
        for warning in &status.warnings {
            println!("  - {warning}");
        }
    }
    if status.config_exists {
        let (_, _, collection) = open_collection(runtime)?;
        print_report(runtime, "collection", &collection.status()?)?;
    }
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn open_collection(
    runtime: &RuntimeOptions,
) -> Result<(ResolvedPaths, CollectionConfig, Collection)> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    ensure_runtime_ready(&paths, &status)?;

    let config = load_config(&paths.config_path)?;
    let registry = PropertyRegistry::builtin();
    let settings = CollectionSettings::from_config(&config, &registry).with_context(|| {
        format!("invalid configuration in {}", normalize_path(&paths.config_path))
    })?;
    let collection = Collection::open(settings, registry, &paths.db_path, &paths.cache_dir)?;
    tracing::debug!(
        collection = collection.name(),
        db = %normalize_path(&paths.db_path),
        "opened collection"
    );
    Ok((paths, config, collection))
}

fn parse_cache_mode(value: Option<&str>) -> Result<Option<CacheMode>> {
    value
        .map(|value| {
            CacheMode::parse(value).ok_or_else(|| {
                anyhow!(
                    "unknown cache mode `{value}` (expected skip-if-fresh, serve-if-fresh or refresh)"
                )
            })
        })
        .transpose()
}

fn parse_property(value: Option<&str>) -> Result<Option<u32>> {
    value
        .map(|value| {
            let trimmed = value.trim();
            let digits = trimmed
                .strip_prefix('P')
                .or_else(|| trimmed.strip_prefix('p'))
                .unwrap_or(trimmed);
            digits
                .parse::<u32>()
                .with_context(|| format!("invalid property id `{value}`"))
        })
        .transpose()
}

fn print_report<T: Serialize>(runtime: &RuntimeOptions, name: &str, report: &T) -> Result<()> {
    let value = serde_json::to_value(report).context("failed to serialize report")?;
    match runtime.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&value)?),
        OutputFormat::Text => print_value(name, &value),
    }
    Ok(())
}

fn print_value(prefix: &str, value: &Value) {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                print_value(&format!("{prefix}.{key}"), nested);
            }
        }
        Value::Array(items) if items.iter().all(|item| !item.is_object()) => {
            if items.is_empty() {
                println!("{prefix}: <empty>");
            } else {
                let joined = items
                    .iter()
                    .map(|item| match item {
                        Value::String(text) => text.clone(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                println!("{prefix}: {joined}");
            }
        }
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                print_value(&format!("{prefix}[{index}]"), item);
            }
        }
        Value::String(text) => println!("{prefix}: {text}"),
        Value::Null => println!("{prefix}: n/a"),
        other => println!("{prefix}: {other}"),
    }
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        eprintln!("\n[diagnostics]\n{}", paths.diagnostics());
    }
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        data_dir: runtime.data_dir.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
