//! CLI entry point for hls-forge
//!
//! Converts assets to HLS and publishes them, one at a time or as a batch of
//! every catalog entry that is not converted yet.

use clap::{Parser, Subcommand};
use hls_forge::{
    check_access, compose_master, detect, new_shared_metrics, plan, resolve_parallelism, run_metrics_server,
    start_system_sampler, BatchRunner, Catalog, CatalogRecord, Config, ConversionJob,
    Coordinator, CoordinatorDeps, FfprobeAnalyzer, JsonCatalog, MemoryStore, ObjectStore,
    S3Store, SharedMetrics, SourceAnalyzer, SourceLocation,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// hls-forge - transcode video to HLS and publish it to object storage
#[derive(Parser, Debug)]
#[command(name = "hls-forge")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert and publish one asset
    Convert {
        asset_id: String,
        /// Source URL (http/https) or object store key
        #[arg(long)]
        source: String,
        /// Add the 480p rendition
        #[arg(long)]
        lower: bool,
        /// Publish into an in-memory store instead of the configured bucket
        #[arg(long)]
        dry_run: bool,
    },
    /// Convert every catalog entry that is not converted yet
    Batch {
        /// Convert at most this many assets
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Register an asset in the catalog
    Enqueue {
        asset_id: String,
        #[arg(long)]
        source: String,
    },
    /// Print the detected encoder capabilities as JSON
    Capabilities,
    /// List one page under the public root to check bucket access and credentials
    CheckStore,
    /// Probe a local file and print the ladder it would get
    Plan {
        file: PathBuf,
        #[arg(long)]
        lower: bool,
    },
}

fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("hls_forge=info,hls_forge_cli=info"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(false))
            .with(env_filter)
            .init();
    }
}

/// Config file plus environment overrides; defaults when the file is absent
fn load_config(path: &Path) -> Result<Config, String> {
    if path.exists() {
        return Config::load(path).map_err(|e| format!("{}: {}", path.display(), e));
    }
    warn!(path = %path.display(), "Config file not found, using defaults");
    let mut config = Config::default();
    config.apply_env_overrides();
    Ok(config)
}

fn build_store(config: &Config, dry_run: bool) -> Result<Arc<dyn ObjectStore>, String> {
    if dry_run {
        info!("Dry run, publishing into an in-memory store");
        return Ok(Arc::new(MemoryStore::new()));
    }
    S3Store::new(&config.storage)
        .map(|s| Arc::new(s) as Arc<dyn ObjectStore>)
        .map_err(|e| e.to_string())
}

async fn build_coordinator(
    config: &Config,
    dry_run: bool,
    metrics: SharedMetrics,
) -> Result<Coordinator, String> {
    config.validate(!dry_run).map_err(|e| e.to_string())?;
    let store = build_store(config, dry_run)?;
    let catalog: Arc<dyn Catalog> = Arc::new(JsonCatalog::new(config.jobs.catalog_dir.clone()));
    let capabilities = detect(config.encoding.ffmpeg_path.clone(), config.encoding.gpu_enabled).await;
    let deps = CoordinatorDeps::from_config(config, store, catalog, capabilities, metrics);
    Ok(Coordinator::new(config, deps))
}

async fn convert(
    config: &Config,
    asset_id: String,
    source: String,
    lower: bool,
    dry_run: bool,
) -> Result<bool, String> {
    let coordinator = build_coordinator(config, dry_run, new_shared_metrics()).await?;
    let job = ConversionJob::new(
        asset_id,
        SourceLocation::parse(&source),
        lower || config.encoding.include_lower_rendition,
    );
    match coordinator.run(job).await {
        Ok(outcome) => {
            print_json(&outcome);
            Ok(true)
        }
        Err(e) => {
            error!(error = %e, "Conversion failed");
            Ok(false)
        }
    }
}

async fn batch(config: &Config, limit: Option<usize>, dry_run: bool) -> Result<bool, String> {
    let catalog = JsonCatalog::new(config.jobs.catalog_dir.clone());
    let pending: Vec<ConversionJob> = catalog
        .list()
        .await
        .map_err(|e| e.to_string())?
        .into_iter()
        .filter(|r| !r.is_converted())
        .take(limit.unwrap_or(usize::MAX))
        .map(|r| ConversionJob::new(r.asset_id, r.source, config.encoding.include_lower_rendition))
        .collect();
    if pending.is_empty() {
        info!("Nothing to convert");
        return Ok(true);
    }

    let metrics = new_shared_metrics();
    let mut background = Vec::new();
    if config.metrics.enabled {
        background.push(start_system_sampler(metrics.clone(), Duration::from_secs(2)));
        let server_metrics = metrics.clone();
        let bind = config.metrics.bind.clone();
        background.push(tokio::spawn(async move {
            if let Err(e) = run_metrics_server(server_metrics, &bind).await {
                warn!(error = %e, "Metrics server stopped");
            }
        }));
    }

    let coordinator = Arc::new(build_coordinator(config, dry_run, metrics).await?);
    let runner = BatchRunner::new(coordinator, resolve_parallelism(&config.jobs));
    let items = runner.run(pending).await;

    for handle in background {
        handle.abort();
    }

    let mut ok = true;
    for item in &items {
        match &item.result {
            Ok(outcome) => info!(asset_id = %item.asset_id, outcome = ?outcome, "Done"),
            Err(e) => {
                ok = false;
                error!(asset_id = %item.asset_id, stage = %e.stage, error = %e, "Failed");
            }
        }
    }
    Ok(ok)
}

async fn enqueue(config: &Config, asset_id: String, source: String) -> Result<bool, String> {
    hls_forge::AssetPathPolicy::validate_asset_id(&asset_id).map_err(|e| e.to_string())?;
    let catalog = JsonCatalog::new(config.jobs.catalog_dir.clone());
    let source = SourceLocation::parse(&source);

    let record = match catalog.get(&asset_id).await.map_err(|e| e.to_string())? {
        Some(existing) if existing.is_converted() => {
            warn!(asset_id = %asset_id, "Asset is already converted, leaving it as is");
            return Ok(true);
        }
        Some(mut existing) => {
            existing.source = source;
            existing
        }
        None => CatalogRecord::new(asset_id, source),
    };
    catalog.put(&record).await.map_err(|e| e.to_string())?;
    info!(asset_id = %record.asset_id, source = %record.source, "Asset enqueued");
    Ok(true)
}

async fn capabilities(config: &Config) -> Result<bool, String> {
    let report = detect(config.encoding.ffmpeg_path.clone(), config.encoding.gpu_enabled).await;
    print_json(&report);
    Ok(true)
}

async fn check_store(config: &Config) -> Result<bool, String> {
    config.validate(true).map_err(|e| e.to_string())?;
    let store = S3Store::new(&config.storage).map_err(|e| e.to_string())?;
    match check_access(&store, &config.storage.public_root).await {
        Ok(check) => {
            info!(bucket = %config.storage.bucket, prefix = %check.prefix, "Store reachable");
            print_json(&check);
            Ok(true)
        }
        Err(e) => {
            error!(bucket = %config.storage.bucket, error = %e, "Store check failed");
            Ok(false)
        }
    }
}

async fn plan_file(config: &Config, file: &Path, lower: bool) -> Result<bool, String> {
    let analyzer = FfprobeAnalyzer::new(
        config.encoding.ffprobe_path.clone(),
        Duration::from_secs(config.encoding.probe_timeout_secs),
    );
    let info = analyzer.analyze(file).await.map_err(|e| e.to_string())?;
    let ladder = plan(&info, lower || config.encoding.include_lower_rendition);
    print_json(&serde_json::json!({
        "source": info,
        "ladder": ladder,
        "master_playlist": compose_master(&ladder),
    }));
    Ok(true)
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => error!(error = %e, "Failed to serialize output"),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();

    let config = match load_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let result = match args.command {
        Command::Convert {
            asset_id,
            source,
            lower,
            dry_run,
        } => convert(&config, asset_id, source, lower, dry_run).await,
        Command::Batch { limit, dry_run } => batch(&config, limit, dry_run).await,
        Command::Enqueue { asset_id, source } => enqueue(&config, asset_id, source).await,
        Command::Capabilities => capabilities(&config).await,
        Command::CheckStore => check_store(&config).await,
        Command::Plan { file, lower } => plan_file(&config, &file, lower).await,
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = %e, "Command failed");
            ExitCode::FAILURE
        }
    }
}
