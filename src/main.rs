use ragfuse::cli::{Cli, Commands, ConfigAction};
use ragfuse::config::Config;
use ragfuse::error::{RagError, Result};
use ragfuse::index::{ChunkRecord, LocalIndexStore};
use ragfuse::retrieval::{Query, RerankStatus, RetrievalOrchestrator, RetrievalResult, Turn};
use ragfuse::services::{embedder_from_config, Services};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn main() -> Result<()> {
    let cli = Cli::parse_args();

    init_logging(cli.verbose);

    match cli.command {
        Commands::Query {
            query,
            index,
            top_k,
            history,
            multi_query,
            decompose,
            no_rerank,
            json,
        } => {
            let mut config = load_config(cli.config, cli.profile)?;
            if multi_query {
                config.query.multi_query = true;
            }
            if decompose {
                config.query.decomposition = true;
            }
            if no_rerank {
                config.reranker.enabled = false;
            }

            let mut request = Query::new(query);
            if let Some(path) = history {
                request = request.with_history(read_history(&path)?);
            }
            if let Some(index) = index {
                request = request.with_index(index);
            }
            if let Some(top_k) = top_k {
                request = request.with_top_k(top_k);
            }

            cmd_query(&config, request, json)?;
        }
        Commands::Ingest { file, index } => {
            let config = load_config(cli.config, cli.profile)?;
            cmd_ingest(&config, &file, index)?;
        }
        Commands::Indexes => {
            let config = load_config(cli.config, cli.profile)?;
            cmd_indexes(&config)?;
        }
        Commands::Config { action } => {
            cmd_config(cli.config, action)?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default = if verbose { "ragfuse=debug" } else { "ragfuse=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().map_err(|e| RagError::Io {
        source: e,
        context: "Failed to create tokio runtime".to_string(),
    })
}

fn cmd_query(config: &Config, query: Query, json: bool) -> Result<()> {
    let rt = runtime()?;

    let store = Arc::new(LocalIndexStore::from_config(config)?);
    let services = Services::from_config(config, store)?;
    let orchestrator = RetrievalOrchestrator::new(config, services)?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    rt.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, cancelling retrieval");
            on_interrupt.cancel();
        }
    });

    let result = rt.block_on(orchestrator.retrieve_with_cancel(&query, cancel))?;

    if json {
        let out = serde_json::to_string_pretty(&result).map_err(|e| RagError::Json {
            source: e,
            context: "Failed to serialize retrieval result".to_string(),
        })?;
        println!("{}", out);
    } else {
        print_result(&result);
    }

    Ok(())
}

fn print_result(result: &RetrievalResult) {
    if result.is_empty() {
        println!("No matching chunks in index '{}'", result.index_id);
        return;
    }

    println!(
        "{} chunks from '{}' ({} variants, {} ms)",
        result.chunks.len(),
        result.index_id,
        result.variants.len(),
        result.elapsed_ms
    );
    if result.variants.len() > 1 {
        for variant in &result.variants {
            println!("  [{}] {:?}: {}", variant.position, variant.origin, variant.text);
        }
    }

    for chunk in &result.chunks {
        let modes: Vec<&str> = chunk.modes().iter().map(|m| m.as_str()).collect();
        println!(
            "\n#{} {} (doc {}) score {:.4} via {}",
            chunk.final_rank,
            chunk.chunk_id,
            chunk.doc_id,
            chunk.score,
            modes.join("+")
        );
        println!("  {}", chunk.preview(200));
    }

    if result.coverage.degraded {
        println!("\n⚠ Degraded coverage:");
        for failure in &result.coverage.failed {
            println!("  {} failed: {}", failure.list, failure.reason);
        }
    }
    if let RerankStatus::Failed { reason } = &result.rerank {
        println!("\n⚠ Rerank skipped: {}", reason);
    }
    if result.deadline_exceeded {
        println!("\n⚠ Deadline exceeded; results are partial");
    }
}

fn read_history(path: &Path) -> Result<Vec<Turn>> {
    let content = std::fs::read_to_string(path).map_err(|e| RagError::Io {
        source: e,
        context: format!("Failed to read history file: {:?}", path),
    })?;
    serde_json::from_str(&content).map_err(|e| RagError::Json {
        source: e,
        context: format!("Invalid history file: {:?}", path),
    })
}

fn read_records(path: &Path) -> Result<Vec<ChunkRecord>> {
    let content = std::fs::read_to_string(path).map_err(|e| RagError::Io {
        source: e,
        context: format!("Failed to read records file: {:?}", path),
    })?;

    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(number, line)| {
            serde_json::from_str(line).map_err(|e| RagError::Json {
                source: e,
                context: format!("Invalid record on line {}", number + 1),
            })
        })
        .collect()
}

fn cmd_ingest(config: &Config, file: &Path, index: Option<String>) -> Result<()> {
    let index_id = index
        .or_else(|| config.index.default_index.clone())
        .ok_or_else(|| RagError::MissingParameter("index id".to_string()))?;

    let records = read_records(file)?;
    let total = records.len();
    println!("Ingesting {} records into '{}'...", total, index_id);

    let store = LocalIndexStore::from_config(config)?;
    let embedder = embedder_from_config(config)?;

    let rt = runtime()?;
    let stats = rt.block_on(store.ingest(
        &index_id,
        records,
        embedder.as_ref(),
        config.embedding.batch_size,
    ))?;

    println!("✓ Ingest complete");
    println!("  Inserted:  {}", stats.inserted);
    println!("  Replaced:  {}", stats.replaced);
    println!("  Unchanged: {}", stats.unchanged);
    if stats.skipped_empty > 0 {
        println!("  Skipped (empty): {}", stats.skipped_empty);
    }

    Ok(())
}

fn cmd_indexes(config: &Config) -> Result<()> {
    let store = LocalIndexStore::from_config(config)?;
    let names = store.list()?;

    if names.is_empty() {
        println!("No indexes under {}", store.root().display());
        return Ok(());
    }

    for name in names {
        let index = store.open(&name)?;
        println!("{}  ({} chunks)", name, index.len()?);
    }

    Ok(())
}

fn cmd_config(config_path: Option<PathBuf>, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show { section } => {
            let config = load_config(config_path, None)?;
            let value = serde_json::to_value(&config).map_err(|e| RagError::Json {
                source: e,
                context: "Failed to serialize config".to_string(),
            })?;

            let value = match section {
                Some(section) => value
                    .get(&section)
                    .cloned()
                    .ok_or_else(|| RagError::Config(format!("Unknown section: {}", section)))?,
                None => value,
            };

            let json = serde_json::to_string_pretty(&value).map_err(|e| RagError::Json {
                source: e,
                context: "Failed to serialize config".to_string(),
            })?;
            println!("{}", json);
        }
        ConfigAction::Validate { file } => {
            let path = match file {
                Some(path) => path,
                None => Config::default_path()?,
            };
            let config = Config::load(&path)?;
            println!("✓ Configuration is valid");
            println!("  Schema version: {}", config.meta.schema_version);
        }
        ConfigAction::Init { force } => {
            let path = match config_path {
                Some(path) => path,
                None => Config::default_path()?,
            };

            if path.exists() && !force {
                println!("Configuration file already exists at: {}", path.display());
                println!("Use --force to overwrite");
                return Ok(());
            }

            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| RagError::Io {
                    source: e,
                    context: format!("Failed to create config directory: {:?}", parent),
                })?;
            }

            Config::default().save(&path)?;
            println!("✓ Configuration initialized at: {}", path.display());
        }
    }

    Ok(())
}

fn load_config(config_path: Option<PathBuf>, profile: Option<String>) -> Result<Config> {
    let path = match config_path {
        Some(path) => path,
        None => Config::default_path()?,
    };

    if !path.exists() {
        tracing::warn!(
            "Config file not found, using defaults. Run 'ragfuse config init' to create one."
        );
        let mut config = Config::default();
        config.apply_env_overrides();
        if let Some(profile) = profile {
            config.apply_profile(&profile)?;
        }
        return Ok(config);
    }

    if let Some(profile) = profile {
        Config::load_with_profile(&path, &profile)
    } else {
        Config::load(&path)
    }
}
