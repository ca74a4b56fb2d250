//! Command-line interface for modelout.
//!
//! Provides commands for importing revisions, managing serializer
//! configurations, checking out or downloading revisions through the
//! orchestrator, and inspecting the output cache.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::io::AsyncWrite;

use crate::cache::DiskCacheManager;
use crate::config;
use crate::core::{CheckoutOrchestrator, CheckoutRequest};
use crate::domain::{NewObject, NewPluginConfiguration, PluginConfiguration, RequestDescriptor, RevisionId, SerializerId};
use crate::plugins::BOUNDING_BOX_ENGINE;
use crate::serializers::{JSON_MESSAGES_SERIALIZER, JSON_SERIALIZER, TEXT_SERIALIZER};
use crate::store::SqliteDatabase;

/// modelout - Checkout and download orchestrator for versioned models
#[derive(Parser, Debug)]
#[command(name = "modelout")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the database and register the built-in serializers
    Init,

    /// Import a JSON array of objects as a new revision
    Import {
        /// Project name (created if missing)
        #[arg(short, long)]
        project: String,

        /// File containing `[{"type": ..., "attributes": {...}}, ...]`
        file: PathBuf,

        /// Revision comment
        #[arg(short, long, default_value = "")]
        comment: String,
    },

    /// List stored revisions
    Revisions,

    /// List serializer configurations
    Serializers,

    /// Check out a revision (records the checkout)
    Checkout(RequestArgs),

    /// Download a revision without recording anything
    Download(RequestArgs),

    /// Serve previously cached output only
    Replay(RequestArgs),

    /// List populated cache entries
    Cache,

    /// Show resolved configuration (debug)
    Config,
}

/// Arguments shared by checkout, download and replay
#[derive(Args, Debug, Clone)]
pub struct RequestArgs {
    /// Revision id
    pub revision: i64,

    /// Serializer configuration id
    #[arg(short, long)]
    pub serializer: i64,

    /// Serializer parameter (repeatable)
    #[arg(short, long = "param", value_name = "KEY=VALUE", value_parser = parse_param)]
    pub params: Vec<(String, String)>,

    /// Output file (stdout if not provided)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// User to record (defaults to the configured username)
    #[arg(short, long)]
    pub user: Option<String>,
}

impl RequestArgs {
    fn descriptor(&self) -> RequestDescriptor {
        self.params.iter().fold(
            RequestDescriptor::new(RevisionId(self.revision), SerializerId(self.serializer)),
            |descriptor, (key, value)| descriptor.with_param(key, value),
        )
    }
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim().to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}

#[derive(Debug, Clone, Copy)]
enum RequestKind {
    Checkout,
    Download,
    Replay,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Init => init().await,
            Commands::Import {
                project,
                file,
                comment,
            } => import(&project, &file, &comment).await,
            Commands::Revisions => list_revisions().await,
            Commands::Serializers => list_serializers().await,
            Commands::Checkout(args) => run_request(RequestKind::Checkout, args).await,
            Commands::Download(args) => run_request(RequestKind::Download, args).await,
            Commands::Replay(args) => run_request(RequestKind::Replay, args).await,
            Commands::Cache => list_cache().await,
            Commands::Config => show_config().await,
        }
    }
}

fn open_database() -> Result<SqliteDatabase> {
    let path = config::database_path()?;
    SqliteDatabase::open(&path).with_context(|| format!("Failed to open database: {}", path.display()))
}

/// Register the built-in serializers on an empty database
async fn init() -> Result<()> {
    let db = open_database()?;

    let existing = db.list_plugin_configurations()?;
    if existing.is_empty() {
        let defaults = [
            NewPluginConfiguration::serializer("JSON", JSON_SERIALIZER).with_render_engine("Bounding box", BOUNDING_BOX_ENGINE),
            NewPluginConfiguration::serializer("Text listing", TEXT_SERIALIZER),
            NewPluginConfiguration::messaging_serializer("JSON messages", JSON_MESSAGES_SERIALIZER),
        ];
        for configuration in defaults {
            let created = db.add_plugin_configuration(configuration)?;
            println!("Registered serializer {} ({})", created.id(), created.name());
        }
    } else {
        println!("{} serializer configuration(s) already present", existing.len());
    }

    println!("Database: {}", db.path().display());
    Ok(())
}

async fn import(project: &str, file: &PathBuf, comment: &str) -> Result<()> {
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read input file: {}", file.display()))?;
    let objects: Vec<NewObject> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse objects from: {}", file.display()))?;

    let db = open_database()?;
    let project = db.ensure_project(project)?;
    let username = config::config()?.server.username.clone();
    let revision = db.import_revision(project.id, &username, comment, &objects)?;

    println!(
        "Imported revision {} (#{} of {}) with {} objects",
        revision.id,
        revision.number,
        project.name,
        objects.len()
    );
    Ok(())
}

async fn list_revisions() -> Result<()> {
    let db = open_database()?;
    let revisions = db.list_revisions()?;

    if revisions.is_empty() {
        println!("No revisions found.");
        return Ok(());
    }

    println!("{:<8} {:<20} {:<6} {:<8} {:<12} {}", "ID", "PROJECT", "NR", "OBJECTS", "USER", "CREATED");
    println!("{}", "-".repeat(80));
    for summary in revisions {
        println!(
            "{:<8} {:<20} {:<6} {:<8} {:<12} {}",
            summary.revision.id,
            summary.project_name,
            summary.revision.number,
            summary.object_count,
            summary.revision.user,
            summary.revision.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

async fn list_serializers() -> Result<()> {
    let db = open_database()?;
    let configurations = db.list_plugin_configurations()?;

    if configurations.is_empty() {
        println!("No serializers configured. Run `modelout init` first.");
        return Ok(());
    }

    println!("{:<6} {:<22} {:<16} {}", "ID", "NAME", "CLASS", "KIND");
    println!("{}", "-".repeat(60));
    for configuration in configurations {
        let class = match &configuration {
            PluginConfiguration::Serializer(c) => match &c.render_engine {
                Some(engine) => format!("{} +{}", c.plugin_class, engine.plugin_class),
                None => c.plugin_class.clone(),
            },
            PluginConfiguration::MessagingSerializer(c) => c.plugin_class.clone(),
            PluginConfiguration::Other { .. } => "-".to_string(),
        };
        println!(
            "{:<6} {:<22} {:<16} {}",
            configuration.id(),
            configuration.name(),
            class,
            configuration.kind()
        );
    }
    Ok(())
}

/// Run a request through the orchestrator and write its output
async fn run_request(kind: RequestKind, args: RequestArgs) -> Result<()> {
    let cfg = config::config()?;
    let orchestrator = CheckoutOrchestrator::from_config(cfg).context("Failed to set up orchestrator")?;

    let descriptor = args.descriptor();
    let username = args.user.clone().unwrap_or_else(|| cfg.server.username.clone());
    let request = match kind {
        RequestKind::Checkout => CheckoutRequest::checkout(descriptor, username),
        RequestKind::Download => CheckoutRequest::download(descriptor, username),
        RequestKind::Replay => CheckoutRequest::replay(descriptor, username),
    };

    let mut result = orchestrator.checkout(request).await?;
    let Some(output) = result.take_output() else {
        anyhow::bail!(
            "Request produced no output: {:?}",
            result.completion().state()
        );
    };
    let delivery = output.kind();

    let written = match &args.output {
        Some(path) => {
            let mut file = tokio::fs::File::create(path)
                .await
                .with_context(|| format!("Failed to create output file: {}", path.display()))?;
            drain_into(output, &mut file).await?
        }
        None => drain_into(output, &mut tokio::io::stdout()).await?,
    };

    eprintln!(
        "[{} bytes, {} delivery, {:?}]",
        written,
        delivery,
        result.completion().state()
    );
    Ok(())
}

async fn drain_into<W>(output: crate::core::OutputHandle, writer: &mut W) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    output.write_to(writer).await.context("Failed to write output")
}

async fn list_cache() -> Result<()> {
    let cfg = config::config()?;
    let cache: Arc<DiskCacheManager> = DiskCacheManager::new(&cfg.cache_dir, cfg.server.replay_chunk_size)?;
    let entries = cache.entries()?;

    if entries.is_empty() {
        println!("Cache is empty.");
        return Ok(());
    }

    println!("{:<10} {:<10} {:<10} {:<30} {}", "REVISION", "SERIALIZER", "BYTES", "PARAMS", "CREATED");
    println!("{}", "-".repeat(80));
    for entry in entries {
        let params = entry
            .descriptor
            .params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");
        println!(
            "{:<10} {:<10} {:<10} {:<30} {}",
            entry.descriptor.revision_id,
            entry.descriptor.serializer_id,
            entry.size_bytes,
            if params.is_empty() { "-".to_string() } else { params },
            entry.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

/// Show resolved configuration
async fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("modelout configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:      {}", cfg.home.display());
    println!("  Database:  {}", cfg.database.display());
    println!("  Cache:     {}", cfg.cache_dir.display());
    println!();
    println!("Server settings:");
    println!("  Cache output files: {}", cfg.server.cache_output_files);
    println!("  Replay chunk size:  {} bytes", cfg.server.replay_chunk_size);
    println!("  Username:           {}", cfg.server.username);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_param() {
        assert_eq!(parse_param("types=Wall,Door").unwrap(), ("types".to_string(), "Wall,Door".to_string()));
        assert_eq!(parse_param("empty=").unwrap(), ("empty".to_string(), String::new()));
        assert!(parse_param("novalue").is_err());
        assert!(parse_param("=x").is_err());
    }

    #[test]
    fn test_request_args_build_descriptor() {
        let cli = Cli::parse_from([
            "modelout", "checkout", "42", "--serializer", "7", "-p", "types=Wall", "--param", "batch=8",
        ]);
        let Commands::Checkout(args) = cli.command else {
            panic!("expected checkout command");
        };

        let descriptor = args.descriptor();
        assert_eq!(
            descriptor,
            RequestDescriptor::new(RevisionId(42), SerializerId(7))
                .with_param("types", "Wall")
                .with_param("batch", "8")
        );
    }
}
