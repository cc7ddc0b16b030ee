//! Stowage CLI - Command line interface for blob storage operations.
//!
//! This tool resolves a storage provider from the registry and runs a
//! single blob operation against it.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use stowage_storage::{
    create_default_registry, AccessUrlOptions, BlobId, BlobProperties, GcsOptions,
    StorageProvider,
};

#[derive(Parser)]
#[command(name = "stowage")]
#[command(about = "Stowage - Blob storage across providers")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Provider name: "local", "gcs" or "memory".
    #[arg(short, long, default_value = "local")]
    provider: String,

    /// JSON provider configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a file.
    Put {
        /// Source file.
        source: PathBuf,

        /// Destination blob as container/key.
        blob: String,

        /// Content type (default: application/octet-stream).
        #[arg(long)]
        content_type: Option<String>,

        /// Make the blob publicly readable.
        #[arg(long)]
        public: bool,

        /// Metadata entry as key=value (repeatable).
        #[arg(short, long = "meta")]
        metadata: Vec<String>,
    },

    /// Download a blob to a file, or to stdout with "-".
    Get {
        /// Source blob as container/key.
        blob: String,

        /// Destination file.
        dest: PathBuf,
    },

    /// Delete a blob.
    Rm {
        /// Blob as container/key.
        blob: String,
    },

    /// Copy a blob.
    Cp {
        /// Source blob as container/key.
        source: String,

        /// Destination blob as container/key.
        dest: String,
    },

    /// Move a blob.
    Mv {
        /// Source blob as container/key.
        source: String,

        /// Destination blob as container/key.
        dest: String,
    },

    /// List blobs in a container.
    Ls {
        /// Container name.
        container: String,
    },

    /// Print a time-limited access URL.
    Url {
        /// Blob as container/key.
        blob: String,

        /// Lifetime in seconds.
        #[arg(short, long, default_value_t = 900)]
        expires: u64,

        /// Grant upload instead of download access.
        #[arg(long)]
        write: bool,

        /// Suggested download file name.
        #[arg(long)]
        download_name: Option<String>,

        /// Content type bound into the URL.
        #[arg(long)]
        content_type: Option<String>,
    },

    /// Show blob properties.
    Info {
        /// Blob as container/key.
        blob: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(&cli.provider, cli.config.as_deref())?;
    let provider = create_default_registry()
        .resolve(&cli.provider, config)
        .with_context(|| format!("Failed to create '{}' provider", cli.provider))?;

    let provider = provider.as_ref();
    match cli.command {
        Commands::Put {
            source,
            blob,
            content_type,
            public,
            metadata,
        } => {
            let mut properties = BlobProperties {
                content_type,
                ..BlobProperties::default()
            };
            if public {
                properties = properties.public();
            }
            for entry in &metadata {
                let (key, value) = parse_metadata(entry)?;
                properties = properties.with_metadata(key, value);
            }
            cmd_put(provider, &source, &blob, &properties).await
        }

        Commands::Get { blob, dest } => cmd_get(provider, &blob, &dest).await,

        Commands::Rm { blob } => cmd_rm(provider, &blob).await,

        Commands::Cp { source, dest } => cmd_cp(provider, &source, &dest).await,

        Commands::Mv { source, dest } => cmd_mv(provider, &source, &dest).await,

        Commands::Ls { container } => cmd_ls(provider, &container).await,

        Commands::Url {
            blob,
            expires,
            write,
            download_name,
            content_type,
        } => {
            let expires_in = Duration::from_secs(expires);
            let mut options = if write {
                AccessUrlOptions::write(expires_in)
            } else {
                AccessUrlOptions::read(expires_in)
            };
            options.download_name = download_name;
            options.content_type = content_type;
            cmd_url(provider, &blob, &options).await
        }

        Commands::Info { blob } => cmd_info(provider, &blob).await,
    }
}

/// Read provider configuration from a file, or fall back to defaults.
///
/// Without a file, `gcs` reads `STOWAGE_GCS_*` variables and `local`
/// uses the current directory.
fn load_config(provider: &str, path: Option<&Path>) -> Result<Value> {
    if let Some(path) = path {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        return serde_json::from_str(&content).context("Config file is not valid JSON");
    }

    match provider {
        "gcs" => {
            let options = GcsOptions::from_env()
                .context("Set STOWAGE_GCS_BUCKET or pass --config for the gcs provider")?;
            serde_json::to_value(options).context("Failed to encode GCS options")
        }
        "local" => {
            let root = std::env::current_dir().context("Failed to get current directory")?;
            Ok(serde_json::json!({ "root": root }))
        }
        _ => Ok(Value::Null),
    }
}

/// Split a `key=value` metadata argument.
fn parse_metadata(entry: &str) -> Result<(&str, &str)> {
    entry
        .split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .with_context(|| format!("Invalid metadata '{}', expected key=value", entry))
}

fn parse_blob(blob: &str) -> Result<BlobId> {
    BlobId::parse(blob).with_context(|| format!("Invalid blob '{}', expected container/key", blob))
}

/// Upload a file.
async fn cmd_put(
    provider: &dyn StorageProvider,
    source: &Path,
    blob: &str,
    properties: &BlobProperties,
) -> Result<()> {
    let id = parse_blob(blob)?;
    info!("Uploading {} to {}", source.display(), id);

    let mut file = File::open(source)
        .await
        .with_context(|| format!("Failed to open {}", source.display()))?;

    provider
        .save(&id, &mut file, properties)
        .await
        .context("Failed to upload blob")?;

    println!("Uploaded: {}", id);
    Ok(())
}

/// Download a blob.
async fn cmd_get(provider: &dyn StorageProvider, blob: &str, dest: &Path) -> Result<()> {
    let id = parse_blob(blob)?;
    let mut reader = provider.fetch(&id).await.context("Failed to fetch blob")?;

    if dest == Path::new("-") {
        let mut stdout = tokio::io::stdout();
        tokio::io::copy(&mut reader, &mut stdout)
            .await
            .context("Failed to write to stdout")?;
        return Ok(());
    }

    let mut file = File::create(dest)
        .await
        .with_context(|| format!("Failed to create {}", dest.display()))?;
    let written = tokio::io::copy(&mut reader, &mut file)
        .await
        .context("Failed to write output file")?;

    println!("Downloaded: {} -> {} ({} bytes)", id, dest.display(), written);
    Ok(())
}

/// Delete a blob.
async fn cmd_rm(provider: &dyn StorageProvider, blob: &str) -> Result<()> {
    let id = parse_blob(blob)?;
    provider.delete(&id).await.context("Failed to delete blob")?;

    println!("Deleted: {}", id);
    Ok(())
}

/// Copy a blob.
async fn cmd_cp(provider: &dyn StorageProvider, source: &str, dest: &str) -> Result<()> {
    let source = parse_blob(source)?;
    let dest = parse_blob(dest)?;
    provider
        .copy(&source, &dest)
        .await
        .context("Failed to copy blob")?;

    println!("Copied: {} -> {}", source, dest);
    Ok(())
}

/// Move a blob.
async fn cmd_mv(provider: &dyn StorageProvider, source: &str, dest: &str) -> Result<()> {
    let source = parse_blob(source)?;
    let dest = parse_blob(dest)?;
    provider
        .move_blob(&source, &dest)
        .await
        .context("Failed to move blob")?;

    println!("Moved: {} -> {}", source, dest);
    Ok(())
}

/// List a container.
async fn cmd_ls(provider: &dyn StorageProvider, container: &str) -> Result<()> {
    let blobs = provider
        .list(container)
        .await
        .context("Failed to list container")?;

    if blobs.is_empty() {
        println!("Container is empty.");
    } else {
        println!("Contents of {}:", container);
        for blob in blobs {
            println!(
                "  {} ({} bytes, {})",
                blob.id.key(),
                blob.length,
                blob.content_type
            );
        }
    }

    Ok(())
}

/// Print an access URL.
async fn cmd_url(
    provider: &dyn StorageProvider,
    blob: &str,
    options: &AccessUrlOptions,
) -> Result<()> {
    let id = parse_blob(blob)?;
    let url = provider
        .generate_access_url(&id, options)
        .await
        .context("Failed to generate access URL")?;

    println!("{}", url);
    Ok(())
}

/// Show blob properties.
async fn cmd_info(provider: &dyn StorageProvider, blob: &str) -> Result<()> {
    let id = parse_blob(blob)?;
    let descriptor = provider
        .descriptor(&id)
        .await
        .context("Failed to get blob properties")?;

    println!("Blob Information:");
    println!("  ID: {}", descriptor.id);
    println!("  Size: {} bytes", descriptor.length);
    println!("  Content-Type: {}", descriptor.content_type);
    println!("  Security: {:?}", descriptor.security);
    println!("  Modified: {}", descriptor.last_modified);
    if let Some(etag) = &descriptor.etag {
        println!("  ETag: {}", etag);
    }
    if let Some(md5) = &descriptor.content_md5 {
        println!("  MD5: {}", md5);
    }
    for (key, value) in &descriptor.metadata {
        println!("  {}: {}", key, value);
    }
    if let Ok(url) = provider.blob_url(&id) {
        println!("  URL: {}", url);
    }

    Ok(())
}
