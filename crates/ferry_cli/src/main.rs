use anyhow::Context;
use clap::{Parser, Subcommand};
use ferry_client::{BaseUrlResolver, Downloader, JobStatus};
use ferry_core::prelude::*;
use ferry_fs::OsFileSystem;
use ferry_storage::LocalStorage;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ferry")]
#[command(about = "CLI for the Ferry content cache")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Remote source URL
    #[arg(short, long, env = "FERRY_URL")]
    url: Option<String>,

    /// Cache directory
    #[arg(short, long, env = "FERRY_CACHE")]
    cache: Option<PathBuf>,

    /// JSON config file, overridden by --url and --cache
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a package into the cache
    Fetch {
        name: String,
        /// Expected size in bytes, enables resuming
        #[arg(short, long)]
        size: Option<u32>,
    },
    /// Check a cached package against a digest, evicting it on mismatch
    Verify {
        name: String,
        #[arg(short, long)]
        size: u32,
        /// Hex checksum as written in the manifest
        #[arg(long)]
        checksum: Checksum,
    },
    /// Inspect or modify the cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
    /// Inspect manifests and package files
    Manifest {
        #[command(subcommand)]
        command: ManifestCommands,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    List,
    Delete { name: String },
}

#[derive(Subcommand)]
enum ManifestCommands {
    /// Print the packages and entries of a manifest
    Show { file: PathBuf },
    /// Print the `size,checksum` digest of a file
    Checksum { file: PathBuf },
}

impl Cli {
    fn content_config(&self) -> anyhow::Result<ContentConfig> {
        let mut config = match &self.config {
            Some(path) => ContentConfig::from_json_file(path)
                .with_context(|| format!("reading {}", path.display()))?,
            None => ContentConfig::default(),
        };
        if let Some(url) = &self.url {
            config.base_url = url.clone();
        }
        if let Some(cache) = &self.cache {
            config.storage_root = cache.clone();
        }
        Ok(config)
    }
}

fn open_storage(config: &ContentConfig) -> anyhow::Result<LocalStorage> {
    std::fs::create_dir_all(&config.storage_root)?;
    let fs = Arc::new(OsFileSystem::new(config.storage_root.clone()));
    Ok(LocalStorage::new(fs, config.cache_extension.clone())?)
}

fn fetch(config: &ContentConfig, name: &str, size: Option<u32>) -> anyhow::Result<()> {
    let storage = open_storage(config)?;
    let runtime = Runtime::new()?;
    let scheduler = Scheduler::new(config.pump_interval());
    let resolver = BaseUrlResolver::new(&config.base_url, config.user_agent.clone())?;
    let downloader = Downloader::new(
        scheduler,
        runtime.handle().clone(),
        Arc::new(resolver),
        config,
    )?;

    println!("⬇️  Fetching {name} from {}...", config.base_url);
    let job = downloader.enqueue(&storage, name, size)?;
    downloader.wait_all()?;
    let digest = storage.digest(name).unwrap_or_default();
    storage.shutdown();

    match job.info().status {
        JobStatus::Succeeded => {
            println!("✅ Stored {name}: {digest}");
            Ok(())
        }
        status => anyhow::bail!("download of {name} ended as {status:?}"),
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.content_config()?;

    match cli.command {
        Commands::Fetch { name, size } => fetch(&config, &name, size)?,
        Commands::Verify {
            name,
            size,
            checksum,
        } => {
            let storage = open_storage(&config)?;
            let expected = ContentDigest::new(size, checksum);
            let valid = storage.verify(&name, &expected);
            storage.save_state()?;
            if valid {
                println!("✅ {name} matches {expected}");
            } else {
                anyhow::bail!("{name} does not match {expected}");
            }
        }
        Commands::Cache { command } => {
            let storage = open_storage(&config)?;
            match command {
                CacheCommands::List => {
                    for (alias, digest) in storage.entries() {
                        println!("{alias}\t{digest}");
                    }
                    println!(
                        "\n{} entries, {} bytes in {}",
                        storage.len(),
                        storage.total_size(),
                        config.storage_root.display()
                    );
                }
                CacheCommands::Delete { name } => {
                    if storage.delete(&name) {
                        storage.save_state()?;
                        println!("🗑️  Deleted {name}");
                    } else {
                        anyhow::bail!("{name} is not cached or is in use");
                    }
                }
            }
        }
        Commands::Manifest { command } => match command {
            ManifestCommands::Show { file } => {
                let library = ContentLibrary::load(&file)
                    .with_context(|| format!("reading {}", file.display()))?;
                for package in library.packages() {
                    let info = package.info();
                    println!("{} {} [{}]", package.kind(), package.name(), package.digest());
                    if !info.dependencies.is_empty() {
                        println!("  depends on {}", info.dependencies.join(", "));
                    }
                    for entry in package.entries() {
                        println!("  {}", entry.path());
                    }
                }
                println!(
                    "\n{} packages, {} entries",
                    library.package_count(),
                    library.entry_count()
                );
            }
            ManifestCommands::Checksum { file } => {
                let (checksum, len) = Checksum::from_reader(File::open(&file)?)?;
                let size = u32::try_from(len).context("file too large for a package")?;
                println!("{size},{checksum}");
            }
        },
    }

    Ok(())
}
