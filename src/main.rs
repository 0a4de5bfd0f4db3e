use anyhow::{Context, Result};
use autocommit_rag::indexer::{PathFilter, WorktreeSource};
use autocommit_rag::{
    Config, GitTreeSource, IndexSynchronizer, Retriever, SyncError, SyncOptions, TreeSource,
    render_context,
};
use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Reference recorded for syncs of the working tree
const WORKTREE_REFERENCE: &str = "WORKTREE";

/// Maintain and query the repository context index used for commit messages
#[derive(Parser, Debug)]
#[command(
    author,
    version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_COMMIT_HASH"), ")"),
    about,
    long_about = None
)]
struct Args {
    /// Repository (any path inside it)
    #[arg(short = 'C', long, default_value = ".")]
    repo: PathBuf,

    /// Configuration file (defaults to <storage>/rag.toml, then the user config)
    #[arg(long, env = "AUTOCOMMIT_RAG_CONFIG")]
    config: Option<PathBuf>,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Bring the index up to date
    Sync {
        /// Git reference to index
        #[arg(long = "ref", default_value = "HEAD", conflicts_with = "worktree")]
        reference: String,
        /// Index the working tree instead of a commit
        #[arg(long)]
        worktree: bool,
        /// Discard the existing index and embed everything again
        #[arg(long)]
        rebuild: bool,
    },
    /// Print the snippets most similar to a query
    Retrieve {
        /// Query text; read from stdin when omitted and --staged is not set
        #[arg(conflicts_with = "staged")]
        query: Option<String>,
        /// Use the staged diff as the query
        #[arg(long)]
        staged: bool,
        /// Number of snippets
        #[arg(short)]
        k: Option<usize>,
    },
    /// Print the staged diff
    Diff,
    /// Show index statistics
    Stats,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();
    let git = GitTreeSource::discover(&args.repo).ok();
    let repo_root = match &git {
        Some(git) => git.repo_path().to_path_buf(),
        None => args.repo.clone(),
    };
    let config = load_config(args.config.as_deref(), &repo_root)?;

    match args.command {
        Commands::Sync {
            reference,
            worktree,
            rebuild,
        } => {
            let (source, reference): (Arc<dyn TreeSource>, String) = if worktree {
                let layout = config.layout(&repo_root);
                let filter =
                    PathFilter::new(&config.chunking.exclude_patterns, layout.storage_prefix())?;
                let walker = WorktreeSource::new(&repo_root, config.chunking.max_file_size)
                    .with_filter(filter);
                (Arc::new(walker), WORKTREE_REFERENCE.to_string())
            } else {
                let git = git.context("Not inside a git repository (use --worktree)")?;
                (Arc::new(git), reference)
            };

            let synchronizer = IndexSynchronizer::from_config(&config, &repo_root)?;
            let options = SyncOptions {
                rebuild,
                cancel: None,
            };
            match synchronizer.sync(source, &reference, &options).await {
                Ok(report) => {
                    if args.json {
                        println!("{}", serde_json::to_string_pretty(&report)?);
                    } else {
                        println!(
                            "Synced {} ({:?}): {} units, {} added, {} removed, {} files skipped",
                            report.sync_point,
                            report.mode,
                            report.units_total,
                            report.units_added,
                            report.units_removed,
                            report.skipped.len()
                        );
                    }
                }
                Err(SyncError::Partial(report)) => {
                    if args.json {
                        println!("{}", serde_json::to_string_pretty(&report)?);
                    }
                    anyhow::bail!(
                        "committed {} with {} units left unembedded; run sync again to retry",
                        report.sync_point,
                        report.failed.len()
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        Commands::Retrieve { query, staged, k } => {
            let query = match (query, staged) {
                (Some(query), _) => query,
                (None, true) => git
                    .context("Not inside a git repository")?
                    .pending_diff()?,
                (None, false) => {
                    let mut buf = String::new();
                    std::io::stdin()
                        .read_to_string(&mut buf)
                        .context("Failed to read query from stdin")?;
                    buf
                }
            };

            let retriever = Retriever::from_config(&config, &repo_root)?;
            let snippets = retriever
                .retrieve(&query, k.unwrap_or(config.retrieval.k))
                .await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&snippets)?);
            } else if !snippets.is_empty() {
                println!("{}", render_context(&snippets));
            }
        }

        Commands::Diff => {
            let diff = git.context("Not inside a git repository")?.pending_diff()?;
            print!("{}", diff);
        }

        Commands::Stats => {
            let synchronizer = IndexSynchronizer::from_config(&config, &repo_root)?;
            match synchronizer.stats().await? {
                Some(stats) if args.json => println!("{}", serde_json::to_string_pretty(&stats)?),
                Some(stats) => {
                    println!("Units:      {}", stats.units);
                    println!("Files:      {}", stats.files);
                    if let Some(dimension) = stats.dimension {
                        println!("Dimension:  {}", dimension);
                    }
                    println!("Model:      {}", stats.embedding_model);
                    println!("Generation: {}", stats.generation);
                    if let Some(point) = &stats.sync_point {
                        println!("Synced at:  {}", point);
                    }
                    println!("Committed:  {}", stats.committed_at);
                }
                None => println!("No index committed yet"),
            }
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>, repo_root: &Path) -> Result<Config> {
    let config = match path {
        Some(path) => {
            let mut config = Config::from_file(path)?;
            config.apply_env_overrides();
            config.validate()?;
            config
        }
        None => Config::new(repo_root)?,
    };
    Ok(config)
}
