//! # imsg-lens CLI
//!
//! Keeps an Elasticsearch index of image embeddings in sync with the local
//! Messages archive and searches it.
//!
//! ## Usage
//!
//! ```bash
//! imsg-lens --config ./config/imsg-lens.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `imsg-lens init` | Create the destination index and mapping |
//! | `imsg-lens embed` | Embed image attachments added since the last run |
//! | `imsg-lens search "<query>"` | Semantic search with filters |
//! | `imsg-lens browse` | Page through indexed documents without a query |
//! | `imsg-lens status` | Show the cursor and index size |
//!
//! Diagnostics go to stderr and are controlled with `RUST_LOG`
//! (default `warn`).

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use imsg_lens::index::SortOrder;
use imsg_lens::pipeline::{self, RunOptions};
use imsg_lens::progress::ProgressMode;
use imsg_lens::query::{self, FilterCriteria, ScrollOptions};
use imsg_lens::{config, index, status};

const DEFAULT_CONFIG: &str = "./config/imsg-lens.toml";

/// imsg-lens: incremental image embedding and semantic search for a
/// local Messages archive.
#[derive(Parser)]
#[command(
    name = "imsg-lens",
    about = "Incremental image embedding and semantic search for a local Messages archive",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// When the default path does not exist, built-in defaults are used.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the index and its mapping. Safe to run repeatedly.
    Init,

    /// Embed image attachments added since the last run.
    ///
    /// Reads attachments past the stored watermark, embeds them in batches,
    /// upserts one document per image, then advances the watermark.
    /// Ctrl-C stops after the current batch.
    Embed {
        /// Ignore the stored watermark and reprocess every attachment.
        #[arg(long)]
        full: bool,

        /// Records per embed/write batch.
        #[arg(long)]
        batch_size: Option<usize>,

        /// Elasticsearch URL (overrides `index.url`).
        #[arg(long)]
        index_url: Option<String>,

        /// Maximum number of attachments to read.
        #[arg(long)]
        limit: Option<usize>,

        /// Read and embed, but write nothing and keep the watermark.
        #[arg(long)]
        dry_run: bool,

        /// Progress output on stderr.
        #[arg(long, value_enum)]
        progress: Option<ProgressArg>,
    },

    /// Semantic search over indexed documents.
    Search {
        /// Free-text query.
        query: String,

        /// Only chats with this participant (exact name).
        #[arg(long)]
        person: Option<String>,

        /// Earliest day, inclusive (YYYY-MM-DD, local time).
        #[arg(long)]
        since: Option<String>,

        /// Latest day, inclusive (YYYY-MM-DD, local time).
        #[arg(long)]
        until: Option<String>,

        /// Maximum results (1-50).
        #[arg(long)]
        limit: Option<usize>,

        /// Only group chats.
        #[arg(long)]
        group_only: bool,
    },

    /// Page through indexed documents sorted by time.
    Browse {
        /// Documents per page (10-100).
        #[arg(long)]
        page_size: Option<usize>,

        #[arg(long, value_enum, default_value = "newest")]
        sort: SortArg,

        /// Only chats with this participant (exact name).
        #[arg(long)]
        person: Option<String>,

        /// Only this group chat (exact name).
        #[arg(long)]
        group: Option<String>,

        /// Only group chats.
        #[arg(long)]
        group_only: bool,

        /// Token printed by the previous page.
        #[arg(long)]
        page_token: Option<String>,
    },

    /// Show the watermark, totals, and index size.
    Status,
}

#[derive(Clone, Copy, ValueEnum)]
enum SortArg {
    Newest,
    Oldest,
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Off,
    Human,
    Json,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let explicit = cli.config != PathBuf::from(DEFAULT_CONFIG);
    let mut cfg = config::load_or_default(&cli.config, explicit)?;

    match cli.command {
        Commands::Init => {
            index::elastic::run_init(&cfg).await?;
        }
        Commands::Embed {
            full,
            batch_size,
            index_url,
            limit,
            dry_run,
            progress,
        } => {
            if let Some(url) = index_url {
                cfg.index.url = url;
            }
            if batch_size == Some(0) {
                anyhow::bail!("--batch-size must be > 0");
            }

            let cancel = Arc::new(AtomicBool::new(false));
            let flag = cancel.clone();
            tokio::spawn(async move {
                if let Some(code) = pipeline::watch_interrupts(flag, tokio::signal::ctrl_c).await {
                    std::process::exit(code);
                }
            });

            let mode = match progress {
                Some(ProgressArg::Off) => ProgressMode::Off,
                Some(ProgressArg::Human) => ProgressMode::Human,
                Some(ProgressArg::Json) => ProgressMode::Json,
                None => ProgressMode::default_for_tty(),
            };
            let reporter = mode.reporter();

            let opts = RunOptions {
                full,
                batch_size: batch_size.unwrap_or(cfg.pipeline.batch_size),
                limit: limit.or(cfg.pipeline.limit),
                dry_run,
                cancel: Some(cancel),
            };
            let summary = pipeline::run_embed(&cfg, &opts, reporter.as_ref()).await?;
            summary.print();
        }
        Commands::Search {
            query,
            person,
            since,
            until,
            limit,
            group_only,
        } => {
            let limit = limit.unwrap_or(cfg.search.limit);
            if !(1..=50).contains(&limit) {
                anyhow::bail!("--limit must be between 1 and 50");
            }
            let criteria = FilterCriteria {
                person,
                group_name: None,
                date_range: query::day_range(since.as_deref(), until.as_deref())?,
                group_only,
                result_limit: limit,
            };
            query::run_search(&cfg, &query, &criteria).await?;
        }
        Commands::Browse {
            page_size,
            sort,
            person,
            group,
            group_only,
            page_token,
        } => {
            let page_size = page_size.unwrap_or(cfg.search.page_size);
            if !(10..=100).contains(&page_size) {
                anyhow::bail!("--page-size must be between 10 and 100");
            }
            let criteria = FilterCriteria {
                person,
                group_name: group,
                date_range: None,
                group_only,
                result_limit: page_size,
            };
            let scroll = ScrollOptions {
                order: match sort {
                    SortArg::Newest => SortOrder::Descending,
                    SortArg::Oldest => SortOrder::Ascending,
                },
                page_token,
            };
            query::run_browse(&cfg, &criteria, &scroll).await?;
        }
        Commands::Status => {
            status::run_status(&cfg).await?;
        }
    }

    Ok(())
}
