//! AFS CLI - browse a file system composed from a TOML config
//!
//! Usage:
//!   afs --config afs.toml mounts
//!   afs list /modules --depth 2
//!   afs read /modules/docs/intro.md
//!   afs write /modules/docs/intro.md "# Intro"
//!   afs search /modules "fox"
//!   afs stale

use std::io::Read;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use afs::{
    AfsConfig, DeleteOptions, ListOptions, ReadOptions, SearchOptions, View, WaitStrategy,
    WriteOptions, WritePayload,
};

#[derive(Parser, Debug)]
#[command(name = "afs")]
#[command(about = "Browse an agent file system composed from local directories")]
struct Args {
    /// Config file
    #[arg(long, short, default_value = "afs.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show mounted modules
    Mounts,
    /// List entries below a path
    List {
        /// Path to list
        #[arg(default_value = "/")]
        path: String,
        /// Depth budget
        #[arg(long, short, default_value_t = 1)]
        depth: usize,
        /// Glob filter relative to the listed path
        #[arg(long)]
        filter: Option<String>,
        /// Maximum number of entries
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Read an entry, optionally as a view (`language=fr`)
    Read {
        /// Entry path
        path: String,
        /// View as `name=value;name=value`
        #[arg(long)]
        view: Option<String>,
        /// Serve the source while a view is generating
        #[arg(long)]
        fallback: bool,
    },
    /// Write an entry from an argument or stdin
    Write {
        /// Entry path
        path: String,
        /// Content; read from stdin when omitted
        content: Option<String>,
        /// Append instead of replacing
        #[arg(long)]
        append: bool,
    },
    /// Delete an entry
    Delete {
        /// Entry path
        path: String,
        /// Delete directories with their contents
        #[arg(long, short)]
        recursive: bool,
    },
    /// Search entry content below a path
    Search {
        /// Path to search
        path: String,
        /// Substring to look for
        query: String,
        /// Match case
        #[arg(long)]
        case_sensitive: bool,
        /// Maximum number of results
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show views waiting for regeneration
    Stale,
}

fn print(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();
    let config = AfsConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    if let Command::Stale = args.command {
        let store = config.open_store()?;
        let views = store.list_stale_views().await?;
        tracing::info!(count = views.len(), "stale views");
        return print(&views);
    }

    let afs = config.build(None)?;
    match args.command {
        Command::Mounts => print(&afs.mounts())?,
        Command::List {
            path,
            depth,
            filter,
            limit,
        } => {
            let options = ListOptions {
                filter,
                limit,
                ..ListOptions::with_depth(depth)
            };
            print(&afs.list(&path, &options).await?.entries)?;
        }
        Command::Read {
            path,
            view,
            fallback,
        } => {
            let mut options = ReadOptions::default();
            if let Some(view) = view {
                options.view = Some(View::parse(&view)?);
            }
            if fallback {
                options = options.wait(WaitStrategy::Fallback);
            }
            let result = afs.read(&path, &options).await?;
            let entry = result
                .entry
                .with_context(|| format!("not found: {path}"))?;
            print(&json!({ "entry": entry, "message": result.message }))?;
        }
        Command::Write {
            path,
            content,
            append,
        } => {
            let content = match content {
                Some(content) => content,
                None => {
                    let mut buf = String::new();
                    std::io::stdin().read_to_string(&mut buf)?;
                    buf
                }
            };
            let written = afs
                .write(&path, WritePayload::content(content), &WriteOptions { append })
                .await?;
            print(&written.entry)?;
        }
        Command::Delete { path, recursive } => {
            afs.delete(&path, &DeleteOptions { recursive }).await?;
            tracing::info!(path = %path, "deleted");
        }
        Command::Search {
            path,
            query,
            case_sensitive,
            limit,
        } => {
            let options = SearchOptions {
                limit,
                case_sensitive,
            };
            print(&afs.search(&path, &query, &options).await?.entries)?;
        }
        Command::Stale => {}
    }
    Ok(())
}
