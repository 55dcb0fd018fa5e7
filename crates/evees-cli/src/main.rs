#![forbid(unsafe_code)]

mod cmd;
mod output;

use clap::{Parser, Subcommand};
use cmd::Project;
use output::{CliError, OutputMode, render_error};
use std::env;
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use evees_core::config::{self, EffectiveConfig};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "evees: content-addressed perspectives with layered caches and merge",
    long_about = None
)]
struct Cli {
    /// Emit JSON output instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,

    /// Project root holding `.evees/` (defaults to the current directory).
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        next_help_heading = "Setup",
        about = "Initialize an evees project",
        after_help = "EXAMPLES:\n    evees init\n    evees init --force --json"
    )]
    Init(cmd::init::InitArgs),

    #[command(
        next_help_heading = "Content",
        about = "Print the content id of a JSON document",
        after_help = "EXAMPLES:\n    evees hash '{\"text\":\"hello\"}'"
    )]
    Hash(cmd::hash::HashArgs),

    #[command(
        next_help_heading = "Content",
        about = "Store a JSON document and print its id"
    )]
    Put(cmd::put::PutArgs),

    #[command(next_help_heading = "Content", about = "Print a stored document")]
    Get(cmd::get::GetArgs),

    #[command(
        next_help_heading = "Perspectives",
        about = "Create a perspective with initial content",
        after_help = "EXAMPLES:\n    evees create '{\"type\":\"TextNode\",\"text\":\"notes\",\"links\":[]}'\n    evees create '{\"type\":\"TextNode\",\"text\":\"ch 1\",\"links\":[]}' --parent <id>"
    )]
    Create(cmd::create::CreateArgs),

    #[command(
        next_help_heading = "Perspectives",
        about = "Commit new content to a perspective"
    )]
    Update(cmd::update::UpdateArgs),

    #[command(
        next_help_heading = "Perspectives",
        about = "Fork a perspective at its current head"
    )]
    Fork(cmd::fork::ForkArgs),

    #[command(next_help_heading = "Read", about = "Show one perspective")]
    Show(cmd::show::ShowArgs),

    #[command(next_help_heading = "Read", about = "Show a perspective's history")]
    Log(cmd::log::LogArgs),

    #[command(
        next_help_heading = "Perspectives",
        about = "Merge one perspective into another",
        after_help = "EXAMPLES:\n    evees merge <to> <from>\n    evees merge <to> <from> --condense"
    )]
    Merge(cmd::merge::MergeArgs),
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("EVEES_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "evees=debug,info"
        } else {
            "evees=info,warn"
        })
    });

    let format = env::var("EVEES_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());
    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

async fn dispatch(
    cli: Cli,
    config: &EffectiveConfig,
    output: OutputMode,
    root: PathBuf,
) -> anyhow::Result<()> {
    let open = || Project::open(&root, config);
    match cli.command {
        Commands::Init(args) => cmd::init::run_init(&args, config, output, &root),
        Commands::Hash(args) => cmd::hash::run_hash(&args, config, output),
        Commands::Put(args) => cmd::put::run_put(&args, &open().await?, output).await,
        Commands::Get(args) => cmd::get::run_get(&args, &open().await?, output).await,
        Commands::Create(args) => cmd::create::run_create(&args, &open().await?, output).await,
        Commands::Update(args) => cmd::update::run_update(&args, &open().await?, output).await,
        Commands::Fork(args) => cmd::fork::run_fork(&args, &open().await?, output).await,
        Commands::Show(args) => cmd::show::run_show(&args, &open().await?, output).await,
        Commands::Log(args) => cmd::log::run_log(&args, &open().await?, output).await,
        Commands::Merge(args) => cmd::merge::run_merge(&args, &open().await?, output).await,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let root = match &cli.root {
        Some(root) => root.clone(),
        None => env::current_dir()?,
    };
    let config = config::resolve_config(&root, cli.json)?;
    let output = OutputMode::from_resolved(&config.resolved_output);
    debug!(root = %root.display(), ?output, "resolved configuration");

    if let Err(err) = dispatch(cli, &config, output, root).await {
        render_error(output, &CliError::from(&err))?;
        std::process::exit(1);
    }
    Ok(())
}
