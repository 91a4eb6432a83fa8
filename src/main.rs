use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use romtool::commands::catalogue::{list_catalogue, list_mirrors};
use romtool::commands::install::{build_requests, install_all, resolve_mirrors, timestamped};
use romtool::config::RomToolConfig;
use romtool::errors::Result;
use romtool::logging;
use romtool::models::ConversionFormat;
use romtool::utils::paths::{resolve_log_dir, resolve_root_dir};
use romtool::AppState;

#[derive(Parser)]
#[command(name = "romtool", version, about = "Download, convert and install Xbox 360 disc images")]
struct Cli {
    /// Config file (defaults to romtool.config.json in the data directory).
    #[arg(long, global = true, env = "ROMTOOL_CONFIG")]
    config: Option<PathBuf>,
    /// Directory containing bin/exiso and bin/iso2god.
    #[arg(long, global = true)]
    base: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List catalogue entries, optionally filtered by title.
    Catalogue {
        #[arg(long)]
        query: Option<String>,
    },
    /// List download mirrors found on a detail page.
    Mirrors {
        #[arg(long)]
        url: String,
        #[arg(long)]
        title: Option<String>,
    },
    /// Download, convert and install one or more titles, one after another.
    Install {
        #[arg(long)]
        dest: PathBuf,
        #[arg(long, default_value = "xex")]
        format: ConversionFormat,
        #[arg(long = "url", required_unless_present = "query", conflicts_with = "query")]
        urls: Vec<String>,
        #[arg(long)]
        query: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let root = resolve_root_dir();
    if let Err(err) = logging::init(&resolve_log_dir(&root)) {
        eprintln!("file logging disabled: {}", err);
    }

    let config = match load_config(&cli, &root) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{}", err.user_message());
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(
        "romtool {} starting (base {}, temp {})",
        env!("CARGO_PKG_VERSION"),
        config.base_dir.display(),
        config.temp_root.display()
    );

    match run(cli.command, AppState::new(config)).await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("{}", err);
            eprintln!("{}", err.user_message());
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli, root: &std::path::Path) -> Result<RomToolConfig> {
    let mut config = match &cli.config {
        Some(path) => RomToolConfig::load(path)?,
        None => RomToolConfig::load_from_root(root)?,
    };
    if let Some(base) = &cli.base {
        config.base_dir = base.clone();
    }
    Ok(config)
}

async fn run(command: Command, state: AppState) -> Result<ExitCode> {
    match command {
        Command::Catalogue { query } => {
            let entries = list_catalogue(&state, query.as_deref()).await?;
            for (index, entry) in entries.iter().enumerate() {
                println!("{:>4}. {}", index + 1, entry);
                println!("      {}", entry.detail_url);
            }
            println!("{} entries", entries.len());
        }
        Command::Mirrors { url, title } => {
            for mirror in list_mirrors(&state, &url, title.as_deref()).await? {
                println!("{}", mirror);
            }
        }
        Command::Install {
            dest,
            format,
            urls,
            query,
        } => {
            let mirrors = resolve_mirrors(&state, &urls, query.as_deref()).await?;
            let requests = build_requests(mirrors, &dest, format);
            println!(
                "{}",
                timestamped(&format!("Queued {} item(s) for {} install", requests.len(), format))
            );

            let outcomes = install_all(&state, requests).await?;
            let mut failed = 0usize;
            for outcome in &outcomes {
                match &outcome.result {
                    Ok(path) => println!("  ok    {}  ->  {}", outcome.label, path.display()),
                    Err(message) => {
                        failed += 1;
                        println!("  FAIL  {}: {}", outcome.label, message.replace('\n', " "));
                    }
                }
            }
            if failed > 0 {
                return Ok(ExitCode::FAILURE);
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}
