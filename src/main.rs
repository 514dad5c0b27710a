use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use hostkeeper::{app, settings};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "hostkeeper",
    version,
    about = "Keep the hosts file pinned to a canonical content"
)]
struct Cli {
    /// Settings file (defaults to hostkeeper.toml next to the executable)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Watch the hosts file and repair it whenever it drifts (default)
    Run,
    /// Compare the hosts file with the canonical content; exits 2 on drift
    Check,
    /// Rewrite the hosts file once if it has drifted
    Repair,
    /// Replace the canonical content with the contents of FILE, or stdin for -
    SetContent { source: PathBuf },
    /// Set the debounce delay in milliseconds
    SetDelay {
        #[arg(allow_negative_numbers = true)]
        ms: i64,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "hostkeeper=debug" } else { "hostkeeper=info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = cli.config.unwrap_or_else(settings::default_config_path);
    let result = match cli.command.unwrap_or(Command::Run) {
        Command::Run => app::run(&config).await,
        Command::Check => app::check(&config).await,
        Command::Repair => app::repair(&config).await,
        Command::SetContent { source } => app::set_content(&config, &source).await,
        Command::SetDelay { ms } => app::set_delay(&config, ms).await,
    };

    match result {
        Ok(outcome) => outcome.into(),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
