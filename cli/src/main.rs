use std::path::PathBuf;

use clap::ArgAction;
use clap::Parser;
use clap::Subcommand;
use execbridge_cli::grep_cmd;
use execbridge_cli::grep_cmd::GrepCli;
use execbridge_cli::load_config;
use execbridge_cli::process_exit_code;
use execbridge_cli::pty_cmd;
use execbridge_cli::pty_cmd::PtyCli;
use execbridge_cli::run_cmd;
use execbridge_cli::run_cmd::RunCli;
use tracing_subscriber::EnvFilter;

/// Run commands through pipes or a pseudo-terminal and stream their output.
#[derive(Debug, Parser)]
#[command(name = "execbridge", version)]
struct Cli {
    /// Config file to use instead of `$EXECBRIDGE_HOME/config.toml`.
    #[arg(long = "config", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug). `RUST_LOG` wins.
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a shell command line with piped output.
    Run(RunCli),
    /// Run a program on a pseudo-terminal.
    Pty(PtyCli),
    /// Search files for fixed text, grouped by file.
    Grep(GrepCli),
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = load_config(cli.config.as_deref())?;

    let code = match cli.command {
        Command::Run(run) => run_cmd::run(run, config).await?,
        Command::Pty(pty) => pty_cmd::run(pty, config).await?,
        Command::Grep(grep) => grep_cmd::run(grep, config).await?,
    };
    std::process::exit(process_exit_code(code));
}
