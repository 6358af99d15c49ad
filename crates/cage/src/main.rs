//! cage - launch, stop, and attach to jail containers via the engine daemon.

use std::io::{self, Write};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use cage::config::Config;
use cage::dataset::ZfsDatasets;
use cage::engine::{EngineClient, EngineError};
use cage::launch::{LaunchOptions, launch};

fn main() -> ExitCode {
    env_logger::init();
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            let _ = writeln!(io::stderr(), "Error: {err:?}");
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn try_main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    let engine = EngineClient::new(config.engine_transport());

    match cli.command {
        Command::Run(args) => handle_run(&config, &engine, args).await,
        Command::Stop { name } => handle_stop(&engine, &name).await,
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "cage",
    author,
    version,
    about = "Launch and attach to jail containers via the cage engine daemon."
)]
struct Cli {
    /// Path to the config file (defaults to ~/.config/cage/config.toml)
    #[arg(long, short = 'c', env = "CAGE_CONFIG", global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Launch a container
    Run(RunArgs),

    /// Stop a running container
    Stop {
        /// Name of the container
        name: String,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Set name for the container
    #[arg(long, short = 'n')]
    name: String,

    /// Name of the base image
    #[arg(long)]
    from: Option<String>,

    /// Set an environment variable (KEY=VALUE, repeatable)
    #[arg(long, short = 'e')]
    env: Vec<String>,

    /// Set a runtime rule (KEY=VALUE, repeatable)
    #[arg(long, short = 'r')]
    rules: Vec<String>,

    /// Mount a host folder in the container (SRC[:DST], repeatable)
    #[arg(long, short = 'm')]
    mount: Vec<String>,

    /// Mount a named volume in the container (NAME:PATH, repeatable)
    #[arg(long = "vol", alias = "volume")]
    volume: Vec<String>,

    /// Attach an interactive terminal
    #[arg(long)]
    tty: bool,

    /// Override the entry command
    #[arg(long)]
    entry: Option<String>,

    /// Network-interface hint for the engine
    #[arg(long)]
    interface: Option<String>,

    /// Command to run in the container
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,
}

async fn handle_run(config: &Config, engine: &EngineClient, args: RunArgs) -> Result<ExitCode> {
    let opts = LaunchOptions {
        name: args.name,
        from: args.from,
        entry: args.entry,
        command: args.command,
        env: args.env,
        rules: args.rules,
        mounts: args.mount,
        volumes: args.volume,
        tty: args.tty,
        interface: args.interface,
    };

    let datasets = Arc::new(ZfsDatasets);
    let code = launch(config, datasets, engine, opts).await?;
    Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
}

async fn handle_stop(engine: &EngineClient, name: &str) -> Result<ExitCode> {
    match engine.stop_container(name).await {
        Ok(_) => {
            println!("container \"{name}\" stopped.");
            Ok(ExitCode::SUCCESS)
        }
        Err(EngineError::NotFound(_)) => {
            eprintln!("container \"{name}\" not found.");
            Ok(ExitCode::FAILURE)
        }
        Err(err) => Err(err.into()),
    }
}
