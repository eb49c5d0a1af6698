use fuzzbuild_core::{Build, BuildEnvironment, FuzzBuildConfig, HostEnv};

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::io::{self, Write};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Log at debug level unless RUST_LOG says otherwise.
    #[clap(short, long)]
    verbose: bool,
    #[clap(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Check that the build's resources are ready.
    Prepare,
    /// Print the host path of each resource key, one per line.
    Paths {
        #[clap(required = true)]
        keys: Vec<String>,
    },
    /// List the fuzzers in the build.
    List,
    /// Print every metadata field of one fuzzer.
    Show { name: String },
    /// Symbolize log text from stdin onto stdout.
    Symbolize,
}

fn load_config(config_file: Option<PathBuf>) -> anyhow::Result<FuzzBuildConfig> {
    let config = match config_file {
        Some(config_path) => FuzzBuildConfig::load_from_file(&config_path)?,
        None => {
            let default_config_path = PathBuf::from("fuzzbuild.toml");
            if default_config_path.exists() {
                FuzzBuildConfig::load_from_file(&default_config_path)?
            } else {
                FuzzBuildConfig::default()
            }
        }
    };
    Ok(config)
}

/// Logs go to stderr so stdout carries only command output.
fn init_logging(default_level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .with_context(|| format!("invalid log level {default_level:?}"))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install log subscriber: {e}"))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config_file)?;
    let level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    init_logging(level)?;
    info!("Effective configuration: {config:?}");

    let build = BuildEnvironment::detect_with(&config, HostEnv::from_process())
        .context("failed to detect build environment")?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    match cli.command {
        CliCommand::Prepare => {
            build.prepare()?;
            writeln!(out, "{} ready", build.layout())?;
        }
        CliCommand::Paths { keys } => {
            let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
            for path in build.path(&keys)? {
                writeln!(out, "{}", path.display())?;
            }
        }
        CliCommand::List => {
            let mut names = build.list_fuzzers();
            names.sort();
            for name in names {
                writeln!(out, "{name}")?;
            }
        }
        CliCommand::Show { name } => {
            let fuzzer = build.fuzzer(&name)?;
            for (field, value) in fuzzer.metadata() {
                writeln!(out, "{field}: {value}")?;
            }
        }
        CliCommand::Symbolize => {
            let mut input = io::stdin();
            build
                .symbolize(&mut input, &mut out)
                .context("symbolization failed")?;
        }
    }
    Ok(())
}
