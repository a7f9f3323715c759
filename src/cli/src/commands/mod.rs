//! CLI command definitions and dispatch.

mod push;
mod repro;
mod run;
mod version;

use clap::{Args, Parser, Subcommand};
use kitrace_core::config::ReproConfig;

/// kitrace: push and pull one tag from two overlapping builds.
///
/// Without a subcommand, runs `repro` with its defaults.
#[derive(Parser)]
#[command(name = "kitrace", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Run two staggered push-and-run invocations against one tag
    Repro(repro::ReproArgs),
    /// Push a fresh image version to the tag
    Push(push::PushArgs),
    /// Pull the tag, list /files and block
    Run(run::RunArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Flags shared by every command that talks to buildkitd.
#[derive(Args, Debug, Default, Clone)]
pub struct TargetArgs {
    /// Tag to push to and pull from (default: localhost:5000/<namespace>/dummy:test)
    #[arg(long)]
    pub image: Option<String>,

    /// Image the pushed version is built on
    #[arg(long)]
    pub base_image: Option<String>,

    /// Suppress build progress output
    #[arg(short, long)]
    pub quiet: bool,
}

impl TargetArgs {
    /// Environment first, flags on top.
    pub(crate) fn config(&self) -> ReproConfig {
        let mut config = ReproConfig::from_env();
        if let Some(image) = &self.image {
            config.image = image.clone();
        }
        if let Some(base) = &self.base_image {
            config.base_image = base.clone();
        }
        config.quiet = self.quiet;
        config
    }
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        None => repro::execute(repro::ReproArgs::default()).await,
        Some(Command::Repro(args)) => repro::execute(args).await,
        Some(Command::Push(args)) => push::execute(args).await,
        Some(Command::Run(args)) => run::execute(args).await,
        Some(Command::Version(args)) => version::execute(args).await,
    }
}
