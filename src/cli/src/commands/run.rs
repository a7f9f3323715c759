//! `kitrace run` command: one run phase.
//!
//! Blocks until the deadline passes or Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use kitrace_runtime::{GrpcConnector, Reproducer};
use tokio::sync::watch;

use super::TargetArgs;

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Marker the listing should contain
    #[arg(long)]
    pub expect: Option<String>,

    /// Stop the run after this many seconds (default: never)
    #[arg(long)]
    pub run_timeout_secs: Option<u64>,
}

pub async fn execute(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.target.config();
    tracing::debug!(image = %config.image, address = %config.address, "Dispatching run");
    let reproducer = Reproducer::new(&config, Arc::new(GrpcConnector))?.with_invocation(1);

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, stopping run");
            let _ = shutdown_tx.send(true);
        }
    });

    let report = reproducer
        .run(
            args.expect.as_deref(),
            args.run_timeout_secs.map(Duration::from_secs),
            &mut shutdown_rx,
        )
        .await?;

    match &report.listing {
        Some(listing) => {
            println!("{}: {}", reproducer.image(), listing.entries.join(" "));
            if listing.stale {
                println!("STALE: expected marker missing");
            }
        }
        None => println!("{}: listing not observed", reproducer.image()),
    }
    Ok(())
}
