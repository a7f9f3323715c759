//! `kitrace push` command: one push phase.

use std::sync::Arc;

use clap::Args;
use kitrace_runtime::{GrpcConnector, Reproducer};

use super::TargetArgs;

#[derive(Args, Debug)]
pub struct PushArgs {
    #[command(flatten)]
    pub target: TargetArgs,
}

pub async fn execute(args: PushArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.target.config();
    tracing::debug!(image = %config.image, address = %config.address, "Dispatching push");
    let reproducer = Reproducer::new(&config, Arc::new(GrpcConnector))?.with_invocation(1);

    let marker = reproducer.push().await?;
    println!("Pushed: {} (marker {})", reproducer.image(), marker);
    Ok(())
}
