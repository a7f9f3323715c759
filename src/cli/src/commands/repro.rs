//! `kitrace repro` command: the two staggered invocations.
//!
//! Listing verdicts are printed as they arrive, since the run phase never
//! finishes unless a deadline is set.

use std::sync::Arc;

use clap::Args;
use kitrace_core::event::{events, EventEmitter, EventPayload, ReproEvent};
use kitrace_runtime::{GrpcConnector, Scheduler};

use super::TargetArgs;

#[derive(Args, Debug, Default)]
pub struct ReproArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Seconds before the second invocation starts [default: 10]
    #[arg(long)]
    pub stagger_secs: Option<u64>,

    /// Stop each run phase after this many seconds (default: never)
    #[arg(long)]
    pub run_timeout_secs: Option<u64>,
}

pub async fn execute(args: ReproArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = args.target.config();
    if let Some(stagger) = args.stagger_secs {
        config.stagger_secs = stagger;
    }
    config.run_timeout_secs = args.run_timeout_secs;

    let emitter = EventEmitter::default();
    let mut listings = emitter.subscribe_filtered(|e| e.key == events::RUN_LISTING);
    let printer = tokio::spawn(async move {
        while let Some(event) = listings.recv().await {
            if let Some(line) = listing_line(&event) {
                println!("{}", line);
            }
        }
    });

    tracing::debug!(image = %config.image, address = %config.address, "Dispatching repro");
    let scheduler = Scheduler::new(config, Arc::new(GrpcConnector)).with_events(emitter);
    let result = scheduler.run().await;
    printer.abort();
    let reports = result?;

    for report in &reports {
        println!("{}", report.summary());
    }
    Ok(())
}

/// `invocation <n>: listing [<entries>] <ok|STALE>` for a `run.listing` event.
fn listing_line(event: &ReproEvent) -> Option<String> {
    let EventPayload::Map(map) = &event.payload else {
        return None;
    };
    let entries: Vec<&str> = map
        .get("entries")?
        .as_array()?
        .iter()
        .filter_map(|v| v.as_str())
        .collect();
    let stale = map.get("stale").and_then(|v| v.as_bool()).unwrap_or(false);
    Some(format!(
        "invocation {}: listing [{}] {}",
        event.invocation,
        entries.join(", "),
        if stale { "STALE" } else { "ok" }
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn listing_event(entries: &[&str], stale: bool) -> ReproEvent {
        let mut map = HashMap::new();
        map.insert("expected".to_string(), serde_json::json!("42"));
        map.insert("entries".to_string(), serde_json::json!(entries));
        map.insert("stale".to_string(), serde_json::json!(stale));
        ReproEvent::with_map(events::RUN_LISTING, 2, map)
    }

    #[test]
    fn test_listing_line_ok() {
        let line = listing_line(&listing_event(&["42"], false)).unwrap();
        assert_eq!(line, "invocation 2: listing [42] ok");
    }

    #[test]
    fn test_listing_line_stale() {
        let line = listing_line(&listing_event(&["7", "9"], true)).unwrap();
        assert_eq!(line, "invocation 2: listing [7, 9] STALE");
    }

    #[test]
    fn test_listing_line_ignores_other_payloads() {
        let event = ReproEvent::with_string(events::RUN_LISTING, 1, "no map");
        assert!(listing_line(&event).is_none());
    }

    #[tokio::test]
    async fn test_listing_events_reach_subscriber() {
        let emitter = EventEmitter::default();
        let mut listings = emitter.subscribe_filtered(|e| e.key == events::RUN_LISTING);

        emitter.emit(ReproEvent::empty(events::RUN_STARTED, 2));
        emitter.emit(listing_event(&["42"], false));

        let event = listings.recv().await.unwrap();
        assert_eq!(
            listing_line(&event).as_deref(),
            Some("invocation 2: listing [42] ok")
        );
    }
}
