//! Staggered concurrent invocations.
//!
//! Invocation 1 starts immediately on a spawned task; invocation 2 starts
//! on the calling task after the configured stagger. Both push to and
//! pull from the same tag. The first failure signals shutdown to the
//! other and is returned.

use std::sync::Arc;
use std::time::Duration;

use kitrace_core::config::ReproConfig;
use kitrace_core::error::{ReproError, Result};
use kitrace_core::event::{events, EventEmitter, ReproEvent};
use tokio::sync::watch;

use crate::client::Connector;
use crate::reproducer::{InvocationReport, Reproducer};

/// Runs two overlapping push-and-run cycles.
pub struct Scheduler {
    config: ReproConfig,
    connector: Arc<dyn Connector>,
    events: EventEmitter,
}

impl Scheduler {
    pub fn new(config: ReproConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            events: EventEmitter::default(),
        }
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    fn reproducer(&self, invocation: u32) -> Result<Reproducer> {
        Ok(Reproducer::new(&self.config, Arc::clone(&self.connector))?
            .with_invocation(invocation)
            .with_events(self.events.clone()))
    }

    /// Run both invocations.
    ///
    /// Without a run deadline this only returns on failure, since the run
    /// phase blocks forever.
    pub async fn run(&self) -> Result<Vec<InvocationReport>> {
        self.config.validate()?;
        let deadline = self.config.run_timeout();
        let stagger = self.config.stagger();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tracing::info!(
            image = %self.config.image,
            address = %self.config.address,
            stagger_secs = self.config.stagger_secs,
            "Starting staggered invocations"
        );

        let mut background = tokio::spawn(invoke(
            self.reproducer(1)?,
            deadline,
            shutdown_rx.clone(),
        ));

        let foreground_repro = self.reproducer(2)?;
        let foreground = async move {
            tokio::time::sleep(stagger).await;
            invoke(foreground_repro, deadline, shutdown_rx).await
        };
        tokio::pin!(foreground);

        let mut background_report: Option<InvocationReport> = None;
        loop {
            tokio::select! {
                joined = &mut background, if background_report.is_none() => {
                    match flatten_join(1, joined) {
                        Ok(report) => background_report = Some(report),
                        Err(e) => {
                            let _ = shutdown_tx.send(true);
                            return Err(e);
                        }
                    }
                }
                result = &mut foreground => {
                    let report = match result {
                        Ok(report) => report,
                        Err(e) => {
                            let _ = shutdown_tx.send(true);
                            background.abort();
                            return Err(e);
                        }
                    };
                    let background_report = match background_report.take() {
                        Some(r) => r,
                        None => flatten_join(1, (&mut background).await)?,
                    };
                    return Ok(vec![background_report, report]);
                }
            }
        }
    }
}

fn flatten_join(
    invocation: u32,
    joined: std::result::Result<Result<InvocationReport>, tokio::task::JoinError>,
) -> Result<InvocationReport> {
    joined.map_err(|e| {
        ReproError::Cancelled(format!("invocation {} aborted: {}", invocation, e))
    })?
}

/// One push-and-run cycle, with its failure logged under its own id.
async fn invoke(
    reproducer: Reproducer,
    deadline: Option<Duration>,
    shutdown: watch::Receiver<bool>,
) -> Result<InvocationReport> {
    let invocation = reproducer.invocation();
    let emitter = reproducer.events().clone();
    emitter.emit(ReproEvent::empty(events::INVOCATION_STARTED, invocation));

    match reproducer.push_and_run(deadline, shutdown).await {
        Ok(report) => {
            tracing::info!(invocation, summary = %report.summary(), "Invocation finished");
            emitter.emit(ReproEvent::with_string(
                events::INVOCATION_FINISHED,
                invocation,
                report.summary(),
            ));
            Ok(report)
        }
        Err(e) => {
            if e.is_cancelled() {
                tracing::info!(invocation, "Invocation cancelled");
            } else {
                tracing::error!(invocation, error = %e, "Invocation failed");
            }
            emitter.emit(ReproEvent::with_string(
                events::INVOCATION_FAILED,
                invocation,
                e.to_string(),
            ));
            Err(e)
        }
    }
}
