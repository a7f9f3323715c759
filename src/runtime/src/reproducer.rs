//! The push-then-run cycle.
//!
//! `push` builds `<base image> + mkdir /files && touch /files/<marker>` and
//! exports it to the configured tag. `run` pulls that tag with cache
//! disabled, lists `/files` and then sleeps forever. The listing is
//! compared against the marker of the preceding push: a missing marker
//! means the run was served a stale image for the tag.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use kitrace_core::address::BuildkitAddress;
use kitrace_core::config::ReproConfig;
use kitrace_core::error::{ReproError, Result};
use kitrace_core::event::{events, EventEmitter, ReproEvent};
use rand::Rng;
use serde::Serialize;
use tokio::sync::watch;

use crate::client::{BuildService, Connector};
use crate::llb::{ExecSpec, Marshaled, Platform, State};
use crate::progress::{drain, LogCapture, PlainPrinter, StatusObserver};
use crate::proto::{SolveRequest, StatusResponse};

/// Directory the push phase writes the marker into.
pub const MARKER_DIR: &str = "/files";

/// First step of the run phase.
pub const LISTING_COMMAND: &str = "find /files";

/// Second step of the run phase. Never exits.
pub const BLOCKING_COMMAND: &str = "sleep infinity";

/// Exporter type that writes (and optionally pushes) an image.
pub const IMAGE_EXPORTER: &str = "image";

/// Pick a marker file name: the decimal form of a random non-negative
/// 63-bit integer.
pub fn marker_name<R: Rng + ?Sized>(rng: &mut R) -> String {
    rng.gen_range(0..=i64::MAX).to_string()
}

/// Graph of the push phase.
pub fn push_graph(base_image: &str, marker: &str) -> Result<State> {
    let script = format!("mkdir {dir} && touch {dir}/{marker}", dir = MARKER_DIR);
    Ok(State::image(base_image)?
        .platform(Platform::linux_amd64())
        .run(ExecSpec::shell(&script)?))
}

/// Graph of the run phase.
pub fn run_graph(image: &str) -> Result<State> {
    Ok(State::image(image)?
        .platform(Platform::linux_amd64())
        .ignore_cache()
        .run(ExecSpec::shlex(LISTING_COMMAND)?.ignore_cache())
        .run(ExecSpec::shlex(BLOCKING_COMMAND)?.ignore_cache()))
}

/// Solve request exporting the result to `image` and pushing it.
pub fn export_request(build_ref: &str, marshaled: &Marshaled, image: &str) -> SolveRequest {
    let mut attrs = HashMap::new();
    attrs.insert("name".to_string(), image.to_string());
    attrs.insert("push".to_string(), "true".to_string());
    SolveRequest {
        r#ref: build_ref.to_string(),
        definition: Some(marshaled.definition.clone()),
        exporter: IMAGE_EXPORTER.to_string(),
        exporter_attrs: attrs,
        ..Default::default()
    }
}

/// Solve request with no export target.
pub fn plain_request(build_ref: &str, marshaled: &Marshaled) -> SolveRequest {
    SolveRequest {
        r#ref: build_ref.to_string(),
        definition: Some(marshaled.definition.clone()),
        ..Default::default()
    }
}

/// Fresh build reference the Status stream is keyed on.
pub fn new_build_ref() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Resolve when `shutdown` flips to true. Pends forever if the sender is
/// gone without signalling.
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// How the run phase stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// The build finished on its own.
    Completed,
    /// The configured deadline passed first.
    DeadlineElapsed,
    /// The shared shutdown signal fired first.
    Cancelled,
}

/// What the `find /files` step printed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListingObservation {
    /// Marker written by the preceding push, if known.
    pub expected: Option<String>,
    /// Entries under `/files`.
    pub entries: Vec<String>,
    /// The expected marker is missing from the listing.
    pub stale: bool,
}

impl ListingObservation {
    pub fn new(expected: Option<String>, lines: &[String]) -> Self {
        let prefix = format!("{}/", MARKER_DIR);
        let entries: Vec<String> = lines
            .iter()
            .filter_map(|line| line.trim().strip_prefix(&prefix))
            .filter(|entry| !entry.is_empty())
            .map(str::to_string)
            .collect();
        let stale = expected
            .as_ref()
            .map(|m| !entries.iter().any(|e| e == m))
            .unwrap_or(false);
        Self {
            expected,
            entries,
            stale,
        }
    }
}

/// Result of the run phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub listing: Option<ListingObservation>,
}

/// Result of one push-then-run cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvocationReport {
    pub invocation: u32,
    pub marker: String,
    pub run: RunReport,
}

impl InvocationReport {
    /// One-line summary: `invocation <n>: marker <m> <ok|STALE|unobserved>`.
    pub fn summary(&self) -> String {
        let verdict = match &self.run.listing {
            Some(l) if l.stale => "STALE",
            Some(_) => "ok",
            None => "unobserved",
        };
        format!(
            "invocation {}: marker {} {}",
            self.invocation, self.marker, verdict
        )
    }
}

/// Watches the Status stream for the listing step and records what it
/// printed once the step completes.
struct ListingWatcher {
    digest: String,
    expected: Option<String>,
    capture: LogCapture,
    observation: Option<ListingObservation>,
    invocation: u32,
    events: EventEmitter,
}

impl ListingWatcher {
    fn new(digest: String, expected: Option<String>, invocation: u32, events: EventEmitter) -> Self {
        Self {
            digest,
            expected,
            capture: LogCapture::new(),
            observation: None,
            invocation,
            events,
        }
    }

    fn record(&mut self, observation: ListingObservation) {
        if observation.stale {
            tracing::warn!(
                invocation = self.invocation,
                expected = ?observation.expected,
                entries = ?observation.entries,
                "Stale image: pushed marker missing from listing"
            );
        } else {
            tracing::info!(
                invocation = self.invocation,
                entries = ?observation.entries,
                "Listing observed"
            );
        }

        let mut map = HashMap::new();
        map.insert(
            "expected".to_string(),
            serde_json::json!(observation.expected),
        );
        map.insert("entries".to_string(), serde_json::json!(observation.entries));
        map.insert("stale".to_string(), serde_json::json!(observation.stale));
        self.events
            .emit(ReproEvent::with_map(events::RUN_LISTING, self.invocation, map));

        self.observation = Some(observation);
    }
}

impl StatusObserver for ListingWatcher {
    fn observe(&mut self, update: &StatusResponse) -> Result<()> {
        self.capture.observe(update)?;
        if self.observation.is_some() {
            return Ok(());
        }
        // The daemon may rewrite digests of cache-ignoring vertices, so
        // fall back to the display name.
        let done = update.vertexes.iter().find(|v| {
            (v.digest == self.digest || v.name == LISTING_COMMAND)
                && v.completed.is_some()
                && v.error.is_empty()
        });
        if let Some(vertex) = done {
            let observation =
                ListingObservation::new(self.expected.clone(), &self.capture.lines(&vertex.digest));
            self.record(observation);
        }
        Ok(())
    }
}

/// Drives push and run phases against one endpoint and tag.
#[derive(Clone)]
pub struct Reproducer {
    connector: Arc<dyn Connector>,
    address: BuildkitAddress,
    image: String,
    base_image: String,
    quiet: bool,
    invocation: u32,
    events: EventEmitter,
}

impl Reproducer {
    pub fn new(config: &ReproConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            connector,
            address: config.buildkit_address()?,
            image: config.image.clone(),
            base_image: config.base_image.clone(),
            quiet: config.quiet,
            invocation: 0,
            events: EventEmitter::default(),
        })
    }

    /// Tag events and log lines with an invocation number.
    pub fn with_invocation(mut self, invocation: u32) -> Self {
        self.invocation = invocation;
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn invocation(&self) -> u32 {
        self.invocation
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    /// Push a fresh image version under the tag. Returns the marker.
    pub async fn push(&self) -> Result<String> {
        let marker = marker_name(&mut rand::thread_rng());
        self.push_marker(&marker).await?;
        Ok(marker)
    }

    /// Push an image whose `/files` holds `marker`.
    pub async fn push_marker(&self, marker: &str) -> Result<()> {
        let marshaled = push_graph(&self.base_image, marker)?.marshal()?;
        let service = self.connector.connect(&self.address).await?;

        let build_ref = new_build_ref();
        tracing::info!(
            invocation = self.invocation,
            image = %self.image,
            marker,
            build_ref = %build_ref,
            "Pushing"
        );
        self.events.emit(ReproEvent::with_string(
            events::PUSH_STARTED,
            self.invocation,
            marker,
        ));

        let request = export_request(&build_ref, &marshaled, &self.image);
        self.solve_with_progress(service.as_ref(), request, None)
            .await?;

        tracing::info!(invocation = self.invocation, marker, "Pushed");
        self.events.emit(ReproEvent::with_string(
            events::PUSH_COMPLETED,
            self.invocation,
            marker,
        ));
        Ok(())
    }

    /// Pull the tag, list `/files` and block.
    ///
    /// Returns when the build finishes (it should not), when `deadline`
    /// passes, or when `shutdown` fires.
    pub async fn run(
        &self,
        expected: Option<&str>,
        deadline: Option<Duration>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<RunReport> {
        let marshaled = run_graph(&self.image)?.marshal()?;
        let listing_digest = marshaled
            .vertex_named(LISTING_COMMAND)
            .map(|v| v.digest.clone())
            .ok_or_else(|| ReproError::GraphBuild("listing step missing from graph".to_string()))?;
        let service = self.connector.connect(&self.address).await?;

        let build_ref = new_build_ref();
        tracing::info!(
            invocation = self.invocation,
            image = %self.image,
            build_ref = %build_ref,
            "Running"
        );
        self.events
            .emit(ReproEvent::empty(events::RUN_STARTED, self.invocation));

        let mut watcher = ListingWatcher::new(
            listing_digest,
            expected.map(str::to_string),
            self.invocation,
            self.events.clone(),
        );
        let request = plain_request(&build_ref, &marshaled);

        let outcome = {
            let work = self.solve_with_progress(service.as_ref(), request, Some(&mut watcher));
            tokio::pin!(work);
            let timer = async {
                match deadline {
                    Some(d) => tokio::time::sleep(d).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                result = &mut work => {
                    result?;
                    RunOutcome::Completed
                }
                _ = timer => RunOutcome::DeadlineElapsed,
                _ = wait_for_shutdown(shutdown) => RunOutcome::Cancelled,
            }
        };

        tracing::info!(invocation = self.invocation, outcome = ?outcome, "Run stopped");
        self.events.emit(ReproEvent::with_string(
            events::RUN_STOPPED,
            self.invocation,
            format!("{:?}", outcome),
        ));
        Ok(RunReport {
            outcome,
            listing: watcher.observation,
        })
    }

    /// Push, then run against what was pushed.
    pub async fn push_and_run(
        &self,
        deadline: Option<Duration>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<InvocationReport> {
        let marker = tokio::select! {
            result = self.push() => result?,
            _ = wait_for_shutdown(&mut shutdown) => {
                return Err(ReproError::Cancelled(format!(
                    "invocation {} stopped during push",
                    self.invocation
                )));
            }
        };
        let run = self.run(Some(&marker), deadline, &mut shutdown).await?;
        Ok(InvocationReport {
            invocation: self.invocation,
            marker,
            run,
        })
    }

    /// Solve and drain progress concurrently. The first failure drops
    /// the other half.
    async fn solve_with_progress(
        &self,
        service: &dyn BuildService,
        request: SolveRequest,
        watcher: Option<&mut ListingWatcher>,
    ) -> Result<()> {
        let build_ref = request.r#ref.clone();
        let solve = async {
            service.solve(request).await?;
            Ok::<_, ReproError>(())
        };
        let progress = async {
            let stream = service.status(&build_ref).await?;
            let mut printer = PlainPrinter::new(std::io::stderr());
            let mut observers: Vec<&mut (dyn StatusObserver + Send)> = Vec::new();
            if !self.quiet {
                observers.push(&mut printer);
            }
            if let Some(watcher) = watcher {
                observers.push(watcher);
            }
            drain(stream, &mut observers).await
        };
        tokio::try_join!(solve, progress)?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::fake::*;
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::atomic::Ordering;

    fn test_config() -> ReproConfig {
        ReproConfig {
            address: "unix:///tmp/kitrace-test.sock".to_string(),
            image: "localhost:5000/test/dummy:test".to_string(),
            quiet: true,
            ..Default::default()
        }
    }

    fn reproducer(connector: &FakeConnector) -> Reproducer {
        Reproducer::new(&test_config(), Arc::new(connector.clone())).unwrap()
    }

    #[test]
    fn test_marker_name_is_decimal_for_any_seed() {
        for seed in 0..256u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let marker = marker_name(&mut rng);
            assert!(!marker.is_empty());
            assert!(marker.chars().all(|c| c.is_ascii_digit()), "{marker}");
        }
    }

    #[test]
    fn test_push_graph_touches_marker() {
        let marshaled = push_graph("alpine", "12345").unwrap().marshal().unwrap();
        let request = export_request("ref", &marshaled, "localhost:5000/ns/dummy:test");
        assert_eq!(pushed_marker(&request).as_deref(), Some("12345"));
        assert!(marshaled
            .vertex_named("mkdir /files && touch /files/12345")
            .is_some());
    }

    #[test]
    fn test_export_request_attrs() {
        let marshaled = push_graph("alpine", "1").unwrap().marshal().unwrap();
        let request = export_request("abc", &marshaled, "localhost:5000/ns/dummy:test");
        assert_eq!(request.r#ref, "abc");
        assert_eq!(request.exporter, "image");
        assert_eq!(request.exporter_attrs["name"], "localhost:5000/ns/dummy:test");
        assert_eq!(request.exporter_attrs["push"], "true");

        let plain = plain_request("abc", &marshaled);
        assert!(plain.exporter.is_empty());
        assert!(plain.exporter_attrs.is_empty());
    }

    #[test]
    fn test_run_graph_ignores_cache_everywhere() {
        let marshaled = run_graph("localhost:5000/ns/dummy:test")
            .unwrap()
            .marshal()
            .unwrap();
        assert_eq!(marshaled.vertices.len(), 3);
        for vertex in &marshaled.vertices {
            assert!(marshaled.definition.metadata[&vertex.digest].ignore_cache);
        }
        assert!(marshaled.vertex_named(LISTING_COMMAND).is_some());
        assert_eq!(
            marshaled.vertices.last().unwrap().name,
            BLOCKING_COMMAND
        );
    }

    #[test]
    fn test_listing_observation() {
        let lines: Vec<String> = vec!["/files".into(), "/files/42".into()];
        let ok = ListingObservation::new(Some("42".into()), &lines);
        assert_eq!(ok.entries, vec!["42"]);
        assert!(!ok.stale);

        let stale = ListingObservation::new(Some("7".into()), &lines);
        assert!(stale.stale);

        let unknown = ListingObservation::new(None, &lines);
        assert!(!unknown.stale);
    }

    #[test]
    fn test_invocation_summary() {
        let report = InvocationReport {
            invocation: 2,
            marker: "9".to_string(),
            run: RunReport {
                outcome: RunOutcome::DeadlineElapsed,
                listing: Some(ListingObservation::new(Some("9".into()), &["/files/1".into()])),
            },
        };
        assert_eq!(report.summary(), "invocation 2: marker 9 STALE");
    }

    #[tokio::test]
    async fn test_push_unreachable_issues_no_solve() {
        let connector = FakeConnector::new(FakeState {
            refuse_connections: true,
            ..Default::default()
        });
        let err = reproducer(&connector).push().await.unwrap_err();
        assert!(matches!(err, ReproError::Connection { .. }));
        assert_eq!(connector.state.connects.load(Ordering::SeqCst), 1);
        assert_eq!(connector.solve_count(), 0);
        assert!(connector.state.registry.lock().is_empty());
    }

    #[tokio::test]
    async fn test_push_publishes_marker() {
        let connector = FakeConnector::default();
        let marker = reproducer(&connector).push().await.unwrap();

        assert!(marker.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(
            connector.state.registry.lock()["localhost:5000/test/dummy:test"],
            marker
        );
        let solves = connector.state.solves.lock();
        assert_eq!(solves.len(), 1);
        assert_eq!(solves[0].exporter_attrs["push"], "true");
    }

    #[tokio::test]
    async fn test_push_solve_error_surfaces() {
        let connector = FakeConnector::new(FakeState {
            fail_second_push: true,
            ..Default::default()
        });
        let repro = reproducer(&connector);
        repro.push().await.unwrap();
        let err = repro.push().await.unwrap_err();
        assert!(matches!(err, ReproError::Solve(_)));
    }

    #[tokio::test]
    async fn test_run_blocks_until_deadline() {
        let connector = FakeConnector::default();
        let repro = reproducer(&connector);
        let marker = repro.push().await.unwrap();

        let (_tx, mut rx) = watch::channel(false);
        let report = repro
            .run(Some(&marker), Some(Duration::from_millis(200)), &mut rx)
            .await
            .unwrap();

        assert_eq!(report.outcome, RunOutcome::DeadlineElapsed);
        let listing = report.listing.expect("listing observed");
        assert_eq!(listing.entries, vec![marker]);
        assert!(!listing.stale);
    }

    #[tokio::test]
    async fn test_run_reports_stale_listing() {
        let connector = FakeConnector::default();
        *connector.state.stale_listing.lock() = Some(vec!["1".to_string()]);
        let emitter = EventEmitter::new(16);
        let mut listing_events = emitter.subscribe_filtered(|e| e.key == events::RUN_LISTING);
        let repro = reproducer(&connector).with_invocation(3).with_events(emitter);

        let (_tx, mut rx) = watch::channel(false);
        let report = repro
            .run(Some("2"), Some(Duration::from_millis(200)), &mut rx)
            .await
            .unwrap();

        assert!(report.listing.unwrap().stale);
        let event = listing_events.recv().await.unwrap();
        assert_eq!(event.invocation, 3);
    }

    #[tokio::test]
    async fn test_run_cancelled_by_shutdown() {
        let connector = FakeConnector::default();
        let repro = reproducer(&connector);

        let (tx, mut rx) = watch::channel(false);
        let handle = tokio::spawn(async move { repro.run(None, None, &mut rx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let report = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("run should stop after shutdown")
            .unwrap()
            .unwrap();
        assert_eq!(report.outcome, RunOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_push_and_run_lists_own_marker() {
        let connector = FakeConnector::default();
        let repro = reproducer(&connector).with_invocation(1);

        let (_tx, rx) = watch::channel(false);
        let report = repro
            .push_and_run(Some(Duration::from_millis(200)), rx)
            .await
            .unwrap();

        assert_eq!(report.invocation, 1);
        assert_eq!(report.run.outcome, RunOutcome::DeadlineElapsed);
        assert_eq!(report.summary(), format!("invocation 1: marker {} ok", report.marker));
        // push + run
        assert_eq!(connector.solve_count(), 2);
        assert!(connector.state.solves.lock()[1].exporter.is_empty());
    }

    #[tokio::test]
    async fn test_run_solve_error_surfaces() {
        let connector = FakeConnector::new(FakeState {
            fail_run_solve: true,
            ..Default::default()
        });
        let repro = reproducer(&connector);

        let (_tx, mut rx) = watch::channel(false);
        let err = repro
            .run(None, Some(Duration::from_secs(5)), &mut rx)
            .await
            .unwrap_err();
        assert!(matches!(err, ReproError::Solve(_)));

        let (_tx, rx) = watch::channel(false);
        let err = repro
            .push_and_run(Some(Duration::from_secs(5)), rx)
            .await
            .unwrap_err();
        assert!(matches!(err, ReproError::Solve(_)));
    }

    #[tokio::test]
    async fn test_run_progress_error_surfaces() {
        let connector = FakeConnector::new(FakeState {
            fail_run_status: true,
            ..Default::default()
        });
        let repro = reproducer(&connector);

        let (_tx, mut rx) = watch::channel(false);
        let err = repro
            .run(None, Some(Duration::from_secs(5)), &mut rx)
            .await
            .unwrap_err();
        assert!(matches!(err, ReproError::ProgressStream(_)));
    }
}
