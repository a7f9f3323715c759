//! Progress draining and plain-text rendering of the Status stream.
//!
//! Output follows BuildKit's `--progress=plain` layout:
//!
//! ```text
//! #1 docker-image://docker.io/library/alpine:latest
//! #1 DONE 0.4s
//!
//! #2 find /files
//! #2 0.112 /files
//! #2 0.112 /files/5577006791947779410
//! #2 DONE 0.2s
//! ```

use std::collections::{HashMap, HashSet};
use std::io::Write;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use kitrace_core::error::{ReproError, Result};

use crate::client::StatusStream;
use crate::proto::StatusResponse;

/// Log stream number of stdout in `VertexLog`.
pub const STDOUT: i64 = 1;

/// Something that consumes Status updates.
pub trait StatusObserver {
    fn observe(&mut self, update: &StatusResponse) -> Result<()>;
}

/// Read the Status stream to its end, feeding every update to each observer.
///
/// Returns when the server closes the stream, which it does once the
/// build has finished.
pub async fn drain(
    mut stream: StatusStream,
    observers: &mut [&mut (dyn StatusObserver + Send)],
) -> Result<()> {
    while let Some(update) = stream.next().await {
        let update = update?;
        for observer in observers.iter_mut() {
            observer.observe(&update)?;
        }
    }
    Ok(())
}

pub(crate) fn to_datetime(ts: &prost_types::Timestamp) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(ts.seconds, ts.nanos.max(0) as u32)
}

fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    end.signed_duration_since(start).num_milliseconds().max(0) as f64 / 1000.0
}

#[derive(Debug, Default)]
struct VertexState {
    index: usize,
    name: String,
    started: Option<DateTime<Utc>>,
    announced: bool,
    done: bool,
    finished_statuses: HashSet<String>,
}

/// Renders Status updates as plain text.
pub struct PlainPrinter<W: Write> {
    out: W,
    vertices: HashMap<String, VertexState>,
    next_index: usize,
}

impl<W: Write> PlainPrinter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            vertices: HashMap::new(),
            next_index: 1,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn vertex(&mut self, digest: &str) -> &mut VertexState {
        let next_index = &mut self.next_index;
        self.vertices.entry(digest.to_string()).or_insert_with(|| {
            let index = *next_index;
            *next_index += 1;
            VertexState {
                index,
                ..Default::default()
            }
        })
    }

    /// Print the `#N name` header once per vertex.
    fn announce(&mut self, digest: &str) -> std::io::Result<usize> {
        let v = self.vertices.get_mut(digest).map(|v| {
            let first = !v.announced;
            v.announced = true;
            (v.index, v.name.clone(), first)
        });
        match v {
            Some((index, name, true)) => {
                writeln!(self.out, "#{} {}", index, name)?;
                Ok(index)
            }
            Some((index, _, false)) => Ok(index),
            None => Ok(0),
        }
    }

    fn write_update(&mut self, update: &StatusResponse) -> std::io::Result<()> {
        for vertex in &update.vertexes {
            let state = self.vertex(&vertex.digest);
            if !vertex.name.is_empty() {
                state.name = vertex.name.clone();
            }
            if let Some(started) = vertex.started.as_ref().and_then(to_datetime) {
                state.started = Some(started);
            }
            let already_done = state.done;
            let started = state.started;

            let active = vertex.started.is_some() || vertex.completed.is_some() || vertex.cached;
            if !active || already_done {
                continue;
            }
            let index = self.announce(&vertex.digest)?;

            let finished = if vertex.cached {
                writeln!(self.out, "#{} CACHED", index)?;
                true
            } else if !vertex.error.is_empty() {
                writeln!(self.out, "#{} ERROR: {}", index, vertex.error)?;
                true
            } else if let Some(completed) = vertex.completed.as_ref().and_then(to_datetime) {
                let secs = started.map(|s| seconds_between(s, completed)).unwrap_or(0.0);
                writeln!(self.out, "#{} DONE {:.1}s", index, secs)?;
                true
            } else {
                false
            };

            if finished {
                writeln!(self.out)?;
                self.vertex(&vertex.digest).done = true;
            }
        }

        for status in &update.statuses {
            if status.completed.is_none() {
                continue;
            }
            let first = self
                .vertex(&status.vertex)
                .finished_statuses
                .insert(status.id.clone());
            if !first {
                continue;
            }
            let index = self.announce(&status.vertex)?;
            if status.total > 0 {
                writeln!(
                    self.out,
                    "#{} {} {}/{} done",
                    index, status.id, status.current, status.total
                )?;
            } else {
                writeln!(self.out, "#{} {} done", index, status.id)?;
            }
        }

        for log in &update.logs {
            let started = self.vertex(&log.vertex).started;
            let index = self.announce(&log.vertex)?;
            let elapsed = match (started, log.timestamp.as_ref().and_then(to_datetime)) {
                (Some(s), Some(t)) => Some(seconds_between(s, t)),
                _ => None,
            };
            let text = String::from_utf8_lossy(&log.msg);
            for line in text.lines() {
                match elapsed {
                    Some(secs) => writeln!(self.out, "#{} {:.3} {}", index, secs, line)?,
                    None => writeln!(self.out, "#{} {}", index, line)?,
                }
            }
        }

        for warning in &update.warnings {
            self.vertex(&warning.vertex);
            let index = self.announce(&warning.vertex)?;
            writeln!(
                self.out,
                "#{} WARN: {}",
                index,
                String::from_utf8_lossy(&warning.short)
            )?;
        }

        self.out.flush()
    }
}

impl<W: Write> StatusObserver for PlainPrinter<W> {
    fn observe(&mut self, update: &StatusResponse) -> Result<()> {
        self.write_update(update)
            .map_err(|e| ReproError::ProgressStream(format!("writing progress: {}", e)))
    }
}

/// Accumulates stdout of selected vertices, line by line.
#[derive(Debug, Default)]
pub struct LogCapture {
    buffers: HashMap<String, String>,
}

impl LogCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, vertex: &str, stream: i64, msg: &[u8]) {
        if stream != STDOUT {
            return;
        }
        self.buffers
            .entry(vertex.to_string())
            .or_default()
            .push_str(&String::from_utf8_lossy(msg));
    }

    /// All complete and partial lines captured for `vertex`.
    pub fn lines(&self, vertex: &str) -> Vec<String> {
        self.buffers
            .get(vertex)
            .map(|buf| buf.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

impl StatusObserver for LogCapture {
    fn observe(&mut self, update: &StatusResponse) -> Result<()> {
        for log in &update.logs {
            self.push(&log.vertex, log.stream, &log.msg);
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use crate::proto::{StatusResponse, Vertex, VertexLog, VertexStatus};

    pub fn ts(seconds: i64, millis: i32) -> prost_types::Timestamp {
        prost_types::Timestamp {
            seconds,
            nanos: millis * 1_000_000,
        }
    }

    pub fn vertex(digest: &str, name: &str) -> Vertex {
        Vertex {
            digest: digest.to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn started(digest: &str, name: &str, at: i64) -> StatusResponse {
        StatusResponse {
            vertexes: vec![Vertex {
                started: Some(ts(at, 0)),
                ..vertex(digest, name)
            }],
            ..Default::default()
        }
    }

    pub fn completed(digest: &str, name: &str, from: i64, to: i64, millis: i32) -> StatusResponse {
        StatusResponse {
            vertexes: vec![Vertex {
                started: Some(ts(from, 0)),
                completed: Some(ts(to, millis)),
                ..vertex(digest, name)
            }],
            ..Default::default()
        }
    }

    pub fn log(digest: &str, at: i64, millis: i32, msg: &str) -> StatusResponse {
        StatusResponse {
            logs: vec![VertexLog {
                vertex: digest.to_string(),
                timestamp: Some(ts(at, millis)),
                stream: 1,
                msg: msg.as_bytes().to_vec(),
            }],
            ..Default::default()
        }
    }

    pub fn status_done(digest: &str, id: &str, current: i64, total: i64) -> StatusResponse {
        StatusResponse {
            statuses: vec![VertexStatus {
                id: id.to_string(),
                vertex: digest.to_string(),
                current,
                total,
                completed: Some(ts(1, 0)),
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}
