//! Embed run progress reporting.
//!
//! Reports observable progress during `imsg-lens embed` so users see how
//! many attachments were found and how far through the batches the run is.
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

/// A single progress event for an embed run.
#[derive(Clone, Debug, PartialEq)]
pub enum RunProgressEvent {
    /// Reading the archive past this watermark. Total unknown.
    Reading { since: i64 },
    /// `n` of `total` fetched records have gone through embed + write.
    Embedding { batch: usize, n: u64, total: u64 },
}

/// Reports run progress. Implementations write to stderr (human or JSON).
pub trait RunProgressReporter: Send + Sync {
    fn report(&self, event: RunProgressEvent);
}

/// Human-friendly progress on stderr: "embed  batch 3  150 / 1,234 images".
pub struct StderrProgress;

impl RunProgressReporter for StderrProgress {
    fn report(&self, event: RunProgressEvent) {
        let line = match &event {
            RunProgressEvent::Reading { since } => {
                format!("embed  reading attachments after rowid {}...\n", since)
            }
            RunProgressEvent::Embedding { batch, n, total } => format!(
                "embed  batch {}  {} / {} images\n",
                batch,
                format_number(*n),
                format_number(*total)
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl RunProgressReporter for JsonProgress {
    fn report(&self, event: RunProgressEvent) {
        let obj = match &event {
            RunProgressEvent::Reading { since } => serde_json::json!({
                "event": "progress",
                "phase": "reading",
                "since": since,
            }),
            RunProgressEvent::Embedding { batch, n, total } => serde_json::json!({
                "event": "progress",
                "phase": "embedding",
                "batch": batch,
                "n": n,
                "total": total,
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl RunProgressReporter for NoProgress {
    fn report(&self, _event: RunProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn RunProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
