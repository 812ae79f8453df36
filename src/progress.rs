//! Bulk ingestion progress reporting.
//!
//! Progress goes to **stderr** so stdout stays parseable: the final report
//! of `assist ingest` is the only thing printed there.

use std::io::Write;

/// A single progress event for a bulk JSONL ingest.
#[derive(Clone, Debug)]
pub enum IngestProgressEvent {
    /// The file was parsed; `objects` valid records, `line_errors` rejected lines.
    Parsed {
        filename: String,
        objects: u64,
        line_errors: u64,
    },
    /// `n` of `total` objects have been embedded and upserted.
    Storing {
        filename: String,
        n: u64,
        total: u64,
    },
}

/// Receives ingest progress. Implementations write to stderr (human or JSON).
pub trait IngestProgressReporter: Send + Sync {
    fn report(&self, event: IngestProgressEvent);
}

/// Human-friendly progress: "ingest faq.jsonl  storing  1,200 / 5,000 objects".
pub struct StderrProgress;

impl IngestProgressReporter for StderrProgress {
    fn report(&self, event: IngestProgressEvent) {
        let line = match &event {
            IngestProgressEvent::Parsed {
                filename,
                objects,
                line_errors,
            } => format!(
                "ingest {}  parsed  {} objects ({} bad lines)\n",
                filename,
                format_number(*objects),
                format_number(*line_errors)
            ),
            IngestProgressEvent::Storing { filename, n, total } => format!(
                "ingest {}  storing  {} / {} objects\n",
                filename,
                format_number(*n),
                format_number(*total)
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// One JSON object per line on stderr.
pub struct JsonProgress;

impl IngestProgressReporter for JsonProgress {
    fn report(&self, event: IngestProgressEvent) {
        let obj = match &event {
            IngestProgressEvent::Parsed {
                filename,
                objects,
                line_errors,
            } => serde_json::json!({
                "event": "progress",
                "filename": filename,
                "phase": "parsed",
                "objects": objects,
                "line_errors": line_errors
            }),
            IngestProgressEvent::Storing { filename, n, total } => serde_json::json!({
                "event": "progress",
                "filename": filename,
                "phase": "storing",
                "n": n,
                "total": total
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// Used by the HTTP upload route and when progress is off.
pub struct NoProgress;

impl IngestProgressReporter for NoProgress {
    fn report(&self, _event: IngestProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut out = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().enumerate() {
        if i > 0 && (s.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Progress mode for the CLI.
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn IngestProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
