use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use log::{debug, info};
use reqwest::blocking::Client;
use serde::Serialize;
use snapcrop_core::{TelemetryEvent, TelemetrySink};

pub const SINK_ENV: &str = "SNAPCROP_TELEMETRY_SINK";
pub const FILE_ENV: &str = "SNAPCROP_TELEMETRY_FILE";
pub const ENDPOINT_ENV: &str = "SNAPCROP_TELEMETRY_ENDPOINT";

/// Sink named by `SNAPCROP_TELEMETRY_SINK`, or `None` when unset, unknown,
/// or missing its companion variable.
pub fn sink_from_env() -> Option<Box<dyn TelemetrySink>> {
    let mode = std::env::var(SINK_ENV).ok()?;
    sink_for_mode(&mode, std::env::var(FILE_ENV).ok(), std::env::var(ENDPOINT_ENV).ok())
}

fn sink_for_mode(mode: &str, file: Option<String>, endpoint: Option<String>) -> Option<Box<dyn TelemetrySink>> {
    match mode.trim().to_ascii_lowercase().as_str() {
        "stdout" => Some(Box::new(StdoutSink)),
        "log" => Some(Box::new(LogSink)),
        "file" => {
            let path = file.filter(|v| !v.trim().is_empty())?;
            Some(Box::new(FileSink::new(PathBuf::from(path))))
        }
        "http" => {
            let endpoint = endpoint.filter(|v| !v.trim().is_empty())?;
            Some(Box::new(HttpSink::new(endpoint)))
        }
        other => {
            debug!("ignoring unknown telemetry sink {:?}", other);
            None
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TelemetryEnvelope {
    event_type: String,
    platform: String,
    duration_ms: Option<u64>,
    detail: Option<String>,
}

impl From<&TelemetryEvent> for TelemetryEnvelope {
    fn from(event: &TelemetryEvent) -> Self {
        Self {
            event_type: format!("{:?}", event.event_type),
            platform: format!("{:?}", event.platform),
            duration_ms: event.duration_ms,
            detail: event.detail.clone(),
        }
    }
}

fn envelope_line(event: &TelemetryEvent) -> Option<String> {
    serde_json::to_string(&TelemetryEnvelope::from(event)).ok()
}

pub struct StdoutSink;

impl TelemetrySink for StdoutSink {
    fn emit(&self, event: TelemetryEvent) {
        if let Some(line) = envelope_line(&event) {
            println!("{}", line);
        }
    }
}

/// Routes events through the `log` facade at info level.
pub struct LogSink;

impl TelemetrySink for LogSink {
    fn emit(&self, event: TelemetryEvent) {
        if let Some(line) = envelope_line(&event) {
            info!(target: "snapcrop::telemetry", "{}", line);
        }
    }
}

pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn write_line(&self, line: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("creating telemetry log parent directory")?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context("opening telemetry file")?;
        writeln!(file, "{}", line).context("writing telemetry line")?;
        Ok(())
    }
}

impl TelemetrySink for FileSink {
    fn emit(&self, event: TelemetryEvent) {
        if let Some(line) = envelope_line(&event) {
            if let Err(err) = self.write_line(&line) {
                debug!("telemetry write to {} failed: {:#}", self.path.display(), err);
            }
        }
    }
}

pub struct HttpSink {
    endpoint: String,
    client: Client,
}

impl HttpSink {
    pub fn new(endpoint: String) -> Self {
        Self {
            endpoint,
            client: Client::new(),
        }
    }
}

impl TelemetrySink for HttpSink {
    fn emit(&self, event: TelemetryEvent) {
        let payload = TelemetryEnvelope::from(&event);
        if let Err(err) = self.client.post(&self.endpoint).json(&payload).send() {
            debug!("telemetry post to {} failed: {}", self.endpoint, err);
        }
    }
}
