use std::io::{self, Write};

use serde::Serialize;

use crate::cache::ScanResult;
use crate::fetch::FetchReport;
use crate::progress::{ProgressEvent, ProgressSink};

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Text,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_scan(result: &ScanResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_fetch(report: &FetchReport) -> io::Result<()> {
        Self::print_json(report)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Human progress lines on stderr, one per event.
pub struct TextSink;

impl ProgressSink for TextSink {
    fn event(&self, event: ProgressEvent) {
        let line = match event {
            ProgressEvent::ScanPhase { message } => format!("scan: {message}"),
            ProgressEvent::ScanProgress {
                current,
                total,
                eta,
            } => match eta {
                Some(eta) => format!("scan: {current}/{total} (~{}s left)", eta.as_secs()),
                None => format!("scan: {current}/{total}"),
            },
            ProgressEvent::FetchStatus {
                timestamp,
                status,
                attempts,
            } => format!("fetch: {timestamp} {status:?} (attempt {attempts})"),
            ProgressEvent::FetchProgress { completed, total } => {
                format!("fetch: {completed}/{total} done")
            }
        };
        eprintln!("{line}");
    }
}
