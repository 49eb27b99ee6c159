use std::io::{self, Write};

use serde::Serialize;

use crate::app::RunUploadResult;
use crate::progress::{ProgressEvent, ProgressSink};
use crate::state::RunStatusRecord;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_upload(result: &RunUploadResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_status(record: &RunStatusRecord) -> io::Result<()> {
        Self::print_json(record)
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

/// Plain-text progress lines on stderr for interactive runs.
pub struct ConsoleProgress;

impl ProgressSink for ConsoleProgress {
    fn event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::StatusChanged {
                run_id,
                status,
                message,
            } => {
                let run = run_id.unwrap_or_else(|| "-".to_string());
                match message {
                    Some(message) => eprintln!("[run {run}] {status}: {message}"),
                    None => eprintln!("[run {run}] {status}"),
                }
            }
            ProgressEvent::FileProgress {
                sample_name,
                percent,
            } => {
                eprint!("\r{sample_name}: {percent}%");
                if percent >= 100 {
                    eprintln!();
                }
                let _ = io::stderr().flush();
            }
        }
    }
}
