use std::cell::Cell;
use std::io::{self, Write};

use crossterm::QueueableCommand;
use crossterm::cursor::MoveToColumn;
use crossterm::terminal::{Clear, ClearType};
use serde::Serialize;

use crate::app::{PlanResult, ProgressEvent, ProgressSink, RunResult, UploadResult};

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_plan(result: &PlanResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_run(result: &RunResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_upload(result: &UploadResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
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

/// Progress on stderr. Transient events rewrite the current line in place;
/// regular events end it.
#[derive(Default)]
pub struct ConsoleProgress {
    line_open: Cell<bool>,
}

impl ConsoleProgress {
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&self, event: &ProgressEvent) -> io::Result<()> {
        let mut stderr = io::stderr();
        if self.line_open.get() {
            stderr
                .queue(MoveToColumn(0))?
                .queue(Clear(ClearType::CurrentLine))?;
        }
        if event.transient {
            write!(stderr, "{}", event.message)?;
        } else {
            writeln!(stderr, "{}", event.message)?;
        }
        self.line_open.set(event.transient);
        stderr.flush()
    }

    /// Ends a pending transient line.
    pub fn finish(&self) {
        if self.line_open.replace(false) {
            let _ = writeln!(io::stderr());
        }
    }
}

impl ProgressSink for ConsoleProgress {
    fn event(&self, event: ProgressEvent) {
        let _ = self.write(&event);
    }
}
