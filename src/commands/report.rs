use std::io::Write;
use std::sync::Mutex;

use tracing::warn;

use crate::commands::callback::CallbackHooks;
use crate::error::ServerError;
use crate::transport::{Response, Status};

/// Hooks that write a one-line report for delete outcomes, e.g.
/// `Report:  deleted=3, warning=orphans skipped`.
pub struct DeleteReporter<W> {
    out: Mutex<W>,
}

impl<W: Write + Send> DeleteReporter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        match self.out.into_inner() {
            Ok(w) => w,
            Err(e) => e.into_inner(),
        }
    }

    fn write_line(&self, line: &str) {
        let mut out = match self.out.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        };
        if let Err(e) = writeln!(out, "{line}") {
            warn!(error = %e, "failed to write report");
        }
    }
}

/// Report line for a response, `None` when it is not a delete outcome.
pub fn delete_report_line(response: &Response) -> Option<String> {
    let report = response.as_delete()?;
    let mut line = format!("Report:  deleted={}", report.actual_deletes);
    if let Some(warning) = report.warning() {
        line.push_str(&format!(", warning={warning}"));
    }
    Some(line)
}

impl<W: Write + Send> CallbackHooks for DeleteReporter<W> {
    fn finished(&self, response: &Response, _status: &Status) {
        match response {
            Response::Err { category, name, .. } => {
                self.write_line(&format!("Report:  error={category}/{name}"));
            }
            other => {
                if let Some(line) = delete_report_line(other) {
                    self.write_line(&line);
                }
            }
        }
    }

    fn failed(&self, error: &ServerError) {
        warn!(error = %error, "handle lost before the report arrived");
        self.write_line("Something happened to the handle?!?");
    }
}
