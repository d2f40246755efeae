//! Structured per-stage progress output.
//!
//! The teacher's `cli/deployment/follow_ui.rs` drives a full ANSI
//! live-redraw terminal UI with spinner frames and cursor repositioning;
//! that's overkill for a CLI whose stages complete in seconds rather than
//! streaming build logs, so this sticks to plain structured lines plus a
//! `comfy-table` summary at the end, matching the simpler reporting the
//! teacher uses for one-shot commands (`rise-cli/src/project.rs`'s list
//! output).

use comfy_table::{presets::UTF8_FULL, Cell, Color, Table};

use crate::model::ErrorKind;

/// One step of a single host/app's progress through the deploy pipeline.
pub fn stage(host: &str, app: &str, stage: &str) {
    println!("[{host}/{app}] {stage}");
}

pub fn skipped(host: &str, app: &str) {
    println!("[{host}/{app}] up-to-date, skipped");
}

pub fn succeeded(host: &str, app: &str, release: &str) {
    println!("[{host}/{app}] deployed release {release}");
}

/// The single final failure line spec §7 requires: host, stage, and kind.
pub fn failed(host: &str, app: &str, stage: &str, kind: ErrorKind, message: &str) {
    eprintln!("[{host}/{app}] FAILED at stage '{stage}' ({kind}): {message}");
}

/// One row in the end-of-run summary table.
pub struct OutcomeRow {
    pub host: String,
    pub app: String,
    pub outcome: Outcome,
}

pub enum Outcome {
    Deployed { release: String },
    Skipped,
    Failed { stage: String, message: String },
}

pub fn print_summary(rows: &[OutcomeRow]) {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL).set_header(vec!["host", "app", "result"]);

    for row in rows {
        let (result, color) = match &row.outcome {
            Outcome::Deployed { release } => (format!("deployed {release}"), Color::Green),
            Outcome::Skipped => ("skipped (up-to-date)".to_string(), Color::Blue),
            Outcome::Failed { stage, message } => (format!("FAILED @ {stage}: {message}"), Color::Red),
        };
        table.add_row(vec![
            Cell::new(&row.host),
            Cell::new(&row.app),
            Cell::new(result).fg(color),
        ]);
    }

    println!("{table}");
}
