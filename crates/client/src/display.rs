//! Terminal rendering for listings, greetings and transfer progress.

use std::fmt::Write as _;

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use protocol::messages::{LsResponse, MotdResponse};
use protocol::{FileEntry, FileOutcome, TransferObserver, TransferSummary};

const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];

/// Formats a byte count with decimal units, e.g. `1.5 MB`.
pub fn format_size(bytes: u64) -> String {
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn push_rows(out: &mut String, entries: &[FileEntry], suffix: &str) {
    for entry in entries {
        let _ = writeln!(
            out,
            "  {:>10}  {}  {}{}",
            format_size(entry.length),
            entry.modified.format("%Y-%m-%d %H:%M"),
            entry.name,
            suffix
        );
    }
}

/// Renders a listing: directories first (with a trailing `/`), then files.
pub fn format_listing(listing: &LsResponse) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", listing.current_directory);
    if listing.dirs.is_empty() && listing.files.is_empty() {
        out.push_str("  (empty)\n");
        return out;
    }
    push_rows(&mut out, &listing.dirs, "/");
    push_rows(&mut out, &listing.files, "");
    out
}

pub fn format_motd(motd: &MotdResponse) -> String {
    let limit = if motd.megabit_per_second_limit > 0.0 {
        format!("{:.2} Mbit/s", motd.megabit_per_second_limit)
    } else {
        "unlimited".to_string()
    };
    let status = &motd.status;
    format!(
        "{}\n  directory: {}\n  bandwidth: {}\n  uptime:    {}s\n  traffic:   {} sent, {} received ({} / {} messages)\n",
        motd.message,
        motd.current_directory,
        limit,
        status.uptime_seconds,
        format_size(status.binary_bytes_sent),
        format_size(status.binary_bytes_received),
        status.text_messages_sent,
        status.text_messages_received,
    )
}

pub fn format_summary(verb: &str, summary: &TransferSummary) -> String {
    let mut line = format!(
        "{verb} {} file(s), {}",
        summary.files_transferred,
        format_size(summary.bytes)
    );
    if summary.files_skipped > 0 {
        let _ = write!(line, " ({} skipped, already present)", summary.files_skipped);
    }
    line
}

pub const HELP: &str = "\
Commands:
  cd <name>    change into a child directory, or `cd ..` for the parent
  ls           list the current directory
  motd         show the server greeting and traffic counters
  get <glob>   download matching files into the local mirror
  put <glob>   upload matching files from the local mirror
  h, help      show this help
  q, quit      close the session";

/// Draws one progress bar per file.
pub struct ProgressObserver {
    bars: MultiProgress,
    current: Option<ProgressBar>,
}

impl ProgressObserver {
    pub fn new() -> Self {
        Self {
            bars: MultiProgress::new(),
            current: None,
        }
    }

    /// An observer that draws nothing.
    pub fn hidden() -> Self {
        Self {
            bars: MultiProgress::with_draw_target(ProgressDrawTarget::hidden()),
            current: None,
        }
    }

    fn style() -> ProgressStyle {
        ProgressStyle::default_bar()
            .template("{msg:30!} [{bar:30.cyan/blue}] {bytes}/{total_bytes} {bytes_per_sec}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ")
    }
}

impl Default for ProgressObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferObserver for ProgressObserver {
    fn file_started(&mut self, entry: &FileEntry) {
        let bar = self.bars.add(ProgressBar::new(entry.length));
        bar.set_style(Self::style());
        bar.set_message(entry.name.clone());
        self.current = Some(bar);
    }

    fn bytes_transferred(&mut self, bytes: u64) {
        if let Some(bar) = &self.current {
            bar.inc(bytes);
        }
    }

    fn file_finished(&mut self, entry: &FileEntry, outcome: FileOutcome) {
        if let Some(bar) = self.current.take() {
            match outcome {
                FileOutcome::Skipped => bar.abandon_with_message(format!("{} (skipped)", entry.name)),
                _ => bar.finish(),
            }
        }
    }
}
