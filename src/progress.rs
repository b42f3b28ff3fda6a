//! Progress reporting for the indexing CLI
//!
//! Real-time display using an indicatif spinner while the walker and the
//! two indexing queues work through their backlog.

use crate::queue::QueueProgress;
use console::style;
use humansize::{format_size, BINARY};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Spinner-based reporter for one indexing run
pub struct ProgressReporter {
    bar: ProgressBar,
}

impl ProgressReporter {
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {elapsed_precise} {msg}")
                .expect("static progress template"),
        );
        bar.enable_steady_tick(Duration::from_millis(120));
        Self { bar }
    }

    /// Update the walking phase display
    pub fn update_walk(&self, dir: &str, files: u64) {
        self.bar
            .set_message(format!("Walking {} | Files: {}", dir, format_number(files)));
    }

    /// Update the queue-draining phase display
    pub fn update_queues(&self, metadata: QueueProgress, contents: QueueProgress) {
        self.bar.set_message(format!(
            "Metadata: {}/{} | Contents: {}/{}",
            format_number(metadata.done),
            format_number(metadata.done + metadata.pending),
            format_number(contents.done),
            format_number(contents.done + contents.pending),
        ));
    }

    pub fn set_status(&self, status: &str) {
        self.bar.set_message(status.to_string());
    }

    pub fn finish_and_clear(&self) {
        self.bar.finish_and_clear();
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Format a number with thousands separators
fn format_number(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    let mut remaining = digits.len();
    for digit in digits.chars() {
        out.push(digit);
        remaining -= 1;
        if remaining > 0 && remaining % 3 == 0 {
            out.push(',');
        }
    }
    out
}

/// Print a header at the start of an indexing run
pub fn print_header(dirs: &[String], data_dir: &str) {
    println!();
    println!(
        "{} {}",
        style("photocanvas").cyan().bold(),
        env!("CARGO_PKG_VERSION")
    );
    println!("{}", style("─".repeat(50)).dim());
    for dir in dirs {
        println!("  {} {}", style("Source:").bold(), dir);
    }
    println!("  {} {}", style("Data dir:").bold(), data_dir);
    println!();
}

/// Print a summary after an indexing run
pub fn print_summary(
    files: u64,
    metadata_done: u64,
    contents_done: u64,
    duration: Duration,
    db_size: Option<u64>,
) {
    let secs = duration.as_secs_f64();
    let rate = if secs > 0.0 { files as f64 / secs } else { 0.0 };

    println!();
    println!("{}", style("Index Complete").green().bold());
    println!("{}", style("─".repeat(50)).dim());
    println!("  {} {}", style("Files:").bold(), format_number(files));
    println!(
        "  {} {}",
        style("Metadata:").bold(),
        format_number(metadata_done)
    );
    println!(
        "  {} {}",
        style("Contents:").bold(),
        format_number(contents_done)
    );
    println!(
        "  {} {:.1}s ({:.0} files/sec)",
        style("Duration:").bold(),
        secs,
        rate
    );
    if let Some(size) = db_size {
        println!(
            "  {} {}",
            style("Catalog:").bold(),
            format_size(size, BINARY)
        );
    }
    println!();
}
