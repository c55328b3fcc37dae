//! Progress bar and summary reporting for CLI installs.

use indicatif::{HumanBytes, HumanDuration, ProgressBar, ProgressStyle};

use crate::{InstallProgress, InstallReport, Response, ResponseSource};

const SEPARATOR: &str = "────────────────────────────────────────────────────────────";

/// Install observer that advances one bar tick per fetched asset.
pub struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    /// Creates a bar sized to the asset list.
    pub fn new(assets: usize) -> Self {
        let bar = ProgressBar::new(assets as u64);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("━━╌"),
        );
        Self { bar }
    }

    /// Removes the bar from the terminal.
    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl InstallProgress for BarProgress {
    fn on_asset_start(&self, url: &str) {
        self.bar.set_message(url.to_string());
    }

    fn on_asset_fetched(&self, url: &str, bytes: u64) {
        self.bar.println(format!("  {url} ({})", HumanBytes(bytes)));
        self.bar.inc(1);
    }

    fn on_asset_failed(&self, url: &str, error: &str) {
        self.bar.println(format!("  {url} failed: {error}"));
        self.bar.abandon_with_message("install rejected");
    }
}

/// Prints a summary of a successful install.
pub fn print_install_report(report: &InstallReport, deleted: &[String]) {
    println!("\n{SEPARATOR}");
    println!("Install Summary");
    println!("{SEPARATOR}");
    println!("  Cache:             {}", report.cache_name);
    println!("  Assets stored:     {}", report.assets);
    println!("  Total size:        {}", HumanBytes(report.total_bytes));
    println!("  Total time:        {}", HumanDuration(report.elapsed));
    if !deleted.is_empty() {
        println!("  Stale caches:      {}", deleted.join(", "));
    }
    println!("{SEPARATOR}");
}

/// Prints one line describing a fetch result.
pub fn print_fetch_result(url: &str, source: ResponseSource, response: &Response) {
    println!(
        "{url} -> {} from {} ({})",
        response.status,
        source.as_str(),
        HumanBytes(response.len() as u64)
    );
}
