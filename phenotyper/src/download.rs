//! Bulk plate download: one task per plate on a bounded worker pool.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use tracing::{error, info};

use crate::data_handling::plate_manifest::PlateEntry;

/// Copies one remote plate folder to a local directory.
pub trait FileFetcher: Sync {
    fn fetch(&self, remote_path: &str, destination: &Path) -> Result<()>;
}

/// Shells out to a transfer program (e.g. `ascp`).
pub struct CommandFetcher {
    /// Program followed by its leading arguments.
    pub command: Vec<String>,
    pub remote_prefix: String,
}

impl CommandFetcher {
    pub fn new(command: Vec<String>, remote_prefix: String) -> Self {
        CommandFetcher { command, remote_prefix }
    }

    fn build(&self, remote_path: &str, destination: &Path) -> Result<Command> {
        let Some((program, leading)) = self.command.split_first() else {
            bail!("no fetch command configured");
        };
        let program = which::which(program).with_context(|| format!("locating {}", program))?;
        let mut cmd = Command::new(program);
        cmd.args(leading)
            .arg(format!("{}{}", self.remote_prefix, remote_path))
            .arg(destination);
        Ok(cmd)
    }
}

impl FileFetcher for CommandFetcher {
    fn fetch(&self, remote_path: &str, destination: &Path) -> Result<()> {
        std::fs::create_dir_all(destination)?;
        let status = self.build(remote_path, destination)?.status()?;
        if !status.success() {
            bail!("fetching {} exited with {}", remote_path, status);
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct DownloadSummary {
    pub downloaded: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
}

fn already_present(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

pub fn plate_destination(dest: &Path, entry: &PlateEntry) -> PathBuf {
    dest.join(&entry.plate)
}

/// Downloads every plate not yet present under `dest`, with at most
/// `min(plates, available cores)` transfers in flight.
pub fn download_plates(
    entries: &[PlateEntry],
    dest: &Path,
    fetcher: &dyn FileFetcher,
) -> Result<DownloadSummary> {
    let summary = Mutex::new(DownloadSummary::default());
    if entries.is_empty() {
        return Ok(DownloadSummary::default());
    }

    let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    let workers = entries.len().min(cores);
    let pool = ThreadPoolBuilder::new().num_threads(workers).build()?;
    info!("Downloading {} plates with {} workers", entries.len(), workers);

    pool.install(|| {
        entries.par_iter().for_each(|entry| {
            let destination = plate_destination(dest, entry);
            let outcome = if already_present(&destination) {
                info!("Plate {} already downloaded", entry.plate);
                Ok(false)
            } else {
                info!("Fetching {} into {}", entry.download_path, destination.display());
                fetcher.fetch(&entry.download_path, &destination).map(|_| true)
            };

            let mut summary = match summary.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            match outcome {
                Ok(true) => summary.downloaded.push(entry.plate.clone()),
                Ok(false) => summary.skipped.push(entry.plate.clone()),
                Err(e) => {
                    error!("Download of plate {} failed: {:#}", entry.plate, e);
                    summary.failed.push(entry.plate.clone());
                }
            }
        });
    });

    let mut summary = summary.into_inner().unwrap_or_else(|p| p.into_inner());
    summary.downloaded.sort();
    summary.skipped.sort();
    summary.failed.sort();
    info!(
        "Downloads: {} fetched, {} skipped, {} failed",
        summary.downloaded.len(),
        summary.skipped.len(),
        summary.failed.len()
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Writes a marker file instead of transferring anything.
    struct LocalFetcher;

    impl FileFetcher for LocalFetcher {
        fn fetch(&self, remote_path: &str, destination: &Path) -> Result<()> {
            if remote_path.contains("broken") {
                bail!("unreachable");
            }
            std::fs::create_dir_all(destination)?;
            std::fs::write(destination.join("fetched.txt"), remote_path)?;
            Ok(())
        }
    }

    fn entry(plate: &str, download_path: &str) -> PlateEntry {
        PlateEntry {
            plate: plate.to_string(),
            manifest_path: String::new(),
            download_path: download_path.to_string(),
        }
    }

    #[test]
    fn existing_plates_are_skipped_and_failures_reported() {
        let dest = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dest.path().join("P2")).unwrap();
        std::fs::write(dest.path().join("P2/old.tiff"), b"").unwrap();

        let entries = vec![entry("P1", "p1/Images"), entry("P2", "p2/Images"), entry("P3", "broken")];
        let summary = download_plates(&entries, dest.path(), &LocalFetcher).unwrap();

        assert_eq!(summary.downloaded, vec!["P1"]);
        assert_eq!(summary.skipped, vec!["P2"]);
        assert_eq!(summary.failed, vec!["P3"]);
        let marker = std::fs::read_to_string(dest.path().join("P1/fetched.txt")).unwrap();
        assert_eq!(marker, "p1/Images");
    }

    #[test]
    fn empty_fetch_command_is_rejected() {
        let fetcher = CommandFetcher::new(Vec::new(), "host:".to_string());
        assert!(fetcher.build("x", Path::new("/tmp")).is_err());
    }
}
