//! Retrying downloader.
//!
//! Fetches a URL into a file with the cache write discipline: any stale
//! final/temp files are removed first, the body streams into `<path>.temp`
//! and the temp is renamed over the final path only on success. Transient
//! failures are retried a fixed number of times; everything past that is
//! fatal to the run.

use anyhow::{anyhow, Context, Result};
use std::fs::{self, File};
use std::io;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::cache::{atomic_rename, temp_path};

const ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(3);

/// Download `url` into `path` with up to three attempts.
pub fn download(url: &str, path: &Path) -> Result<()> {
    let temp = temp_path(path);
    if path.exists() {
        fs::remove_file(path)
            .with_context(|| format!("failed to remove stale {}", path.display()))?;
    }
    if temp.exists() {
        fs::remove_file(&temp)
            .with_context(|| format!("failed to remove stale {}", temp.display()))?;
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let client = reqwest::blocking::Client::new();
    let mut last_err = None;
    for attempt in 1..=ATTEMPTS {
        info!("downloading {} (attempt {}/{})", url, attempt, ATTEMPTS);
        match fetch_once(&client, url, &temp) {
            Ok(()) => {
                atomic_rename(&temp, path)?;
                return Ok(());
            }
            Err(e) => {
                warn!("download of {} failed: {:#}", url, e);
                let _ = fs::remove_file(&temp);
                last_err = Some(e);
                if attempt < ATTEMPTS {
                    std::thread::sleep(RETRY_DELAY);
                }
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("download of {} failed", url)))
}

fn fetch_once(client: &reqwest::blocking::Client, url: &str, temp: &Path) -> Result<()> {
    let mut response = client
        .get(url)
        .send()
        .with_context(|| format!("request to {} failed", url))?;
    if !response.status().is_success() {
        anyhow::bail!("{} answered {}", url, response.status());
    }
    let mut file = File::create(temp)
        .with_context(|| format!("failed to create {}", temp.display()))?;
    io::copy(&mut response, &mut file)
        .with_context(|| format!("failed to write {}", temp.display()))?;
    Ok(())
}
