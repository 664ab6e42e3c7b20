use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, info};

/// Progress callback: bytes so far and the total when known.
pub type ProgressFn<'a> = dyn FnMut(u64, Option<u64>) + 'a;

/// Fetches a remote file. Implemented over HTTP for production and by fakes
/// in tests.
pub trait Downloader: Send + Sync {
    fn download(&self, url: &str, destination: &Path, progress: &mut ProgressFn<'_>) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct HttpDownloader {
    client: reqwest::blocking::Client,
}

impl HttpDownloader {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .user_agent(concat!("burn/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client })
    }
}

impl Downloader for HttpDownloader {
    fn download(&self, url: &str, destination: &Path, progress: &mut ProgressFn<'_>) -> Result<()> {
        info!(url, destination = %destination.display(), "downloading");
        let mut response = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("failed to request {url}"))?
            .error_for_status()
            .with_context(|| format!("download of {url} was refused"))?;
        let total = response.content_length();

        let part_path = part_path(destination);
        let result = (|| -> Result<()> {
            let mut file = create_file(&part_path)?;
            let mut buffer = vec![0_u8; 64 * 1024];
            let mut received = 0_u64;
            loop {
                let read = response
                    .read(&mut buffer)
                    .with_context(|| format!("failed reading response body from {url}"))?;
                if read == 0 {
                    break;
                }
                file.write_all(&buffer[..read])
                    .with_context(|| format!("failed writing {}", part_path.display()))?;
                received += read as u64;
                progress(received, total);
            }
            file.flush()
                .with_context(|| format!("failed flushing {}", part_path.display()))?;
            Ok(())
        })();

        if let Err(err) = result {
            let _ = fs::remove_file(&part_path);
            return Err(err);
        }
        replace_file(&part_path, destination)
    }
}

/// Copies a loose payload that ships next to the bundle executable.
pub fn acquire_from_source(source: &Path, destination: &Path) -> Result<u64> {
    if !source.exists() {
        return Err(anyhow!("payload source not found: {}", source.display()));
    }
    ensure_parent(destination)?;
    debug!(source = %source.display(), destination = %destination.display(), "copying payload source");
    fs::copy(source, destination).with_context(|| {
        format!(
            "failed to copy {} to {}",
            source.display(),
            destination.display()
        )
    })
}

/// Extracts the named entries of a tar container. Each request pairs the
/// entry's path inside the archive with where it should land. Entries that
/// are not requested are skipped; a requested entry missing from the archive
/// is an error.
pub fn extract_container(container: &Path, requests: &[(String, PathBuf)]) -> Result<()> {
    let file = File::open(container)
        .with_context(|| format!("failed to open container {}", container.display()))?;
    let mut archive = tar::Archive::new(file);
    let mut found = vec![false; requests.len()];

    for entry in archive
        .entries()
        .with_context(|| format!("failed to read container {}", container.display()))?
    {
        let mut entry =
            entry.with_context(|| format!("corrupt entry in container {}", container.display()))?;
        let entry_path = entry
            .path()
            .with_context(|| format!("invalid entry path in {}", container.display()))?
            .to_string_lossy()
            .replace('\\', "/");
        let entry_path = entry_path.trim_start_matches("./");

        for (index, (wanted, destination)) in requests.iter().enumerate() {
            if found[index] || wanted.replace('\\', "/") != entry_path {
                continue;
            }
            ensure_parent(destination)?;
            let mut output = create_file(destination)?;
            io::copy(&mut entry, &mut output).with_context(|| {
                format!(
                    "failed extracting '{wanted}' from {} to {}",
                    container.display(),
                    destination.display()
                )
            })?;
            found[index] = true;
            debug!(entry = wanted.as_str(), destination = %destination.display(), "extracted payload");
            break;
        }
    }

    let missing = requests
        .iter()
        .zip(&found)
        .filter(|(_, found)| !**found)
        .map(|((wanted, _), _)| wanted.as_str())
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        return Err(anyhow!(
            "container {} is missing payloads: {}",
            container.display(),
            missing.join(", ")
        ));
    }
    Ok(())
}

pub(crate) fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    Ok(())
}

fn create_file(path: &Path) -> Result<File> {
    ensure_parent(path)?;
    File::create(path).with_context(|| format!("failed to create {}", path.display()))
}

fn part_path(destination: &Path) -> PathBuf {
    destination.with_file_name(format!(
        "{}.part",
        destination
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("payload")
    ))
}

fn replace_file(from: &Path, to: &Path) -> Result<()> {
    if to.exists() {
        fs::remove_file(to)
            .with_context(|| format!("failed to replace {}", to.display()))?;
    }
    fs::rename(from, to)
        .with_context(|| format!("failed to move {} to {}", from.display(), to.display()))
}
