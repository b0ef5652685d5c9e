//! Artifact retrieval and installation.
//!
//! Artifacts are directories named `<binary>-<version>-<os>-<arch>` holding
//! the executable and, optionally, its `<binary>.spec.json`. The local
//! downloader copies them out of a repository directory; the installer copies
//! a downloaded artifact into the program's install directory.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::DownloadConfig;

/// Fetches artifacts
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Download the artifact and return its local path
    async fn download(&self, binary_name: &str, version: &str) -> Result<PathBuf>;
}

/// Places a downloaded artifact into an install directory
#[async_trait]
pub trait Installer: Send + Sync {
    async fn install(&self, binary_name: &str, version: &str, dest_dir: &Path) -> Result<()>;
}

/// Downloader reading from a local artifact repository
pub struct LocalDownloader {
    config: DownloadConfig,
}

impl LocalDownloader {
    pub fn new(config: DownloadConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Downloader for LocalDownloader {
    async fn download(&self, binary_name: &str, version: &str) -> Result<PathBuf> {
        let name = self.config.platform.artifact_name(binary_name, version);
        let source = self.config.source_uri.join(&name);
        let target = self.config.artifact_path(binary_name, version);

        if !source.exists() {
            anyhow::bail!(
                "Artifact '{}' not found in repository {}",
                name,
                self.config.source_uri.display()
            );
        }

        debug!(source = %source.display(), target = %target.display(), "Downloading artifact");
        copy_atomically(source, target.clone()).await?;
        info!(artifact = %name, "Artifact downloaded");

        Ok(target)
    }
}

/// Installer copying the downloaded artifact directory
pub struct DirectoryInstaller {
    config: DownloadConfig,
}

impl DirectoryInstaller {
    pub fn new(config: DownloadConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Installer for DirectoryInstaller {
    async fn install(&self, binary_name: &str, version: &str, dest_dir: &Path) -> Result<()> {
        let artifact = self.config.artifact_path(binary_name, version);
        if !artifact.exists() {
            anyhow::bail!("Artifact not downloaded: {}", artifact.display());
        }

        copy_atomically(artifact, dest_dir.to_path_buf()).await?;
        info!(binary = binary_name, version, dir = %dest_dir.display(), "Artifact installed");

        Ok(())
    }
}

/// Copy `source` (file or directory) to `target` via a sibling temp path
async fn copy_atomically(source: PathBuf, target: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        let parent = target
            .parent()
            .context("Copy target has no parent directory")?;
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;

        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(parent)
            .context("Failed to create staging directory")?;
        let staged = staging.path().join("artifact");

        copy_recursive(&source, &staged)?;

        if target.exists() {
            if target.is_dir() {
                std::fs::remove_dir_all(&target)?;
            } else {
                std::fs::remove_file(&target)?;
            }
        }
        std::fs::rename(&staged, &target)
            .with_context(|| format!("Failed to move artifact into {}", target.display()))?;

        Ok(())
    })
    .await
    .context("Copy task panicked")?
}

fn copy_recursive(source: &Path, target: &Path) -> Result<()> {
    let metadata = std::fs::metadata(source)
        .with_context(|| format!("Failed to stat {}", source.display()))?;

    if metadata.is_file() {
        std::fs::copy(source, target).with_context(|| {
            format!("Failed to copy {} to {}", source.display(), target.display())
        })?;
        return Ok(());
    }

    std::fs::create_dir_all(target)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        copy_recursive(&entry.path(), &target.join(entry.file_name()))?;
    }

    Ok(())
}
