//! # Disk Cache Policy

use anyhow::Context;
use burn::config::Config;
use burn::data::network::downloader;
use std::fs::{File, remove_file};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Cache Policy
#[derive(Config, Debug)]
pub struct DiskCacheConfig {
    /// Key for the root cache directory, under ``~/.cache``.
    #[config(default = "\"detnet\".to_string()")]
    pub root_cache_key: String,

    /// Explicit cache root; replaces ``~/.cache/{root_cache_key}`` when set.
    #[config(default = "None")]
    pub root_dir: Option<String>,
}

impl Default for DiskCacheConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl DiskCacheConfig {
    /// Fetch the base cache directory.
    ///
    /// If the cache directory does not exist, does not create it.
    pub fn base_cache_dir(&self) -> anyhow::Result<PathBuf> {
        if let Some(root) = &self.root_dir {
            return Ok(PathBuf::from(root));
        }
        let home = dirs::home_dir().context("no home directory for the weight cache")?;
        Ok(home.join(".cache").join(&self.root_cache_key))
    }

    /// Fetch the base cache directory.
    ///
    /// If the cache directory does not exist, creates it.
    pub fn ensure_base_cache_dir(&self) -> anyhow::Result<PathBuf> {
        let dir = self.base_cache_dir()?;
        if !dir.exists() {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(dir)
    }

    /// Map a resource key to a cache path.
    ///
    /// Does not ensure that the path (or any of the parents) exist.
    pub fn resource_to_path(
        &self,
        resource_key: &[String],
    ) -> anyhow::Result<PathBuf> {
        let path = self.base_cache_dir()?;
        Ok(resource_key.iter().fold(path, |acc, s| acc.join(s)))
    }

    /// Map a resource key to a cache path and ensure the parent directory exists.
    pub fn ensure_resource_parent_dir(
        &self,
        resource_key: &[String],
    ) -> anyhow::Result<PathBuf> {
        let path = self.resource_to_path(resource_key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(path)
    }

    /// Fetch a Resource to the Cache.
    pub fn fetch_resource(
        &self,
        url: &str,
        resource: &[String],
    ) -> anyhow::Result<PathBuf> {
        let cache_file_path = self.ensure_resource_parent_dir(resource)?;
        try_cache_download_to_path(url, cache_file_path)
    }
}

/// Download a URL resource to a given path.
///
/// If the path already exists, does nothing.
///
/// # Returns
///
/// The cache path.
pub fn try_cache_download_to_path(
    url: &str,
    cache_file_path: PathBuf,
) -> anyhow::Result<PathBuf> {
    if cache_file_path.exists() {
        tracing::debug!(path = %cache_file_path.display(), "weight cache hit");
        return Ok(cache_file_path);
    }

    let file_name = file_name_of(&cache_file_path)?;
    tracing::info!(url, path = %cache_file_path.display(), "downloading weights");

    let bytes = downloader::download_file_as_bytes(url, &file_name);

    write_cache_file(&cache_file_path, &bytes)?;

    Ok(cache_file_path)
}

/// Write `bytes` to `path` in full.
///
/// A partially written file is removed, so a failed write is never seen as a cache hit.
pub fn write_cache_file(
    path: &Path,
    bytes: &[u8],
) -> anyhow::Result<()> {
    let mut output_file = File::create(path)
        .with_context(|| format!("failed to create cache file: {}", path.display()))?;

    if let Err(err) = output_file.write_all(bytes).and_then(|_| output_file.flush()) {
        drop(output_file);
        let _ = remove_file(path);
        return Err(err)
            .with_context(|| format!("failed to write model weights file: {}", path.display()));
    }
    Ok(())
}

fn file_name_of(path: &Path) -> anyhow::Result<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .with_context(|| format!("cache path has no file name: {}", path.display()))
}
