//! Configuration loaded from `~/.config/mediawriter/config.toml`.
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::download::DownloadOptions;
use crate::write::WriteOptions;

/// Environment variable the helper reads to find its config file.
pub const CONFIG_ENV: &str = "MEDIAWRITER_CONFIG";

/// Downloader settings (`[download]` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Delay before reissuing a request after a transport interruption.
    pub resume_delay_ms: u64,
    /// Connect and response-header timeout in seconds.
    pub timeout_secs: u64,
    /// Read size while hashing the completed file.
    pub verify_chunk_size: usize,
    /// Below this many free bytes a write failure is reported as "out of space".
    pub low_space_threshold: u64,
    /// Cap on automatic resumes; absent means keep resuming.
    pub max_resume_attempts: Option<u32>,
    pub user_agent: Option<String>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            resume_delay_ms: 1000,
            timeout_secs: 5,
            verify_chunk_size: 64 * 1024,
            low_space_threshold: 5 * 1024 * 1024,
            max_resume_attempts: None,
            user_agent: None,
        }
    }
}

impl From<&DownloadConfig> for DownloadOptions {
    fn from(cfg: &DownloadConfig) -> Self {
        let defaults = DownloadOptions::default();
        Self {
            resume_delay: Duration::from_millis(cfg.resume_delay_ms),
            timeout: Duration::from_secs(cfg.timeout_secs),
            verify_chunk_size: cfg.verify_chunk_size.max(1),
            low_space_threshold: cfg.low_space_threshold,
            max_resume_attempts: cfg.max_resume_attempts,
            user_agent: cfg.user_agent.clone().unwrap_or(defaults.user_agent),
        }
    }
}

/// Device writer settings (`[writer]` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    pub block_size: usize,
    pub lock_attempts: u32,
    pub lock_retry_delay_ms: u64,
    /// Sleep between the failed first write attempt and the retry.
    pub retry_delay_ms: u64,
    /// How often to look at the staging file while a download is in flight.
    pub download_poll_interval_ms: u64,
    pub xz_memlimit: u64,
    /// Location of `mediawriter-helper`; defaults to next to the front-end.
    pub helper_path: Option<PathBuf>,
    /// Program used to run the helper with elevated privileges (e.g. `pkexec`).
    pub elevate_with: Option<String>,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            block_size: 64 * 1024,
            lock_attempts: 10,
            lock_retry_delay_ms: 2000,
            retry_delay_ms: 5000,
            download_poll_interval_ms: 1000,
            xz_memlimit: 1024 * 1024 * 1024,
            helper_path: None,
            elevate_with: None,
        }
    }
}

impl From<&WriterConfig> for WriteOptions {
    fn from(cfg: &WriterConfig) -> Self {
        // O_DIRECT needs whole sectors.
        let block_size = cfg.block_size.max(512) / 512 * 512;
        Self {
            block_size,
            lock_attempts: cfg.lock_attempts.max(1),
            lock_retry_delay: Duration::from_millis(cfg.lock_retry_delay_ms),
            retry_delay: Duration::from_millis(cfg.retry_delay_ms),
            download_poll_interval: Duration::from_millis(cfg.download_poll_interval_ms),
            xz_memlimit: cfg.xz_memlimit,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaWriterConfig {
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub writer: WriterConfig,
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("mediawriter")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<MediaWriterConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = MediaWriterConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    load_from(&path)
}

pub fn load_from(path: &Path) -> Result<MediaWriterConfig> {
    let data = fs::read_to_string(path)?;
    let cfg: MediaWriterConfig = toml::from_str(&data)?;
    Ok(cfg)
}

/// Read-only lookup for the helper: `$MEDIAWRITER_CONFIG`, then the XDG path,
/// then built-in defaults. Never writes anything.
pub fn load_for_helper() -> Result<MediaWriterConfig> {
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return load_from(Path::new(&path));
    }
    let xdg_dirs = xdg::BaseDirectories::with_prefix("mediawriter")?;
    match xdg_dirs.find_config_file("config.toml") {
        Some(path) => load_from(&path),
        None => Ok(MediaWriterConfig::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let cfg = MediaWriterConfig::default();
        assert_eq!(cfg.download.resume_delay_ms, 1000);
        assert_eq!(cfg.download.timeout_secs, 5);
        assert_eq!(cfg.download.low_space_threshold, 5 * 1024 * 1024);
        assert_eq!(cfg.writer.block_size, 64 * 1024);
        assert_eq!(cfg.writer.lock_attempts, 10);
        assert_eq!(cfg.writer.retry_delay_ms, 5000);
    }

    #[test]
    fn config_toml_roundtrip() {
        let cfg = MediaWriterConfig::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: MediaWriterConfig = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.writer.block_size, cfg.writer.block_size);
        assert_eq!(parsed.download.verify_chunk_size, cfg.download.verify_chunk_size);
    }

    #[test]
    fn partial_sections_fall_back_to_defaults() {
        let toml = r#"
            [writer]
            lock_attempts = 3
            elevate_with = "pkexec"

            [download]
            max_resume_attempts = 20
        "#;
        let cfg: MediaWriterConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.writer.lock_attempts, 3);
        assert_eq!(cfg.writer.block_size, 64 * 1024);
        assert_eq!(cfg.writer.elevate_with.as_deref(), Some("pkexec"));
        assert_eq!(cfg.download.max_resume_attempts, Some(20));
        assert_eq!(cfg.download.resume_delay_ms, 1000);
    }

    #[test]
    fn writer_options_round_block_size_to_sectors() {
        let cfg = WriterConfig {
            block_size: 1000,
            lock_attempts: 0,
            ..WriterConfig::default()
        };
        let opts = WriteOptions::from(&cfg);
        assert_eq!(opts.block_size, 512);
        assert_eq!(opts.lock_attempts, 1);
        assert_eq!(opts.retry_delay, Duration::from_secs(5));
    }

    #[test]
    fn download_options_from_config() {
        let cfg = DownloadConfig {
            resume_delay_ms: 10,
            user_agent: Some("test-agent".into()),
            ..DownloadConfig::default()
        };
        let opts = DownloadOptions::from(&cfg);
        assert_eq!(opts.resume_delay, Duration::from_millis(10));
        assert_eq!(opts.timeout, Duration::from_secs(5));
        assert_eq!(opts.user_agent, "test-agent");
    }
}
