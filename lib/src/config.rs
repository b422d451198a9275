//! Process-wide configuration, loaded once and passed by reference into
//! every constructor.
//!
//! The original implementation expresses configuration as module-level
//! singletons (`cfg`, `proxy_cfg`); per the redesign note in spec.md §9 we
//! instead build one immutable value at startup and thread it through.

use std::path::PathBuf;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use otaclient_utils::BackoffPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which bootloader family's adapter to resolve at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BootloaderFamily {
    /// grub2, editing `/etc/default/grub` + a `custom.cfg` menu entry.
    Grub,
    /// extlinux.conf, as used by NVIDIA cboot/UEFI platforms.
    Extlinux,
    /// No-op adapter, used in tests and dry runs.
    Noop,
}

/// Concurrency caps from spec.md §5.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Bounds in-flight regular-file materialization tasks.
    pub max_concurrent_tasks: usize,
    /// Bounds in-flight HTTP downloads.
    pub max_concurrent_downloads: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 8,
            max_concurrent_downloads: 4,
        }
    }
}

/// Retry/back-off knobs, serializable mirror of [`BackoffPolicy`] (which
/// lives in `otaclient-utils` since it has no serde dependency of its own).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum attempts per download, including the first.
    pub max_retry: u32,
    /// Back-off factor in milliseconds.
    pub factor_ms: u64,
    /// Back-off cap in milliseconds.
    pub backoff_max_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retry: 3,
            factor_ms: 500,
            backoff_max_ms: 30_000,
        }
    }
}

impl From<RetryConfig> for BackoffPolicy {
    fn from(c: RetryConfig) -> Self {
        BackoffPolicy {
            max_retry: c.max_retry,
            factor: Duration::from_millis(c.factor_ms),
            backoff_max: Duration::from_millis(c.backoff_max_ms),
        }
    }
}

/// Filesystem layout knobs: where the standby slot is mounted, where the
/// temp pool lives, how often the stats collector drains.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Mount point of the standby rootfs while an update is in progress.
    pub standby_mount: Utf8PathBuf,
    /// Mount point of the currently active rootfs, used as a copy source for
    /// the `hold_set` and for resolving `persistents.txt` entries. `/` on a
    /// real ECU; tests point this at a scratch directory instead.
    #[serde(default = "default_active_root")]
    pub active_root: Utf8PathBuf,
    /// Mount point of the boot partition shared by both slots.
    pub boot_dir: Utf8PathBuf,
    /// Scratch pool for first-copy materialization, e.g. `/var/tmp/ota-tmp`.
    pub tmp_pool: Utf8PathBuf,
    /// Directory under which `ota-partition.<slot>/{status,version,slot_in_use}` live.
    pub ota_status_dir: Utf8PathBuf,
}

fn default_active_root() -> Utf8PathBuf {
    "/".into()
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            standby_mount: "/mnt/standby".into(),
            active_root: "/".into(),
            boot_dir: "/boot".into(),
            tmp_pool: "/var/tmp/ota-tmp".into(),
            ota_status_dir: "/boot/ota-status".into(),
        }
    }
}

/// Top-level, immutable configuration for one OTA client process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Bootloader family to drive.
    pub bootloader: BootloaderFamily,
    /// Concurrency caps.
    pub concurrency: ConcurrencyConfig,
    /// Retry/back-off policy for downloads.
    pub retry: RetryConfig,
    /// Filesystem layout.
    pub paths: PathsConfig,
    /// How often the stats collector drains its event queue, in milliseconds.
    pub collect_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bootloader: BootloaderFamily::Grub,
            concurrency: ConcurrencyConfig::default(),
            retry: RetryConfig::default(),
            paths: PathsConfig::default(),
            collect_interval_ms: 500,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, falling back to built-in defaults
    /// for any key the file omits.
    pub fn load(path: &PathBuf) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))
    }

    /// The back-off policy to hand the downloader.
    pub fn backoff_policy(&self) -> BackoffPolicy {
        self.retry.into()
    }
}
