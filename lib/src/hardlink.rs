//! Hardlink-group reconstruction.
//!
//! `regulars.txt` entries that share an `(inode, size)` key on the source
//! rootfs must land back on a single inode in the standby rootfs. The first
//! worker to claim a group downloads/copies the content once; every other
//! worker with the same key blocks until that copy lands, then hardlinks to
//! it. This mirrors the original implementation's `_HardlinkTracker` /
//! `HardlinkRegister` pair, built on `Event` + `WeakValueDictionary`; here
//! the same refcounting is expressed with `Arc`/`Weak` and `tokio::sync`
//! primitives instead of polling an `Event`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::Notify;

use crate::error::{OtaError, Result};

/// Key identifying one hardlink group on the source rootfs: the original
/// inode number paired with file size, matching the original implementation's
/// `(RegularInf.inode, RegularInf.size)` grouping.
pub type HardlinkKey = (u64, u64);

/// Tracks the materialization of one hardlink group's first copy.
///
/// The writer that wins the race calls [`HardlinkTracker::writer_done`] (or
/// [`HardlinkTracker::writer_failed`] on error); every other holder's
/// [`HardlinkTracker::subscribe`] future resolves once one of those is
/// called. `remaining_links` starts at `nlink - 1`: once every expected
/// linker has hardlinked in, the group's tracker is dropped from the
/// register by virtue of `Weak` upgrade failing.
#[derive(Debug)]
pub struct HardlinkTracker {
    path: Mutex<Option<PathBuf>>,
    failed: Mutex<bool>,
    notify: Notify,
    remaining_links: std::sync::atomic::AtomicU64,
}

impl HardlinkTracker {
    fn new(nlink: u64) -> Self {
        Self {
            path: Mutex::new(None),
            failed: Mutex::new(false),
            notify: Notify::new(),
            remaining_links: std::sync::atomic::AtomicU64::new(nlink.saturating_sub(1)),
        }
    }

    /// Called by the writer that performed the first materialization.
    pub fn writer_done(&self, path: PathBuf) {
        *self.path.lock().unwrap() = Some(path);
        self.notify.notify_waiters();
    }

    /// Called by the writer if the first materialization failed; wakes every
    /// waiter so they can retry their own copy instead of hanging forever.
    pub fn writer_failed(&self) {
        *self.failed.lock().unwrap() = true;
        self.notify.notify_waiters();
    }

    /// Wait for the first writer to finish, returning the path it wrote to,
    /// or `None` if the first writer failed (caller should materialize its
    /// own copy instead of linking).
    pub async fn subscribe(&self) -> Option<PathBuf> {
        loop {
            if *self.failed.lock().unwrap() {
                return None;
            }
            if let Some(p) = self.path.lock().unwrap().clone() {
                return Some(p);
            }
            self.notify.notified().await;
        }
    }

    /// Record that one more hardlink has been created against the group's
    /// winning path. Returns the number of links still expected.
    pub fn record_link(&self) -> u64 {
        self.remaining_links
            .fetch_update(
                std::sync::atomic::Ordering::SeqCst,
                std::sync::atomic::Ordering::SeqCst,
                |n| Some(n.saturating_sub(1)),
            )
            .unwrap();
        self.remaining_links.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// First-writer-wins coordination for every hardlink group seen in one
/// standby rebuild. Entries are held weakly: once every writer/linker for a
/// group has dropped its `Arc<HardlinkTracker>`, the slot collapses and a
/// future rebuild (or a same-process retry) starts fresh.
#[derive(Debug, Default)]
pub struct HardlinkRegister {
    trackers: Mutex<HashMap<HardlinkKey, Weak<HardlinkTracker>>>,
}

/// What a caller should do with the hardlink group it asked about.
pub enum HardlinkRole {
    /// This caller is the first to touch the group; it must materialize the
    /// content itself and report the outcome via the returned tracker.
    Writer(Arc<HardlinkTracker>),
    /// Another caller is already materializing the group; await its tracker
    /// and hardlink to the path it reports.
    Linker(Arc<HardlinkTracker>),
}

impl HardlinkRegister {
    /// Build an empty register.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a role in the hardlink group identified by `key` with expected
    /// link count `nlink`. The first caller for a given `key` (or the first
    /// after the previous tracker has been fully released) becomes the
    /// writer; every subsequent concurrent caller becomes a linker.
    pub fn get_tracker(&self, key: HardlinkKey, nlink: u64) -> HardlinkRole {
        let mut trackers = self.trackers.lock().unwrap();
        if let Some(weak) = trackers.get(&key) {
            if let Some(existing) = weak.upgrade() {
                return HardlinkRole::Linker(existing);
            }
        }
        let tracker = Arc::new(HardlinkTracker::new(nlink));
        trackers.insert(key, Arc::downgrade(&tracker));
        HardlinkRole::Writer(tracker)
    }
}

/// Create `link` pointing at the same inode as `target`, matching the
/// original implementation's `os.link` call after `subscribe()` resolves.
pub fn link_into_group(target: &Path, link: &Path) -> Result<()> {
    if let Some(parent) = link.parent() {
        std::fs::create_dir_all(parent).map_err(OtaError::Io)?;
    }
    if link.exists() {
        std::fs::remove_file(link).map_err(OtaError::Io)?;
    }
    std::fs::hard_link(target, link).map_err(OtaError::Io)
}
