//! On-disk persistence for boot-control state: `status`, `version`, and
//! `slot_in_use`, one small file per slot directory. Every write goes
//! through a temp file in the same directory, `fsync`ed, then renamed into
//! place, so a crash between write and rename never corrupts the existing
//! file and a reader never observes a partial write.

use std::io::Write;

use camino::Utf8PathBuf;

use super::OtaStatus;
use crate::error::Result;

/// Reads and atomically writes the three boot-control files for each slot
/// under a shared root directory (`ota_status_dir` in configuration).
#[derive(Debug, Clone)]
pub struct SlotStateStore {
    root: Utf8PathBuf,
}

impl SlotStateStore {
    /// Build a store rooted at `root`, e.g. `/boot/ota-status`.
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    fn slot_dir(&self, slot: &str) -> Utf8PathBuf {
        self.root.join(format!("ota-partition.{slot}"))
    }

    fn atomic_write(&self, path: &Utf8PathBuf, contents: &str) -> Result<()> {
        let dir = path.parent().expect("status file path always has a parent").to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(contents.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        if let Ok(dirfd) = std::fs::File::open(&dir) {
            let _ = dirfd.sync_all();
        }
        Ok(())
    }

    fn read_trimmed(&self, path: &Utf8PathBuf) -> Result<Option<String>> {
        match std::fs::read_to_string(path) {
            Ok(s) => Ok(Some(s.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist `status` for `slot`.
    pub fn write_status(&self, slot: &str, status: OtaStatus) -> Result<()> {
        self.atomic_write(&self.slot_dir(slot).join("status"), &status.to_string())
    }

    /// Read the persisted status for `slot`, defaulting to `INITIALIZED`.
    pub fn read_status(&self, slot: &str) -> Result<OtaStatus> {
        match self.read_trimmed(&self.slot_dir(slot).join("status"))? {
            Some(s) => s.parse(),
            None => Ok(OtaStatus::Initialized),
        }
    }

    /// Persist the image version string that now occupies `slot`.
    pub fn write_version(&self, slot: &str, version: &str) -> Result<()> {
        self.atomic_write(&self.slot_dir(slot).join("version"), version)
    }

    /// Read the image version string recorded for `slot`, if any.
    pub fn read_version(&self, slot: &str) -> Result<Option<String>> {
        self.read_trimmed(&self.slot_dir(slot).join("version"))
    }

    /// Record which slot this controller last switched the bootloader to,
    /// for fallback-reboot detection on the next boot.
    pub fn write_slot_in_use(&self, slot: &str) -> Result<()> {
        self.atomic_write(&self.root.join("slot_in_use"), slot)
    }

    /// Read which slot was last switched to, if any.
    pub fn read_slot_in_use(&self) -> Result<Option<String>> {
        self.read_trimmed(&self.root.join("slot_in_use"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SlotStateStore::new(Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap());
        store.write_status("a", OtaStatus::Updating).unwrap();
        assert_eq!(store.read_status("a").unwrap(), OtaStatus::Updating);
    }

    #[test]
    fn missing_status_defaults_to_initialized() {
        let dir = tempfile::tempdir().unwrap();
        let store = SlotStateStore::new(Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap());
        assert_eq!(store.read_status("b").unwrap(), OtaStatus::Initialized);
    }

    #[test]
    fn slot_in_use_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SlotStateStore::new(Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap());
        assert_eq!(store.read_slot_in_use().unwrap(), None);
        store.write_slot_in_use("b").unwrap();
        assert_eq!(store.read_slot_in_use().unwrap(), Some("b".to_string()));
    }

    #[test]
    fn version_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SlotStateStore::new(Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap());
        store.write_version("a", "2026.07.1").unwrap();
        assert_eq!(store.read_version("a").unwrap(), Some("2026.07.1".to_string()));
    }
}
