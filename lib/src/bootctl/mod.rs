//! Boot-control state machine: which slot is active, which is standby, and
//! the lifecycle status persisted across the update attempt so a reboot
//! mid-update (intentional or crash) can be detected and reconciled.
//!
//! See spec.md §4.G. Status, version, and `slot_in_use` are each a single
//! small file under `ota_status_dir/<slot>/`, written with the
//! temp-file-plus-rename pattern so a crash never leaves a half-written
//! status file behind.

mod adapters;
mod slot;
mod store;

pub use adapters::{BootAdapter, ExtlinuxAdapter, GrubAdapter, NoopAdapter};
pub use slot::SlotDescriptor;
pub use store::SlotStateStore;

use crate::config::{BootloaderFamily, Config};
use crate::error::Result;

/// The boot-control status lifecycle. Persisted verbatim (its `Display`
/// impl is the on-disk string) so the file format never needs a migration
/// for a simple variant rename.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OtaStatus {
    /// No update has ever been attempted, or the last one fully succeeded
    /// and this is steady state.
    Initialized,
    /// A rebuild of the standby slot is in progress.
    Updating,
    /// The last update completed and the ECU has rebooted into the new slot.
    Success,
    /// The last update failed before or during the reboot.
    Failure,
    /// A rollback to the previous slot is in progress.
    Rollbacking,
    /// A rollback attempt itself failed; manual intervention required.
    RollbackFailure,
}

impl std::fmt::Display for OtaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initialized => "INITIALIZED",
            Self::Updating => "UPDATING",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Rollbacking => "ROLLBACKING",
            Self::RollbackFailure => "ROLLBACK_FAILURE",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for OtaStatus {
    type Err = crate::error::OtaError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.trim() {
            "INITIALIZED" => Self::Initialized,
            "UPDATING" => Self::Updating,
            "SUCCESS" => Self::Success,
            "FAILURE" => Self::Failure,
            "ROLLBACKING" => Self::Rollbacking,
            "ROLLBACK_FAILURE" => Self::RollbackFailure,
            other => {
                return Err(crate::error::OtaError::MalformedManifest {
                    stream: "status".into(),
                    line: 0,
                    detail: format!("unrecognized status {other:?}"),
                })
            }
        })
    }
}

/// Owns the persisted boot-control state and drives slot switches through a
/// [`BootAdapter`].
#[derive(Debug)]
pub struct BootController {
    store: SlotStateStore,
    adapter: Box<dyn BootAdapter>,
}

impl BootController {
    /// Build a controller from process configuration, resolving the
    /// concrete [`BootAdapter`] from `config.bootloader`.
    pub fn from_config(config: &Config) -> Self {
        let adapter: Box<dyn BootAdapter> = match config.bootloader {
            BootloaderFamily::Grub => Box::new(GrubAdapter::new(config.paths.boot_dir.clone())),
            BootloaderFamily::Extlinux => Box::new(ExtlinuxAdapter::new(config.paths.boot_dir.clone())),
            BootloaderFamily::Noop => Box::new(NoopAdapter::default()),
        };
        Self {
            store: SlotStateStore::new(config.paths.ota_status_dir.clone()),
            adapter,
        }
    }

    /// The slot descriptor pair: which slot is currently active, which is
    /// standby, resolved from the adapter's view of the bootloader's
    /// current default entry.
    pub fn current_slots(&self) -> Result<SlotDescriptor> {
        self.adapter.current_slot_descriptor()
    }

    /// Mark the standby slot `UPDATING` before a rebuild starts, and point
    /// `slot_in_use` at it immediately so a crash or unexpected reboot
    /// partway through the rebuild is still detected as targeting standby,
    /// not silently attributed to whichever slot was active before.
    pub fn begin_update(&self, slot: &str) -> Result<()> {
        self.store.write_status(slot, OtaStatus::Updating)?;
        self.store.write_slot_in_use(slot)
    }

    /// Switch the bootloader's default entry to `slot` and mark it pending
    /// verification (`slot_in_use` is written so that a subsequent boot can
    /// tell whether it landed on the slot this controller switched to).
    pub fn finalize_update(&self, slot: &str, version: &str) -> Result<()> {
        self.store.write_version(slot, version)?;
        self.store.write_slot_in_use(slot)?;
        self.adapter.switch_default_slot(slot)?;
        self.store.write_status(slot, OtaStatus::Success)
    }

    /// Record that the update attempt on `slot` failed before completion.
    pub fn mark_failed(&self, slot: &str) -> Result<()> {
        self.store.write_status(slot, OtaStatus::Failure)
    }

    /// Detect a fallback reboot: the bootloader is reporting a slot
    /// different from the one `slot_in_use` last recorded, meaning the
    /// firmware silently fell back to the other slot (e.g. after repeated
    /// boot failures). Returns `true` if a fallback was detected, in which
    /// case the caller should record `ROLLBACK_FAILURE` or similar.
    pub fn detect_fallback(&self, booted_slot: &str) -> Result<bool> {
        match self.store.read_slot_in_use()? {
            Some(expected) => Ok(expected != booted_slot),
            None => Ok(false),
        }
    }

    /// Reconcile each slot's persisted status against what actually booted.
    /// Call once at process startup, before any command runs, so a status
    /// left behind by a crash or an unexpected (firmware-driven) fallback
    /// reboot never lingers as a stale `UPDATING`/`ROLLBACKING`/`SUCCESS`.
    ///
    /// - `UPDATING` on the slot that actually booted means the switch and
    ///   status write raced the crash and the switch won: resolve to
    ///   `SUCCESS`. `UPDATING` on a slot that did *not* boot means the
    ///   rebuild never finished: resolve to `FAILURE`.
    /// - `ROLLBACKING` on the slot that booted means the switch back never
    ///   took effect: resolve to `ROLLBACK_FAILURE`. Otherwise the rollback
    ///   completed: resolve to `INITIALIZED`.
    /// - `SUCCESS` is cross-checked against `slot_in_use`; a mismatch means
    ///   the firmware silently fell back to the other slot after this
    ///   process declared success, so it is downgraded to `FAILURE`.
    /// - `INITIALIZED`, `FAILURE`, and `ROLLBACK_FAILURE` are left as is.
    pub fn finalize_on_startup(&self) -> Result<()> {
        let slots = self.current_slots()?;
        let booted = slots.active.name();
        let fell_back = self.detect_fallback(booted)?;
        for slot in [slots.active.name(), slots.standby.name()] {
            match self.read_status(slot)? {
                OtaStatus::Updating => {
                    let resolved = if slot == booted { OtaStatus::Success } else { OtaStatus::Failure };
                    self.store.write_status(slot, resolved)?;
                }
                OtaStatus::Rollbacking => {
                    let resolved = if slot == booted { OtaStatus::RollbackFailure } else { OtaStatus::Initialized };
                    self.store.write_status(slot, resolved)?;
                }
                OtaStatus::Success if fell_back => {
                    self.store.write_status(slot, OtaStatus::Failure)?;
                }
                OtaStatus::Success | OtaStatus::Initialized | OtaStatus::Failure | OtaStatus::RollbackFailure => {}
            }
        }
        Ok(())
    }

    /// Read the persisted status for `slot`, defaulting to `INITIALIZED` if
    /// no status file has ever been written.
    pub fn read_status(&self, slot: &str) -> Result<OtaStatus> {
        self.store.read_status(slot)
    }

    /// Switch the bootloader's default entry back to `slots.active`,
    /// abandoning whatever was rebuilt onto `slots.standby`. Marks the
    /// standby slot `ROLLBACK_FAILURE` if the switch itself fails, since at
    /// that point neither slot's state is reliably known good.
    pub fn rollback(&self, slots: &SlotDescriptor) -> Result<()> {
        self.store.write_status(slots.standby.name(), OtaStatus::Rollbacking)?;
        match self.adapter.switch_default_slot(slots.active.name()) {
            Ok(()) => self.store.write_status(slots.standby.name(), OtaStatus::Initialized),
            Err(e) => {
                self.store.write_status(slots.standby.name(), OtaStatus::RollbackFailure)?;
                Err(e)
            }
        }
    }
}
