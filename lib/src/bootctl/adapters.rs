//! Bootloader-family adapters: the thin shell-out layer that actually flips
//! which slot boots next. Grounded in the `Task` helper's shell-out pattern;
//! each adapter wraps the handful of commands its bootloader family needs
//! and nothing more (spec.md §6 treats the bootloader as an external
//! collaborator, not something this crate reimplements).

use camino::Utf8PathBuf;

use super::slot::{Slot, SlotDescriptor};
use crate::error::{OtaError, Result};
use crate::task::Task;

/// What a boot-control implementation must provide: read the bootloader's
/// idea of the current slot, and switch its default entry to a new one.
pub trait BootAdapter: std::fmt::Debug + Send + Sync {
    /// Resolve which slot is active (booted) and which is standby.
    fn current_slot_descriptor(&self) -> Result<SlotDescriptor>;

    /// Make `slot` the bootloader's default entry for the next boot.
    fn switch_default_slot(&self, slot: &str) -> Result<()>;
}

fn active_marker_path(boot_dir: &Utf8PathBuf) -> Utf8PathBuf {
    boot_dir.join("ota-active-slot")
}

fn read_active_slot(boot_dir: &Utf8PathBuf) -> Result<Slot> {
    match std::fs::read_to_string(active_marker_path(boot_dir)) {
        Ok(s) => s.trim().parse(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Slot::A),
        Err(e) => Err(OtaError::Io(e)),
    }
}

/// grub2-based platforms: the default entry is set via `grub2-mkconfig` over
/// a slot-specific `custom.cfg` the running system is expected to maintain;
/// this adapter only rewrites the active-slot marker and regenerates the menu.
#[derive(Debug)]
pub struct GrubAdapter {
    boot_dir: Utf8PathBuf,
}

impl GrubAdapter {
    /// Build an adapter rooted at `boot_dir`, typically `/boot`.
    pub fn new(boot_dir: Utf8PathBuf) -> Self {
        Self { boot_dir }
    }
}

impl BootAdapter for GrubAdapter {
    fn current_slot_descriptor(&self) -> Result<SlotDescriptor> {
        Ok(SlotDescriptor::from_active(read_active_slot(&self.boot_dir)?))
    }

    fn switch_default_slot(&self, slot: &str) -> Result<()> {
        std::fs::write(active_marker_path(&self.boot_dir), format!("{slot}\n"))?;
        Task::new("regenerating grub menu", "grub2-mkconfig")
            .args(["-o", "/boot/grub2/grub.cfg"])
            .quiet_output()
            .run()
            .map_err(OtaError::Unrecoverable)
    }
}

/// extlinux-based platforms (NVIDIA cboot/UEFI), driven by editing
/// `extlinux.conf`'s `DEFAULT` directive via `extlinux`'s config tooling.
#[derive(Debug)]
pub struct ExtlinuxAdapter {
    boot_dir: Utf8PathBuf,
}

impl ExtlinuxAdapter {
    /// Build an adapter rooted at `boot_dir`, typically `/boot`.
    pub fn new(boot_dir: Utf8PathBuf) -> Self {
        Self { boot_dir }
    }
}

impl BootAdapter for ExtlinuxAdapter {
    fn current_slot_descriptor(&self) -> Result<SlotDescriptor> {
        Ok(SlotDescriptor::from_active(read_active_slot(&self.boot_dir)?))
    }

    fn switch_default_slot(&self, slot: &str) -> Result<()> {
        std::fs::write(active_marker_path(&self.boot_dir), format!("{slot}\n"))?;
        let entry = format!("LABEL={slot}");
        Task::new("updating extlinux default entry", "extlinux")
            .args(["--update", "--default", &entry, self.boot_dir.as_str()])
            .quiet_output()
            .run()
            .map_err(OtaError::Unrecoverable)
    }
}

/// A no-op adapter for tests and dry runs: tracks the active slot in memory
/// only, never shells out.
#[derive(Debug, Default)]
pub struct NoopAdapter {
    switched_to: std::sync::Mutex<Option<String>>,
}

impl BootAdapter for NoopAdapter {
    fn current_slot_descriptor(&self) -> Result<SlotDescriptor> {
        let slot = self
            .switched_to
            .lock()
            .unwrap()
            .as_deref()
            .map(str::parse)
            .transpose()?
            .unwrap_or(Slot::A);
        Ok(SlotDescriptor::from_active(slot))
    }

    fn switch_default_slot(&self, slot: &str) -> Result<()> {
        *self.switched_to.lock().unwrap() = Some(slot.to_string());
        Ok(())
    }
}
