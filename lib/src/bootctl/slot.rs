//! A/B slot naming and descriptor resolution.

/// The two rootfs slots an ECU alternates between. Grounded in the fixed
/// `SLOT_A` / `SLOT_B` naming used by automotive A/B bootloader integrations
/// in the retrieved example pack, rather than inventing arbitrary slot IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    /// The first rootfs partition set.
    A,
    /// The second rootfs partition set.
    B,
}

impl Slot {
    /// The slot's canonical name, as used in `ota-partition.<slot>` directories.
    pub fn name(self) -> &'static str {
        match self {
            Self::A => "a",
            Self::B => "b",
        }
    }

    /// The other slot.
    pub fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

impl std::str::FromStr for Slot {
    type Err = crate::error::OtaError;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "a" => Ok(Self::A),
            "b" => Ok(Self::B),
            other => Err(crate::error::OtaError::MalformedManifest {
                stream: "slot".into(),
                line: 0,
                detail: format!("unrecognized slot {other:?}"),
            }),
        }
    }
}

/// Which slot is currently booted (active) and which is available to
/// rebuild into (standby), as resolved from the bootloader's current
/// default entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotDescriptor {
    /// The slot the system is currently running from.
    pub active: Slot,
    /// The slot a rebuild should target.
    pub standby: Slot,
}

impl SlotDescriptor {
    /// Build a descriptor from the active slot; standby is always the other one.
    pub fn from_active(active: Slot) -> Self {
        Self {
            active,
            standby: active.other(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn other_is_involutive() {
        assert_eq!(Slot::A.other().other(), Slot::A);
    }

    #[test]
    fn descriptor_standby_is_the_other_slot() {
        let d = SlotDescriptor::from_active(Slot::A);
        assert_eq!(d.standby, Slot::B);
    }

    #[test]
    fn slot_name_parses_back() {
        assert_eq!("a".parse::<Slot>().unwrap(), Slot::A);
        assert_eq!("B".parse::<Slot>().unwrap(), Slot::B);
        assert!("c".parse::<Slot>().is_err());
    }
}
