//! Bus location derivation for emulated drives.
//!
//! Some older guest operating systems expect a drive at a specific bus
//! location. By default the emulator assigns locations automatically; a
//! manual override only applies to interfaces with addressable locations.

use serde::{Deserialize, Serialize};

/// Emulated drive interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriveInterface {
    Ide,
    Scsi,
    Virtio,
    Nvme,
    Usb,
    Floppy,
    /// No interface (image attached without a bus).
    None,
}

impl DriveInterface {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriveInterface::Ide => "ide",
            DriveInterface::Scsi => "scsi",
            DriveInterface::Virtio => "virtio",
            DriveInterface::Nvme => "nvme",
            DriveInterface::Usb => "usb",
            DriveInterface::Floppy => "floppy",
            DriveInterface::None => "none",
        }
    }
}

/// Manually specified bus location.
///
/// Field meaning depends on the interface: IDE uses bus/unit/index,
/// SCSI uses bus (target) and unit (LUN) with index ignored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusLocation {
    pub bus: u32,
    pub unit: u32,
    pub index: u32,
}

/// Derive the explicit location list for a drive.
///
/// `None` means automatic assignment: either no manual override was given,
/// or the interface has no addressable locations. IDE yields
/// `[bus, unit, index]`, SCSI yields `[target, lun]`.
pub fn derive_location(
    interface: DriveInterface,
    manual: Option<BusLocation>,
) -> Option<Vec<u32>> {
    let loc = manual?;
    match interface {
        DriveInterface::Ide => Some(vec![loc.bus, loc.unit, loc.index]),
        DriveInterface::Scsi => Some(vec![loc.bus, loc.unit]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn automatic_assignment_yields_none() {
        assert_eq!(derive_location(DriveInterface::Ide, None), None);
        assert_eq!(derive_location(DriveInterface::Scsi, None), None);
    }

    #[test]
    fn ide_uses_bus_unit_index() {
        let loc = BusLocation {
            bus: 1,
            unit: 0,
            index: 2,
        };
        assert_eq!(
            derive_location(DriveInterface::Ide, Some(loc)),
            Some(vec![1, 0, 2])
        );
    }

    #[test]
    fn scsi_uses_target_and_lun() {
        let loc = BusLocation {
            bus: 3,
            unit: 1,
            index: 9,
        };
        assert_eq!(
            derive_location(DriveInterface::Scsi, Some(loc)),
            Some(vec![3, 1])
        );
    }

    #[test]
    fn other_interfaces_ignore_manual_location() {
        let loc = BusLocation {
            bus: 1,
            unit: 1,
            index: 1,
        };
        assert_eq!(derive_location(DriveInterface::Virtio, Some(loc)), None);
        assert_eq!(derive_location(DriveInterface::Nvme, Some(loc)), None);
        assert_eq!(derive_location(DriveInterface::Floppy, Some(loc)), None);
    }
}
