//! Device registry (component E).
//!
//! A fixed-capacity array of up to 16 device entries. The registry is the
//! single arbiter for device ownership: a bridge must claim an entry
//! before it may call any driver operation against it, and `claim` is
//! atomic — it either succeeds and sets the owner, or fails with
//! [`RegistryError::DeviceBusy`], never partially.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

use planck_noalloc::vec::ArrayVec;

/// Registry capacity ceiling.
pub const MAX_DEVICES: usize = 16;

/// How a device is addressed on its bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusTag {
    /// Fixed I/O port, no enumeration (classic ISA).
    LegacyIsa,
    /// Enumerated via a PCI-like configuration mechanism.
    EnumeratedPci,
    /// Hot-pluggable (PCMCIA-class) card.
    HotPluggableCard,
}

/// Bus/device/function location triple, meaningful for enumerated buses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BusLocation {
    /// Bus number.
    pub bus: u8,
    /// Device number.
    pub device: u8,
    /// Function number.
    pub function: u8,
}

/// Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MacAddress(pub [u8; 6]);

/// One registry entry: the identity and ownership state of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceEntry {
    /// PCI-style vendor identifier (repurposed for ISA-board identity).
    pub vendor_id: u16,
    /// PCI-style device identifier.
    pub device_id: u16,
    /// How this device is addressed.
    pub bus_tag: BusTag,
    /// I/O port base.
    pub io_base: u16,
    /// Interrupt request line.
    pub irq: u8,
    /// Bus/device/function location, if this bus enumerates one.
    pub location: Option<BusLocation>,
    /// Hardware address, once known (may postdate `add`).
    pub mac: Option<MacAddress>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    entry: DeviceEntry,
    claimed_by: Option<u32>,
    verified: bool,
}

/// Errors the registry can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    /// The registry already holds [`MAX_DEVICES`] entries.
    RegistryFull,
    /// No entry exists at the given id.
    NoSuchDevice,
    /// The entry is already claimed by a different owner.
    DeviceBusy,
    /// The caller's owner id does not match the entry's current owner.
    AccessDenied,
}

/// A query filter for [`Registry::query`].
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryFilter {
    /// Only match entries with this vendor id, if set.
    pub vendor_id: Option<u16>,
    /// Only match unclaimed entries, if `true`.
    pub unclaimed_only: bool,
}

/// The fixed-capacity device registry.
#[derive(Default)]
pub struct Registry {
    slots: ArrayVec<Slot, MAX_DEVICES>,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self { slots: ArrayVec::new() }
    }

    /// Registers a new device, returning its id (stable for the life of
    /// the registry; ids are never reused after removal, but this registry
    /// never removes entries).
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::RegistryFull`] at [`MAX_DEVICES`] entries.
    pub fn add(&mut self, entry: DeviceEntry) -> Result<u32, RegistryError> {
        if self.slots.is_full() {
            return Err(RegistryError::RegistryFull);
        }
        let id = self.slots.len() as u32;
        self.slots.push(Slot { entry, claimed_by: None, verified: false });
        Ok(id)
    }

    fn slot(&self, id: u32) -> Result<&Slot, RegistryError> {
        self.slots.as_slice().get(id as usize).ok_or(RegistryError::NoSuchDevice)
    }

    fn slot_mut(&mut self, id: u32) -> Result<&mut Slot, RegistryError> {
        self.slots.as_mut_slice().get_mut(id as usize).ok_or(RegistryError::NoSuchDevice)
    }

    /// Atomically claims device `id` for `owner`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DeviceBusy`] if another owner already holds
    /// the claim; the entry is left unchanged in that case (no partial
    /// claim is ever observable).
    pub fn claim(&mut self, id: u32, owner: u32) -> Result<(), RegistryError> {
        let slot = self.slot_mut(id)?;
        match slot.claimed_by {
            Some(existing) if existing != owner => Err(RegistryError::DeviceBusy),
            _ => {
                slot.claimed_by = Some(owner);
                Ok(())
            }
        }
    }

    /// Releases device `id`, previously claimed by `owner`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::AccessDenied`] if `owner` does not match
    /// the current claim.
    pub fn release(&mut self, id: u32, owner: u32) -> Result<(), RegistryError> {
        let slot = self.slot_mut(id)?;
        if slot.claimed_by != Some(owner) {
            return Err(RegistryError::AccessDenied);
        }
        slot.claimed_by = None;
        slot.verified = false;
        Ok(())
    }

    /// Marks device `id` verified by its current owner.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::AccessDenied`] if `owner` does not hold the
    /// current claim.
    pub fn verify(&mut self, id: u32, owner: u32) -> Result<(), RegistryError> {
        let slot = self.slot_mut(id)?;
        if slot.claimed_by != Some(owner) {
            return Err(RegistryError::AccessDenied);
        }
        slot.verified = true;
        Ok(())
    }

    /// Reads back one entry's identity, without its ownership state.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NoSuchDevice`] if `id` is out of range.
    pub fn entry(&self, id: u32) -> Result<DeviceEntry, RegistryError> {
        Ok(self.slot(id)?.entry)
    }

    /// `true` if `id` is currently claimed by anyone.
    #[must_use]
    pub fn is_claimed(&self, id: u32) -> bool {
        self.slot(id).map(|s| s.claimed_by.is_some()).unwrap_or(false)
    }

    /// `true` if `id` has been verified by its current owner.
    #[must_use]
    pub fn is_verified(&self, id: u32) -> bool {
        self.slot(id).map(|s| s.verified).unwrap_or(false)
    }

    /// Returns the ids of every entry matching `filter`.
    #[must_use]
    pub fn query(&self, filter: QueryFilter) -> ArrayVec<u32, MAX_DEVICES> {
        let mut out = ArrayVec::new();
        for (idx, slot) in self.slots.iter().enumerate() {
            if let Some(vendor_id) = filter.vendor_id {
                if slot.entry.vendor_id != vendor_id {
                    continue;
                }
            }
            if filter.unclaimed_only && slot.claimed_by.is_some() {
                continue;
            }
            out.push(idx as u32);
        }
        out
    }

    /// Finds the id of the device at bus location `location`.
    #[must_use]
    pub fn find_by_location(&self, location: BusLocation) -> Option<u32> {
        self.slots.iter().position(|s| s.entry.location == Some(location)).map(|i| i as u32)
    }

    /// Finds the id of the device with hardware address `mac`.
    #[must_use]
    pub fn find_by_mac(&self, mac: MacAddress) -> Option<u32> {
        self.slots.iter().position(|s| s.entry.mac == Some(mac)).map(|i| i as u32)
    }
}
