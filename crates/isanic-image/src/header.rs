//! Per-module immutable descriptor, read by the builder from each
//! candidate module before its hot section is copied into the image.

use bitflags::bitflags;

/// Module header magic, validated on every load attempt.
pub const MODULE_MAGIC: [u8; 4] = *b"ISNM";

/// ABI version this builder accepts. A module whose `abi_version` differs
/// is rejected before any bytes are copied.
pub const SUPPORTED_ABI_VERSION: u16 = 1;

/// What kind of module this is. Purely advisory to the builder; all three
/// classes go through the same size/copy/patch pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleClass {
    /// A per-device network interface driver.
    Nic,
    /// An optional capability layered on top of a NIC module (e.g.
    /// checksum offload).
    Feature,
    /// Core resident-image plumbing: the dispatcher's own entry stub, the
    /// bridge, the buffer plane.
    Core,
}

bitflags! {
    /// Per-module flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ModuleFlags: u8 {
        /// This module installs an interrupt handler.
        const HAS_ISR = 1 << 0;
        /// This module has a cold section the loader discards after init.
        const DISCARD_COLD = 1 << 1;
        /// This module's relocation table includes self-modifying-code
        /// call-site patches, not just absolute-offset fixups.
        const USES_SMC = 1 << 2;
    }
}

/// The four entry points a module may export, as byte offsets from the
/// start of its own hot section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntryOffsets {
    /// Called once during attach.
    pub init: u16,
    /// The module's packet-driver API entry, if any.
    pub api: u16,
    /// The module's interrupt handler, if [`ModuleFlags::HAS_ISR`] is set.
    pub isr: u16,
    /// Called once during detach.
    pub cleanup: u16,
}

/// One relocation site inside a module's hot section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocationEntry {
    /// Byte offset, relative to the start of this module's hot section,
    /// of the 16-bit field to patch.
    pub site_offset: u16,
    /// Identifier of the module whose destination offset this site
    /// resolves against.
    pub target_module_id: u16,
    /// `true` if this site is a call-site thunk patched as a relative
    /// displacement (self-modifying-code); `false` for a plain
    /// absolute-offset fixup.
    pub is_call_displacement: bool,
}

/// A module's immutable descriptor, as read by the builder.
///
/// `hot_start`/`hot_end` bound the region of the module's source image
/// that must remain resident; everything outside that range is cold and
/// never copied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleHeader<'a> {
    /// Must equal [`MODULE_MAGIC`].
    pub magic: [u8; 4],
    /// Must equal [`SUPPORTED_ABI_VERSION`].
    pub abi_version: u16,
    /// Module class.
    pub class: ModuleClass,
    /// Module flags.
    pub flags: ModuleFlags,
    /// Stable identifier used by relocation sites and well-known entry
    /// point resolution.
    pub identifier: u16,
    /// Lowest CPU family (as its `isanic_platform::CpuFamily` discriminant
    /// ordinal) this module requires.
    pub min_cpu: u8,
    /// Byte offset, within this module's source buffer, where the hot
    /// section begins.
    pub hot_start: u16,
    /// Byte offset, within this module's source buffer, one past the end
    /// of the hot section.
    pub hot_end: u16,
    /// Entry point offsets, relative to `hot_start`.
    pub entry_offsets: EntryOffsets,
    /// Relocation sites inside the hot section.
    pub relocations: &'a [RelocationEntry],
    /// Size in bytes of this module's uninitialized-data (BSS) region,
    /// reserved but not copied.
    pub bss_size: u16,
}

impl<'a> ModuleHeader<'a> {
    /// Size of the hot section this module contributes to the image.
    #[must_use]
    pub const fn hot_size(&self) -> u16 {
        self.hot_end - self.hot_start
    }

    /// `true` if this header's magic and ABI version are both valid.
    #[must_use]
    pub const fn signature_is_valid(&self) -> bool {
        let magic_ok = self.magic[0] == MODULE_MAGIC[0]
            && self.magic[1] == MODULE_MAGIC[1]
            && self.magic[2] == MODULE_MAGIC[2]
            && self.magic[3] == MODULE_MAGIC[3];
        magic_ok && self.abi_version == SUPPORTED_ABI_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> ModuleHeader<'static> {
        ModuleHeader {
            magic: MODULE_MAGIC,
            abi_version: SUPPORTED_ABI_VERSION,
            class: ModuleClass::Nic,
            flags: ModuleFlags::HAS_ISR,
            identifier: 1,
            min_cpu: 0,
            hot_start: 0,
            hot_end: 512,
            entry_offsets: EntryOffsets::default(),
            relocations: &[],
            bss_size: 0,
        }
    }

    #[test]
    fn hot_size_is_end_minus_start() {
        assert_eq!(header().hot_size(), 512);
    }

    #[test]
    fn valid_signature_accepted() {
        assert!(header().signature_is_valid());
    }

    #[test]
    fn bad_magic_rejected() {
        let mut h = header();
        h.magic = *b"NOPE";
        assert!(!h.signature_is_valid());
    }

    #[test]
    fn bad_abi_version_rejected() {
        let mut h = header();
        h.abi_version = 99;
        assert!(!h.signature_is_valid());
    }
}
