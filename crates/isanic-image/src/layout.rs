//! `ImageLayout`, the builder's output record, and the image header wire
//! format written at offset 0 of the resident image (§6).

use planck_noalloc::vec::ArrayVec;

/// Image-wide module ceiling. Matches the registry's device ceiling in
/// spirit: a small fixed bound that keeps the layout table stack-sized.
pub const MAX_MODULES: usize = 16;

/// Fixed reserve appended past `total_size` for the image's private stack,
/// switched to by the entry dispatcher before it routes to the bridge.
pub const STACK_RESERVE_BYTES: u16 = 512;

/// Magic written at image offset 0.
pub const IMAGE_MAGIC: [u8; 4] = *b"ISNI";

/// Image format version.
pub const IMAGE_VERSION: u16 = 1;

/// Byte size of the encoded [`ImageHeader`].
pub const IMAGE_HEADER_SIZE: usize = 26;

/// Hard ceiling on total image size (§3 invariant: `total_size <= 65535`).
pub const MAX_IMAGE_SIZE: usize = 65_535;

/// One module's placement inside the built image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleEntry {
    /// Module identifier.
    pub id: u16,
    /// Offset of the hot section within its own source buffer
    /// (`header.hot_start`).
    pub src_offset: u16,
    /// Size of the copied hot section.
    pub src_size: u16,
    /// Offset within the built image this module's hot section starts at.
    pub dst_offset: u16,
}

/// The builder's full output: where every module landed, and the image's
/// overall size.
///
/// Invariants (§8 property 7): `sum(entries[i].src_size) + IMAGE_HEADER_SIZE
/// == total_size`, and consecutive entries are contiguous:
/// `entries[i].dst_offset + entries[i].src_size == entries[i+1].dst_offset`.
#[derive(Debug, Clone)]
pub struct ImageLayout {
    /// Total byte size of the built image, excluding the stack reserve.
    pub total_size: u16,
    /// Per-module placement, in build order.
    pub entries: ArrayVec<ModuleEntry, MAX_MODULES>,
}

impl ImageLayout {
    /// Finds the placement entry for `module_id`, if it was included in
    /// this build.
    #[must_use]
    pub fn entry_for(&self, module_id: u16) -> Option<&ModuleEntry> {
        self.entries.iter().find(|e| e.id == module_id)
    }
}

/// Which module provides each of the four well-known entry points the
/// image header exposes.
///
/// Resolved against a module's own [`crate::header::EntryOffsets`]: the
/// mapping from an image-level well-known entry point to the providing
/// module's own offset field is a builder policy decision (recorded in
/// this workspace's design notes), not part of the per-module header
/// layout itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WellKnownModules {
    /// Module providing the packet-driver API entry (its `api` offset).
    pub packet_api: u16,
    /// Module providing the idle/foreground hook (its `init` offset —
    /// TSR convention: the init routine falls through to the resident
    /// idle loop on first entry).
    pub idle: u16,
    /// Module providing the interrupt handler (its `isr` offset).
    pub interrupt: u16,
    /// Module providing the uninstall hook (its `cleanup` offset).
    pub uninstall: u16,
}

/// The fixed-layout header written at image offset 0 (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    /// Target software-interrupt vector (§6: default decimal 96).
    pub int_number: u8,
    /// IRQ line placeholder, filled by the attached device's claim.
    pub irq_number: u8,
    /// Final, image-relative offset of the packet-driver API entry.
    pub pktapi_offset: u16,
    /// Final, image-relative offset of the idle entry.
    pub idle_offset: u16,
    /// Final, image-relative offset of the interrupt entry.
    pub irq_offset: u16,
    /// Final, image-relative offset of the uninstall entry.
    pub uninstall_offset: u16,
    /// Total image size, excluding the stack reserve.
    pub total_size: u16,
}

impl ImageHeader {
    /// Encodes this header to its wire form: `{magic:u32, version:u16,
    /// image_size:u16, int_number:u8, irq_number:u8, pktapi_offset:u16,
    /// idle_offset:u16, irq_offset:u16, uninstall_offset:u16,
    /// data_offset:u16, data_size:u16, stack_offset:u16, stack_size:u16}`,
    /// all little-endian. `data_offset`/`stack_offset` are both
    /// `total_size` (§4.G: "data and stack offsets are set to total_size
    /// with a fixed 512-byte stack reserve"); `data_size` is 0 since this
    /// builder places no separate static-data segment beyond per-module
    /// BSS.
    #[must_use]
    pub fn encode(&self) -> [u8; IMAGE_HEADER_SIZE] {
        let mut out = [0u8; IMAGE_HEADER_SIZE];
        out[0..4].copy_from_slice(&IMAGE_MAGIC);
        out[4..6].copy_from_slice(&IMAGE_VERSION.to_le_bytes());
        out[6..8].copy_from_slice(&self.total_size.to_le_bytes());
        out[8] = self.int_number;
        out[9] = self.irq_number;
        out[10..12].copy_from_slice(&self.pktapi_offset.to_le_bytes());
        out[12..14].copy_from_slice(&self.idle_offset.to_le_bytes());
        out[14..16].copy_from_slice(&self.irq_offset.to_le_bytes());
        out[16..18].copy_from_slice(&self.uninstall_offset.to_le_bytes());
        out[18..20].copy_from_slice(&self.total_size.to_le_bytes());
        out[20..22].copy_from_slice(&0u16.to_le_bytes());
        out[22..24].copy_from_slice(&self.total_size.to_le_bytes());
        out[24..26].copy_from_slice(&STACK_RESERVE_BYTES.to_le_bytes());
        out
    }
}
