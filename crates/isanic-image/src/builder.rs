//! Two-pass image builder: size/validate, then copy/patch/serialize.

use planck_noalloc::vec::ArrayVec;

use crate::header::ModuleHeader;
use crate::layout::{
    ImageHeader, ImageLayout, ModuleEntry, WellKnownModules, IMAGE_HEADER_SIZE, MAX_IMAGE_SIZE, MAX_MODULES,
    STACK_RESERVE_BYTES,
};
use crate::reloc::patched_value;

/// Errors the builder can report. Every variant leaves no global state
/// mutated and, for the two variants that can occur after allocation,
/// releases the partially built image first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageError {
    /// Accumulated module sizes would push `total_size` past
    /// [`crate::layout::MAX_IMAGE_SIZE`].
    SizeOverflow,
    /// A selected module's hot section is empty (`hot_start == hot_end`).
    ZeroHotSize,
    /// A selected module failed signature validation, was missing from
    /// the provider, or a relocation/well-known lookup named a module
    /// outside the current selection.
    BadSignature,
    /// The host allocator could not satisfy the image allocation.
    AllocFailed,
}

impl core::fmt::Display for ImageError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::SizeOverflow => f.write_str("image size exceeds the 64 KiB ceiling"),
            Self::ZeroHotSize => f.write_str("a selected module has a zero-byte hot section"),
            Self::BadSignature => f.write_str("module header signature or relocation target invalid"),
            Self::AllocFailed => f.write_str("image buffer allocation failed"),
        }
    }
}

/// Resolves a module identifier to its header and source bytes. The
/// builder never interprets the bytes outside the header's declared hot
/// range.
pub trait ModuleProvider {
    /// The module's immutable descriptor, or `None` if `id` is unknown.
    fn header(&self, id: u16) -> Option<ModuleHeader<'_>>;
    /// The module's full source buffer (the builder slices
    /// `header.hot_start..header.hot_end` out of it itself).
    fn source(&self, id: u16) -> Option<&[u8]>;
}

/// Supplies the image buffer. Implementations on the resident target
/// allocate from conventional memory; host tests back this with the
/// system allocator.
pub trait ImageAllocator {
    /// Allocates a zeroed buffer of at least `size` bytes, or `None` if
    /// the allocator cannot satisfy the request.
    fn alloc(&mut self, size: usize) -> Option<*mut u8>;
    /// Releases a buffer previously returned by `alloc` with the same
    /// `size`.
    ///
    /// # Safety
    ///
    /// `ptr` must be a value this allocator's `alloc` returned, not yet
    /// freed, with the same `size` it was allocated with.
    unsafe fn free(&mut self, ptr: *mut u8, size: usize);
    /// Allocation granularity; requested sizes are rounded up to a
    /// multiple of this.
    fn granularity(&self) -> usize {
        16
    }
}

fn round_up(size: usize, granularity: usize) -> usize {
    if granularity == 0 {
        return size;
    }
    size.div_ceil(granularity) * granularity
}

/// Pass 1: walks `selection` in order, validating every header and
/// accumulating `total_size`. Allocates nothing; mutates nothing global.
///
/// # Errors
///
/// Returns [`ImageError::BadSignature`] for an unknown or invalid-signature
/// module, [`ImageError::ZeroHotSize`] for an empty hot section, or
/// [`ImageError::SizeOverflow`] once `total_size` would exceed
/// [`MAX_IMAGE_SIZE`].
fn size_and_validate(
    selection: &[u16],
    provider: &impl ModuleProvider,
) -> Result<(ArrayVec<ModuleEntry, MAX_MODULES>, u16), ImageError> {
    let mut entries = ArrayVec::new();
    let mut total_size: usize = IMAGE_HEADER_SIZE;
    for &id in selection {
        let header = provider.header(id).ok_or(ImageError::BadSignature)?;
        if !header.signature_is_valid() {
            return Err(ImageError::BadSignature);
        }
        let hot_size = header.hot_size();
        if hot_size == 0 {
            return Err(ImageError::ZeroHotSize);
        }
        let dst_offset = total_size;
        total_size += hot_size as usize;
        if total_size > MAX_IMAGE_SIZE {
            return Err(ImageError::SizeOverflow);
        }
        entries
            .try_push(ModuleEntry {
                id,
                src_offset: header.hot_start,
                src_size: hot_size,
                // total_size <= MAX_IMAGE_SIZE (u16::MAX - 1) was just checked above.
                dst_offset: dst_offset as u16,
            })
            .map_err(|_| ImageError::SizeOverflow)?;
    }
    Ok((entries, total_size as u16))
}

fn patch_site(image: &mut [u8], abs_offset: usize, value: [u8; 2]) {
    image[abs_offset] = value[0];
    image[abs_offset + 1] = value[1];
}

/// Pass 2 plus relocation/SMC patching and the prefetch-serialization
/// write. Builds the full resident image from a selection already proven
/// valid by [`size_and_validate`].
///
/// # Errors
///
/// Returns [`ImageError::AllocFailed`] if the allocator cannot satisfy the
/// image buffer request, or [`ImageError::BadSignature`] if a relocation
/// or well-known entry point names a module outside `selection` — in
/// either case the partially built image (if any) is released before
/// returning.
#[allow(clippy::too_many_arguments)]
fn copy_patch_and_serialize(
    selection: &[u16],
    entries: ArrayVec<ModuleEntry, MAX_MODULES>,
    total_size: u16,
    provider: &impl ModuleProvider,
    allocator: &mut impl ImageAllocator,
    int_number: u8,
    irq_number: u8,
    well_known: WellKnownModules,
) -> Result<(*mut u8, usize, ImageLayout, ImageHeader), ImageError> {
    let alloc_len = round_up(total_size as usize + STACK_RESERVE_BYTES as usize, allocator.granularity());
    let base = allocator.alloc(alloc_len).ok_or(ImageError::AllocFailed)?;
    // SAFETY: `base` was just allocated with exactly `alloc_len` bytes by
    // `allocator.alloc`, which zeroes it; no other reference to it exists
    // yet.
    let image = unsafe { core::slice::from_raw_parts_mut(base, alloc_len) };

    let layout = ImageLayout { total_size, entries };

    for (idx, &id) in selection.iter().enumerate() {
        let header = match provider.header(id) {
            Some(h) => h,
            None => {
                // SAFETY: `base`/`alloc_len` are exactly what `alloc` returned above.
                unsafe { allocator.free(base, alloc_len) };
                return Err(ImageError::BadSignature);
            }
        };
        let entry = &layout.entries[idx];
        let src = match provider.source(id) {
            Some(s) => s,
            None => {
                // SAFETY: `base`/`alloc_len` are exactly what `alloc` returned above.
                unsafe { allocator.free(base, alloc_len) };
                return Err(ImageError::BadSignature);
            }
        };
        let hot = &src[header.hot_start as usize..header.hot_end as usize];
        image[entry.dst_offset as usize..entry.dst_offset as usize + entry.src_size as usize].copy_from_slice(hot);

        for reloc in header.relocations {
            let Some(target) = layout.entry_for(reloc.target_module_id) else {
                // SAFETY: `base`/`alloc_len` are exactly what `alloc` returned above.
                unsafe { allocator.free(base, alloc_len) };
                return Err(ImageError::BadSignature);
            };
            let site_abs = entry.dst_offset as usize + reloc.site_offset as usize;
            let value = patched_value(reloc, site_abs, target.dst_offset);
            patch_site(image, site_abs, value);
        }
    }

    let resolve = |module_id: u16, offset_of: fn(&ModuleHeader<'_>) -> u16| -> Result<u16, ImageError> {
        let header = provider.header(module_id).ok_or(ImageError::BadSignature)?;
        let entry = layout.entry_for(module_id).ok_or(ImageError::BadSignature)?;
        Ok(entry.dst_offset + offset_of(&header))
    };

    let pktapi_offset = match resolve(well_known.packet_api, |h| h.entry_offsets.api) {
        Ok(v) => v,
        Err(e) => {
            // SAFETY: `base`/`alloc_len` are exactly what `alloc` returned above.
            unsafe { allocator.free(base, alloc_len) };
            return Err(e);
        }
    };
    let idle_offset = match resolve(well_known.idle, |h| h.entry_offsets.init) {
        Ok(v) => v,
        Err(e) => {
            // SAFETY: `base`/`alloc_len` are exactly what `alloc` returned above.
            unsafe { allocator.free(base, alloc_len) };
            return Err(e);
        }
    };
    let irq_offset = match resolve(well_known.interrupt, |h| h.entry_offsets.isr) {
        Ok(v) => v,
        Err(e) => {
            // SAFETY: `base`/`alloc_len` are exactly what `alloc` returned above.
            unsafe { allocator.free(base, alloc_len) };
            return Err(e);
        }
    };
    let uninstall_offset = match resolve(well_known.uninstall, |h| h.entry_offsets.cleanup) {
        Ok(v) => v,
        Err(e) => {
            // SAFETY: `base`/`alloc_len` are exactly what `alloc` returned above.
            unsafe { allocator.free(base, alloc_len) };
            return Err(e);
        }
    };

    // Prefetch serialization: a short branch to the next instruction at
    // the first module's entry offset (its dst_offset, the start of its
    // hot section), written last so the image is immutable from this
    // point on.
    if let Some(first) = layout.entries.as_slice().first() {
        patch_site(image, first.dst_offset as usize, [0xEB, 0x00]);
    }

    let header = ImageHeader { int_number, irq_number, pktapi_offset, idle_offset, irq_offset, uninstall_offset, total_size };
    image[0..IMAGE_HEADER_SIZE].copy_from_slice(&header.encode());

    Ok((base, alloc_len, layout, header))
}

/// The complete output of [`build_image`]: a freshly allocated resident
/// image, its layout, and the header that was written at offset 0.
pub struct BuiltImage {
    base: *mut u8,
    alloc_len: usize,
    /// Per-module placement.
    pub layout: ImageLayout,
    /// The header written at image offset 0.
    pub header: ImageHeader,
}

impl BuiltImage {
    /// Base pointer of the allocated image.
    #[must_use]
    pub const fn base(&self) -> *mut u8 {
        self.base
    }

    /// Total allocated length, including the stack reserve and any
    /// allocator-granularity rounding.
    #[must_use]
    pub const fn alloc_len(&self) -> usize {
        self.alloc_len
    }

    /// Reads back the image's bytes.
    ///
    /// # Safety
    ///
    /// The image must not have been freed, and must not be concurrently
    /// mutated (the SMC patching path only ever runs once, during
    /// `build_image`, so this is safe once the builder has returned).
    #[must_use]
    pub unsafe fn as_slice(&self) -> &[u8] {
        // SAFETY: forwarded from the caller's contract above.
        unsafe { core::slice::from_raw_parts(self.base, self.alloc_len) }
    }

    /// Releases the image back to `allocator`.
    ///
    /// # Safety
    ///
    /// `allocator` must be the same allocator (or an allocator sharing the
    /// same backing store) that `build_image` used.
    pub unsafe fn release(self, allocator: &mut impl ImageAllocator) {
        // SAFETY: forwarded from the caller's contract above.
        unsafe { allocator.free(self.base, self.alloc_len) };
    }
}

/// Builds a resident image from `selection`, in order, resolving each
/// module through `provider` and allocating through `allocator`.
///
/// Two passes, exactly as §4.G specifies: [`size_and_validate`] touches no
/// global state and allocates nothing; only once it succeeds does
/// [`copy_patch_and_serialize`] allocate the image and begin writing to
/// it. Any failure in the second pass releases the partially built image
/// before returning.
///
/// # Errors
///
/// See [`ImageError`].
pub fn build_image(
    selection: &[u16],
    provider: &impl ModuleProvider,
    allocator: &mut impl ImageAllocator,
    int_number: u8,
    irq_number: u8,
    well_known: WellKnownModules,
) -> Result<BuiltImage, ImageError> {
    let (entries, total_size) = size_and_validate(selection, provider)?;
    let (base, alloc_len, layout, header) =
        copy_patch_and_serialize(selection, entries, total_size, provider, allocator, int_number, irq_number, well_known)?;
    Ok(BuiltImage { base, alloc_len, layout, header })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{EntryOffsets, ModuleClass, ModuleFlags, RelocationEntry, MODULE_MAGIC, SUPPORTED_ABI_VERSION};

    struct SystemAllocator;
    impl ImageAllocator for SystemAllocator {
        fn alloc(&mut self, size: usize) -> Option<*mut u8> {
            if size == 0 {
                return None;
            }
            let layout = std::alloc::Layout::from_size_align(size, 1).ok()?;
            // SAFETY: `layout` has non-zero size.
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
            if ptr.is_null() {
                None
            } else {
                Some(ptr)
            }
        }
        unsafe fn free(&mut self, ptr: *mut u8, size: usize) {
            let layout = std::alloc::Layout::from_size_align(size, 1).expect("layout matches a prior alloc");
            // SAFETY: forwarded from the trait's own contract.
            unsafe { std::alloc::dealloc(ptr, layout) };
        }
    }

    struct FakeModule {
        header_bytes: std::vec::Vec<u8>,
        reloc_storage: std::vec::Vec<RelocationEntry>,
        hot_start: u16,
        hot_end: u16,
        identifier: u16,
        entry_offsets: EntryOffsets,
    }

    struct FakeProvider {
        modules: std::collections::HashMap<u16, FakeModule>,
    }

    impl ModuleProvider for FakeProvider {
        fn header(&self, id: u16) -> Option<ModuleHeader<'_>> {
            let m = self.modules.get(&id)?;
            Some(ModuleHeader {
                magic: MODULE_MAGIC,
                abi_version: SUPPORTED_ABI_VERSION,
                class: ModuleClass::Nic,
                flags: ModuleFlags::empty(),
                identifier: m.identifier,
                min_cpu: 0,
                hot_start: m.hot_start,
                hot_end: m.hot_end,
                entry_offsets: m.entry_offsets,
                relocations: &m.reloc_storage,
                bss_size: 0,
            })
        }
        fn source(&self, id: u16) -> Option<&[u8]> {
            self.modules.get(&id).map(|m| m.header_bytes.as_slice())
        }
    }

    fn simple_module(id: u16, hot_bytes: &[u8]) -> FakeModule {
        FakeModule {
            header_bytes: hot_bytes.to_vec(),
            reloc_storage: std::vec::Vec::new(),
            hot_start: 0,
            hot_end: hot_bytes.len() as u16,
            identifier: id,
            entry_offsets: EntryOffsets { init: 0, api: 1, isr: 2, cleanup: 3 },
        }
    }

    fn well_known_single(id: u16) -> WellKnownModules {
        WellKnownModules { packet_api: id, idle: id, interrupt: id, uninstall: id }
    }

    #[test]
    fn builds_contiguous_layout_for_two_modules() {
        let mut modules = std::collections::HashMap::new();
        modules.insert(1, simple_module(1, &[0xAA; 16]));
        modules.insert(2, simple_module(2, &[0xBB; 32]));
        let provider = FakeProvider { modules };
        let mut alloc = SystemAllocator;

        let image = build_image(&[1, 2], &provider, &mut alloc, 96, 10, well_known_single(1)).unwrap();
        assert_eq!(image.layout.total_size as usize, IMAGE_HEADER_SIZE + 16 + 32);
        assert_eq!(image.layout.entries[0].dst_offset, IMAGE_HEADER_SIZE as u16);
        assert_eq!(image.layout.entries[1].dst_offset, IMAGE_HEADER_SIZE as u16 + 16);
        // SAFETY: image was just built and not freed yet.
        unsafe {
            assert_eq!(image.as_slice()[0..4], crate::layout::IMAGE_MAGIC);
            image.release(&mut alloc);
        }
    }

    #[test]
    fn zero_hot_size_rejected() {
        let mut modules = std::collections::HashMap::new();
        modules.insert(1, simple_module(1, &[]));
        let provider = FakeProvider { modules };
        let mut alloc = SystemAllocator;
        let result = build_image(&[1], &provider, &mut alloc, 96, 10, well_known_single(1));
        assert_eq!(result.err(), Some(ImageError::ZeroHotSize));
    }

    #[test]
    fn oversized_selection_rejected_without_allocating() {
        let mut modules = std::collections::HashMap::new();
        let big = std::vec![0u8; 65536 - IMAGE_HEADER_SIZE + 1];
        modules.insert(1, simple_module(1, &big));
        let provider = FakeProvider { modules };
        let mut alloc = SystemAllocator;
        let result = build_image(&[1], &provider, &mut alloc, 96, 10, well_known_single(1));
        assert_eq!(result.err(), Some(ImageError::SizeOverflow));
    }

    #[test]
    fn relocation_patches_target_dst_offset() {
        // site_offset 2, not 0: offset 0 is where the prefetch-serialization
        // branch lands, and this test wants to observe the relocation
        // patch undisturbed by that later write.
        let mut first = simple_module(1, &[0u8; 4]);
        first.reloc_storage.push(RelocationEntry { site_offset: 2, target_module_id: 2, is_call_displacement: false });
        let second = simple_module(2, &[0xCC; 8]);
        let mut modules = std::collections::HashMap::new();
        modules.insert(1, first);
        modules.insert(2, second);
        let provider = FakeProvider { modules };
        let mut alloc = SystemAllocator;

        let image = build_image(&[1, 2], &provider, &mut alloc, 96, 10, well_known_single(1)).unwrap();
        let second_dst = image.layout.entry_for(2).unwrap().dst_offset;
        let site_abs = image.layout.entry_for(1).unwrap().dst_offset as usize + 2;
        // SAFETY: image was just built and not freed yet.
        unsafe {
            let bytes = image.as_slice();
            let patched = u16::from_le_bytes([bytes[site_abs], bytes[site_abs + 1]]);
            assert_eq!(patched, second_dst);
            image.release(&mut alloc);
        }
    }

    #[test]
    fn prefetch_serialization_branch_written_at_first_entry() {
        let mut modules = std::collections::HashMap::new();
        modules.insert(1, simple_module(1, &[0x90; 16]));
        let provider = FakeProvider { modules };
        let mut alloc = SystemAllocator;
        let image = build_image(&[1], &provider, &mut alloc, 96, 10, well_known_single(1)).unwrap();
        let first_dst = image.layout.entries[0].dst_offset as usize;
        // SAFETY: image was just built and not freed yet.
        unsafe {
            let bytes = image.as_slice();
            assert_eq!(&bytes[first_dst..first_dst + 2], &[0xEB, 0x00]);
            image.release(&mut alloc);
        }
    }

    #[test]
    fn unknown_module_in_selection_is_bad_signature() {
        let provider = FakeProvider { modules: std::collections::HashMap::new() };
        let mut alloc = SystemAllocator;
        let result = build_image(&[1], &provider, &mut alloc, 96, 10, well_known_single(1));
        assert_eq!(result.err(), Some(ImageError::BadSignature));
    }

    #[test]
    fn repeated_builds_are_byte_identical_modulo_base_pointer() {
        let mut modules = std::collections::HashMap::new();
        modules.insert(1, simple_module(1, &[0xAA; 16]));
        modules.insert(2, simple_module(2, &[0xBB; 32]));
        let provider = FakeProvider { modules };
        let mut alloc = SystemAllocator;

        let a = build_image(&[1, 2], &provider, &mut alloc, 96, 10, well_known_single(1)).unwrap();
        let b = build_image(&[1, 2], &provider, &mut alloc, 96, 10, well_known_single(1)).unwrap();
        // SAFETY: both images were just built and not freed yet.
        unsafe {
            assert_eq!(a.as_slice(), b.as_slice());
            a.release(&mut alloc);
            b.release(&mut alloc);
        }
    }
}
