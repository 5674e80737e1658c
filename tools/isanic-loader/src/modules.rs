//! The loader's one built-in module: a minimal resident stub exposing the
//! four well-known entry points as single-byte `RETF` stubs. Stands in for
//! the real per-device driver modules this builder would otherwise read
//! from the installed module directory, none of which exist on a host
//! build.

use isanic_image::{
    EntryOffsets, ImageAllocator, ModuleClass, ModuleFlags, ModuleHeader, MODULE_MAGIC, SUPPORTED_ABI_VERSION,
};

/// Identifier of the built-in stub module.
pub const STUB_MODULE_ID: u16 = 1;

const RETF: u8 = 0xCB;

/// `ModuleProvider` over the one compiled-in stub module.
pub struct StubProvider {
    bytes: [u8; 4],
}

impl StubProvider {
    /// Builds the stub's four-byte hot section: one `RETF` per well-known
    /// entry point, at offsets 0-3 matching `entry_offsets` below.
    #[must_use]
    pub fn new() -> Self {
        Self { bytes: [RETF; 4] }
    }
}

impl Default for StubProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl isanic_image::ModuleProvider for StubProvider {
    fn header(&self, id: u16) -> Option<ModuleHeader<'_>> {
        if id != STUB_MODULE_ID {
            return None;
        }
        Some(ModuleHeader {
            magic: MODULE_MAGIC,
            abi_version: SUPPORTED_ABI_VERSION,
            class: ModuleClass::Core,
            flags: ModuleFlags::empty(),
            identifier: STUB_MODULE_ID,
            min_cpu: 0,
            hot_start: 0,
            hot_end: self.bytes.len() as u16,
            entry_offsets: EntryOffsets { init: 0, api: 1, isr: 2, cleanup: 3 },
            relocations: &[],
            bss_size: 0,
        })
    }

    fn source(&self, id: u16) -> Option<&[u8]> {
        (id == STUB_MODULE_ID).then_some(self.bytes.as_slice())
    }
}

/// [`ImageAllocator`] over the host system allocator, matching
/// `isanic-image`'s own test harness.
pub struct HostAllocator;

impl ImageAllocator for HostAllocator {
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

#[cfg(test)]
mod tests {
    use super::*;
    use isanic_image::{build_image, WellKnownModules};

    #[test]
    fn stub_module_builds_a_minimal_image() {
        let provider = StubProvider::new();
        let mut allocator = HostAllocator;
        let well_known = WellKnownModules {
            packet_api: STUB_MODULE_ID,
            idle: STUB_MODULE_ID,
            interrupt: STUB_MODULE_ID,
            uninstall: STUB_MODULE_ID,
        };
        let image = build_image(&[STUB_MODULE_ID], &provider, &mut allocator, 96, 10, well_known).unwrap();
        assert_eq!(image.layout.total_size as usize, isanic_image::IMAGE_HEADER_SIZE + 4);
        // SAFETY: image was just built and not yet released.
        unsafe { image.release(&mut allocator) };
    }
}
