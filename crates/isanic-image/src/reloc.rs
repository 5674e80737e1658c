//! Relocation-site patch computation, split out from the builder's
//! buffer-writing loop so the arithmetic can be tested without an
//! allocator in the way.

use crate::header::RelocationEntry;

/// Computes the two little-endian bytes to write at a relocation site.
///
/// `site_abs` is the site's absolute offset within the built image;
/// `target_dst_offset` is where the relocation's target module landed.
/// For a plain fixup this is just `target_dst_offset`; for a call-site
/// thunk it is the signed displacement from the instruction following the
/// patched field (`site_abs + 2`) to the target, matching an x86 near
/// `CALL rel16`.
#[must_use]
pub fn patched_value(reloc: &RelocationEntry, site_abs: usize, target_dst_offset: u16) -> [u8; 2] {
    if reloc.is_call_displacement {
        let displacement = i32::from(target_dst_offset) - (site_abs as i32 + 2);
        (displacement as i16).to_le_bytes()
    } else {
        target_dst_offset.to_le_bytes()
    }
}
