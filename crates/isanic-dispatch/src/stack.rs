//! Private-stack switch for the single software-interrupt entry point
//! (§4.H): the dispatcher's only job besides routing.

/// A reserved stack region inside the resident image (the 512-byte reserve
/// [`isanic_image::STACK_RESERVE_BYTES`] appends past the image's
/// `total_size`), switched to on entry and switched back from before
/// return-from-interrupt.
pub struct PrivateStack {
    top: *mut u8,
    size: usize,
    saved_sp: Option<u32>,
}

impl PrivateStack {
    /// Wraps a stack region `[top, top + size)`. `top` is the high end: the
    /// stack grows downward from it, matching the x86 convention.
    #[must_use]
    pub const fn new(top: *mut u8, size: usize) -> Self {
        Self { top, size, saved_sp: None }
    }

    /// Switches onto this stack, remembering the caller's stack pointer.
    ///
    /// # Safety
    ///
    /// `top` must describe a region of at least `size` writable bytes that
    /// nothing else is using as a stack concurrently. Must be paired with
    /// exactly one [`PrivateStack::leave`] before any access to the
    /// caller's original stack resumes.
    pub unsafe fn enter(&mut self) {
        // SAFETY: forwarded from this function's own contract.
        self.saved_sp = Some(unsafe { switch_to(self.top, self.size) });
    }

    /// Switches back to the stack pointer saved by the matching
    /// [`PrivateStack::enter`].
    ///
    /// # Safety
    ///
    /// Must be called exactly once after a matching `enter`, with no other
    /// stack switch having intervened.
    pub unsafe fn leave(&mut self) {
        if let Some(sp) = self.saved_sp.take() {
            // SAFETY: forwarded from this function's own contract.
            unsafe { switch_back(sp) };
        }
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
#[inline]
unsafe fn switch_to(top: *mut u8, _size: usize) -> u32 {
    let saved_sp: u32;
    // SAFETY: forwarded from `PrivateStack::enter`'s contract: `top` bounds
    // a live, exclusively-owned stack region.
    unsafe {
        core::arch::asm!(
            "mov {saved:e}, esp",
            "mov esp, {top:e}",
            top = in(reg) top,
            saved = out(reg) saved_sp,
            options(nomem, nostack),
        );
    }
    saved_sp
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
#[inline]
unsafe fn switch_back(saved_sp: u32) {
    // SAFETY: forwarded from `PrivateStack::leave`'s contract: `saved_sp`
    // was produced by a matching `switch_to` with no intervening switch.
    unsafe {
        core::arch::asm!(
            "mov esp, {saved:e}",
            saved = in(reg) saved_sp,
            options(nomem, nostack),
        );
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
#[inline]
unsafe fn switch_to(_top: *mut u8, _size: usize) -> u32 {
    0
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
#[inline]
unsafe fn switch_back(_saved_sp: u32) {}
