/*
 * Copyright 2026 vmcore contributors
 *
 * This file is part of vmcore.
 *
 * vmcore is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * vmcore is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * vmcore. If not, see <https://www.gnu.org/licenses/>.
 */

//! The downward-facing interface this crate needs from its host kernel:
//! physical frame allocation, TLB control and interrupt masking.
//!
//! This crate never talks to hardware itself — it is handed implementations
//! of these traits by whatever boots it, the same way `vm_bootstrap` in the
//! original source assumes `ram_stealmem`/`tlb_write`/`splhigh` already exist
//! elsewhere in the kernel.

use crate::memory::PhysAddr;

/// Hands out and reclaims zeroed physical frames.
///
/// A frame returned by `alloc_zeroed` is demand-zero from the caller's point
/// of view: every byte reads as zero until written.
pub trait FrameAllocator {
    /// Allocates one zeroed physical frame, or `None` if the pool is
    /// exhausted.
    fn alloc_zeroed(&self) -> Option<PhysAddr>;

    /// Returns a frame to the pool. The frame must not be referenced by any
    /// page table entry anymore.
    fn free(&self, frame: PhysAddr);

    /// Copies one page's worth of bytes from `src` to `dst`, used when
    /// breaking copy-on-write sharing. Both frames must already be allocated.
    fn copy_page(&self, src: PhysAddr, dst: PhysAddr);
}

/// The software-refilled TLB this subsystem refills on every fault.
pub trait Tlb {
    /// Writes an entry at a specific index.
    fn write(&mut self, index: usize, high: u32, low: u32);

    /// Writes an entry into a implementation-chosen slot (e.g. round robin),
    /// used for the common refill path.
    fn write_random(&mut self, high: u32, low: u32);

    /// Looks up the index of the entry whose high word matches `high`, if
    /// any is currently loaded.
    fn probe(&mut self, high: u32) -> Option<usize>;

    /// Invalidates every entry. Used on address space switch.
    fn flush_all(&mut self);

    /// Invalidates a single entry by index, e.g. one just returned by
    /// [`Self::probe`].
    fn invalidate(&mut self, index: usize);
}

/// Disables and restores interrupts around a critical section.
///
/// Implemented once per platform and shared by every [`crate::sync::Spin`]
/// in the crate.
pub trait InterruptControl {
    /// Tells whether interrupts are currently enabled.
    fn is_enabled() -> bool;
    /// Disables interrupts.
    fn disable();
    /// Enables interrupts.
    fn enable();
}

#[cfg(not(test))]
mod hosted {
    //! Interrupt control outside of tests is provided by the embedding
    //! kernel through these `extern "Rust"` hooks, since this crate has no
    //! architecture layer of its own to call `cli`/`sti` directly.
    extern "Rust" {
        fn vmcore_interrupts_enabled() -> bool;
        fn vmcore_disable_interrupts();
        fn vmcore_enable_interrupts();
    }

    pub struct PlatformInterruptControl;

    impl super::InterruptControl for PlatformInterruptControl {
        fn is_enabled() -> bool {
            unsafe { vmcore_interrupts_enabled() }
        }

        fn disable() {
            unsafe { vmcore_disable_interrupts() }
        }

        fn enable() {
            unsafe { vmcore_enable_interrupts() }
        }
    }
}

#[cfg(not(test))]
pub use hosted::PlatformInterruptControl;

#[cfg(test)]
pub use tests::PlatformInterruptControl;

/// Creates the frame table for a platform reporting `num_frames` physical
/// frames. Mirrors `vm_bootstrap`'s role of sizing `frame_table[]` from the
/// RAM size the bootloader reported.
pub fn bootstrap(num_frames: usize) -> crate::memory::frame_table::FrameTable {
    crate::memory::frame_table::FrameTable::new(num_frames)
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use alloc::vec;
    use alloc::vec::Vec;
    use core::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    static INTERRUPTS_ENABLED: AtomicBool = AtomicBool::new(true);

    /// Host-side stand-in for real `cli`/`sti`: just a flag, since unit
    /// tests run single-threaded and never actually take an interrupt.
    pub struct PlatformInterruptControl;

    impl InterruptControl for PlatformInterruptControl {
        fn is_enabled() -> bool {
            INTERRUPTS_ENABLED.load(Ordering::SeqCst)
        }

        fn disable() {
            INTERRUPTS_ENABLED.store(false, Ordering::SeqCst);
        }

        fn enable() {
            INTERRUPTS_ENABLED.store(true, Ordering::SeqCst);
        }
    }

    /// A bitmap-backed mock frame allocator: frame `i` is free iff
    /// `free[i]`. Also keeps each frame's actual bytes, purely so tests can
    /// observe that a copy-on-write break really copies page content.
    pub struct MockFrameAllocator {
        free: Mutex<Vec<bool>>,
        pages: Mutex<Vec<[u8; crate::memory::PAGE_SIZE]>>,
    }

    impl MockFrameAllocator {
        pub fn new(num_frames: usize) -> Self {
            Self {
                free: Mutex::new(vec![true; num_frames]),
                pages: Mutex::new(vec![[0u8; crate::memory::PAGE_SIZE]; num_frames]),
            }
        }

        pub fn is_freed(&self, frame: u32) -> bool {
            self.free.lock().unwrap()[frame as usize]
        }

        /// Writes a single byte into a frame, for tests to later observe
        /// whether a copy reached the right destination.
        pub fn poke(&self, frame: u32, offset: usize, value: u8) {
            self.pages.lock().unwrap()[frame as usize][offset] = value;
        }

        pub fn peek(&self, frame: u32, offset: usize) -> u8 {
            self.pages.lock().unwrap()[frame as usize][offset]
        }
    }

    impl FrameAllocator for MockFrameAllocator {
        fn alloc_zeroed(&self) -> Option<PhysAddr> {
            let mut free = self.free.lock().unwrap();
            let idx = free.iter().position(|&f| f)?;
            free[idx] = false;
            self.pages.lock().unwrap()[idx] = [0u8; crate::memory::PAGE_SIZE];
            Some(PhysAddr::from_frame_number(idx as u32))
        }

        fn free(&self, frame: PhysAddr) {
            let mut free = self.free.lock().unwrap();
            let idx = frame.frame_number() as usize;
            assert!(!free[idx], "double free of frame {idx}");
            free[idx] = true;
        }

        fn copy_page(&self, src: PhysAddr, dst: PhysAddr) {
            let mut pages = self.pages.lock().unwrap();
            let (src_idx, dst_idx) = (src.frame_number() as usize, dst.frame_number() as usize);
            let src_page = pages[src_idx];
            pages[dst_idx] = src_page;
        }
    }

    /// A fixed-size mock TLB, just large enough to exercise refill logic.
    pub struct MockTlb {
        entries: [(u32, u32); 8],
    }

    impl MockTlb {
        pub fn new() -> Self {
            Self {
                entries: [(INVALID, INVALID); 8],
            }
        }

        pub fn entry(&self, index: usize) -> (u32, u32) {
            self.entries[index]
        }
    }

    /// Sentinel high/low word meaning "no entry loaded here".
    pub const INVALID: u32 = u32::MAX;

    impl Tlb for MockTlb {
        fn write(&mut self, index: usize, high: u32, low: u32) {
            self.entries[index] = (high, low);
        }

        fn write_random(&mut self, high: u32, low: u32) {
            let idx = self
                .entries
                .iter()
                .position(|&(h, _)| h == INVALID)
                .unwrap_or(0);
            self.entries[idx] = (high, low);
        }

        fn probe(&mut self, high: u32) -> Option<usize> {
            self.entries.iter().position(|&(h, _)| h == high)
        }

        fn flush_all(&mut self) {
            self.entries = [(INVALID, INVALID); 8];
        }

        fn invalidate(&mut self, index: usize) {
            self.entries[index] = (INVALID, INVALID);
        }
    }
}
