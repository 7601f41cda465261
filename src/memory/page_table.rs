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

//! Two-level forward-mapped page table: a root table of 1024 entries, each
//! lazily pointing at a secondary table of 1024 page entries.

use crate::memory::{PhysAddr, VirtAddr, NUM_ROOT_ENTRIES, NUM_SECONDARY_ENTRIES, PAGE_SIZE};
use crate::memory::frame_table::FrameTable;
use crate::platform::FrameAllocator;
use alloc::boxed::Box;
use alloc::vec::Vec;

/// Per-page permission bits, matching the original `PF_R`/`PF_W`/`PF_X`.
pub mod flags {
    pub const READ: u8 = 0b001;
    pub const WRITE: u8 = 0b010;
    pub const EXEC: u8 = 0b100;
    pub const RWX: u8 = READ | WRITE | EXEC;
}

/// A packed TLB-low-register-shaped word: page-aligned frame address plus
/// VALID and DIRTY bits. Kept packed, rather than decomposed into separate
/// fields, so the fault path can refill the TLB with a single store.
///
/// DIRTY means "writable" on this architecture, not "recently modified".
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TlbWord(u32);

impl TlbWord {
    /// Entry is present and usable.
    pub const VALID: u32 = 1 << 0;
    /// Entry is writable.
    pub const DIRTY: u32 = 1 << 1;

    /// No real packed word can equal this: it would require a frame address
    /// of `u32::MAX & !0xfff`, far past any real physical memory.
    const NONE: u32 = u32::MAX;

    /// A word meaning "no physical frame is mapped here yet".
    pub const fn none() -> Self {
        Self(Self::NONE)
    }

    pub const fn is_none(&self) -> bool {
        self.0 == Self::NONE
    }

    /// Builds a word mapping `frame`, writable iff `writable`.
    pub fn with_frame(frame: PhysAddr, writable: bool) -> Self {
        let mut word = frame.page_base().0 | Self::VALID;
        if writable {
            word |= Self::DIRTY;
        }
        Self(word)
    }

    /// Returns the mapped frame, if any.
    pub fn frame(&self) -> Option<PhysAddr> {
        if self.is_none() {
            None
        } else {
            Some(PhysAddr::new(self.0 & !(PAGE_SIZE as u32 - 1)))
        }
    }

    pub fn is_dirty(&self) -> bool {
        !self.is_none() && self.0 & Self::DIRTY != 0
    }

    pub fn set_dirty(&mut self) {
        debug_assert!(!self.is_none());
        self.0 |= Self::DIRTY;
    }

    /// Clears the DIRTY bit, leaving VALID and the frame address untouched.
    ///
    /// The original source cleared DIRTY with `paddr & (!TLBLO_DIRTY)`: a
    /// logical NOT of a nonzero constant is `0`, so that line zeroed the
    /// entire word instead of clearing one bit. This uses the bitwise
    /// complement instead.
    pub fn clear_dirty(&mut self) {
        debug_assert!(!self.is_none());
        self.0 &= !Self::DIRTY;
    }

    /// The raw word, ready to hand to [`crate::platform::Tlb::write`] as the
    /// low half of an entry.
    pub fn raw(&self) -> u32 {
        self.0
    }
}

/// A single page's state: which permissions it was defined with (`None`
/// means the slot is logically empty, replacing the original's `flags ==
/// -1` sentinel), which frame backs it, and whether that frame is shared
/// copy-on-write.
#[derive(Clone)]
pub struct PageEntry {
    vaddr_page: u32,
    flags: Option<u8>,
    paddr_tlb: TlbWord,
    copy_on_write: bool,
}

impl PageEntry {
    fn empty(vaddr_page: u32) -> Self {
        Self {
            vaddr_page,
            flags: None,
            paddr_tlb: TlbWord::none(),
            copy_on_write: false,
        }
    }

    /// The page number this entry belongs to (its slot is fixed at
    /// construction and never moves).
    pub fn vaddr_page(&self) -> u32 {
        self.vaddr_page
    }

    /// Whether this slot actually holds a defined page.
    pub fn is_defined(&self) -> bool {
        self.flags.is_some()
    }

    pub fn flags(&self) -> Option<u8> {
        self.flags
    }

    pub fn set_flags(&mut self, flags: u8) {
        self.flags = Some(flags);
    }

    pub fn frame(&self) -> Option<PhysAddr> {
        self.paddr_tlb.frame()
    }

    pub fn tlb_word(&self) -> TlbWord {
        self.paddr_tlb
    }

    pub fn set_tlb_word(&mut self, word: TlbWord) {
        self.paddr_tlb = word;
    }

    pub fn is_copy_on_write(&self) -> bool {
        self.copy_on_write
    }

    pub fn set_copy_on_write(&mut self, cow: bool) {
        self.copy_on_write = cow;
    }
}

/// One of the 1024 leaves a root entry can point at.
struct SecondaryTable {
    entries: Box<[PageEntry]>,
}

impl SecondaryTable {
    fn new(root_index: usize) -> Box<Self> {
        let base_page = (root_index as u32) << 10;
        let entries = (0..NUM_SECONDARY_ENTRIES)
            .map(|i| PageEntry::empty(base_page | i as u32))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Box::new(Self { entries })
    }
}

/// The two-level page table owned by one address space.
pub struct RootPageTable {
    entries: Vec<Option<Box<SecondaryTable>>>,
}

impl RootPageTable {
    pub fn new() -> Self {
        let mut entries = Vec::with_capacity(NUM_ROOT_ENTRIES);
        entries.resize_with(NUM_ROOT_ENTRIES, || None);
        Self { entries }
    }

    /// Looks up the page entry for `vaddr`, if its secondary table exists.
    pub fn get(&self, vaddr: VirtAddr) -> Option<&PageEntry> {
        let (root, secondary) = vaddr.split();
        self.entries[root].as_deref().map(|t| &t.entries[secondary])
    }

    /// Mutable counterpart of [`Self::get`].
    pub fn get_mut(&mut self, vaddr: VirtAddr) -> Option<&mut PageEntry> {
        let (root, secondary) = vaddr.split();
        self.entries[root]
            .as_deref_mut()
            .map(|t| &mut t.entries[secondary])
    }

    /// Defines the page at `vaddr` with `flags`, allocating the secondary
    /// table on demand if this is the first page in its 1024-page group.
    ///
    /// Allocating the secondary table is fatal on failure, matching
    /// `create_secondary_table`'s `panic()` in the original source — this is
    /// not one of the recoverable conditions `spec.md` lists.
    pub fn add(&mut self, vaddr: VirtAddr, flags: u8) -> &mut PageEntry {
        let (root, secondary) = vaddr.split();
        if self.entries[root].is_none() {
            self.entries[root] = Some(SecondaryTable::new(root));
        }
        let entry = &mut self.entries[root].as_deref_mut().unwrap().entries[secondary];
        entry.set_flags(flags);
        entry
    }
}

impl Default for RootPageTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Ensures `entry` has a backing frame, allocating and zeroing one on first
/// use (demand-zero paging). Returns the frame either way.
///
/// Frame-pool exhaustion is fatal, matching `ensure_paddr`'s `panic()` in the
/// original source: this crate has no recovery path for a kernel that
/// cannot back a page it already promised a process.
pub fn ensure_paddr(
    entry: &mut PageEntry,
    frames: &FrameTable,
    alloc: &dyn FrameAllocator,
) -> PhysAddr {
    if let Some(frame) = entry.frame() {
        return frame;
    }
    let frame = match alloc.alloc_zeroed() {
        Some(frame) => frame,
        None => {
            crate::kprintln!("vmcore: out of physical memory");
            panic!("ensure_paddr: could not allocate a physical frame");
        }
    };
    frames.set_one(frame.frame_number());
    let writable = entry.flags().is_some_and(|f| f & flags::WRITE != 0);
    entry.set_tlb_word(TlbWord::with_frame(frame, writable));
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_get_round_trips() {
        let mut table = RootPageTable::new();
        let addr = VirtAddr::new(0x0040_1000);
        table.add(addr, flags::RWX);
        let entry = table.get(addr).unwrap();
        assert!(entry.is_defined());
        assert_eq!(entry.flags(), Some(flags::RWX));
        assert!(entry.frame().is_none());
    }

    #[test]
    fn unallocated_secondary_table_yields_none() {
        let table = RootPageTable::new();
        assert!(table.get(VirtAddr::new(0x0080_0000)).is_none());
    }

    #[test]
    fn ensure_paddr_is_idempotent() {
        use crate::platform::tests::MockFrameAllocator;
        let frames = FrameTable::new(4);
        let alloc = MockFrameAllocator::new(4);
        let mut table = RootPageTable::new();
        let addr = VirtAddr::new(0x0040_1000);
        table.add(addr, flags::READ);
        let entry = table.get_mut(addr).unwrap();
        let first = ensure_paddr(entry, &frames, &alloc);
        let second = ensure_paddr(entry, &frames, &alloc);
        assert_eq!(first, second);
        assert_eq!(frames.ref_count(first.frame_number()), 1);
    }

    #[test]
    fn clear_dirty_preserves_valid_and_frame() {
        let mut word = TlbWord::with_frame(PhysAddr::from_frame_number(7), true);
        assert!(word.is_dirty());
        word.clear_dirty();
        assert!(!word.is_dirty());
        assert_eq!(word.frame(), Some(PhysAddr::from_frame_number(7)));
        assert_eq!(word.raw() & TlbWord::VALID, TlbWord::VALID);
    }
}
