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

//! A user process's address space: the root page table, its region list,
//! and the heap bounds the loader and `sbrk` maintain together.

use crate::errno::{VmError, VmResult};
use crate::memory::page_table::{flags, RootPageTable};
use crate::memory::frame_table::FrameTable;
use crate::memory::{VirtAddr, PAGE_SIZE};
use crate::platform::{FrameAllocator, Tlb};
use crate::process::region::RegionList;
use alloc::boxed::Box;

/// Top of the range of virtual addresses a user process may use. Not given
/// by the distilled specification's retrieval pack (only `addrspace.h` was
/// kept, not the platform's `vm.h`); chosen to match the conventional
/// OS/161-on-MIPS layout this subsystem is otherwise grounded on.
pub const USERSPACETOP: u32 = 0x8000_0000;
/// Top of the user stack; grows downward from here.
pub const USERSTACK: u32 = USERSPACETOP;
/// Default user stack size.
pub const USERSTACK_SIZE: u32 = 16 * 1024 * 1024;

fn page_align_down(addr: u32) -> u32 {
    addr & !(PAGE_SIZE as u32 - 1)
}

fn page_align_up(size: u32) -> u32 {
    (size.wrapping_add(PAGE_SIZE as u32 - 1)) & !(PAGE_SIZE as u32 - 1)
}

/// A user process's address space.
pub struct AddressSpace {
    pub page_table: RootPageTable,
    pub regions: RegionList,
    pub heap_start: VirtAddr,
    pub heap_end: VirtAddr,
}

impl AddressSpace {
    /// Creates an empty address space: no regions, a fresh root page table,
    /// heap bounds both zero.
    pub fn create() -> Box<Self> {
        Box::new(Self {
            page_table: RootPageTable::new(),
            regions: RegionList::new(),
            heap_start: VirtAddr::new(0),
            heap_end: VirtAddr::new(0),
        })
    }

    /// Clones this address space, sharing physical frames copy-on-write.
    ///
    /// Mutates `self` too: every shared page becomes copy-on-write and
    /// read-only on both sides, matching the original `as_copy`, which marks
    /// the source page entries alongside the destination's.
    pub fn copy(&mut self, frames: &FrameTable, tlb: &mut dyn Tlb) -> VmResult<Box<Self>> {
        let mut dst = Self::create();
        dst.heap_start = self.heap_start;
        dst.heap_end = self.heap_end;

        let vbases: alloc::vec::Vec<VirtAddr> = self.regions.iter().map(|r| r.vbase).collect();
        for vbase in vbases {
            let cur_flags = self
                .page_table
                .get(vbase)
                .and_then(|e| e.flags())
                .expect("region node without a defined page entry");
            dst.page_table.add(vbase, cur_flags);
            dst.regions.push(vbase, cur_flags)?;

            let shared_frame = self.page_table.get(vbase).and_then(|e| e.frame());
            if let Some(frame) = shared_frame {
                let src_entry = self.page_table.get_mut(vbase).unwrap();
                src_entry.set_copy_on_write(true);
                let mut word = src_entry.tlb_word();
                word.clear_dirty();
                src_entry.set_tlb_word(word);

                let dst_entry = dst.page_table.get_mut(vbase).unwrap();
                dst_entry.set_copy_on_write(true);
                dst_entry.set_tlb_word(word);

                frames.increment(frame.frame_number());

                if let Some(index) = tlb.probe(vbase.0) {
                    tlb.invalidate(index);
                }
            }
        }

        Ok(dst)
    }

    /// Tears down this address space: deactivates it, releases every frame
    /// it solely or jointly references, frees every secondary table.
    ///
    /// Unlike the original `as_destroy`, there is no separate "caller must
    /// free the struct" step: consuming `self: Box<Self>` means the struct
    /// itself, its region list, and its root table are freed when this
    /// function returns, by ordinary Rust ownership.
    pub fn destroy(self: Box<Self>, frames: &FrameTable, alloc: &dyn FrameAllocator, tlb: &mut dyn Tlb) {
        deactivate(Some(&self), tlb);
        for region in self.regions.iter() {
            if let Some(frame) = self.page_table.get(region.vbase).and_then(|e| e.frame()) {
                frames.decrement(frame.frame_number(), alloc);
            }
        }
    }

    fn define_region_impl(
        &mut self,
        vaddr: VirtAddr,
        size: u32,
        new_flags: u8,
        update_heap: bool,
    ) -> VmResult<()> {
        let base = VirtAddr::new(page_align_down(vaddr.0));
        let memsize = page_align_up(size.wrapping_add(vaddr.0 - base.0));

        if update_heap && new_flags & flags::WRITE != 0 {
            self.heap_start = base + memsize;
            self.heap_end = self.heap_start;
        }

        let mut offset = 0u32;
        while offset < memsize {
            let page_vaddr = base + offset;
            self.page_table.add(page_vaddr, new_flags);
            self.regions.push(page_vaddr, new_flags)?;
            offset += PAGE_SIZE as u32;
        }
        Ok(())
    }

    /// Defines a region of `size` bytes at `vaddr` with the given
    /// permissions. If `writable`, also (re)establishes the heap bounds
    /// immediately past this region — matching the loader's assumption that
    /// the writable data/bss segment is the only one that sets up the heap.
    pub fn define_region(&mut self, vaddr: VirtAddr, size: u32, region_flags: u8) -> VmResult<()> {
        self.define_region_impl(vaddr, size, region_flags, true)
    }

    /// Identical to [`Self::define_region`] but never touches the heap
    /// bounds — used for the stack, which must never look like the heap.
    pub fn define_region_noheap(
        &mut self,
        vaddr: VirtAddr,
        size: u32,
        region_flags: u8,
    ) -> VmResult<()> {
        self.define_region_impl(vaddr, size, region_flags, false)
    }

    /// Removes every region whose base lies in `[vaddr, vaddr + size)`,
    /// releasing frames as it goes. `size` may wrap (a negative `sbrk`
    /// delta cast to `u32`); when it does, nothing matches.
    pub fn remove_region(&mut self, vaddr: VirtAddr, size: u32, frames: &FrameTable, alloc: &dyn FrameAllocator) {
        let page_table = &self.page_table;
        self.regions.remove_range(vaddr, size, |vbase| {
            if let Some(frame) = page_table.get(vbase).and_then(|e| e.frame()) {
                frames.decrement(frame.frame_number(), alloc);
            }
        });
    }

    /// Temporarily widens every defined page to writable, so the loader can
    /// write into read-only segments (e.g. `.rodata`) while copying in ELF
    /// bytes.
    pub fn prepare_load(&mut self, tlb: &mut dyn Tlb) {
        let regions = &mut self.regions;
        let page_table = &mut self.page_table;
        for region in regions.iter_mut() {
            let entry = page_table
                .get_mut(region.vbase)
                .expect("region node without a defined page entry");
            let saved = entry.flags().expect("region node's page must be defined");
            region.old_flags = saved;
            entry.set_flags(saved | flags::WRITE);

            if let Some(_frame) = entry.frame() {
                let word = entry.tlb_word();
                if !word.is_dirty() {
                    if let Some(index) = tlb.probe(region.vbase.0) {
                        tlb.invalidate(index);
                    }
                    let mut word = word;
                    word.set_dirty();
                    entry.set_tlb_word(word);
                }
            }
        }
    }

    /// Inverse of [`Self::prepare_load`]: restores each page's original
    /// permissions, and clears the transient DIRTY bit that widened it.
    pub fn complete_load(&mut self, tlb: &mut dyn Tlb) {
        let regions = &mut self.regions;
        let page_table = &mut self.page_table;
        for region in regions.iter() {
            let entry = page_table
                .get_mut(region.vbase)
                .expect("region node without a defined page entry");
            entry.set_flags(region.old_flags);

            if entry.frame().is_some() && entry.flags().unwrap() & flags::WRITE == 0 {
                let word = entry.tlb_word();
                if word.is_dirty() {
                    if let Some(index) = tlb.probe(region.vbase.0) {
                        tlb.invalidate(index);
                    }
                    let mut word = word;
                    word.clear_dirty();
                    entry.set_tlb_word(word);
                }
            }
        }
    }

    /// Defines the user stack (read+write, no heap update). Returns the
    /// initial stack pointer.
    pub fn define_stack(&mut self) -> VmResult<VirtAddr> {
        self.define_region_noheap(
            VirtAddr::new(USERSTACK - USERSTACK_SIZE),
            USERSTACK_SIZE,
            flags::READ | flags::WRITE,
        )?;
        Ok(VirtAddr::new(USERSTACK - 1))
    }
}

/// Invalidates every TLB entry, unless `current` is `None` — matching a
/// kernel thread with no address space of its own, where there is nothing
/// of this process's to flush.
pub fn activate(current: Option<&AddressSpace>, tlb: &mut dyn Tlb) {
    if current.is_none() {
        return;
    }
    tlb.flush_all();
}

/// Identical to [`activate`] in the original source; kept as a distinct
/// name for call-site clarity.
pub fn deactivate(current: Option<&AddressSpace>, tlb: &mut dyn Tlb) {
    activate(current, tlb);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::frame_table::FrameTable;
    use crate::platform::tests::{MockFrameAllocator, MockTlb};

    #[test]
    fn create_is_empty() {
        let as1 = AddressSpace::create();
        assert_eq!(as1.heap_start, VirtAddr::new(0));
        assert_eq!(as1.heap_end, VirtAddr::new(0));
        assert!(as1.regions.is_empty());
    }

    #[test]
    fn define_region_sets_heap_and_pages() {
        let mut as1 = AddressSpace::create();
        as1.define_region(VirtAddr::new(0x0040_1000), 0x2000, flags::RWX)
            .unwrap();
        assert_eq!(as1.regions.len(), 2);
        assert_eq!(as1.heap_start, VirtAddr::new(0x0040_3000));
        assert_eq!(as1.heap_end, as1.heap_start);
        assert!(as1.page_table.get(VirtAddr::new(0x0040_1000)).unwrap().is_defined());
    }

    #[test]
    fn copy_shares_frame_and_marks_cow() {
        let frames = FrameTable::new(8);
        let alloc = MockFrameAllocator::new(8);
        let mut tlb = MockTlb::new();

        let mut src = AddressSpace::create();
        src.define_region_noheap(VirtAddr::new(0x0040_0000), PAGE_SIZE as u32, flags::RWX)
            .unwrap();
        {
            let entry = src.page_table.get_mut(VirtAddr::new(0x0040_0000)).unwrap();
            crate::memory::page_table::ensure_paddr(entry, &frames, &alloc);
        }
        let frame = src
            .page_table
            .get(VirtAddr::new(0x0040_0000))
            .unwrap()
            .frame()
            .unwrap();
        assert_eq!(frames.ref_count(frame.frame_number()), 1);

        let dst = src.copy(&frames, &mut tlb).unwrap();

        assert_eq!(frames.ref_count(frame.frame_number()), 2);
        assert!(src
            .page_table
            .get(VirtAddr::new(0x0040_0000))
            .unwrap()
            .is_copy_on_write());
        assert!(dst
            .page_table
            .get(VirtAddr::new(0x0040_0000))
            .unwrap()
            .is_copy_on_write());
        assert!(!src
            .page_table
            .get(VirtAddr::new(0x0040_0000))
            .unwrap()
            .tlb_word()
            .is_dirty());

        drop(dst);
    }

    #[test]
    fn prepare_then_complete_load_restores_flags_and_dirty() {
        let frames = FrameTable::new(8);
        let alloc = MockFrameAllocator::new(8);
        let mut tlb = MockTlb::new();

        let mut as1 = AddressSpace::create();
        as1.define_region_noheap(VirtAddr::new(0x0040_0000), PAGE_SIZE as u32, flags::READ)
            .unwrap();
        {
            let entry = as1.page_table.get_mut(VirtAddr::new(0x0040_0000)).unwrap();
            crate::memory::page_table::ensure_paddr(entry, &frames, &alloc);
        }
        assert!(!as1
            .page_table
            .get(VirtAddr::new(0x0040_0000))
            .unwrap()
            .tlb_word()
            .is_dirty());

        as1.prepare_load(&mut tlb);
        let entry = as1.page_table.get(VirtAddr::new(0x0040_0000)).unwrap();
        assert_eq!(entry.flags(), Some(flags::READ | flags::WRITE));
        assert!(entry.tlb_word().is_dirty());

        as1.complete_load(&mut tlb);
        let entry = as1.page_table.get(VirtAddr::new(0x0040_0000)).unwrap();
        assert_eq!(entry.flags(), Some(flags::READ));
        assert!(!entry.tlb_word().is_dirty());
        // the bug being fixed: clearing DIRTY must not have zeroed the frame.
        assert!(entry.frame().is_some());
    }

    #[test]
    fn define_stack_returns_top_minus_one() {
        let mut as1 = AddressSpace::create();
        let sp = as1.define_stack().unwrap();
        assert_eq!(sp, VirtAddr::new(USERSTACK - 1));
    }
}
