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

//! TLB-refill fault handler: the path every user-mode memory access that
//! misses the TLB runs through.

use crate::errno::{VmError, VmResult};
use crate::memory::frame_table::FrameTable;
use crate::memory::page_table::{ensure_paddr, flags, TlbWord};
use crate::memory::VirtAddr;
use crate::platform::{FrameAllocator, Tlb};
use crate::process::addrspace::AddressSpace;

/// Why the TLB missed or trapped.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FaultType {
    Read,
    Write,
    /// A write landed on a TLB entry that was loaded without DIRTY set.
    ReadOnly,
}

/// Resolves one TLB miss or write-to-read-only trap.
///
/// `current` is `None` for a fault with no running process or no address
/// space set up yet (e.g. very early boot), which always fails.
pub fn vm_fault(
    current: Option<&mut AddressSpace>,
    faulttype: FaultType,
    faultaddress: VirtAddr,
    frames: &FrameTable,
    alloc: &dyn FrameAllocator,
    tlb: &mut dyn Tlb,
) -> VmResult<()> {
    let as_ = current.ok_or(VmError::Fault)?;
    let page = as_.page_table.get_mut(faultaddress);

    match faulttype {
        FaultType::ReadOnly => {
            if !page.as_ref().is_some_and(|p| p.is_copy_on_write()) {
                return Err(VmError::Fault);
            }
        }
        FaultType::Read | FaultType::Write => {}
    }

    let page = page.filter(|p| p.is_defined()).ok_or(VmError::Fault)?;

    if page.is_copy_on_write() && matches!(faulttype, FaultType::Write | FaultType::ReadOnly) {
        let old_frame = page
            .frame()
            .expect("a copy-on-write page always has a backing frame");

        if frames.ref_count(old_frame.frame_number()) == 1 {
            page.set_copy_on_write(false);
            if page.flags().is_some_and(|f| f & flags::WRITE != 0) {
                let mut word = page.tlb_word();
                word.set_dirty();
                page.set_tlb_word(word);
            }
        } else {
            page.set_tlb_word(TlbWord::none());
            let new_frame = ensure_paddr(page, frames, alloc);
            alloc.copy_page(old_frame, new_frame);
            frames.decrement(old_frame.frame_number(), alloc);
            page.set_copy_on_write(false);
        }

        if let Some(index) = tlb.probe(faultaddress.page_base().0) {
            tlb.invalidate(index);
        }
    } else {
        ensure_paddr(page, frames, alloc);
    }

    tlb.write_random(faultaddress.page_base().0, page.tlb_word().raw());
    Ok(())
}
