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

//! The `sbrk` heap primitive, built on [`super::addrspace`].

use crate::errno::{VmError, VmResult};
use crate::memory::frame_table::FrameTable;
use crate::memory::page_table::flags;
use crate::memory::{VirtAddr, PAGE_SIZE};
use crate::platform::FrameAllocator;
use crate::process::addrspace::{AddressSpace, USERSPACETOP};

/// Largest magnitude `sbrk` will move the break in one call.
const MAX_DELTA: i64 = 1 << 29;

/// Grows or shrinks the calling process's heap by `amount` bytes (negative
/// to shrink), returning the break address from *before* the change.
pub fn sys_sbrk(
    as_: &mut AddressSpace,
    amount: i32,
    frames: &FrameTable,
    alloc: &dyn FrameAllocator,
) -> VmResult<VirtAddr> {
    // Widen to i64 before rounding: a rounded i32::MAX would overflow its
    // type, where the original's plain `int` arithmetic silently wrapped.
    let amount = round_to_multiple_of_4(amount as i64);

    let heap_end = as_.heap_end.0 as i64;
    let heap_start = as_.heap_start.0 as i64;
    let new = heap_end + amount;

    if new < heap_start || new > USERSPACETOP as i64 {
        return Err(VmError::Inval);
    }
    if amount.unsigned_abs() > MAX_DELTA as u64 {
        return Err(VmError::NoMem);
    }

    let old = as_.heap_end;
    let new = VirtAddr::new(new as u32);

    if amount > 0 {
        let old_last_page = (old.0.wrapping_sub(1)) & !(PAGE_SIZE as u32 - 1);
        let new_last_page = (new.0.wrapping_sub(1)) & !(PAGE_SIZE as u32 - 1);
        if old_last_page != new_last_page {
            let new_base = VirtAddr::new(old_last_page + PAGE_SIZE as u32);
            as_.define_region_noheap(new_base, new.0.wrapping_sub(new_base.0), flags::RWX)?;
        }
    } else if amount < 0 {
        let base = VirtAddr::new(((new.0.wrapping_sub(1)) & !(PAGE_SIZE as u32 - 1)) + PAGE_SIZE as u32);
        as_.remove_region(base, old.0.wrapping_sub(base.0), frames, alloc);
    }

    as_.heap_end = new;
    Ok(old)
}

fn round_to_multiple_of_4(amount: i64) -> i64 {
    let rem = amount % 4;
    if rem != 0 {
        amount + (4 - rem)
    } else {
        amount
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::tests::MockFrameAllocator;

    fn fresh_heap(start: u32) -> Box<AddressSpace> {
        let mut as1 = AddressSpace::create();
        as1.heap_start = VirtAddr::new(start);
        as1.heap_end = VirtAddr::new(start);
        as1
    }

    #[test]
    fn grow_then_shrink_round_trip() {
        let frames = FrameTable::new(16);
        let alloc = MockFrameAllocator::new(16);
        let mut as1 = fresh_heap(0x0050_0000);

        let old = sys_sbrk(&mut as1, 0x3000, &frames, &alloc).unwrap();
        assert_eq!(old, VirtAddr::new(0x0050_0000));
        assert_eq!(as1.heap_end, VirtAddr::new(0x0050_3000));
        assert_eq!(as1.regions.len(), 3);

        let old = sys_sbrk(&mut as1, -0x2000, &frames, &alloc).unwrap();
        assert_eq!(old, VirtAddr::new(0x0050_3000));
        assert_eq!(as1.heap_end, VirtAddr::new(0x0050_1000));
        assert_eq!(as1.regions.len(), 1);
    }

    #[test]
    fn shrink_below_heap_start_is_invalid() {
        let frames = FrameTable::new(16);
        let alloc = MockFrameAllocator::new(16);
        let mut as1 = fresh_heap(0x0050_0000);
        sys_sbrk(&mut as1, 0x3000, &frames, &alloc).unwrap();

        let result = sys_sbrk(&mut as1, -0x1000_0000, &frames, &alloc);
        assert_eq!(result, Err(VmError::Inval));
    }

    #[test]
    fn oversized_request_is_out_of_memory() {
        let frames = FrameTable::new(16);
        let alloc = MockFrameAllocator::new(16);
        let mut as1 = fresh_heap(0x0050_0000);
        // Just over the 2^29 cap, but still well within the valid address
        // range, so this exercises the NOMEM check rather than INVAL.
        let result = sys_sbrk(&mut as1, (1 << 29) + 4, &frames, &alloc);
        assert_eq!(result, Err(VmError::NoMem));
    }

    #[test]
    fn zero_amount_is_a_no_op_query() {
        let frames = FrameTable::new(16);
        let alloc = MockFrameAllocator::new(16);
        let mut as1 = fresh_heap(0x0050_0000);
        let old = sys_sbrk(&mut as1, 0, &frames, &alloc).unwrap();
        assert_eq!(old, VirtAddr::new(0x0050_0000));
        assert_eq!(as1.heap_end, VirtAddr::new(0x0050_0000));
        assert!(as1.regions.is_empty());
    }
}
