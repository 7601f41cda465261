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

//! A software-refilled-TLB virtual memory core for a small teaching kernel:
//! a two-level forward-mapped page table, a reference-counted frame table,
//! region-tracked address spaces, the copy-on-write fault handler that ties
//! them together, and an `sbrk` heap primitive built on top.
//!
//! This crate owns no hardware. It is linked into a kernel that implements
//! [`platform::FrameAllocator`], [`platform::Tlb`] and
//! [`platform::InterruptControl`] and calls into [`process::fault::vm_fault`]
//! from its trap handler and [`process::sbrk::sys_sbrk`] from its syscall
//! dispatcher.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod errno;
pub mod log;
pub mod memory;
pub mod platform;
pub mod process;
pub mod sync;
