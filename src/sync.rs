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

//! Mutually exclusive access primitive based on a spinlock.
//!
//! A multiprocessor kernel needs this against concurrent access from another
//! core; a uniprocessor one still needs it against reentrancy from an
//! interrupt handler, which is why locking also disables interrupts for the
//! duration of the critical section — the same role `splhigh()`/`splx()`
//! play around the frame table and page tables in the original source.
//!
//! The interrupt controller itself is not something this crate owns (it is
//! one of the platform's downward requirements, see [`crate::platform`]), so
//! [`Spin`] is generic over it rather than calling architecture intrinsics
//! directly.

use crate::platform::InterruptControl;
use core::cell::UnsafeCell;
use core::fmt::{self, Formatter};
use core::hint;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering::Acquire, Ordering::Release};

#[inline(always)]
fn spin_acquire(lock: &AtomicBool) {
    while lock.swap(true, Acquire) {
        hint::spin_loop();
    }
}

/// Releases the associated [`Spin`] when dropped.
pub struct SpinGuard<'m, T: ?Sized, C: InterruptControl> {
    spin: &'m Spin<T, C>,
    /// Whether interrupts were enabled before this guard was acquired.
    was_enabled: bool,
}

impl<T: ?Sized, C: InterruptControl> Deref for SpinGuard<'_, T, C> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.spin.data.get() }
    }
}

impl<T: ?Sized, C: InterruptControl> DerefMut for SpinGuard<'_, T, C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.spin.data.get() }
    }
}

impl<T: ?Sized + fmt::Debug, C: InterruptControl> fmt::Debug for SpinGuard<'_, T, C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.deref(), f)
    }
}

impl<T: ?Sized, C: InterruptControl> Drop for SpinGuard<'_, T, C> {
    fn drop(&mut self) {
        self.spin.lock_flag.store(false, Release);
        if self.was_enabled {
            C::enable();
        }
    }
}

/// A spinlock that disables interrupts for the lifetime of its guard.
pub struct Spin<T: ?Sized, C: InterruptControl> {
    lock_flag: AtomicBool,
    data: UnsafeCell<T>,
    _control: PhantomData<C>,
}

impl<T, C: InterruptControl> Spin<T, C> {
    /// Creates a new, unlocked spinlock wrapping `data`.
    pub const fn new(data: T) -> Self {
        Self {
            lock_flag: AtomicBool::new(false),
            data: UnsafeCell::new(data),
            _control: PhantomData,
        }
    }
}

impl<T: ?Sized, C: InterruptControl> Spin<T, C> {
    /// Disables interrupts, then spins until the lock is acquired.
    pub fn lock(&self) -> SpinGuard<'_, T, C> {
        let was_enabled = C::is_enabled();
        C::disable();
        spin_acquire(&self.lock_flag);
        SpinGuard {
            spin: self,
            was_enabled,
        }
    }
}

unsafe impl<T: ?Sized + Send, C: InterruptControl> Sync for Spin<T, C> {}

/// The crate's lock type, parameterized by the platform's interrupt
/// controller. Every component that mutates shared VM state (the frame
/// table, a page table's secondary tables) takes its lock through this.
pub type IntSpin<T> = Spin<T, crate::platform::PlatformInterruptControl>;
