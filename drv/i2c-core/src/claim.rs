// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Exclusive claim over the mutable state of one controller.
//!
//! A controller is shared by reference among every client that talks to its
//! bus, but a transfer is a long, stateful conversation with the hardware
//! and must run whole.  `ClaimCell` provides the required exclusion: an
//! atomic flag guarding the contents, claimed for the duration of one
//! operation and released when the guard drops.  Contention does not fail
//! the claim -- the loser waits its turn, yielding through the caller's
//! `relax` hook between attempts.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

pub struct ClaimCell<T> {
    held: AtomicBool,
    cell: UnsafeCell<T>,
}

// Safety: access to the contents is serialized by `held`, so sharing the
// cell across threads hands out `&mut T` to one claimant at a time.
unsafe impl<T> Sync for ClaimCell<T> where T: Send {}

impl<T> ClaimCell<T> {
    pub const fn new(contents: T) -> Self {
        Self {
            held: AtomicBool::new(false),
            cell: UnsafeCell::new(contents),
        }
    }

    /// Claims the contents, blocking until any current holder releases.
    /// `relax` is called between acquisition attempts.
    pub fn claim(&self, relax: fn()) -> ClaimGuard<'_, T> {
        while self.held.swap(true, Ordering::Acquire) {
            relax();
        }
        ClaimGuard { cell: self }
    }
}

pub struct ClaimGuard<'a, T> {
    cell: &'a ClaimCell<T>,
}

impl<T> Deref for ClaimGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the swap in `claim` made us the sole holder.
        unsafe { &*self.cell.cell.get() }
    }
}

impl<T> DerefMut for ClaimGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: as in `deref`.
        unsafe { &mut *self.cell.cell.get() }
    }
}

impl<T> Drop for ClaimGuard<'_, T> {
    fn drop(&mut self) {
        self.cell.held.store(false, Ordering::Release);
    }
}
