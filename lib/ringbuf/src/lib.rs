// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Static trace ring buffers for instrumenting drivers.
//!
//! A ring buffer records a fixed window of recent events of a `Copy +
//! PartialEq` payload type, tagged with the source line that deposited them.
//! The buffers are static, so they can be inspected from a debugger (or, on
//! the host, from a test) without any cooperation from the code under
//! observation, and recording an entry never allocates or blocks.
//!
//! Declare a buffer with [`ringbuf!`], providing the payload type, the entry
//! count, and an initializer for unused slots:
//!
//! ```ignore
//! ringbuf!(Trace, 32, Trace::None);
//! ```
//!
//! and deposit entries with [`ringbuf_entry!`]:
//!
//! ```ignore
//! ringbuf_entry!(Trace::Start(addr));
//! ```
//!
//! If the same line deposits the same payload repeatedly, the existing entry's
//! count is bumped rather than burning another slot, so a polling loop that
//! observes the same status a thousand times costs one slot.
//!
//! Both macros take an optional leading name when a module needs more than
//! one buffer; without it, the buffer is named `__RINGBUF`.

#![cfg_attr(target_os = "none", no_std)]

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

/// Declares a static ring buffer in the current module.
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        #[used]
        static $name: $crate::RingbufCell<$t, $n> =
            $crate::RingbufCell::new($crate::Ringbuf {
                next: 0,
                buffer: [$crate::RingbufEntry {
                    line: 0,
                    count: 0,
                    payload: $init,
                }; $n],
            });
    };
    ($t:ty, $n:expr, $init:expr) => {
        $crate::ringbuf!(__RINGBUF, $t, $n, $init);
    };
}

/// Deposits an entry into a ring buffer declared with [`ringbuf!`].
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        // Evaluate the payload before touching the buffer so the expression
        // can't observe the buffer claimed.
        let (p, buf) = ($payload, &$buf);
        $crate::RingbufCell::record(buf, line!() as u16, p);
    }};
    ($payload:expr) => {
        $crate::ringbuf_entry!(__RINGBUF, $payload);
    };
}

/// One slot of a [`Ringbuf`]. `count` is the number of consecutive deposits
/// of this exact (line, payload) pair that were folded into the slot.
#[derive(Debug, Copy, Clone)]
pub struct RingbufEntry<T: Copy + PartialEq> {
    pub line: u16,
    pub count: u32,
    pub payload: T,
}

/// Storage for a ring buffer. Instantiate through [`ringbuf!`] rather than
/// directly; the fields are public only so the macro can build the static.
#[derive(Debug)]
pub struct Ringbuf<T: Copy + PartialEq, const N: usize> {
    /// Index of the slot the next deposit will use.
    pub next: usize,
    pub buffer: [RingbufEntry<T>; N],
}

impl<T: Copy + PartialEq, const N: usize> Ringbuf<T, N> {
    pub fn entry(&mut self, line: u16, payload: T) {
        // Fold into the most recent slot if it matches. `next` is the slot we
        // would write, so the most recent deposit is the one before it.
        let last = self.next.checked_sub(1).unwrap_or(N - 1);
        let prev = &mut self.buffer[last];
        if prev.count > 0 && prev.line == line && prev.payload == payload {
            prev.count = prev.count.saturating_add(1);
            return;
        }

        self.buffer[self.next] = RingbufEntry {
            line,
            count: 1,
            payload,
        };
        self.next = if self.next + 1 == N { 0 } else { self.next + 1 };
    }

    /// Returns the recorded entries, oldest first. Host-side helper for
    /// tests and post-mortem inspection; on a target you would read the
    /// static out of memory instead.
    pub fn iter(&self) -> impl Iterator<Item = &RingbufEntry<T>> {
        let (wrapped, fresh) = self.buffer.split_at(self.next);
        fresh.iter().chain(wrapped.iter()).filter(|e| e.count > 0)
    }
}

/// A claim-guarded cell holding a [`Ringbuf`], so a static buffer can be
/// written without `static mut`.
///
/// Unlike a `RefCell`, contention does not panic: if the buffer is already
/// claimed (e.g. a trace point interrupted another trace point), the entry is
/// dropped. Losing a trace entry is preferable to blocking or faulting in
/// interrupt context.
pub struct RingbufCell<T: Copy + PartialEq, const N: usize> {
    claimed: AtomicBool,
    cell: UnsafeCell<Ringbuf<T, N>>,
}

unsafe impl<T: Copy + PartialEq + Send, const N: usize> Sync
    for RingbufCell<T, N>
{
}

impl<T: Copy + PartialEq, const N: usize> RingbufCell<T, N> {
    pub const fn new(contents: Ringbuf<T, N>) -> Self {
        Self {
            claimed: AtomicBool::new(false),
            cell: UnsafeCell::new(contents),
        }
    }

    pub fn record(&self, line: u16, payload: T) {
        if self.claimed.swap(true, Ordering::Acquire) {
            // Already claimed; drop the entry.
            return;
        }
        // Safety: the swap above made us the sole claimant, so no other
        // reference to the contents can exist until we release.
        unsafe {
            (*self.cell.get()).entry(line, payload);
        }
        self.claimed.store(false, Ordering::Release);
    }

    /// Runs `f` against the buffer contents. Returns `None` if the buffer is
    /// claimed by a concurrent writer.
    pub fn read<R>(&self, f: impl FnOnce(&Ringbuf<T, N>) -> R) -> Option<R> {
        if self.claimed.swap(true, Ordering::Acquire) {
            return None;
        }
        // Safety: as in `record`.
        let r = f(unsafe { &*self.cell.get() });
        self.claimed.store(false, Ordering::Release);
        Some(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty<const N: usize>() -> Ringbuf<u32, N> {
        Ringbuf {
            next: 0,
            buffer: [RingbufEntry {
                line: 0,
                count: 0,
                payload: 0,
            }; N],
        }
    }

    #[test]
    fn records_in_order() {
        let mut rb = empty::<4>();

        rb.entry(1, 10);
        rb.entry(2, 20);
        rb.entry(3, 30);

        let seen: Vec<_> = rb.iter().map(|e| e.payload).collect();
        assert_eq!(seen, [10, 20, 30]);
    }

    #[test]
    fn folds_repeats() {
        let mut rb = empty::<4>();

        for _ in 0..1000 {
            rb.entry(7, 99);
        }

        let entries: Vec<_> = rb.iter().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].count, 1000);
    }

    #[test]
    fn wraps() {
        let mut rb = empty::<3>();

        for i in 0..5u32 {
            rb.entry(i as u16, i);
        }

        let seen: Vec<_> = rb.iter().map(|e| e.payload).collect();
        assert_eq!(seen, [2, 3, 4]);
    }

    #[test]
    fn cell_roundtrip() {
        static CELL: RingbufCell<u8, 4> = RingbufCell::new(Ringbuf {
            next: 0,
            buffer: [RingbufEntry {
                line: 0,
                count: 0,
                payload: 0,
            }; 4],
        });

        CELL.record(1, 0xaa);
        let n = CELL.read(|rb| rb.iter().count()).unwrap();
        assert_eq!(n, 1);
    }
}
