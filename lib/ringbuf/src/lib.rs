// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ring buffer for tracing the boot trust core
//!
//! Each context object in the boot path (the block device registry, the
//! partition table manager, the A/B state store, the image authenticator and
//! the orchestrator) owns a small ring buffer of `Copy` trace events. There is
//! no global buffer: the ring lives inside the context that produces the
//! events and is inspected through that context, from a debugger or from
//! tests.
//!
//! ## Constraints
//!
//! The type in the ring buffer must implement both `Copy` and `PartialEq`.
//!
//! ## Creating a ring buffer
//!
//! A ring buffer is a plain field, built with [`Ringbuf::new`] from an
//! initializer that fills the unused slots:
//!
//! ```
//! # use ringbuf::Ringbuf;
//! #[derive(Copy, Clone, PartialEq)]
//! enum Trace { None, Read(u64) }
//!
//! struct Dev { trace: Ringbuf<Trace, 16> }
//!
//! let dev = Dev { trace: Ringbuf::new(Trace::None) };
//! ```
//!
//! Entries are added with [`ringbuf_entry!`], which records the source line
//! of the call site along with the payload:
//!
//! ```
//! # use ringbuf::{Ringbuf, ringbuf_entry};
//! # #[derive(Copy, Clone, PartialEq)]
//! # enum Trace { None, Read(u64) }
//! # let mut trace: Ringbuf<Trace, 16> = Ringbuf::new(Trace::None);
//! ringbuf_entry!(trace, Trace::Read(34));
//! ```
//!
//! When the same line records the same payload twice in a row, the existing
//! entry's `count` is bumped instead of consuming a new slot.

#![cfg_attr(not(test), no_std)]

/// Inserts data into a ring buffer.
///
/// `ringbuf_entry!(buf, expr)` inserts `expr` into `buf`, which must be a
/// place expression of type [`Ringbuf`] that can be mutably borrowed (for
/// example `self.trace`).
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        // Evaluate the payload first so that it may read from the same
        // context that owns the buffer.
        let p = $payload;
        $crate::Ringbuf::entry(&mut $buf, line!() as u16, p);
    }};
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        let _ = &$buf;
        let _ = &$payload;
    }};
}

///
/// The structure of a single [`Ringbuf`] entry, carrying a payload of arbitrary
/// type.  When a ring buffer entry is generated with an identical payload to
/// the most recent entry (in terms of both `line` and `payload`), `count` will
/// be incremented rather than generating a new entry.
///
#[derive(Debug, Copy, Clone)]
pub struct RingbufEntry<T: Copy + PartialEq> {
    pub line: u16,
    pub generation: u16,
    pub count: u32,
    pub payload: T,
}

///
/// A ring buffer of parametrized type and size.
///
#[derive(Debug)]
pub struct Ringbuf<T: Copy + PartialEq, const N: usize> {
    pub last: Option<usize>,
    pub buffer: [RingbufEntry<T>; N],
}

impl<T: Copy + PartialEq, const N: usize> Ringbuf<T, { N }> {
    pub const fn new(init: T) -> Self {
        Self {
            last: None,
            buffer: [RingbufEntry {
                line: 0,
                generation: 0,
                count: 0,
                payload: init,
            }; N],
        }
    }

    pub fn entry(&mut self, line: u16, payload: T) {
        // On first use, last is None; treat it as an out-of-range index so
        // that nothing is reused and the first entry lands in slot 0.
        let last = self.last.unwrap_or(usize::MAX);

        if let Some(ent) = self.buffer.get_mut(last) {
            if ent.line == line && ent.payload == payload {
                // Only reuse this entry if we don't overflow the count.
                if let Some(new_count) = ent.count.checked_add(1) {
                    ent.count = new_count;
                    return;
                }
            }
        }

        let ndx = {
            let last_plus_1 = last.wrapping_add(1);
            // Not a remainder: most targets lack a hardware divide, and this
            // also turns usize::MAX into 0 for the starting condition.
            if last_plus_1 >= self.buffer.len() {
                0
            } else {
                last_plus_1
            }
        };

        let Some(ent) = self.buffer.get_mut(ndx) else {
            return;
        };
        *ent = RingbufEntry {
            line,
            payload,
            count: 1,
            generation: ent.generation.wrapping_add(1),
        };

        self.last = Some(ndx);
    }

    /// Iterates over recorded entries from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &RingbufEntry<T>> + '_ {
        let start = match self.last {
            Some(last) => last + 1,
            None => N,
        };
        self.buffer[start.min(N)..]
            .iter()
            .chain(self.buffer[..start.min(N)].iter())
            .filter(|e| e.count != 0)
    }

    /// Returns the payload of the most recent entry, if any.
    pub fn last_payload(&self) -> Option<T> {
        self.last
            .and_then(|i| self.buffer.get(i))
            .map(|e| e.payload)
    }

    /// Returns `true` if any retained entry carries `payload`.
    pub fn contains(&self, payload: &T) -> bool {
        self.iter().any(|e| e.payload == *payload)
    }
}
