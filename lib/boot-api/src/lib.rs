// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Types shared by every layer of the boot trust core.
//!
//! This crate holds the error taxonomy that all of the boot crates report
//! through, the 16-byte [`Uuid`] that names block devices and partitions, the
//! two CRC32 flavors used by the on-disk formats, and the [`Watchdog`] hook
//! that long-running loops service.

#![cfg_attr(not(test), no_std)]

pub mod crc;
mod uuid;

pub use num_traits::FromPrimitive;
pub use uuid::Uuid;

/// Errors reported by the boot trust core.
///
/// Values are stable so that they can cross a command-protocol boundary as a
/// bare `u32`; zero is deliberately not a valid error.
#[derive(Copy, Clone, Debug, num_derive::FromPrimitive, Eq, PartialEq)]
#[repr(u32)]
pub enum BootError {
    /// A parameter or handle was out of range.
    Param = 1,
    /// A fixed-capacity pool or buffer is exhausted or too small.
    Mem = 2,
    /// The underlying device reported a failure.
    Io = 3,
    /// No implementation is registered for the requested operation.
    NotSupported = 4,
    NotFound = 5,
    /// Both copies of a redundant structure failed validation.
    Corrupt = 6,
    BadHeader = 7,
    BadMeta = 8,
    BadPayload = 9,
    BadKeystore = 10,
    KeyNotFound = 11,
    KeyRevoked = 12,
    UnknownHash = 13,
    AuthenticationFailed = 14,
    PartNotBootable = 15,
    NoActiveBootPartition = 16,
    /// The platform jump hook returned control.
    Jumped = 17,
}

impl From<BootError> for u32 {
    fn from(e: BootError) -> Self {
        e as u32
    }
}

/// Cooperative liveness hook, serviced at a bounded cadence from inside
/// partition table writes and payload hashing.
pub trait Watchdog {
    fn kick(&mut self);
}

/// A [`Watchdog`] for platforms without one.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoWatchdog;

impl Watchdog for NoWatchdog {
    fn kick(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_survive_u32() {
        for code in 1..=17u32 {
            let e = BootError::from_u32(code).unwrap();
            assert_eq!(u32::from(e), code);
        }
        assert_eq!(BootError::from_u32(0), None);
        assert_eq!(BootError::from_u32(18), None);
    }
}
