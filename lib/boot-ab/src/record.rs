// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use bitflags::bitflags;
use boot_api::crc::{crc32_skipping, RAW};
use static_assertions::const_assert_eq;
use zerocopy::byteorder::little_endian as le;
use zerocopy::{FromZeros, IntoBytes};

pub const STATE_MAGIC: u32 = 0x026d_4a65;

/// Number of board scratch registers kept in the record.
pub const BOARD_REGS: usize = 4;

const CRC_OFFSET: usize = 508;

bitflags! {
    /// One bit per system, used by the `enable`, `verified` and `error`
    /// words. In `error` the bit names the system that was rolled back
    /// *from*.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct Systems: u32 {
        const A = 1 << 0;
        const B = 1 << 1;
    }
}

/// The persistent A/B record, identical in both state partitions.
#[derive(
    Clone,
    PartialEq,
    Eq,
    zerocopy_derive::FromBytes,
    zerocopy_derive::IntoBytes,
    zerocopy_derive::Immutable,
    zerocopy_derive::KnownLayout,
    zerocopy_derive::Unaligned,
)]
#[repr(C)]
pub struct BootState {
    magic: le::U32,
    enable: le::U32,
    verified: le::U32,
    remaining_boot_attempts: le::U32,
    error: le::U32,
    _reserved: [u8; 472],
    /// Stored last-register-first.
    board_regs: [le::U32; BOARD_REGS],
    crc: le::U32,
}

const_assert_eq!(core::mem::size_of::<BootState>(), 512);

impl Default for BootState {
    fn default() -> Self {
        let mut s = Self::new_zeroed();
        s.magic.set(STATE_MAGIC);
        s.seal();
        s
    }
}

impl BootState {
    /// Recomputes the trailing CRC.
    pub fn seal(&mut self) {
        let crc = crc32_skipping(&RAW, self.as_bytes(), CRC_OFFSET);
        self.crc.set(crc);
    }

    pub fn is_valid(&self) -> bool {
        self.magic.get() == STATE_MAGIC
            && crc32_skipping(&RAW, self.as_bytes(), CRC_OFFSET)
                == self.crc.get()
    }

    pub fn enable(&self) -> Systems {
        Systems::from_bits_retain(self.enable.get())
    }

    pub fn set_enable(&mut self, s: Systems) {
        self.enable.set(s.bits());
    }

    pub fn verified(&self) -> Systems {
        Systems::from_bits_retain(self.verified.get())
    }

    pub fn set_verified(&mut self, s: Systems) {
        self.verified.set(s.bits());
    }

    pub fn error(&self) -> Systems {
        Systems::from_bits_retain(self.error.get())
    }

    pub fn set_error(&mut self, s: Systems) {
        self.error.set(s.bits());
    }

    pub fn remaining_boot_attempts(&self) -> u32 {
        self.remaining_boot_attempts.get()
    }

    pub fn set_remaining_boot_attempts(&mut self, n: u32) {
        self.remaining_boot_attempts.set(n);
    }

    pub fn board_reg(&self, index: usize) -> Option<u32> {
        let slot = reg_slot(index)?;
        Some(self.board_regs[slot].get())
    }

    pub fn set_board_reg(&mut self, index: usize, value: u32) -> Option<()> {
        let slot = reg_slot(index)?;
        self.board_regs[slot].set(value);
        Some(())
    }
}

fn reg_slot(index: usize) -> Option<usize> {
    if index < BOARD_REGS {
        Some(BOARD_REGS - 1 - index)
    } else {
        None
    }
}
